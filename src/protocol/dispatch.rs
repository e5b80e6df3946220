//! Request dispatch.
//!
//! A handful of opcodes belong to the invalidation core itself; everything
//! else runs through the [`RequestHandler`] collaborator inside a unit of
//! work. When a unit of work commits a sync-required change-set, the
//! response is held back until the daemons on the named hosts have applied
//! it or the barrier timeout passes.

use super::codec::{Request, ServerFrame, WireValue};
use crate::core::error::{HostplaneError, HostplaneResult, WireErrorMapping, WireStatus};
use crate::core::ids::HostId;
use crate::core::master::Master;
use crate::invalidate::{FanOutReport, Scope, UnitOfWork};
use crate::schema::TableId;
use crate::session::Session;

/// Opcodes served by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    Ping = 0,
    Quit = 1,
    /// `[Long sync_id]`, daemon sessions only.
    AckInvalidate = 2,
    /// `[Int host | Null]`, table taken from the request header.
    InvalidateTable = 3,
    /// `[Int host]`, privileged identities only.
    WaitForInvalidates = 4,
}

impl Opcode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ping),
            1 => Some(Self::Quit),
            2 => Some(Self::AckInvalidate),
            3 => Some(Self::InvalidateTable),
            4 => Some(Self::WaitForInvalidates),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Request as seen by a [`RequestHandler`].
#[derive(Debug)]
pub struct RequestContext<'a> {
    pub session: &'a Session,
    /// Canonical table named by the request, if any.
    pub table: Option<TableId>,
    pub opcode: i32,
    pub params: &'a [WireValue],
}

/// Domain request bodies.
///
/// Changes recorded on `work` are delivered after the handler returns and
/// the transaction commits. An error rolls the unit of work back.
pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        request: &RequestContext<'_>,
        work: &mut UnitOfWork,
    ) -> HostplaneResult<Vec<WireValue>>;
}

/// Handler that serves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedHandler;

impl RequestHandler for UnsupportedHandler {
    fn handle(
        &self,
        request: &RequestContext<'_>,
        _work: &mut UnitOfWork,
    ) -> HostplaneResult<Vec<WireValue>> {
        Err(HostplaneError::UnsupportedOpcode {
            opcode: request.opcode,
        })
    }
}

/// What the connection should do with a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub frame: ServerFrame,
    /// Close the connection after writing `frame`.
    pub close: bool,
}

impl Reply {
    fn done(sequence: i64, payload: Vec<WireValue>) -> Self {
        Self {
            frame: ServerFrame::Response {
                sequence,
                status: WireStatus::Done,
                payload,
            },
            close: false,
        }
    }

    /// Failure response for `error`.
    pub fn failure(sequence: i64, error: &HostplaneError) -> Self {
        Self {
            frame: ServerFrame::Response {
                sequence,
                status: WireErrorMapping::to_status(error),
                payload: vec![WireValue::Str(WireErrorMapping::to_message(error))],
            },
            close: error.closes_connection(),
        }
    }
}

/// Dispatches requests of one session.
pub struct Dispatcher<'a> {
    master: &'a Master,
    session: &'a Session,
}

impl<'a> Dispatcher<'a> {
    pub fn new(master: &'a Master, session: &'a Session) -> Self {
        Self { master, session }
    }

    pub async fn dispatch(&self, request: &Request) -> Reply {
        let result = match Opcode::from_code(request.opcode) {
            Some(Opcode::Ping) => Ok(Vec::new()),
            Some(Opcode::Quit) => {
                let mut reply = Reply::done(request.sequence, Vec::new());
                reply.close = true;
                return reply;
            }
            Some(Opcode::AckInvalidate) => self.acknowledge(request),
            Some(Opcode::InvalidateTable) => self.invalidate_table(request).await,
            Some(Opcode::WaitForInvalidates) => self.wait_for_invalidates(request).await,
            None => self.delegate(request).await,
        };

        match result {
            Ok(payload) => Reply::done(request.sequence, payload),
            Err(err) => {
                tracing::debug!(
                    session = %self.session.id(),
                    opcode = request.opcode,
                    error = %err,
                    "request failed"
                );
                Reply::failure(request.sequence, &err)
            }
        }
    }

    fn table(&self, request: &Request) -> HostplaneResult<Option<TableId>> {
        if request.table < 0 {
            return Ok(None);
        }
        self.master
            .translator()
            .to_canonical(self.session.version(), request.table)
            .map(Some)
            .ok_or_else(|| HostplaneError::UnknownTable {
                version: self.session.version().to_string(),
                ordinal: request.table,
            })
    }

    fn param<'r>(request: &'r Request, index: usize) -> HostplaneResult<&'r WireValue> {
        request.params.get(index).ok_or_else(|| {
            HostplaneError::request_failed(format!("missing parameter {}", index))
        })
    }

    fn host_param(request: &Request, index: usize) -> HostplaneResult<Option<HostId>> {
        let host = Self::param(request, index)?
            .as_opt_int()
            .map_err(|err| HostplaneError::request_failed(err.to_string()))?;
        host.map(|id| {
            u32::try_from(id)
                .map(HostId)
                .map_err(|_| HostplaneError::request_failed(format!("invalid host id {}", id)))
        })
        .transpose()
    }

    fn acknowledge(&self, request: &Request) -> HostplaneResult<Vec<WireValue>> {
        let Some(host) = self.session.daemon_host() else {
            return Err(HostplaneError::permission_denied(
                "only daemon sessions acknowledge invalidations",
            ));
        };
        let sync_id = Self::param(request, 0)?
            .as_long()
            .map_err(|err| HostplaneError::request_failed(err.to_string()))?;
        let removed = self
            .master
            .barrier()
            .acknowledge(host, self.session.id(), sync_id);
        Ok(vec![WireValue::Int(removed as i32)])
    }

    async fn invalidate_table(&self, request: &Request) -> HostplaneResult<Vec<WireValue>> {
        let table = self
            .table(request)?
            .ok_or_else(|| HostplaneError::request_failed("invalidate requires a table"))?;
        let host = if request.params.is_empty() {
            None
        } else {
            Self::host_param(request, 0)?
        };

        let identity = self.session.effective_identity();
        let allowed = match host {
            Some(host) => self.master.access().can_access_host(identity, host),
            None => self.master.access().is_privileged(identity),
        };
        if !allowed {
            return Err(HostplaneError::permission_denied(format!(
                "{} may not invalidate {}",
                identity, table
            )));
        }

        let mut work = self.master.begin_work()?;
        work.add_table(table, Scope::All, Scope::from(host), host.is_some());
        let report = work.commit()?;
        let notified = report.sessions_notified;
        self.await_sync(report).await;
        Ok(vec![WireValue::Int(notified as i32)])
    }

    async fn wait_for_invalidates(&self, request: &Request) -> HostplaneResult<Vec<WireValue>> {
        let identity = self.session.effective_identity();
        if !self.master.access().is_privileged(identity) {
            return Err(HostplaneError::permission_denied(format!(
                "{} may not wait for invalidations",
                identity
            )));
        }
        let host = Self::host_param(request, 0)?
            .ok_or_else(|| HostplaneError::request_failed("wait requires a host"))?;
        let outcome = self.master.wait_for_invalidates(host).await;
        Ok(vec![WireValue::Bool(!outcome.timed_out())])
    }

    async fn delegate(&self, request: &Request) -> HostplaneResult<Vec<WireValue>> {
        let context = RequestContext {
            session: self.session,
            table: self.table(request)?,
            opcode: request.opcode,
            params: &request.params,
        };
        let mut work = self.master.begin_work()?;
        let payload = self.master.handler().handle(&context, &mut work)?;
        let report = work.commit()?;
        self.await_sync(report).await;
        Ok(payload)
    }

    async fn await_sync(&self, report: FanOutReport) {
        if report.sync_hosts.is_empty() {
            return;
        }
        let outcomes = self
            .master
            .barrier()
            .wait_for_hosts(report.sync_hosts)
            .await;
        tracing::debug!(session = %self.session.id(), outcomes = ?outcomes, "post-commit sync wait finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_codes() {
        for op in [
            Opcode::Ping,
            Opcode::Quit,
            Opcode::AckInvalidate,
            Opcode::InvalidateTable,
            Opcode::WaitForInvalidates,
        ] {
            assert_eq!(Opcode::from_code(op.code()), Some(op));
        }
        assert_eq!(Opcode::from_code(100), None);
    }

    #[test]
    fn failure_reply_closes_only_on_fatal_errors() {
        let reply = Reply::failure(3, &HostplaneError::permission_denied("no"));
        assert!(!reply.close);
        match reply.frame {
            ServerFrame::Response { status, .. } => assert_eq!(status, WireStatus::PermissionDenied),
            other => panic!("unexpected: {:?}", other),
        }

        let reply = Reply::failure(
            3,
            &HostplaneError::SequenceMismatch {
                expected: 2,
                received: 3,
            },
        );
        assert!(reply.close);
    }
}
