//! Connection handshake.
//!
//! The client sends, in order: protocol version, daemon flag, optional
//! daemon hostname, effective identity, authenticated identity, credential
//! and an optional connector id to resume. Fields are read one at a time so
//! an unusable version is rejected before anything else is read.
//!
//! Every failure becomes a [`HandshakeReply::Rejected`]; the caller writes it
//! and closes the socket.

use super::codec::{DecodeResult, WireValue};
use crate::access::{AccessControl, HostLookupCache};
use crate::core::error::{HostplaneError, HostplaneResult};
use crate::core::ids::{ConnectorId, HostId, Identity};
use crate::schema::{ProtocolVersion, TableTranslator};
use crate::session::SessionInfo;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default deadline for a peer to finish its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    VersionNegotiated,
    Authenticating,
    Authenticated,
    Rejected,
}

/// Fields sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: String,
    pub daemon_hostname: Option<String>,
    pub effective_identity: String,
    pub authenticated_identity: String,
    pub credential: String,
    pub resume_connector_id: Option<String>,
}

impl HandshakeRequest {
    /// Encode in wire order.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        WireValue::Str(self.version.clone()).encode(&mut buf);
        WireValue::Bool(self.daemon_hostname.is_some()).encode(&mut buf);
        if let Some(hostname) = &self.daemon_hostname {
            WireValue::Str(hostname.clone()).encode(&mut buf);
        }
        WireValue::Str(self.effective_identity.clone()).encode(&mut buf);
        WireValue::Str(self.authenticated_identity.clone()).encode(&mut buf);
        WireValue::Str(self.credential.clone()).encode(&mut buf);
        match &self.resume_connector_id {
            Some(id) => WireValue::Str(id.clone()).encode(&mut buf),
            None => WireValue::Null.encode(&mut buf),
        }
        buf.freeze()
    }
}

/// Server answer to a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Accepted {
        connector_id: String,
        start_sequence: i64,
    },
    Rejected {
        message: String,
    },
}

impl HandshakeReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::Accepted {
                connector_id,
                start_sequence,
            } => {
                WireValue::Bool(true).encode(&mut buf);
                WireValue::Str(connector_id.clone()).encode(&mut buf);
                WireValue::Long(*start_sequence).encode(&mut buf);
            }
            Self::Rejected { message } => {
                WireValue::Bool(false).encode(&mut buf);
                WireValue::Str(message.clone()).encode(&mut buf);
            }
        }
        buf.freeze()
    }

    /// Decode a reply, consuming it only when complete.
    pub fn decode(buffer: &mut BytesMut, max_len: usize) -> DecodeResult<Self> {
        let mut values = Vec::with_capacity(3);
        let mut offset = 0;
        loop {
            let wanted = match values.first() {
                None => 1,
                Some(WireValue::Bool(true)) => 3,
                Some(WireValue::Bool(false)) => 2,
                Some(other) => {
                    return DecodeResult::Invalid(format!("invalid reply flag {:?}", other))
                }
            };
            if values.len() == wanted {
                break;
            }
            match WireValue::parse(&buffer[offset..], max_len) {
                DecodeResult::Complete((value, used)) => {
                    values.push(value);
                    offset += used;
                }
                DecodeResult::Incomplete => return DecodeResult::Incomplete,
                DecodeResult::Invalid(reason) => return DecodeResult::Invalid(reason),
            }
        }

        let reply = match values.as_slice() {
            [_, WireValue::Str(connector_id), WireValue::Long(start_sequence)] => {
                Self::Accepted {
                    connector_id: connector_id.clone(),
                    start_sequence: *start_sequence,
                }
            }
            [_, WireValue::Str(message)] => Self::Rejected {
                message: message.clone(),
            },
            other => return DecodeResult::Invalid(format!("malformed reply {:?}", other)),
        };
        let _ = buffer.split_to(offset);
        DecodeResult::Complete(reply)
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub version: ProtocolVersion,
    pub info: SessionInfo,
    pub start_sequence: i64,
}

impl Accepted {
    pub fn reply(&self) -> HandshakeReply {
        HandshakeReply::Accepted {
            connector_id: self.info.connector_id.to_string(),
            start_sequence: self.start_sequence,
        }
    }
}

/// Server side of one handshake.
pub struct Handshake<'a> {
    translator: &'a TableTranslator,
    access: Arc<dyn AccessControl>,
    hosts: &'a HostLookupCache,
    max_field_bytes: usize,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(
        translator: &'a TableTranslator,
        access: Arc<dyn AccessControl>,
        hosts: &'a HostLookupCache,
        max_field_bytes: usize,
    ) -> Self {
        Self {
            translator,
            access,
            hosts,
            max_field_bytes,
            state: HandshakeState::Connecting,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Read and check the handshake fields from `reader`.
    ///
    /// Bytes past the handshake stay in `buffer` for the request loop.
    pub async fn run<R>(&mut self, reader: &mut R, buffer: &mut BytesMut) -> HostplaneResult<Accepted>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.negotiate(reader, buffer).await;
        self.state = match result {
            Ok(_) => HandshakeState::Authenticated,
            Err(_) => HandshakeState::Rejected,
        };
        result
    }

    async fn negotiate<R>(&mut self, reader: &mut R, buffer: &mut BytesMut) -> HostplaneResult<Accepted>
    where
        R: AsyncRead + Unpin,
    {
        let requested = self.read_string(reader, buffer, "protocol version").await?;
        let version = self.translator.negotiate(&requested)?;
        self.state = HandshakeState::VersionNegotiated;

        let is_daemon = read_value(reader, buffer, self.max_field_bytes)
            .await?
            .as_bool()
            .map_err(|_| HostplaneError::malformed("daemon flag must be a bool"))?;
        let daemon_hostname = if is_daemon {
            Some(self.read_string(reader, buffer, "daemon hostname").await?)
        } else {
            None
        };
        let effective = Identity(self.read_string(reader, buffer, "effective identity").await?);
        let authenticated =
            Identity(self.read_string(reader, buffer, "authenticated identity").await?);
        let credential = self.read_string(reader, buffer, "credential").await?;
        let resume = read_value(reader, buffer, self.max_field_bytes).await?;
        let resume = resume
            .as_opt_str()
            .map_err(|_| HostplaneError::malformed("connector id must be a string or null"))?
            .map(str::to_string);

        self.state = HandshakeState::Authenticating;
        let access = Arc::clone(&self.access);
        let identity = authenticated.clone();
        tokio::task::spawn_blocking(move || access.authenticate(&identity, &credential))
            .await
            .map_err(|err| HostplaneError::internal(format!("credential check aborted: {}", err)))??;

        if effective != authenticated && !self.access.can_switch_users(&authenticated, &effective)
        {
            return Err(HostplaneError::permission_denied(format!(
                "{} may not switch to {}",
                authenticated, effective
            )));
        }

        let daemon_host = match daemon_hostname {
            Some(hostname) => Some(self.bind_daemon(&effective, &hostname)?),
            None => None,
        };

        let connector_id = match resume {
            Some(id) if !id.is_empty() => ConnectorId(id),
            _ => ConnectorId::generate(),
        };

        Ok(Accepted {
            info: SessionInfo {
                connector_id,
                version: version.name.clone(),
                authenticated,
                effective,
                daemon_host,
            },
            version,
            start_sequence: rand::random::<i64>(),
        })
    }

    fn bind_daemon(&self, identity: &Identity, hostname: &str) -> HostplaneResult<HostId> {
        // Unprivileged identities learn nothing about the host directory.
        if !self.access.is_privileged(identity) {
            return Err(HostplaneError::permission_denied(format!(
                "{} is not allowed to run a daemon",
                identity
            )));
        }
        let host = self
            .hosts
            .resolve(hostname)
            .ok_or_else(|| HostplaneError::UnknownHost {
                hostname: hostname.to_string(),
            })?;
        if !self.access.can_access_host(identity, host) {
            return Err(HostplaneError::permission_denied(format!(
                "{} may not bind to {}",
                identity, hostname
            )));
        }
        Ok(host)
    }

    async fn read_string<R>(
        &self,
        reader: &mut R,
        buffer: &mut BytesMut,
        field: &str,
    ) -> HostplaneResult<String>
    where
        R: AsyncRead + Unpin,
    {
        match read_value(reader, buffer, self.max_field_bytes).await? {
            WireValue::Str(value) => Ok(value),
            other => Err(HostplaneError::malformed(format!(
                "{} must be a string, got {:?}",
                field, other
            ))),
        }
    }
}

/// Read one value, pulling from `reader` until it is complete.
pub async fn read_value<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_len: usize,
) -> HostplaneResult<WireValue>
where
    R: AsyncRead + Unpin,
{
    loop {
        match WireValue::decode(buffer, max_len) {
            DecodeResult::Complete(value) => return Ok(value),
            DecodeResult::Invalid(reason) => return Err(HostplaneError::malformed(reason)),
            DecodeResult::Incomplete => {
                if reader.read_buf(buffer).await? == 0 {
                    return Err(HostplaneError::ConnectionClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{hash_credential, IdentityGrant, StaticAccessControl};
    use crate::core::ids::AccountId;
    use crate::invalidate::Scope;
    use crate::schema::BuiltinSchema;

    struct Fixture {
        translator: TableTranslator,
        access: Arc<StaticAccessControl>,
        hosts: HostLookupCache,
    }

    fn grant(name: &str, privileged: bool, can_switch_users: bool) -> IdentityGrant {
        IdentityGrant {
            identity: Identity::from(name),
            password_hash: hash_credential("pw", 256, 1).unwrap(),
            privileged,
            can_switch_users,
            accounts: Scope::All,
            hosts: Scope::only([10u32]),
        }
    }

    fn fixture() -> Fixture {
        let access = Arc::new(
            StaticAccessControl::new()
                .with_host(HostId(10), "web1.example.net")
                .with_host(HostId(11), "web2.example.net")
                .with_grant(grant("daemon", true, false))
                .with_grant(grant("alice", false, false))
                .with_grant(grant("admin", false, true)),
        );
        Fixture {
            translator: TableTranslator::new(Arc::new(BuiltinSchema::new())),
            hosts: HostLookupCache::new(access.clone()),
            access,
        }
    }

    fn request(identity: &str, daemon_hostname: Option<&str>) -> HandshakeRequest {
        HandshakeRequest {
            version: "1.83.0".to_string(),
            daemon_hostname: daemon_hostname.map(str::to_string),
            effective_identity: identity.to_string(),
            authenticated_identity: identity.to_string(),
            credential: "pw".to_string(),
            resume_connector_id: None,
        }
    }

    async fn run(fx: &Fixture, bytes: &[u8]) -> (HostplaneResult<Accepted>, HandshakeState, usize) {
        let mut reader = bytes;
        let mut buffer = BytesMut::new();
        let mut handshake = Handshake::new(&fx.translator, fx.access.clone(), &fx.hosts, 4096);
        let result = handshake.run(&mut reader, &mut buffer).await;
        (result, handshake.state(), reader.len() + buffer.len())
    }

    #[tokio::test]
    async fn accepts_and_keeps_trailing_bytes() {
        let fx = fixture();
        let mut bytes = request("alice", None).encode().to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB]);

        let (result, state, left) = run(&fx, &bytes).await;
        let accepted = result.unwrap();
        assert_eq!(state, HandshakeState::Authenticated);
        assert_eq!(accepted.version.name, "1.83.0");
        assert_eq!(accepted.info.connector_id.as_str().len(), 36);
        assert!(accepted.info.daemon_host.is_none());
        assert_eq!(left, 2);
    }

    #[tokio::test]
    async fn unsupported_version_stops_reading() {
        let fx = fixture();
        let mut req = request("alice", None);
        req.version = "9.9.9".to_string();
        let bytes = req.encode();

        let (result, state, left) = run(&fx, &bytes).await;
        match result {
            Err(HostplaneError::UnsupportedVersion { supported, .. }) => {
                assert!(supported.contains(&"1.83.0".to_string()));
            }
            other => panic!("unexpected: {:?}", other.map(|a| a.info)),
        }
        assert_eq!(state, HandshakeState::Rejected);
        // Everything after the version string is still unread.
        let version_len = 1 + 4 + "9.9.9".len();
        assert_eq!(left, bytes.len() - version_len);
    }

    #[tokio::test]
    async fn version_suffix_resolves_to_base() {
        let fx = fixture();
        let mut req = request("alice", None);
        req.version = "1.83.0-SNAPSHOT".to_string();
        let (result, _, _) = run(&fx, &req.encode()).await;
        assert_eq!(result.unwrap().version.name, "1.83.0");
    }

    #[tokio::test]
    async fn bad_credential_rejected() {
        let fx = fixture();
        let mut req = request("alice", None);
        req.credential = "nope".to_string();
        let (result, state, _) = run(&fx, &req.encode()).await;
        assert!(matches!(result, Err(HostplaneError::AuthenticationFailed { .. })));
        assert_eq!(state, HandshakeState::Rejected);
    }

    #[tokio::test]
    async fn impersonation_needs_permission() {
        let fx = fixture();
        let mut req = request("alice", None);
        req.effective_identity = "daemon".to_string();
        let (result, _, _) = run(&fx, &req.encode()).await;
        assert!(matches!(result, Err(HostplaneError::PermissionDenied { .. })));

        let mut req = request("admin", None);
        req.effective_identity = "alice".to_string();
        let (result, _, _) = run(&fx, &req.encode()).await;
        let accepted = result.unwrap();
        assert_eq!(accepted.info.effective, Identity::from("alice"));
        assert_eq!(accepted.info.authenticated, Identity::from("admin"));
    }

    #[tokio::test]
    async fn daemon_binding_checks() {
        let fx = fixture();

        let (result, _, _) = run(&fx, &request("daemon", Some("web1.example.net")).encode()).await;
        assert_eq!(result.unwrap().info.daemon_host, Some(HostId(10)));

        let (result, _, _) = run(&fx, &request("daemon", Some("web2.example.net")).encode()).await;
        assert!(matches!(result, Err(HostplaneError::PermissionDenied { .. })));

        let (result, _, _) = run(&fx, &request("alice", Some("web1.example.net")).encode()).await;
        assert!(matches!(result, Err(HostplaneError::PermissionDenied { .. })));

        let (result, _, _) = run(&fx, &request("daemon", Some("nope.example.net")).encode()).await;
        assert!(matches!(result, Err(HostplaneError::UnknownHost { .. })));
    }

    /// Records the thread that checked the credential.
    struct RecordingAccess {
        inner: Arc<StaticAccessControl>,
        checked_on: parking_lot::Mutex<Option<std::thread::ThreadId>>,
    }

    impl AccessControl for RecordingAccess {
        fn authenticate(&self, identity: &Identity, credential: &str) -> HostplaneResult<()> {
            *self.checked_on.lock() = Some(std::thread::current().id());
            self.inner.authenticate(identity, credential)
        }

        fn can_switch_users(&self, authenticated: &Identity, effective: &Identity) -> bool {
            self.inner.can_switch_users(authenticated, effective)
        }

        fn is_privileged(&self, identity: &Identity) -> bool {
            self.inner.is_privileged(identity)
        }

        fn can_access_account(&self, identity: &Identity, account: &AccountId) -> bool {
            self.inner.can_access_account(identity, account)
        }

        fn can_access_host(&self, identity: &Identity, host: HostId) -> bool {
            self.inner.can_access_host(identity, host)
        }
    }

    #[tokio::test]
    async fn credential_check_leaves_the_connection_thread() {
        let fx = fixture();
        let access = Arc::new(RecordingAccess {
            inner: fx.access.clone(),
            checked_on: parking_lot::Mutex::new(None),
        });
        let bytes = request("alice", None).encode();
        let mut reader = &bytes[..];
        let mut buffer = BytesMut::new();

        let mut handshake = Handshake::new(&fx.translator, access.clone(), &fx.hosts, 4096);
        assert!(handshake.run(&mut reader, &mut buffer).await.is_ok());
        let checked_on = access.checked_on.lock().expect("credential checked");
        assert_ne!(checked_on, std::thread::current().id());
    }

    #[tokio::test]
    async fn unprivileged_binding_does_not_reveal_hostnames() {
        let fx = fixture();
        for hostname in ["web1.example.net", "nope.example.net"] {
            let (result, _, _) = run(&fx, &request("alice", Some(hostname)).encode()).await;
            assert!(
                matches!(result, Err(HostplaneError::PermissionDenied { .. })),
                "{}",
                hostname
            );
        }
        assert_eq!(fx.hosts.misses(), 0);
    }

    #[tokio::test]
    async fn resume_id_used_verbatim() {
        let fx = fixture();
        let mut req = request("alice", None);
        req.resume_connector_id = Some("connector-7".to_string());
        let (result, _, _) = run(&fx, &req.encode()).await;
        assert_eq!(result.unwrap().info.connector_id.as_str(), "connector-7");
    }

    #[tokio::test]
    async fn truncated_handshake_is_closed_connection() {
        let fx = fixture();
        let bytes = request("alice", None).encode();
        let (result, _, _) = run(&fx, &bytes[..bytes.len() - 4]).await;
        assert!(matches!(result, Err(HostplaneError::ConnectionClosed)));
    }

    #[test]
    fn reply_decodes_both_forms() {
        for reply in [
            HandshakeReply::Accepted {
                connector_id: "abc".to_string(),
                start_sequence: -5,
            },
            HandshakeReply::Rejected {
                message: "no".to_string(),
            },
        ] {
            let mut buf = BytesMut::from(&reply.encode()[..]);
            match HandshakeReply::decode(&mut buf, 1024) {
                DecodeResult::Complete(decoded) => assert_eq!(decoded, reply),
                other => panic!("unexpected: {:?}", other),
            }
            assert!(buf.is_empty());
        }
    }
}
