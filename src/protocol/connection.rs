//! Connection task.
//!
//! One task per accepted socket: handshake, then a loop that races the next
//! request bytes against the session's invalidation queue and the shutdown
//! signal. While a request is being dispatched (which may wait on the sync
//! barrier) queued invalidations are still written out and the socket is
//! still read, so a daemon's own acknowledgements and a vanished peer are
//! noticed before the barrier gives up.

use super::codec::{DecodeResult, ProtocolCodec, Request, ServerCodec, ServerFrame};
use super::dispatch::{Dispatcher, Opcode, Reply};
use super::handshake::{Handshake, HandshakeReply};
use crate::core::error::{HostplaneError, HostplaneResult, WireErrorMapping, WireStatus};
use crate::core::master::Master;
use crate::session::{InvalidateBatch, Session};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Connection statistics.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Requests processed.
    pub requests_processed: AtomicU64,
    /// Requests answered with a failure status.
    pub requests_failed: AtomicU64,
    /// Invalidation batches written.
    pub invalidations_sent: AtomicU64,
    /// Bytes received.
    pub bytes_received: AtomicU64,
    /// Bytes sent.
    pub bytes_sent: AtomicU64,
}

impl ConnectionStats {
    fn record_reply(&self, reply: &Reply) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        if let ServerFrame::Response { status, .. } = &reply.frame {
            if *status != WireStatus::Done {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Serve one client socket until it disconnects or the server shuts down.
///
/// Handshake rejections are answered and end the connection with `Ok`.
pub async fn serve_connection<S>(
    master: Arc<Master>,
    stream: S,
    peer: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) -> HostplaneResult<Arc<ConnectionStats>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let stats = Arc::new(ConnectionStats::default());

    let accepted = {
        let mut handshake = Handshake::new(
            master.translator(),
            Arc::clone(master.access()),
            master.hosts(),
            master.max_frame_bytes(),
        );
        let deadline = master.handshake_timeout();
        let outcome = tokio::time::timeout(deadline, handshake.run(&mut reader, &mut read_buf))
            .await
            .unwrap_or_else(|_| {
                Err(HostplaneError::HandshakeTimeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            });
        match outcome {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::info!(%peer, reason = %err, "handshake rejected");
                if !matches!(err, HostplaneError::ConnectionClosed | HostplaneError::Io(_)) {
                    let reply = HandshakeReply::Rejected {
                        message: WireErrorMapping::to_message(&err),
                    };
                    writer.write_all(&reply.encode()).await?;
                    writer.flush().await?;
                }
                let _ = writer.shutdown().await;
                return Ok(stats);
            }
        }
    };

    // Registered before the reply goes out so the client never observes an
    // accepted session that fan-out cannot see yet.
    let reply = accepted.reply().encode();
    let (session, inbound) = master.open_session(accepted.info);
    if let Err(err) = writer.write_all(&reply).await {
        master.close_session(&session);
        return Err(err.into());
    }
    stats
        .bytes_sent
        .fetch_add(reply.len() as u64, Ordering::Relaxed);

    tracing::info!(
        session = %session.id(),
        %peer,
        connector = %session.connector_id(),
        version = session.version(),
        identity = %session.effective_identity(),
        daemon_host = ?session.daemon_host(),
        "session opened"
    );

    let mut connection = Connection {
        master: Arc::clone(&master),
        session: Arc::clone(&session),
        codec: ServerCodec::new(master.max_frame_bytes()),
        expected_sequence: accepted.start_sequence,
        stats: Arc::clone(&stats),
    };
    let result = connection
        .serve(&mut reader, &mut writer, read_buf, inbound, shutdown_rx)
        .await;

    master.close_session(&session);
    let _ = writer.shutdown().await;
    match &result {
        Ok(()) => tracing::info!(session = %session.id(), "session closed"),
        Err(err) => tracing::info!(session = %session.id(), error = %err, "session closed with error"),
    }
    result.map(|()| stats)
}

struct Connection {
    master: Arc<Master>,
    session: Arc<Session>,
    codec: ServerCodec,
    expected_sequence: i64,
    stats: Arc<ConnectionStats>,
}

impl Connection {
    async fn serve<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        mut read_buf: BytesMut,
        mut inbound: mpsc::UnboundedReceiver<InvalidateBatch>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> HostplaneResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            loop {
                match self.codec.decode(&mut read_buf) {
                    DecodeResult::Complete(request) => {
                        let keep = self
                            .handle(request, reader, writer, &mut read_buf, &mut inbound)
                            .await?;
                        if !keep {
                            return Ok(());
                        }
                    }
                    DecodeResult::Incomplete => break,
                    DecodeResult::Invalid(reason) => {
                        let err = HostplaneError::protocol(reason);
                        let reply = Reply::failure(self.expected_sequence, &err);
                        self.write_frame(writer, &reply.frame).await?;
                        return Err(err);
                    }
                }
            }

            tokio::select! {
                read = reader.read_buf(&mut read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                }
                batch = inbound.recv() => {
                    match batch {
                        Some(batch) => self.write_batch(writer, batch).await?,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Dispatch one request. Returns false when the connection should end.
    async fn handle<R, W>(
        &mut self,
        request: Request,
        reader: &mut R,
        writer: &mut W,
        read_buf: &mut BytesMut,
        inbound: &mut mpsc::UnboundedReceiver<InvalidateBatch>,
    ) -> HostplaneResult<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if request.sequence != self.expected_sequence {
            let err = HostplaneError::SequenceMismatch {
                expected: self.expected_sequence,
                received: request.sequence,
            };
            tracing::warn!(session = %self.session.id(), error = %err, "closing connection");
            let reply = Reply::failure(request.sequence, &err);
            self.write_frame(writer, &reply.frame).await?;
            return Err(err);
        }
        self.expected_sequence = self.expected_sequence.wrapping_add(1);

        let master = Arc::clone(&self.master);
        let session = Arc::clone(&self.session);
        let dispatcher = Dispatcher::new(&master, &session);
        let dispatch = dispatcher.dispatch(&request);
        tokio::pin!(dispatch);

        let reply = loop {
            let has_room = read_buf.len() < self.codec.max_frame_bytes();
            tokio::select! {
                reply = &mut dispatch => break reply,
                Some(batch) = inbound.recv() => self.write_batch(writer, batch).await?,
                read = reader.read_buf(&mut *read_buf), if has_room => {
                    let n = read?;
                    if n == 0 {
                        tracing::info!(
                            session = %self.session.id(),
                            opcode = request.opcode,
                            "peer closed with a request in flight"
                        );
                        return Ok(false);
                    }
                    self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    self.answer_queued_acks(writer, read_buf).await?;
                }
            }
        };

        self.stats.record_reply(&reply);
        self.write_frame(writer, &reply.frame).await?;
        Ok(!reply.close)
    }

    /// Answer acknowledgements that arrived behind a request still in flight.
    ///
    /// Only an unbroken run of `AckInvalidate` frames at the expected
    /// sequence is taken; anything else stays buffered for the main loop.
    async fn answer_queued_acks<W>(
        &mut self,
        writer: &mut W,
        read_buf: &mut BytesMut,
    ) -> HostplaneResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let mut rest = read_buf.clone();
            let request = match self.codec.decode(&mut rest) {
                DecodeResult::Complete(request) => request,
                DecodeResult::Incomplete | DecodeResult::Invalid(_) => return Ok(()),
            };
            if Opcode::from_code(request.opcode) != Some(Opcode::AckInvalidate)
                || request.sequence != self.expected_sequence
            {
                return Ok(());
            }
            *read_buf = rest;
            self.expected_sequence = self.expected_sequence.wrapping_add(1);

            let reply = Dispatcher::new(&self.master, &self.session)
                .dispatch(&request)
                .await;
            self.stats.record_reply(&reply);
            self.write_frame(writer, &reply.frame).await?;
        }
    }

    async fn write_batch<W>(&self, writer: &mut W, batch: InvalidateBatch) -> HostplaneResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.stats.invalidations_sent.fetch_add(1, Ordering::Relaxed);
        self.write_frame(writer, &ServerFrame::Invalidate(batch))
            .await
    }

    async fn write_frame<W>(&self, writer: &mut W, frame: &ServerFrame) -> HostplaneResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.codec.encode(frame);
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        self.stats
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
