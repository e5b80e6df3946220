//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use bytes::BytesMut;
use hostplane::access::{hash_credential, StaticAccessControl};
use hostplane::core::config::Config;
use hostplane::core::error::WireStatus;
use hostplane::core::master::Master;
use hostplane::net::tcp::{TcpListener, TcpListenerConfig};
use hostplane::protocol::{
    ClientCodec, DecodeResult, HandshakeReply, HandshakeRequest, ProtocolCodec, Request,
    RequestHandler, ServerFrame, WireValue,
};
use hostplane::schema::{BuiltinSchema, TableId, TableTranslator};
use hostplane::session::InvalidateBatch;
use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

pub const PASSWORD: &str = "secret";
pub const VERSION: &str = "1.83.0";
pub const MAX_FRAME: usize = 1024 * 1024;
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration with two hosts, an administrator, one daemon identity per
/// host and an account-scoped user.
pub fn config_toml(barrier_timeout_ms: u64) -> String {
    let hash = hash_credential(PASSWORD, 256, 1).expect("credential hash");
    format!(
        r#"
[listener]
bind = "127.0.0.1:0"

[protocol]
barrier_timeout_ms = {timeout}

[telemetry]
log_level = "debug"

[[hosts]]
id = 10
hostname = "web1.example.net"

[[hosts]]
id = 11
hostname = "web2.example.net"

[[identities]]
name = "admin"
password_hash = "{hash}"
privileged = true
can_switch_users = true
accounts = ["*"]
all_hosts = true

[[identities]]
name = "daemon-web1"
password_hash = "{hash}"
privileged = true
hosts = [10]

[[identities]]
name = "daemon-web2"
password_hash = "{hash}"
privileged = true
hosts = [11]

[[identities]]
name = "alice"
password_hash = "{hash}"
accounts = ["alice"]
"#,
        timeout = barrier_timeout_ms,
        hash = hash
    )
}

/// Parsed test configuration.
pub fn test_config(barrier_timeout_ms: u64) -> Config {
    Config::from_toml(&config_toml(barrier_timeout_ms)).expect("valid test config")
}

/// Write configuration content to a temporary file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Master over the test configuration with a custom request handler.
pub fn build_master(config: &Config, handler: Arc<dyn RequestHandler>) -> Arc<Master> {
    let acl = Arc::new(StaticAccessControl::from_config(config));
    Arc::new(
        Master::builder(acl.clone(), acl)
            .handler(handler)
            .barrier_timeout(config.protocol.barrier_timeout())
            .handshake_timeout(config.listener.handshake_timeout())
            .max_frame_bytes(config.listener.max_frame_bytes)
            .build(),
    )
}

/// A running listener bound to an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub master: Arc<Master>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestServer {
    pub async fn start(master: Arc<Master>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = TcpListenerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 64,
            nodelay: true,
        };
        let listener = Arc::new(TcpListener::new(config, shutdown_rx));
        let socket = listener.bind().await.expect("bind");
        let addr = socket.local_addr().expect("local addr");
        tokio::spawn(listener.run(socket, Arc::clone(&master)));
        Self {
            addr,
            master,
            shutdown_tx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client ordinal of `table` in `version`.
pub fn ordinal(version: &str, table: TableId) -> i32 {
    TableTranslator::new(Arc::new(BuiltinSchema::new()))
        .to_client_ordinal(version, table)
        .expect("table valid in version")
}

pub fn login(identity: &str) -> HandshakeRequest {
    HandshakeRequest {
        version: VERSION.to_string(),
        daemon_hostname: None,
        effective_identity: identity.to_string(),
        authenticated_identity: identity.to_string(),
        credential: PASSWORD.to_string(),
        resume_connector_id: None,
    }
}

pub fn daemon_login(identity: &str, hostname: &str) -> HandshakeRequest {
    HandshakeRequest {
        daemon_hostname: Some(hostname.to_string()),
        ..login(identity)
    }
}

/// Minimal protocol client.
pub struct TestClient {
    stream: TcpStream,
    buffer: BytesMut,
    codec: ClientCodec,
    pub connector_id: String,
    pub next_sequence: i64,
    pending: VecDeque<InvalidateBatch>,
}

impl TestClient {
    /// Handshake; `Err` carries the rejection message.
    pub async fn connect(addr: SocketAddr, request: HandshakeRequest) -> Result<Self, String> {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(&request.encode()).await.expect("write handshake");

        let mut buffer = BytesMut::with_capacity(1024);
        let reply = loop {
            match HandshakeReply::decode(&mut buffer, MAX_FRAME) {
                DecodeResult::Complete(reply) => break reply,
                DecodeResult::Incomplete => {}
                DecodeResult::Invalid(reason) => panic!("invalid handshake reply: {}", reason),
            }
            let n = tokio::time::timeout(IO_TIMEOUT, stream.read_buf(&mut buffer))
                .await
                .expect("handshake reply timed out")
                .expect("read handshake reply");
            assert!(n > 0, "connection closed during handshake");
        };

        match reply {
            HandshakeReply::Accepted {
                connector_id,
                start_sequence,
            } => Ok(Self {
                stream,
                buffer,
                codec: ClientCodec::new(MAX_FRAME),
                connector_id,
                next_sequence: start_sequence,
                pending: VecDeque::new(),
            }),
            HandshakeReply::Rejected { message } => Err(message),
        }
    }

    pub async fn send(&mut self, request: &Request) {
        let bytes = self.codec.encode(request);
        self.stream.write_all(&bytes).await.expect("write request");
    }

    /// Next server frame, or `None` at end of stream.
    pub async fn read_frame(&mut self) -> Option<ServerFrame> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                DecodeResult::Complete(frame) => return Some(frame),
                DecodeResult::Incomplete => {}
                DecodeResult::Invalid(reason) => panic!("invalid server frame: {}", reason),
            }
            let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_buf(&mut self.buffer))
                .await
                .expect("read timed out")
                .expect("read frame");
            if n == 0 {
                return None;
            }
        }
    }

    /// Send a request and wait for its response, queueing invalidations
    /// that arrive first.
    pub async fn call(
        &mut self,
        table: i32,
        opcode: i32,
        params: Vec<WireValue>,
    ) -> (WireStatus, Vec<WireValue>) {
        let sequence = self.submit(table, opcode, params).await;
        self.response_for(sequence).await
    }

    /// Send a request without waiting for it; returns its sequence.
    pub async fn submit(&mut self, table: i32, opcode: i32, params: Vec<WireValue>) -> i64 {
        let request = Request {
            sequence: self.next_sequence,
            table,
            opcode,
            params,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.send(&request).await;
        request.sequence
    }

    pub async fn response_for(&mut self, sequence: i64) -> (WireStatus, Vec<WireValue>) {
        let (got, status, payload) = self.next_response().await;
        assert_eq!(got, sequence, "response sequence");
        (status, payload)
    }

    /// Next response in arrival order as `(sequence, status, payload)`.
    pub async fn next_response(&mut self) -> (i64, WireStatus, Vec<WireValue>) {
        loop {
            match self.read_frame().await {
                Some(ServerFrame::Response {
                    sequence,
                    status,
                    payload,
                }) => return (sequence, status, payload),
                Some(ServerFrame::Invalidate(batch)) => self.pending.push_back(batch),
                None => panic!("connection closed before a response"),
            }
        }
    }

    /// Next pushed invalidation batch.
    pub async fn next_invalidation(&mut self) -> InvalidateBatch {
        if let Some(batch) = self.pending.pop_front() {
            return batch;
        }
        match self.read_frame().await {
            Some(ServerFrame::Invalidate(batch)) => batch,
            other => panic!("expected invalidation, got {:?}", other),
        }
    }

    /// Invalidations already received but not yet taken.
    pub fn pending_invalidations(&self) -> usize {
        self.pending.len()
    }

    /// Read until the server closes the connection.
    pub async fn expect_closed(&mut self) {
        while let Some(frame) = self.read_frame().await {
            if let ServerFrame::Invalidate(batch) = frame {
                self.pending.push_back(batch);
            } else {
                panic!("unexpected frame before close: {:?}", frame);
            }
        }
    }
}
