//! Client protocol.
//!
//! - [`codec`] - Tagged primitives and request/server frames
//! - [`handshake`] - Version negotiation and authentication
//! - [`dispatch`] - Core opcodes and the request handler seam
//! - [`connection`] - Per-connection serve loop

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod handshake;

pub use codec::{
    ClientCodec, DecodeResult, ProtocolCodec, Request, ServerCodec, ServerFrame, WireValue,
};
pub use connection::{serve_connection, ConnectionStats};
pub use dispatch::{Dispatcher, Opcode, Reply, RequestContext, RequestHandler, UnsupportedHandler};
pub use handshake::{Handshake, HandshakeReply, HandshakeRequest, HandshakeState};
