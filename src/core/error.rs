//! Error types and wire mapping.
//!
//! Every failure the core can observe is a [`HostplaneError`]. Handshake and
//! authorization failures are never raised past the connection task: they are
//! turned into a structured `(ok=false, message)` reply and the socket is
//! closed. Request failures become a response status via [`WireErrorMapping`].

use thiserror::Error;

/// Common hostplane error conditions.
#[derive(Debug, Error)]
pub enum HostplaneError {
    /// Client asked for a protocol version the server does not speak.
    #[error("unsupported protocol version {requested:?}, supported versions: {}", supported.join(", "))]
    UnsupportedVersion {
        requested: String,
        supported: Vec<String>,
    },

    /// The peer did not finish the handshake in time.
    #[error("handshake not completed within {timeout_ms} ms")]
    HandshakeTimeout { timeout_ms: u64 },

    /// A handshake field was missing or of the wrong type.
    #[error("malformed handshake: {message}")]
    MalformedHandshake { message: String },

    /// Credential check failed.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Identity is not allowed to perform the operation.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// A daemon declared a hostname that is not in the host directory.
    #[error("unknown host: {hostname}")]
    UnknownHost { hostname: String },

    /// The peer violated request framing.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Request sequence did not follow the previous one.
    #[error("sequence mismatch: expected {expected}, received {received}")]
    SequenceMismatch { expected: i64, received: i64 },

    /// A version-local table ordinal has no canonical table in that version.
    #[error("unknown table ordinal {ordinal} for protocol {version}")]
    UnknownTable { version: String, ordinal: i32 },

    /// Peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A collaborator (database, request handler) failed the request.
    #[error("request failed: {message}")]
    RequestFailed { message: String },

    /// Unsupported request opcode.
    #[error("unsupported request opcode {opcode}")]
    UnsupportedOpcode { opcode: i32 },

    /// Socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HostplaneError {
    /// Create a MalformedHandshake error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedHandshake {
            message: message.into(),
        }
    }

    /// Create a Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create an AuthenticationFailed error.
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Create a RequestFailed error.
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::RequestFailed {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error must end the connection.
    ///
    /// Request-level failures are answered and the session keeps serving;
    /// framing, sequencing and transport failures leave the stream in an
    /// unknown state.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVersion { .. }
                | Self::HandshakeTimeout { .. }
                | Self::MalformedHandshake { .. }
                | Self::AuthenticationFailed { .. }
                | Self::UnknownHost { .. }
                | Self::Protocol { .. }
                | Self::SequenceMismatch { .. }
                | Self::ConnectionClosed
                | Self::Io(_)
        )
    }

    /// Check if this error was raised before the session reached `Serving`.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVersion { .. }
                | Self::HandshakeTimeout { .. }
                | Self::MalformedHandshake { .. }
                | Self::AuthenticationFailed { .. }
                | Self::UnknownHost { .. }
        )
    }
}

/// Result type using HostplaneError.
pub type HostplaneResult<T> = Result<T, HostplaneError>;

/// Response status codes written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WireStatus {
    Done = 0,
    Error = 1,
    PermissionDenied = 2,
    UnknownTable = 3,
    Unsupported = 4,
    ProtocolViolation = 5,
}

impl WireStatus {
    /// Decode a status code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Done),
            1 => Some(Self::Error),
            2 => Some(Self::PermissionDenied),
            3 => Some(Self::UnknownTable),
            4 => Some(Self::Unsupported),
            5 => Some(Self::ProtocolViolation),
            _ => None,
        }
    }

    /// Numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Maps errors to response status and client-visible text.
pub struct WireErrorMapping;

impl WireErrorMapping {
    /// Map a HostplaneError to a wire status code.
    pub fn to_status(error: &HostplaneError) -> WireStatus {
        match error {
            HostplaneError::PermissionDenied { .. }
            | HostplaneError::AuthenticationFailed { .. } => WireStatus::PermissionDenied,
            HostplaneError::UnknownTable { .. } => WireStatus::UnknownTable,
            HostplaneError::UnsupportedOpcode { .. } => WireStatus::Unsupported,
            HostplaneError::Protocol { .. } | HostplaneError::SequenceMismatch { .. } => {
                WireStatus::ProtocolViolation
            }
            _ => WireStatus::Error,
        }
    }

    /// Message sent to the client.
    ///
    /// Internal and I/O details stay in the server log.
    pub fn to_message(error: &HostplaneError) -> String {
        match error {
            HostplaneError::Internal { .. } | HostplaneError::Io(_) => {
                "internal server error".to_string()
            }
            _ => error.to_string(),
        }
    }
}
