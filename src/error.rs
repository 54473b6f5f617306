use crate::config::ConfigError;
use crate::shard::ShardState;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// A lightweight, copyable projection of [`Error`] that can be matched
/// without borrowing the full error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol or socket error
    WebSocket,
    /// Connection could not be established
    ConnectionFailed,
    /// The gateway sent something that violates the protocol
    Protocol,
    /// The gateway closed the connection with a fatal close code
    ServerClosed,
    /// An outbound payload was rejected before it was sent
    InvalidPayload,
    /// The operation is not valid in the current lifecycle state
    InvalidState,
    /// The shard or manager is shutting down
    ShuttingDown,
    /// Configuration was rejected
    Config,
    /// Other error
    Other,
}

/// Errors that can occur in ws-gateway-client
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TCP, proxy or TLS setup failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Payload could not be encoded or decoded as JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A zlib-stream frame could not be inflated
    #[error("Decompression error: {0}")]
    Decompress(#[from] flate2::DecompressError),

    /// The gateway violated the protocol
    #[error("Gateway protocol error: {0}")]
    Protocol(String),

    /// The gateway closed the connection with a code that must not be retried
    #[error("Gateway closed the connection with code {code}: {reason}")]
    ServerClosed { code: u16, reason: String },

    /// Outbound frame exceeds the gateway's frame limit
    #[error("Payload of {size} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// Outbound payload is malformed
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A send was attempted while no socket is open
    #[error("Shard {shard_id} is not connected")]
    NotConnected { shard_id: u32 },

    /// `connect` was called on a connection that is already live
    #[error("Shard {shard_id} is already connected")]
    AlreadyConnected { shard_id: u32 },

    /// `start` was called on a shard that is still running
    #[error("Cannot start shard {shard_id} while it is {state:?}")]
    AlreadyStarted { shard_id: u32, state: ShardState },

    /// `start` was called on a manager that is still running
    #[error("GatewayManager is already running")]
    AlreadyRunning,

    /// The shard stopped before it became ready
    #[error("Shard is shutting down")]
    ShuttingDown,

    /// A supervising task panicked or was cancelled
    #[error("Shard task failed: {0}")]
    TaskFailed(String),

    /// Configuration was rejected by validation
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::Json(_) | Error::Decompress(_) | Error::Protocol(_) => ErrorKind::Protocol,
            Error::ServerClosed { .. } => ErrorKind::ServerClosed,
            Error::PayloadTooLarge { .. } | Error::InvalidPayload(_) => ErrorKind::InvalidPayload,
            Error::NotConnected { .. }
            | Error::AlreadyConnected { .. }
            | Error::AlreadyStarted { .. }
            | Error::AlreadyRunning => ErrorKind::InvalidState,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Config(_) => ErrorKind::Config,
            Error::TaskFailed(_) => ErrorKind::Other,
        }
    }
}

/// Why a single gateway connection ended.
///
/// Every exit path out of a live connection produces exactly one of these;
/// the shard supervisor matches on it to decide between resuming,
/// re-identifying, backing off or giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Shutdown was requested locally
    ClientClosed,
    /// The socket could not be opened, or failed mid-stream
    Transport(String),
    /// No traffic arrived between two heartbeats
    Zombied,
    /// The gateway invalidated the session (op 9, or close codes 4007/4009)
    InvalidSession { resumable: bool },
    /// The gateway asked the client to reconnect (op 7)
    MustReconnect,
    /// The gateway sent a close frame
    ServerClosed { code: u16, reason: String },
    /// The gateway sent something the client cannot interpret
    Protocol(String),
}

impl From<Error> for CloseReason {
    fn from(err: Error) -> Self {
        match err {
            Error::Json(_)
            | Error::Decompress(_)
            | Error::Protocol(_)
            | Error::PayloadTooLarge { .. }
            | Error::InvalidPayload(_) => CloseReason::Protocol(err.to_string()),
            other => CloseReason::Transport(other.to_string()),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "closed by client"),
            CloseReason::Transport(e) => write!(f, "transport failure: {}", e),
            CloseReason::Zombied => write!(f, "connection zombied"),
            CloseReason::InvalidSession { resumable } => {
                write!(f, "invalid session (resumable: {})", resumable)
            }
            CloseReason::MustReconnect => write!(f, "reconnect requested by gateway"),
            CloseReason::ServerClosed { code, reason } => {
                write!(f, "closed by gateway with code {}: {}", code, reason)
            }
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}
