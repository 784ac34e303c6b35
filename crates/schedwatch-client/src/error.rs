use schedwatch_core::rpc::{FrameError, RpcErrorObject};
use std::time::Duration;
use thiserror::Error;

/// Failure of one correlated call. Every call ends with exactly one value or
/// one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("server error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("call cancelled")]
    Cancelled,
    #[error("outbound queue full")]
    QueueFull,
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("session stopped")]
    SessionStopped,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl CallError {
    pub fn is_remote(&self) -> bool {
        matches!(self, CallError::Remote { .. })
    }
}

impl From<RpcErrorObject> for CallError {
    fn from(error: RpcErrorObject) -> Self {
        CallError::Remote {
            code: error.code,
            message: error.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("invalid endpoint url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}
