use std::time::Duration;

use thiserror::Error;

use crate::frame::EncodeError;

/// Failure reported by a [`Transport`](crate::session::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("write failed: {0}")]
    Write(String),
    #[error("transport disconnected")]
    Disconnected,
}

/// Why a single attempt did not get acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("transport write failed: {0}")]
    TransportWrite(TransportError),
    #[error("no matching acknowledgment within {0:?}")]
    AckTimeout(Duration),
    #[error("notification stream closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("frame {index} failed after {attempts} attempts: {cause}")]
    FrameFailed {
        /// 1-based position in the sequence
        index: usize,
        attempts: u32,
        cause: AttemptError,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;
