//! Crate-level error type.

use crate::tensor::TensorError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// A shape/divisibility requirement of the sharded run does not hold.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A peer rank went away (its channel endpoint was dropped).
    #[error("Communication error on rank {rank}: {message}")]
    Comm { rank: usize, message: String },

    #[error("Rank {rank} timed out after {timeout_ms} ms waiting in {op}")]
    Timeout {
        rank: usize,
        op: &'static str,
        timeout_ms: u128,
    },

    /// Ranks issued collectives in a different order.
    #[error("Rank {rank}: collective mismatch in {op}, expected sequence {expected}, received {got}")]
    CollectiveMismatch {
        rank: usize,
        op: &'static str,
        expected: u64,
        got: u64,
    },

    #[error("Rank {rank} panicked: {message}")]
    RankPanicked { rank: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition(message.into())
    }
}

/// Returns `Error::Precondition` with the formatted message unless the condition holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::Precondition(format!($($arg)+)));
        }
    };
}
