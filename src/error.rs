//! Error types for the multichain coordinator

use crate::types::{ChainId, ExecTxResult};
use thiserror::Error;

/// Main error type for coordination and branched execution
#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: ChainId },

    #[error("Chain mismatch: requested {requested}, resolved handle is {resolved}")]
    ChainMismatch { requested: ChainId, resolved: ChainId },

    #[error("Chain {chain_id} is not ready; please wait for first block")]
    ChainNotReady { chain_id: ChainId },

    #[error("Invalid height {height}: cannot execute with height < 0")]
    InvalidHeight { height: i64 },

    #[error("Height {height} is in the future; latest committed height is {latest}")]
    HeightInFuture { height: i64, latest: u64 },

    #[error("Cannot execute with proof when height <= 1 (height {height})")]
    ProofUnavailable { height: u64 },

    #[error("Atomic tx running on {count} chains; at most {max} are supported")]
    TooManyParticipants { count: usize, max: usize },

    #[error("Chain {chain_id} is listed more than once in the atomic tx")]
    DuplicateParticipant { chain_id: ChainId },

    #[error("Leader chain {leader} is not included in the participating chains")]
    LeaderNotInSet { leader: ChainId },

    #[error("Atomic tx is not for chain {chain_id}")]
    ChainNotInSet { chain_id: ChainId },

    #[error("Atomic tx mismatch: {0}")]
    AtomicTxMismatch(String),

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("Cannot route sub-transaction {index}: {message}")]
    RouteResolutionFailure { index: usize, message: String },

    #[error("Cross-chain call already outstanding towards chain {chain_id}")]
    CrossCallOutstanding { chain_id: ChainId },

    #[error("Aborted while waiting for {operation}")]
    Aborted { operation: String },

    #[error("Sub-transaction failed with code {}: {}", .0.code, .0.log)]
    SubTransactionFailed(ExecTxResult),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Check if the error was raised by request validation, before any work started
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvalidHeight { .. }
                | CoordinatorError::HeightInFuture { .. }
                | CoordinatorError::ProofUnavailable { .. }
                | CoordinatorError::TooManyParticipants { .. }
                | CoordinatorError::DuplicateParticipant { .. }
                | CoordinatorError::LeaderNotInSet { .. }
                | CoordinatorError::ChainNotInSet { .. }
                | CoordinatorError::DecodeFailure(_)
                | CoordinatorError::RouteResolutionFailure { .. }
        )
    }

    /// Check if the error is a cancellation outcome
    pub fn is_aborted(&self) -> bool {
        matches!(self, CoordinatorError::Aborted { .. })
    }

    pub(crate) fn aborted(operation: impl Into<String>) -> Self {
        CoordinatorError::Aborted {
            operation: operation.into(),
        }
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
