// Copyright (c) 2024 The Botho Foundation

//! Errors at the chain, relayer and engine boundaries.

use lock_relay_core::CheckpointError;
use thiserror::Error;

/// Failures talking to the source chain node.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Node unreachable or the transport failed. Retried next cycle.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("RPC call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The node rejected the request itself (bad filter, range too large).
    #[error("request rejected by node: {0}")]
    InvalidRequest(String),

    /// The node answered with data the reader cannot use.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ChainError {
    /// Whether the failure is expected to clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Connection(_) | ChainError::Timeout(_) | ChainError::MalformedResponse(_)
        )
    }
}

/// Failures submitting an event to the relayer. All of them leave the event
/// pending.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relayer unreachable: {0}")]
    Transport(String),

    #[error("relayer did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("relayer returned status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to build relayer client: {0}")]
    Client(String),
}

/// Errors that end a cycle early.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rejected_requests_are_not_transient() {
        assert!(ChainError::Connection("reset".into()).is_transient());
        assert!(ChainError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(ChainError::MalformedResponse("null".into()).is_transient());
        assert!(!ChainError::InvalidRequest("query exceeds 10000 blocks".into()).is_transient());
    }
}
