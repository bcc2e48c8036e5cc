// Copyright (c) 2024 The Botho Foundation

//! Decoding raw logs into bridge events.
//!
//! The engine only depends on [`EventDecoder`], so a schema-driven decoder
//! can replace the positional one without touching the scan loop.

use alloy_primitives::{keccak256, Address, B256, U256};
use thiserror::Error;

use crate::types::{BridgeEvent, RawLogRecord};

/// Solidity signature of the watched event.
pub const TOKENS_LOCKED_SIGNATURE: &str = "TokensLocked(address,address,uint256,uint256)";

const WORD: usize = 32;

/// Why a raw log could not be decoded. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected at least {expected} topics, found {found}")]
    MissingTopics { expected: usize, found: usize },

    #[error("expected {expected} bytes of data, found {found}")]
    DataLength { expected: usize, found: usize },

    #[error("destination chain id {0} does not fit in 64 bits")]
    ChainIdOverflow(U256),
}

/// Maps one raw log to a structured event. Must be pure.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, log: &RawLogRecord) -> Result<BridgeEvent, DecodeError>;
}

/// Positional decoder for
/// `TokensLocked(address indexed user, address indexed token, uint256 amount, uint256 destinationChainId)`.
///
/// Topic 1 is the user and topic 2 the token (low 20 bytes of each word);
/// data is exactly two big-endian words: amount, then destination chain id.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokensLockedDecoder;

impl TokensLockedDecoder {
    /// Topics required: signature, user, token.
    pub const REQUIRED_TOPICS: usize = 3;

    /// Data bytes required: amount and destination chain id.
    pub const DATA_LEN: usize = 2 * WORD;

    /// keccak256 of [`TOKENS_LOCKED_SIGNATURE`], the log filter topic.
    pub fn signature_topic() -> B256 {
        keccak256(TOKENS_LOCKED_SIGNATURE)
    }
}

impl EventDecoder for TokensLockedDecoder {
    fn decode(&self, log: &RawLogRecord) -> Result<BridgeEvent, DecodeError> {
        if log.topics.len() < Self::REQUIRED_TOPICS {
            return Err(DecodeError::MissingTopics {
                expected: Self::REQUIRED_TOPICS,
                found: log.topics.len(),
            });
        }
        if log.data.len() != Self::DATA_LEN {
            return Err(DecodeError::DataLength {
                expected: Self::DATA_LEN,
                found: log.data.len(),
            });
        }

        let user = Address::from_word(log.topics[1]);
        let token = Address::from_word(log.topics[2]);

        let amount = U256::from_be_slice(&log.data[..WORD]);
        let chain_id_word = U256::from_be_slice(&log.data[WORD..]);
        let destination_chain_id = u64::try_from(chain_id_word)
            .map_err(|_| DecodeError::ChainIdOverflow(chain_id_word))?;

        Ok(BridgeEvent {
            transaction_hash: log.transaction_hash,
            block_height: log.block_height,
            user,
            token,
            amount,
            destination_chain_id,
        })
    }
}
