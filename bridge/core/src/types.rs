// Copyright (c) 2024 The Botho Foundation

//! Block ranges, raw logs and decoded bridge events.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Height of a block on the source chain.
pub type BlockHeight = u64;

/// Hash of a source chain transaction. Identifies a bridge event.
pub type TxHash = B256;

/// An inclusive range of block heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: BlockHeight,
    pub to: BlockHeight,
}

impl BlockRange {
    /// Create a range, or `None` when `from > to`.
    pub fn new(from: BlockHeight, to: BlockHeight) -> Option<Self> {
        (from <= to).then_some(Self { from, to })
    }

    /// The next range that is safe to scan.
    ///
    /// Starts right after `last_scanned` and ends at `head - confirmation_depth`,
    /// clipped to at most `max_len` blocks (`0` disables the clip). Returns
    /// `None` when no new block is final yet.
    pub fn next_confirmed(
        last_scanned: BlockHeight,
        head: BlockHeight,
        confirmation_depth: u64,
        max_len: u64,
    ) -> Option<Self> {
        let target = head.checked_sub(confirmation_depth)?;
        let from = last_scanned.checked_add(1)?;
        let to = if max_len > 0 {
            target.min(last_scanned.saturating_add(max_len))
        } else {
            target
        };
        Self::new(from, to)
    }

    /// Number of blocks in the range.
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, height: BlockHeight) -> bool {
        self.from <= height && height <= self.to
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// A log record as returned by the source chain node, already filtered by
/// contract address and event topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogRecord {
    pub transaction_hash: TxHash,
    pub block_height: BlockHeight,
    /// Signature topic first, then indexed arguments.
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// A decoded `TokensLocked` event.
///
/// Identity is the transaction hash: one lock transaction yields one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub transaction_hash: TxHash,
    pub block_height: BlockHeight,
    pub user: Address,
    pub token: Address,
    pub amount: U256,
    pub destination_chain_id: u64,
}

impl BridgeEvent {
    /// Build the body posted to the relayer for this event.
    pub fn relay_request(&self) -> RelayRequest {
        RelayRequest {
            source_transaction_hash: self.transaction_hash,
            recipient: self.user,
            token_address: self.token,
            amount: self.amount.to_string(),
            target_chain_id: self.destination_chain_id,
        }
    }
}

/// JSON body of a relayer mint/unlock instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub source_transaction_hash: TxHash,
    pub recipient: Address,
    pub token_address: Address,
    /// Decimal string; 256-bit amounts do not fit a JSON number.
    pub amount: String,
    pub target_chain_id: u64,
}
