// Copyright (c) 2024 The Botho Foundation

//! Read access to the source chain.

mod ethereum;

pub use ethereum::EthereumChainReader;

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use lock_relay_core::{BlockHeight, BlockRange, RawLogRecord};

use crate::error::ChainError;

/// Capability over a node connection. Reads are idempotent and may be
/// repeated freely.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current head of the chain.
    async fn current_height(&self) -> Result<BlockHeight, ChainError>;

    /// Logs emitted by `address` with `topic` as first topic, in `range`
    /// (both ends inclusive), in chain order.
    async fn logs_in_range(
        &self,
        range: BlockRange,
        address: Address,
        topic: B256,
    ) -> Result<Vec<RawLogRecord>, ChainError>;
}

#[async_trait]
impl<T: ChainReader + ?Sized> ChainReader for Arc<T> {
    async fn current_height(&self) -> Result<BlockHeight, ChainError> {
        (**self).current_height().await
    }

    async fn logs_in_range(
        &self,
        range: BlockRange,
        address: Address,
        topic: B256,
    ) -> Result<Vec<RawLogRecord>, ChainError> {
        (**self).logs_in_range(range, address, topic).await
    }
}
