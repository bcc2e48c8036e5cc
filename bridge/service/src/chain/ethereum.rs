// Copyright (c) 2024 The Botho Foundation

//! JSON-RPC chain reader backed by alloy.

use std::future::IntoFuture;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::{RpcError, TransportErrorKind, TransportResult};
use async_trait::async_trait;
use lock_relay_core::{BlockHeight, BlockRange, RawLogRecord};
use tracing::{debug, info};

use super::ChainReader;
use crate::error::ChainError;

/// Reads heights and logs from an Ethereum-compatible node.
pub struct EthereumChainReader {
    provider: DynProvider,
    rpc_timeout: Duration,
}

impl EthereumChainReader {
    /// Connect to `rpc_url` over http or https.
    pub async fn connect(rpc_url: &str, rpc_timeout: Duration) -> Result<Self, ChainError> {
        let provider = tokio::time::timeout(rpc_timeout, ProviderBuilder::new().connect(rpc_url))
            .await
            .map_err(|_| ChainError::Timeout(rpc_timeout))?
            .map_err(classify)?;

        info!("Connected to source chain via {}", rpc_url);

        Ok(Self::new(DynProvider::new(provider), rpc_timeout))
    }

    pub fn new(provider: DynProvider, rpc_timeout: Duration) -> Self {
        Self {
            provider,
            rpc_timeout,
        }
    }

    async fn call<T, F>(&self, request: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = TransportResult<T>>,
    {
        tokio::time::timeout(self.rpc_timeout, request)
            .await
            .map_err(|_| ChainError::Timeout(self.rpc_timeout))?
            .map_err(classify)
    }
}

#[async_trait]
impl ChainReader for EthereumChainReader {
    async fn current_height(&self) -> Result<BlockHeight, ChainError> {
        self.call(self.provider.get_block_number()).await
    }

    async fn logs_in_range(
        &self,
        range: BlockRange,
        address: Address,
        topic: B256,
    ) -> Result<Vec<RawLogRecord>, ChainError> {
        let filter = Filter::new()
            .address(address)
            .event_signature(topic)
            .from_block(range.from)
            .to_block(range.to);

        let logs = self.call(self.provider.get_logs(&filter)).await?;
        debug!("Fetched {} logs for blocks {}", logs.len(), range);

        logs.iter().map(raw_log_from_rpc).collect()
    }
}

/// Logs of a confirmed range always carry their transaction and block.
fn raw_log_from_rpc(log: &Log) -> Result<RawLogRecord, ChainError> {
    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| ChainError::MalformedResponse("log without transaction hash".into()))?;
    let block_height = log.block_number.ok_or_else(|| {
        ChainError::MalformedResponse(format!("log from tx {} without block number", transaction_hash))
    })?;

    Ok(RawLogRecord {
        transaction_hash,
        block_height,
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
    })
}

fn classify(err: RpcError<TransportErrorKind>) -> ChainError {
    match &err {
        RpcError::ErrorResp(_) => ChainError::InvalidRequest(err.to_string()),
        RpcError::NullResp | RpcError::DeserError { .. } => {
            ChainError::MalformedResponse(err.to_string())
        }
        _ => ChainError::Connection(err.to_string()),
    }
}
