// Copyright (c) 2024 The Botho Foundation

//! Core types and logic for the lock event relay.
//!
//! This crate holds everything the relay needs that does not touch the
//! network:
//!
//! - Block ranges, raw logs and decoded bridge events
//! - The `TokensLocked` event decoder
//! - The durable checkpoint (scan progress, relayed ids, pending retries)
//! - The operator command queue applied by the running engine
//! - Configuration structures

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod decoder;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointError, PendingDispatch, RetryPolicy};
pub use config::{ConfigError, ListenerConfig, ScanSettings};
pub use control::{CommandQueue, OperatorCommand, QueuedCommands};
pub use decoder::{DecodeError, EventDecoder, TokensLockedDecoder};
pub use types::{BlockHeight, BlockRange, BridgeEvent, RawLogRecord, RelayRequest, TxHash};
