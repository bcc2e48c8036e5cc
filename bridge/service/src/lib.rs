// Copyright (c) 2024 The Botho Foundation

//! Lock event relay service.
//!
//! Watches a bridge contract on the source chain for `TokensLocked` events
//! and tells the relaying service about each one exactly once. The engine is
//! generic over its chain and relayer so both can be replaced in tests.

pub mod chain;
pub mod engine;
pub mod error;
pub mod relay;

pub use chain::{ChainReader, EthereumChainReader};
pub use engine::{
    load_or_init_checkpoint, watch_interrupts, CycleOutcome, CycleReport, ScanEngine, Shutdown,
    ShutdownSignal,
};
pub use error::{ChainError, EngineError, RelayError};
pub use relay::{HttpRelayNotifier, RelayNotifier};
