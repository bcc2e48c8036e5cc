// Copyright (c) 2024 The Botho Foundation

//! Listener configuration types.
//!
//! Configuration comes from an optional TOML file, then environment
//! variables override individual fields. [`ListenerConfig::scan_settings`]
//! validates everything the engine needs and fails fast otherwise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::RetryPolicy;
use crate::types::BlockHeight;

pub const ENV_RPC_URL: &str = "SOURCE_CHAIN_RPC_URL";
pub const ENV_BRIDGE_CONTRACT: &str = "BRIDGE_CONTRACT_ADDRESS";
pub const ENV_EVENT_TOPIC: &str = "TOKENS_LOCKED_EVENT_HASH";
pub const ENV_RELAYER_ENDPOINT: &str = "RELAYER_API_ENDPOINT";
pub const ENV_START_BLOCK: &str = "START_BLOCK";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main listener configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Source chain node and watched contract
    #[serde(default)]
    pub source: SourceChainConfig,

    /// Relaying service
    #[serde(default)]
    pub relayer: RelayerConfig,

    /// Loop and persistence settings
    #[serde(default)]
    pub listener: ListenerSettings,
}

/// Source chain connection and event filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceChainConfig {
    /// JSON-RPC URL (required)
    #[serde(default)]
    pub rpc_url: String,

    /// Bridge contract emitting `TokensLocked` (required)
    #[serde(default)]
    pub bridge_contract: String,

    /// keccak256 of the event signature (required)
    #[serde(default)]
    pub event_topic: String,

    /// First block to scan on a cold start; ignored once a checkpoint exists.
    /// When unset, the listener starts at `head - confirmation_depth + 1`,
    /// the first block that was not yet final at startup, rather than at the
    /// head itself. Lock events in the unconfirmed tail are therefore still
    /// relayed once they are final.
    #[serde(default)]
    pub start_block: Option<BlockHeight>,

    /// Blocks to wait behind the head before a block is considered final
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,

    /// Upper bound on blocks requested per log query (0 = unbounded)
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,

    /// Timeout for each RPC call in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

/// Relaying service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerConfig {
    /// URL receiving mint/unlock instructions
    #[serde(default = "default_relayer_endpoint")]
    pub endpoint: String,

    /// Timeout for each relay call in seconds
    #[serde(default = "default_relayer_timeout")]
    pub timeout_secs: u64,
}

/// Poll loop, retry and checkpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Checkpoint file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Sleep between polls when no new block is final
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Delay before the first relay retry; doubles per failed attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Cap on the relay retry delay
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,

    /// Park a dispatch after this many failed attempts (unset = never)
    #[serde(default)]
    pub max_dispatch_attempts: Option<u32>,

    /// Forget relayed ids this many blocks behind the scan position
    /// (unset = keep forever)
    #[serde(default)]
    pub processed_retention_blocks: Option<u64>,
}

fn default_confirmation_depth() -> u64 {
    12
}

fn default_max_block_range() -> u64 {
    1_000
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_relayer_endpoint() -> String {
    "https://api.example-relayer.com/submit".to_string()
}

fn default_relayer_timeout() -> u64 {
    10
}

fn default_state_file() -> PathBuf {
    PathBuf::from("listener_state.json")
}

fn default_poll_interval() -> u64 {
    15
}

fn default_retry_base_delay() -> u64 {
    15
}

fn default_retry_max_delay() -> u64 {
    900
}

impl Default for SourceChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            bridge_contract: String::new(),
            event_topic: String::new(),
            start_block: None,
            confirmation_depth: default_confirmation_depth(),
            max_block_range: default_max_block_range(),
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_relayer_endpoint(),
            timeout_secs: default_relayer_timeout(),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            poll_interval_secs: default_poll_interval(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            max_dispatch_attempts: None,
            processed_retention_blocks: None,
        }
    }
}

/// Validated, typed settings for the scan engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub contract: Address,
    pub event_topic: B256,
    pub start_block: Option<BlockHeight>,
    pub confirmation_depth: u64,
    pub max_block_range: u64,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub processed_retention: Option<u64>,
}

impl ListenerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from `path` when it exists, otherwise start from defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            tracing::info!("Loading configuration from {}", path.display());
            Self::from_file(path)
        } else {
            tracing::info!(
                "No configuration file at {}, using defaults and environment",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by the `ENV_*` names. Empty values
    /// are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_RPC_URL) {
            self.source.rpc_url = url;
        }
        if let Some(contract) = get(ENV_BRIDGE_CONTRACT) {
            self.source.bridge_contract = contract;
        }
        if let Some(topic) = get(ENV_EVENT_TOPIC) {
            self.source.event_topic = topic;
        }
        if let Some(endpoint) = get(ENV_RELAYER_ENDPOINT) {
            self.relayer.endpoint = endpoint;
        }
        if let Some(start) = get(ENV_START_BLOCK) {
            let start = start.trim().parse().map_err(|e| ConfigError::Invalid {
                field: ENV_START_BLOCK,
                reason: format!("{}", e),
            })?;
            self.source.start_block = Some(start);
        }

        Ok(())
    }

    /// Validate the configuration and convert it for the engine.
    pub fn scan_settings(&self) -> Result<ScanSettings, ConfigError> {
        if self.source.rpc_url.trim().is_empty() {
            return Err(ConfigError::Missing("source.rpc_url (SOURCE_CHAIN_RPC_URL)"));
        }
        if self.source.bridge_contract.trim().is_empty() {
            return Err(ConfigError::Missing(
                "source.bridge_contract (BRIDGE_CONTRACT_ADDRESS)",
            ));
        }
        if self.source.event_topic.trim().is_empty() {
            return Err(ConfigError::Missing(
                "source.event_topic (TOKENS_LOCKED_EVENT_HASH)",
            ));
        }

        let contract = self
            .source
            .bridge_contract
            .trim()
            .parse::<Address>()
            .map_err(|e| ConfigError::Invalid {
                field: "source.bridge_contract",
                reason: e.to_string(),
            })?;
        let event_topic = self
            .source
            .event_topic
            .trim()
            .parse::<B256>()
            .map_err(|e| ConfigError::Invalid {
                field: "source.event_topic",
                reason: e.to_string(),
            })?;

        self.relayer_endpoint()?;

        if self.listener.retry_max_delay_secs < self.listener.retry_base_delay_secs {
            return Err(ConfigError::Invalid {
                field: "listener.retry_max_delay_secs",
                reason: "must be >= retry_base_delay_secs".to_string(),
            });
        }
        if self.listener.max_dispatch_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                field: "listener.max_dispatch_attempts",
                reason: "must be at least 1 when set".to_string(),
            });
        }

        Ok(ScanSettings {
            contract,
            event_topic,
            start_block: self.source.start_block,
            confirmation_depth: self.source.confirmation_depth,
            max_block_range: self.source.max_block_range,
            poll_interval: Duration::from_secs(self.listener.poll_interval_secs),
            retry: RetryPolicy {
                base_delay: Duration::from_secs(self.listener.retry_base_delay_secs),
                max_delay: Duration::from_secs(self.listener.retry_max_delay_secs),
                max_attempts: self.listener.max_dispatch_attempts,
            },
            processed_retention: self.listener.processed_retention_blocks,
        })
    }

    /// The relayer URL, checked for an http(s) scheme.
    pub fn relayer_endpoint(&self) -> Result<&str, ConfigError> {
        let endpoint = self.relayer.endpoint.trim();
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            Ok(endpoint)
        } else {
            Err(ConfigError::Invalid {
                field: "relayer.endpoint",
                reason: format!("expected an http(s) URL, got {:?}", endpoint),
            })
        }
    }

    pub fn relayer_timeout(&self) -> Duration {
        Duration::from_secs(self.relayer.timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.source.rpc_timeout_secs)
    }
}
