// Copyright (c) 2024 The Botho Foundation

//! Relayer notification.
//!
//! Posts each decoded event to the relaying service, which mints or unlocks
//! on the destination chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lock_relay_core::BridgeEvent;
use reqwest::Client;
use tracing::debug;

use crate::error::RelayError;

/// Capability over the relaying service. No partial success: either the
/// instruction was accepted or the event stays pending.
#[async_trait]
pub trait RelayNotifier: Send + Sync {
    async fn submit(&self, event: &BridgeEvent) -> Result<(), RelayError>;
}

#[async_trait]
impl<T: RelayNotifier + ?Sized> RelayNotifier for Arc<T> {
    async fn submit(&self, event: &BridgeEvent) -> Result<(), RelayError> {
        (**self).submit(event).await
    }
}

/// Notifier that POSTs a JSON instruction to an HTTP endpoint.
pub struct HttpRelayNotifier {
    /// HTTP client
    client: Client,
    /// Relayer URL
    endpoint: String,
    /// Per-call timeout
    timeout: Duration,
}

impl HttpRelayNotifier {
    /// Create a notifier whose calls give up after `timeout`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RelayNotifier for HttpRelayNotifier {
    async fn submit(&self, event: &BridgeEvent) -> Result<(), RelayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&event.relay_request())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::Timeout(self.timeout)
                } else {
                    RelayError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(200).collect();

        if !status.is_success() {
            return Err(RelayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            "Relayer accepted tx {} with status {}: {}",
            event.transaction_hash, status, body
        );

        Ok(())
    }
}
