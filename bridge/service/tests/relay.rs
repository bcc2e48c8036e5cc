// Copyright (c) 2024 The Botho Foundation
//
//! Relayer Client Tests
//!
//! Runs `HttpRelayNotifier` against a local HTTP server. These tests verify:
//! - The JSON instruction body
//! - Status handling (2xx accepted, everything else rejected)
//! - Timeouts and unreachable endpoints

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpListener;

use lock_relay_core::BridgeEvent;
use lock_relay_service::{HttpRelayNotifier, RelayError, RelayNotifier};

// ============================================================================
// Test Helpers
// ============================================================================

type Received = Arc<Mutex<Vec<Value>>>;

/// Spawn a relayer answering every request with `status` after `delay`.
/// Returns the bound address and the JSON bodies it received.
async fn spawn_relayer(status: StatusCode, delay: Duration) -> (SocketAddr, Received) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let received: Received = Arc::new(Mutex::new(Vec::new()));

    let bodies = received.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let bodies = bodies.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let bodies = bodies.clone();
                    async move {
                        let body = match req.into_body().collect().await {
                            Ok(collected) => collected.to_bytes(),
                            Err(_) => Bytes::new(),
                        };
                        if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                            bodies.lock().unwrap().push(value);
                        }
                        tokio::time::sleep(delay).await;

                        let mut response = Response::new(Full::new(Bytes::from("{\"ok\":true}")));
                        *response.status_mut() = status;
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, received)
}

fn sample_event() -> BridgeEvent {
    BridgeEvent {
        transaction_hash: B256::repeat_byte(0xab),
        block_height: 60,
        user: Address::repeat_byte(0x11),
        token: Address::repeat_byte(0x22),
        amount: U256::from(1_000_000_000_000_000_000u128),
        destination_chain_id: 56,
    }
}

fn notifier(addr: SocketAddr, timeout: Duration) -> HttpRelayNotifier {
    HttpRelayNotifier::new(&format!("http://{}/submit", addr), timeout)
        .expect("Failed to build notifier")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_accepted_submission_posts_instruction() {
    let (addr, received) = spawn_relayer(StatusCode::ACCEPTED, Duration::ZERO).await;
    let notifier = notifier(addr, Duration::from_secs(5));

    notifier.submit(&sample_event()).await.unwrap();

    let bodies = received.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(
        body["sourceTransactionHash"].as_str().unwrap().to_lowercase(),
        format!("0x{}", "ab".repeat(32))
    );
    assert_eq!(
        body["recipient"].as_str().unwrap().to_lowercase(),
        format!("0x{}", "11".repeat(20))
    );
    assert_eq!(
        body["tokenAddress"].as_str().unwrap().to_lowercase(),
        format!("0x{}", "22".repeat(20))
    );
    assert_eq!(body["amount"], "1000000000000000000");
    assert_eq!(body["targetChainId"], 56);
}

#[tokio::test]
async fn test_ok_status_is_success() {
    let (addr, _received) = spawn_relayer(StatusCode::OK, Duration::ZERO).await;
    let notifier = notifier(addr, Duration::from_secs(5));

    assert!(notifier.submit(&sample_event()).await.is_ok());
}

#[tokio::test]
async fn test_server_error_is_rejected() {
    let (addr, _received) =
        spawn_relayer(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
    let notifier = notifier(addr, Duration::from_secs(5));

    let err = notifier.submit(&sample_event()).await.unwrap_err();
    match err {
        RelayError::Rejected { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("ok"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_error_is_rejected() {
    let (addr, _received) = spawn_relayer(StatusCode::BAD_REQUEST, Duration::ZERO).await;
    let notifier = notifier(addr, Duration::from_secs(5));

    let err = notifier.submit(&sample_event()).await.unwrap_err();
    assert!(matches!(err, RelayError::Rejected { status: 400, .. }));
}

#[tokio::test]
async fn test_slow_relayer_times_out() {
    let (addr, _received) = spawn_relayer(StatusCode::ACCEPTED, Duration::from_secs(3)).await;
    let notifier = notifier(addr, Duration::from_millis(200));

    let err = notifier.submit(&sample_event()).await.unwrap_err();
    assert!(matches!(err, RelayError::Timeout(_)));
}

#[tokio::test]
async fn test_unreachable_relayer_is_transport_error() {
    // Bind then release a port so nothing is listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let notifier = notifier(addr, Duration::from_secs(2));
    let err = notifier.submit(&sample_event()).await.unwrap_err();
    assert!(matches!(err, RelayError::Transport(_)));
}
