// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Matches responses to the requests that caused them.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::protocol::{RequestId, ResponseMessage};
use crate::error::{LspError, Result};

/// What a waiting caller eventually receives.
pub type Completion = Result<ResponseMessage>;

/// One outstanding request.
#[derive(Debug)]
struct PendingRequest {
    method: String,
    timeout: Duration,
    deadline: Instant,
    slot: oneshot::Sender<Completion>,
}

/// Outstanding requests of a single connection, keyed by id.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<i64, PendingRequest>>,
}

impl Correlator {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers request `id` and returns the receiver its caller waits on.
    ///
    /// Expired entries are swept on every registration and their waiters are
    /// failed with [`LspError::RequestTimeout`].
    pub async fn register(
        &self,
        id: i64,
        method: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let mut pending = self.pending.lock().await;
        sweep_expired(&mut pending, now);
        pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                timeout,
                deadline: now + timeout,
                slot: tx,
            },
        );
        drop(pending);

        rx
    }

    /// Delivers a response. Returns false if no caller is waiting for its id.
    pub async fn fulfill(&self, response: ResponseMessage) -> bool {
        let Some(RequestId::Number(id)) = response.id else {
            warn!("Received response with unusable id: {:?}", response.id);
            return false;
        };

        let Some(entry) = self.pending.lock().await.remove(&id) else {
            warn!("Received response for unknown request id: {}", id);
            return false;
        };

        // The caller may have given up already; that is not an error here.
        let _ = entry.slot.send(Ok(response));
        true
    }

    /// Drops the entry for `id` without completing it.
    pub async fn forget(&self, id: i64) {
        self.pending.lock().await.remove(&id);
    }

    /// Fails every outstanding request with `error`.
    pub async fn fail_all(&self, error: &LspError) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!("Failing {} pending requests: {}", drained.len(), error);
        }
        for (_, entry) in drained {
            let _ = entry.slot.send(Err(error.clone()));
        }
    }

    /// Number of requests still waiting.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Returns true if no request is waiting.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

fn sweep_expired(pending: &mut HashMap<i64, PendingRequest>, now: Instant) {
    let expired: Vec<i64> = pending
        .iter()
        .filter(|(_, entry)| entry.deadline <= now)
        .map(|(id, _)| *id)
        .collect();

    for id in expired {
        if let Some(entry) = pending.remove(&id) {
            debug!("Request {} ({}) expired", id, entry.method);
            let _ = entry.slot.send(Err(LspError::RequestTimeout {
                method: entry.method,
                timeout: entry.timeout,
            }));
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;

    fn response(id: i64, result: serde_json::Value) -> ResponseMessage {
        ResponseMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::Number(id)),
            result: Some(result),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_out_of_order_fulfillment() {
        let correlator = Correlator::new();
        let rx1 = correlator.register(1, "a", Duration::from_secs(5)).await;
        let rx2 = correlator.register(2, "b", Duration::from_secs(5)).await;

        assert!(correlator.fulfill(response(2, serde_json::json!("two"))).await);
        assert!(correlator.fulfill(response(1, serde_json::json!("one"))).await);

        assert_eq!(rx1.await.unwrap().unwrap().result.unwrap(), "one");
        assert_eq!(rx2.await.unwrap().unwrap().result.unwrap(), "two");
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.fulfill(response(99, serde_json::Value::Null)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_swept_on_register() {
        let correlator = Correlator::new();
        let stale = correlator
            .register(1, "textDocument/hover", Duration::from_millis(100))
            .await;

        tokio::time::advance(Duration::from_millis(150)).await;
        let _fresh = correlator.register(2, "x", Duration::from_secs(5)).await;

        match stale.await.unwrap() {
            Err(LspError::RequestTimeout { method, .. }) => {
                assert_eq!(method, "textDocument/hover");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(correlator.len().await, 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = Correlator::new();
        let rx = correlator.register(1, "a", Duration::from_secs(5)).await;

        correlator.fail_all(&LspError::ConnectionClosed).await;

        assert_eq!(rx.await.unwrap().unwrap_err(), LspError::ConnectionClosed);
        assert!(correlator.is_empty().await);
    }
}
