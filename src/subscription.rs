//! Subscription Registry: correlates request-ids with server-assigned
//! subscription-ids and tracks what each subscription means.
//!
//! Single logical owner of `Subscription` and `PendingConfirmation` state;
//! lookups favor a lock-free-friendly map shape over the Connection
//! Manager's heavier per-task ownership model.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

use crate::domain::{now_ts, DexKind, SubscriptionKind};
use crate::error::{IngestError, Result};

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscription_id: u64,
    pub request_id: u64,
    pub pool_address: String,
    pub dex_kind: DexKind,
    pub kind: SubscriptionKind,
    pub created_ts: f64,
    pub program_id: String,
}

#[derive(Debug, Clone)]
pub enum PendingOutcome {
    Success { subscription_id: u64 },
    Error { info: String },
}

pub struct CompletionHandle {
    pub request_id: u64,
    receiver: oneshot::Receiver<PendingOutcome>,
}

impl CompletionHandle {
    /// Awaits the confirmation with the default 60s timeout from §4.2.
    pub async fn await_outcome(self) -> Result<PendingOutcome> {
        match tokio::time::timeout(Duration::from_secs(60), self.receiver).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(IngestError::PendingNotFound(self.request_id)),
            Err(_) => Err(IngestError::Timeout(Duration::from_secs(60))),
        }
    }
}

struct PendingState {
    sender: Option<oneshot::Sender<PendingOutcome>>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    pending: RwLock<HashMap<u64, PendingState>>,
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    by_connection: RwLock<HashMap<String, Vec<u64>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every outbound subscribe request has exactly one pending confirmation
    /// until resolved or timed out.
    pub fn register_pending(&self, request_id: u64) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(request_id, PendingState { sender: Some(tx) });
        CompletionHandle { request_id, receiver: rx }
    }

    /// Completes a pending request. Unknown request-ids are dropped silently
    /// (the dispatcher logs a warning at the call site).
    pub fn complete_pending(&self, request_id: u64, outcome: PendingOutcome) -> bool {
        let sender = {
            let mut pending = self.pending.write();
            pending.remove(&request_id).and_then(|mut p| p.sender.take())
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// `bind` is only ever called after `complete_pending(success)`.
    pub fn bind(&self, subscription_id: u64, request_id: u64, pool_address: String, dex_kind: DexKind, kind: SubscriptionKind, program_id: String) {
        let sub = Subscription {
            subscription_id,
            request_id,
            pool_address,
            dex_kind,
            kind,
            created_ts: now_ts(),
            program_id: program_id.clone(),
        };
        self.subscriptions.write().insert(subscription_id, sub);
        self.by_connection.write().entry(program_id).or_default().push(subscription_id);
    }

    pub fn resolve(&self, subscription_id: u64) -> Option<Subscription> {
        self.subscriptions.read().get(&subscription_id).cloned()
    }

    /// Invalidates all subscriptions owned by a connection on reconnect.
    pub fn drop_for_connection(&self, program_id: &str) {
        if let Some(ids) = self.by_connection.write().remove(program_id) {
            let mut subs = self.subscriptions.write();
            for id in ids {
                subs.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_completes_exact_pending_request() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.register_pending(7);
        registry.complete_pending(7, PendingOutcome::Success { subscription_id: 42 });
        let outcome = handle.await_outcome().await.unwrap();
        match outcome {
            PendingOutcome::Success { subscription_id } => assert_eq!(subscription_id, 42),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn spurious_confirmation_for_unknown_request_is_dropped() {
        let registry = SubscriptionRegistry::new();
        let completed = registry.complete_pending(999, PendingOutcome::Success { subscription_id: 1 });
        assert!(!completed);
    }

    #[test]
    fn resolve_returns_not_found_after_drop_for_connection() {
        let registry = SubscriptionRegistry::new();
        registry.bind(42, 7, "PoolA".to_string(), DexKind::ConstantProduct, SubscriptionKind::Logs, "prog-1".to_string());
        assert!(registry.resolve(42).is_some());
        registry.drop_for_connection("prog-1");
        assert!(registry.resolve(42).is_none());
    }
}
