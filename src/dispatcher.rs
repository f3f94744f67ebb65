//! Message Dispatcher (§4.3): classifies raw JSON-RPC frames and routes them
//! to type-specific handling, then through the Event Router to the consumer
//! sink. JSON parse failures, validation failures, and handler errors are
//! counted and never terminate the dispatcher loop — every message is
//! handled in isolation, matching the original Python `message_dispatcher.py`
//! handler-dispatch-table design this module is grounded on.

use base64::Engine;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::dex::DexParserRegistry;
use crate::domain::{BlockchainEvent, DexKind, EventSource, SubscriptionKind};
use crate::events::{EventRouter, InboundRecord};
use crate::monitor::SystemMonitor;
use crate::subscription::{PendingOutcome, SubscriptionRegistry};

/// High-water-mark for the bounded sink channel before the backpressure
/// policy in §5 engages.
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

pub struct MessageDispatcher {
    subscriptions: Arc<SubscriptionRegistry>,
    parsers: Arc<DexParserRegistry>,
    router: Arc<EventRouter>,
    monitor: Arc<SystemMonitor>,
    sink: mpsc::Sender<BlockchainEvent>,
}

impl MessageDispatcher {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        parsers: Arc<DexParserRegistry>,
        router: Arc<EventRouter>,
        monitor: Arc<SystemMonitor>,
        sink: mpsc::Sender<BlockchainEvent>,
    ) -> Self {
        Self { subscriptions, parsers, router, monitor, sink }
    }

    /// Parses one frame and routes it. Never returns an error the caller
    /// must propagate — all failures are counted and logged internally.
    pub async fn dispatch_message(&self, raw: &str, program_id: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.monitor.increment_counter("dispatcher_json_parse_failures", 1);
                warn!(error = %e, "failed to parse frame as JSON");
                return;
            }
        };

        if let (Some(id), Some(result)) = (value.get("id").and_then(Value::as_u64), value.get("result")) {
            if let Some(subscription_id) = result.as_u64() {
                self.handle_confirmation(id, subscription_id);
                return;
            }
        }

        if let Some(error) = value.get("error") {
            self.handle_error(value.get("id").and_then(Value::as_u64), error);
            return;
        }

        match value.get("method").and_then(Value::as_str) {
            Some("logsNotification") => self.handle_logs_notification(&value, program_id).await,
            Some("accountNotification") => self.handle_account_notification(&value, program_id).await,
            Some("programNotification") => self.handle_logs_notification(&value, program_id).await,
            _ => {
                self.monitor.increment_counter("dispatcher_unknown_frames", 1);
                warn!("unrecognized frame shape, dropping");
            }
        }
    }

    fn handle_confirmation(&self, request_id: u64, subscription_id: u64) {
        let completed = self
            .subscriptions
            .complete_pending(request_id, PendingOutcome::Success { subscription_id });
        if !completed {
            warn!(request_id, "subscription confirmation for unknown request-id");
        }
    }

    fn handle_error(&self, id: Option<u64>, error: &Value) {
        let info = error.to_string();
        match id {
            Some(request_id) => {
                if !self.subscriptions.complete_pending(request_id, PendingOutcome::Error { info: info.clone() }) {
                    warn!(request_id, %info, "error response for unknown request-id");
                }
            }
            None => warn!(%info, "error response with no correlating id"),
        }
    }

    async fn handle_logs_notification(&self, value: &Value, program_id: &str) {
        let params = match value.get("params") {
            Some(p) => p,
            None => return self.degrade(value, "logsNotification missing params").await,
        };
        let subscription_id = match params.get("subscription").and_then(Value::as_u64) {
            Some(s) => s,
            None => return self.degrade(value, "logsNotification missing subscription id").await,
        };

        let logs: Vec<String> = params
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.get("logs"))
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|l| l.as_str().map(String::from)).collect())
            .unwrap_or_default();

        // An empty logs array in a logs notification is rejected (§8).
        if logs.is_empty() {
            return self.degrade(value, "empty logs array").await;
        }

        let signature = params
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.get("signature"))
            .and_then(Value::as_str)
            .map(String::from);
        let slot = params
            .get("result")
            .and_then(|r| r.get("context"))
            .and_then(|c| c.get("slot"))
            .and_then(Value::as_u64);

        let resolved = self.subscriptions.resolve(subscription_id);
        let (pool_address, dex_kind) = match &resolved {
            Some(sub) => (Some(sub.pool_address.clone()), Some(sub.dex_kind)),
            None => (None, None),
        };

        let swap_info = dex_kind
            .and_then(|k| self.parsers.get(k))
            .map(|parser| parser.parse_swap_logs(&logs));

        let record = InboundRecord {
            source: Some(EventSource::LogNotification),
            subscription_id: Some(subscription_id),
            pool_address,
            dex_kind,
            logs,
            signature,
            slot,
            swap_info,
            pool_state: None,
            event_type_hint_creation: false,
            raw_message: Some(value.to_string()),
        };

        self.emit(self.router.route(record), program_id).await;
    }

    async fn handle_account_notification(&self, value: &Value, program_id: &str) {
        let params = match value.get("params") {
            Some(p) => p,
            None => return self.degrade(value, "accountNotification missing params").await,
        };
        let subscription_id = match params.get("subscription").and_then(Value::as_u64) {
            Some(s) => s,
            None => return self.degrade(value, "accountNotification missing subscription id").await,
        };

        let data_b64 = params
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.get("data"))
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(Value::as_str);

        let resolved = self.subscriptions.resolve(subscription_id);
        let (pool_address, dex_kind) = match &resolved {
            Some(sub) => (Some(sub.pool_address.clone()), Some(sub.dex_kind)),
            None => (None, None),
        };

        let pool_state = match (data_b64, dex_kind) {
            (Some(b64), Some(kind)) => {
                let decoded = base64::engine::general_purpose::STANDARD.decode(b64).ok();
                decoded.and_then(|bytes| self.parsers.get(kind).and_then(|p| p.decode_pool_state(&bytes).ok()))
            }
            _ => None,
        };

        let slot = params
            .get("result")
            .and_then(|r| r.get("context"))
            .and_then(|c| c.get("slot"))
            .and_then(Value::as_u64);

        let record = InboundRecord {
            source: Some(EventSource::AccountNotification),
            subscription_id: Some(subscription_id),
            pool_address,
            dex_kind,
            logs: Vec::new(),
            signature: None,
            slot,
            swap_info: None,
            pool_state,
            event_type_hint_creation: false,
            raw_message: Some(value.to_string()),
        };

        self.emit(self.router.route(record), program_id).await;
    }

    async fn degrade(&self, value: &Value, reason: &str) {
        self.monitor.increment_counter("dispatcher_validation_failures", 1);
        warn!(%reason, "dropping malformed frame");
        let record = InboundRecord {
            raw_message: Some(value.to_string()),
            ..Default::default()
        };
        self.emit(self.router.route(record), "unknown").await;
    }

    /// Bounded-sink backpressure (§5): pool-creation events never drop and
    /// block the read loop; everything else uses a non-blocking `try_send`
    /// and increments `dropped_events` on overflow.
    async fn emit(&self, event: BlockchainEvent, _program_id: &str) {
        match &event {
            BlockchainEvent::PoolCreation { .. } => {
                if self.sink.send(event).await.is_err() {
                    self.monitor.increment_counter("sink_closed_drops", 1);
                }
            }
            _ => {
                if let Err(mpsc::error::TrySendError::Full(_)) = self.sink.try_send(event) {
                    self.monitor.increment_counter("dropped_events", 1);
                }
            }
        }
    }

    /// Builds the outbound subscribe frame for a pool. `dex_kind` selects no
    /// wire-level difference today but is threaded through so callers can
    /// correlate the eventual confirmation back to the right parser via
    /// `SubscriptionRegistry::bind`.
    pub fn subscribe_request(&self, request_id: u64, method: &str, pool_address: &str, dex_kind: DexKind, kind: SubscriptionKind) -> String {
        let _ = (dex_kind, kind);
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": [pool_address, {"commitment": "confirmed"}],
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::now_ts;
    use crate::monitor::Thresholds;

    fn build() -> (MessageDispatcher, mpsc::Receiver<BlockchainEvent>, Arc<SubscriptionRegistry>) {
        let subscriptions = SubscriptionRegistry::new();
        let parsers = Arc::new(DexParserRegistry::with_defaults());
        let monitor = Arc::new(SystemMonitor::new(Thresholds::default(), 100));
        let router = Arc::new(EventRouter::new(monitor.clone(), 150.0));
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = MessageDispatcher::new(subscriptions.clone(), parsers, router, monitor, tx);
        (dispatcher, rx, subscriptions)
    }

    #[tokio::test]
    async fn confirmation_completes_matching_pending_request() {
        let (dispatcher, _rx, subscriptions) = build();
        let handle = subscriptions.register_pending(1);
        dispatcher.dispatch_message(r#"{"jsonrpc":"2.0","id":1,"result":42}"#, "prog").await;
        let outcome = handle.await_outcome().await.unwrap();
        assert!(matches!(outcome, PendingOutcome::Success { subscription_id: 42 }));
    }

    #[tokio::test]
    async fn scenario_s1_logs_notification_emits_swap() {
        let (dispatcher, mut rx, subscriptions) = build();
        subscriptions.bind(42, 1, "PoolA".repeat(8), DexKind::ConstantProduct, SubscriptionKind::Logs, "prog".to_string());

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "logsNotification",
            "params": {
                "subscription": 42,
                "result": {
                    "context": {"slot": 1000},
                    "value": {"signature": "a".repeat(64), "logs": ["Program log: Instruction: Swap"], "err": null}
                }
            }
        });
        dispatcher.dispatch_message(&frame.to_string(), "prog").await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BlockchainEvent::Swap { .. } | BlockchainEvent::Unhandled { .. }));
    }

    #[tokio::test]
    async fn empty_logs_array_is_rejected() {
        let (dispatcher, mut rx, subscriptions) = build();
        subscriptions.bind(7, 1, "PoolB".repeat(8), DexKind::ConstantProduct, SubscriptionKind::Logs, "prog".to_string());
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "logsNotification",
            "params": {"subscription": 7, "result": {"context": {"slot": 1}, "value": {"logs": []}}}
        });
        dispatcher.dispatch_message(&frame.to_string(), "prog").await;
        let event = rx.recv().await.unwrap();
        match event {
            BlockchainEvent::Unhandled { reason, .. } => assert_eq!(reason.as_deref(), Some("empty logs array")),
            other => panic!("expected Unhandled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_counted_and_does_not_panic() {
        let (dispatcher, _rx, _subs) = build();
        dispatcher.dispatch_message("not json at all", "prog").await;
        assert_eq!(dispatcher.monitor.counter_value("dispatcher_json_parse_failures"), 1);
    }

    #[test]
    fn timestamp_invariant_holds_for_new_events() {
        assert!(now_ts() > 0.0);
    }
}
