//! Event Router & Specialized Handlers (§4.4): applies handlers in priority
//! order, first acceptor wins, turning dispatcher output into validated
//! `BlockchainEvent`s. No handler here ever throws; an unmatched or invalid
//! record degrades to `Unhandled` carrying a reason.

use std::sync::Arc;
use tracing::warn;

use crate::domain::{
    now_ts, BlockchainEvent, CreationMetadata, DexKind, EventBase, EventSource, LiquidityQuality,
    PoolState, SwapInfo, VolumeInfo,
};
use crate::monitor::SystemMonitor;

const POOL_CREATION_KEYWORDS: [&str; 4] = ["pool_creation", "initialize", "create_pool", "new_pool"];

/// A sentinel used when a pool address fails basic validation, so the
/// handler still emits rather than dropping the event.
const SENTINEL_POOL_ADDRESS: &str = "11111111111111111111111111111111";

/// Normalized dispatcher output, handed to the router for enrichment.
#[derive(Debug, Clone, Default)]
pub struct InboundRecord {
    pub source: Option<EventSource>,
    pub subscription_id: Option<u64>,
    pub pool_address: Option<String>,
    pub dex_kind: Option<DexKind>,
    pub logs: Vec<String>,
    pub signature: Option<String>,
    pub slot: Option<u64>,
    pub swap_info: Option<SwapInfo>,
    pub pool_state: Option<PoolState>,
    pub event_type_hint_creation: bool,
    pub raw_message: Option<String>,
}

/// A coarse reference-currency price used only when the per-token price
/// looks native-asset-denominated (<1.0); configurable via
/// `REFERENCE_CURRENCY_FALLBACK_PRICE` in the Configuration Registry.
pub const DEFAULT_REFERENCE_CURRENCY_PRICE: f64 = 150.0;

pub struct EventRouter {
    monitor: Arc<SystemMonitor>,
    reference_currency_price: f64,
}

impl EventRouter {
    pub fn new(monitor: Arc<SystemMonitor>, reference_currency_price: f64) -> Self {
        Self { monitor, reference_currency_price }
    }

    pub fn route(&self, record: InboundRecord) -> BlockchainEvent {
        let event = self
            .try_pool_creation(&record)
            .or_else(|| self.try_swap(&record))
            .or_else(|| self.try_account_update(&record))
            .unwrap_or_else(|| self.unhandled(&record, "no handler accepted this record"));

        self.monitor.increment_counter(&format!("events_emitted_{}", event.event_type()), 1);
        event
    }

    fn base_for(&self, record: &InboundRecord, handler: &str) -> EventBase {
        let mut base = EventBase::new(record.source.unwrap_or(EventSource::LogNotification), handler);
        base.subscription_id = record.subscription_id;
        base.pool_address = record.pool_address.clone();
        base.dex_kind = record.dex_kind;
        base.signature = record.signature.clone();
        base.slot = record.slot;
        base.processing_timestamp = Some(now_ts());
        base
    }

    /// Highest priority: logs mention a creation keyword, or the dispatcher
    /// already flagged this record as a creation.
    fn try_pool_creation(&self, record: &InboundRecord) -> Option<BlockchainEvent> {
        let mentions_creation = record.logs.iter().any(|l| {
            let lower = l.to_ascii_lowercase();
            POOL_CREATION_KEYWORDS.iter().any(|kw| lower.contains(kw))
        });
        if !mentions_creation && !record.event_type_hint_creation {
            return None;
        }

        let mut base = self.base_for(record, "pool_creation");
        let signature = record.signature.clone().unwrap_or_default();
        let mut pool_address = record.pool_address.clone().unwrap_or_default();
        if pool_address.is_empty() || pool_address.len() < 32 {
            warn!(pool_address = %pool_address, "malformed pool address on creation, substituting sentinel");
            pool_address = SENTINEL_POOL_ADDRESS.to_string();
        }
        base.pool_address = Some(pool_address.clone());

        let metadata = CreationMetadata {
            pool_address,
            dex_kind: record.dex_kind,
            creation_signature: signature,
            created_at_iso: chrono::Utc::now().to_rfc3339(),
            has_initial_price: record.swap_info.as_ref().and_then(|s| s.top_level_price()).is_some(),
        };

        Some(BlockchainEvent::PoolCreation {
            base,
            initial_price: record.swap_info.as_ref().and_then(|s| s.top_level_price()),
            monitoring_candidate: true,
            creation_metadata: metadata,
            logs: record.logs.clone(),
        })
    }

    /// Accepted when the source is a logs-derived notification, logs are
    /// present, and the dispatcher attached a parser result for this dex.
    fn try_swap(&self, record: &InboundRecord) -> Option<BlockchainEvent> {
        let source_ok = matches!(record.source, Some(EventSource::LogNotification) | Some(EventSource::LogUpdate));
        if !source_ok || record.logs.is_empty() {
            return None;
        }
        let swap_info = record.swap_info.clone()?;
        if !swap_info.is_emittable() {
            return Some(self.unhandled(record, "No swap found in logs"));
        }

        let base = self.base_for(record, "swap");
        let price = swap_info.top_level_price();
        let volume_info = match (swap_info.amount_in, swap_info.amount_out, price) {
            (Some(amount_in), Some(amount_out), Some(p)) => {
                let larger = amount_in.max(amount_out);
                let estimate = if p < 1.0 {
                    larger * self.reference_currency_price
                } else {
                    larger * p
                };
                Some(VolumeInfo { estimated_volume_reference_currency: estimate, confidence: 0.3 })
            }
            _ => None,
        };

        Some(BlockchainEvent::Swap { base, swap_info, price, volume_info, logs: record.logs.clone() })
    }

    /// Accepted for account-derived records; computes price from reserves
    /// unless the parser already decoded a direct price.
    fn try_account_update(&self, record: &InboundRecord) -> Option<BlockchainEvent> {
        let source_ok = matches!(record.source, Some(EventSource::AccountNotification) | Some(EventSource::AccountUpdate));
        if !source_ok {
            return None;
        }
        let pool_state = record.pool_state.clone()?;
        if !pool_state.decimals_valid() {
            return Some(self.unhandled(record, "decimals out of range (must be 1..=18)"));
        }

        let base = self.base_for(record, "account_update");
        let price = pool_state.constant_product_price();
        let liquidity_quality = price.map(|_| LiquidityQuality::from_base_reserve(pool_state.base_reserve)).unwrap_or(LiquidityQuality::Unknown);

        Some(BlockchainEvent::AccountUpdate {
            base,
            price,
            liquidity_base_asset: Some(pool_state.base_reserve),
            liquidity_quality,
            reserves_raw: Some((pool_state.base_reserve, pool_state.quote_reserve)),
            decimals: Some((pool_state.base_decimals, pool_state.quote_decimals)),
            vaults: Some((pool_state.base_vault.clone(), pool_state.quote_vault.clone())),
        })
    }

    fn unhandled(&self, record: &InboundRecord, reason: &str) -> BlockchainEvent {
        BlockchainEvent::Unhandled {
            base: self.base_for(record, "none"),
            reason: Some(reason.to_string()),
            raw_message: record.raw_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{SystemMonitor, Thresholds};

    fn router() -> EventRouter {
        EventRouter::new(Arc::new(SystemMonitor::new(Thresholds::default(), 100)), DEFAULT_REFERENCE_CURRENCY_PRICE)
    }

    #[test]
    fn scenario_s1_happy_swap() {
        let router = router();
        let record = InboundRecord {
            source: Some(EventSource::LogNotification),
            subscription_id: Some(42),
            pool_address: Some("PoolA".repeat(8)),
            dex_kind: Some(DexKind::ConstantProduct),
            logs: vec!["Program log: Instruction: Swap".to_string()],
            signature: Some("a".repeat(64)),
            slot: Some(1000),
            swap_info: Some(SwapInfo {
                found_swap: true,
                price: Some(0.00012),
                amount_in: Some(1000.0),
                amount_out: Some(120000.0),
                parsing_confidence: 0.9,
                ..Default::default()
            }),
            ..Default::default()
        };
        match router.route(record) {
            BlockchainEvent::Swap { price, volume_info, .. } => {
                assert_eq!(price, Some(0.00012));
                let vol = volume_info.unwrap();
                assert!((vol.estimated_volume_reference_currency - 120000.0 * 0.00012).abs() < 1e-9);
            }
            other => panic!("expected Swap, got {other:?}"),
        }
    }

    #[test]
    fn scenario_s3_pool_creation() {
        let router = router();
        let record = InboundRecord {
            source: Some(EventSource::LogNotification),
            logs: vec!["Program log: Instruction: initialize".to_string()],
            pool_address: Some("Pool".repeat(10)),
            signature: Some("b".repeat(64)),
            ..Default::default()
        };
        match router.route(record) {
            BlockchainEvent::PoolCreation { monitoring_candidate, creation_metadata, .. } => {
                assert!(monitoring_candidate);
                assert!(!creation_metadata.has_initial_price);
            }
            other => panic!("expected PoolCreation, got {other:?}"),
        }
    }

    #[test]
    fn no_swap_in_logs_degrades_to_unhandled() {
        let router = router();
        let record = InboundRecord {
            source: Some(EventSource::LogNotification),
            logs: vec!["Program log: Instruction: Transfer".to_string()],
            swap_info: Some(SwapInfo::none()),
            ..Default::default()
        };
        match router.route(record) {
            BlockchainEvent::Unhandled { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("No swap found in logs"));
            }
            other => panic!("expected Unhandled, got {other:?}"),
        }
    }

    #[test]
    fn account_update_assigns_liquidity_quality() {
        let router = router();
        let pool_state = PoolState {
            dex_kind: DexKind::ConstantProduct,
            base_reserve: 1e12,
            quote_reserve: 5e10,
            base_decimals: 6,
            quote_decimals: 9,
            base_vault: "vault-base".to_string(),
            quote_vault: "vault-quote".to_string(),
            base_mint: "mint-base".to_string(),
            quote_mint: "mint-quote".to_string(),
            direct_price: None,
        };
        let record = InboundRecord {
            source: Some(EventSource::AccountNotification),
            pool_state: Some(pool_state),
            ..Default::default()
        };
        match router.route(record) {
            BlockchainEvent::AccountUpdate { price, .. } => {
                assert!((price.unwrap() - 5e-5).abs() < 1e-12);
            }
            other => panic!("expected AccountUpdate, got {other:?}"),
        }
    }

    #[test]
    fn invalid_decimals_degrade_to_unhandled() {
        let router = router();
        let pool_state = PoolState {
            dex_kind: DexKind::ConstantProduct,
            base_reserve: 1.0,
            quote_reserve: 1.0,
            base_decimals: 0,
            quote_decimals: 9,
            base_vault: String::new(),
            quote_vault: String::new(),
            base_mint: String::new(),
            quote_mint: String::new(),
            direct_price: None,
        };
        let record = InboundRecord {
            source: Some(EventSource::AccountNotification),
            pool_state: Some(pool_state),
            ..Default::default()
        };
        assert!(matches!(router.route(record), BlockchainEvent::Unhandled { .. }));
    }

    #[test]
    fn malformed_pool_address_substitutes_sentinel() {
        let router = router();
        let record = InboundRecord {
            source: Some(EventSource::LogNotification),
            logs: vec!["new_pool created".to_string()],
            pool_address: Some("short".to_string()),
            signature: Some("c".repeat(64)),
            ..Default::default()
        };
        match router.route(record) {
            BlockchainEvent::PoolCreation { creation_metadata, .. } => {
                assert_eq!(creation_metadata.pool_address, SENTINEL_POOL_ADDRESS);
            }
            other => panic!("expected PoolCreation, got {other:?}"),
        }
    }
}
