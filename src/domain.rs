//! Domain event model: declarative, validated record types shared across the
//! ingestion pipeline. Handlers return a new value with enrichment applied;
//! nothing downstream of emission mutates these records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// A closed identifier of a decentralized-exchange program variant. Determines
/// which parser and account-layout applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DexKind {
    /// Constant-product AMM (x*y=k pools, e.g. Raydium AMM V4).
    ConstantProduct,
    /// Concentrated-liquidity AMM (tick-based pools, e.g. Raydium CLMM / Orca Whirlpools).
    ConcentratedLiquidity,
}

impl DexKind {
    pub fn program_id(self) -> &'static str {
        match self {
            DexKind::ConstantProduct => "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8",
            DexKind::ConcentratedLiquidity => "CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK",
        }
    }

    pub fn from_program_id(id: &str) -> Option<Self> {
        match id {
            "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8" => Some(DexKind::ConstantProduct),
            "CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK" => Some(DexKind::ConcentratedLiquidity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Logs,
    Account,
    Program,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    LogNotification,
    AccountNotification,
    ProgramNotification,
    LogUpdate,
    AccountUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityQuality {
    VeryLow,
    Low,
    Medium,
    High,
    Unknown,
}

impl LiquidityQuality {
    /// ≥100 -> high, ≥10 -> medium, ≥1 -> low, <1 -> very_low.
    pub fn from_base_reserve(base_reserve: f64) -> Self {
        if !base_reserve.is_finite() {
            LiquidityQuality::Unknown
        } else if base_reserve >= 100.0 {
            LiquidityQuality::High
        } else if base_reserve >= 10.0 {
            LiquidityQuality::Medium
        } else if base_reserve >= 1.0 {
            LiquidityQuality::Low
        } else {
            LiquidityQuality::VeryLow
        }
    }
}

/// Produced by a DEX parser from a logs vector. Invariant: if `found_swap`,
/// at least one of `price`/`price_ratio` must be present before the event is
/// emitted as a `Swap`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwapInfo {
    pub found_swap: bool,
    pub price: Option<f64>,
    pub price_ratio: Option<f64>,
    pub amount_in: Option<f64>,
    pub amount_out: Option<f64>,
    pub token_in: Option<String>,
    pub token_out: Option<String>,
    pub parsing_confidence: f64,
    pub swap_direction: Option<String>,
    pub fee_amount: Option<f64>,
}

impl SwapInfo {
    pub fn none() -> Self {
        Self::default()
    }

    /// Invariant check from §3: if found_swap, price or price_ratio must be present and positive.
    pub fn is_emittable(&self) -> bool {
        if !self.found_swap {
            return false;
        }
        matches!(self.price, Some(p) if p > 0.0) || matches!(self.price_ratio, Some(p) if p > 0.0)
    }

    pub fn top_level_price(&self) -> Option<f64> {
        self.price.or(self.price_ratio)
    }
}

/// An opaque decoded pool-state record. Never persisted in the core, only
/// forwarded to the Event Router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    pub dex_kind: DexKind,
    pub base_reserve: f64,
    pub quote_reserve: f64,
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub base_vault: String,
    pub quote_vault: String,
    pub base_mint: String,
    pub quote_mint: String,
    /// Present only for DEX variants that expose a direct decoded price
    /// (e.g. concentrated-liquidity pools deriving price from sqrt-price).
    pub direct_price: Option<f64>,
}

impl PoolState {
    /// decimals of 0 or >18 on a pool are rejected.
    pub fn decimals_valid(&self) -> bool {
        (1..=18).contains(&self.base_decimals) && (1..=18).contains(&self.quote_decimals)
    }

    /// Constant-product price = (quote_reserve / 10^quote_decimals) / (base_reserve / 10^base_decimals).
    pub fn constant_product_price(&self) -> Option<f64> {
        if let Some(p) = self.direct_price {
            return Some(p);
        }
        if self.base_reserve <= 0.0 || self.quote_reserve <= 0.0 {
            return None;
        }
        let quote = self.quote_reserve / 10f64.powi(self.quote_decimals as i32);
        let base = self.base_reserve / 10f64.powi(self.base_decimals as i32);
        if base <= 0.0 {
            None
        } else {
            Some(quote / base)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub estimated_volume_reference_currency: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreationMetadata {
    pub pool_address: String,
    pub dex_kind: Option<DexKind>,
    pub creation_signature: String,
    pub created_at_iso: String,
    pub has_initial_price: bool,
}

impl CreationMetadata {
    /// A signature shorter than 64 characters is rejected.
    pub fn signature_valid(&self) -> bool {
        self.creation_signature.len() >= 64
    }
}

/// Fields shared by every emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBase {
    pub source: EventSource,
    pub timestamp: f64,
    pub processing_timestamp: Option<f64>,
    pub handler: String,
    pub subscription_id: Option<u64>,
    pub pool_address: Option<String>,
    pub dex_kind: Option<DexKind>,
    pub signature: Option<String>,
    pub slot: Option<u64>,
}

impl EventBase {
    pub fn new(source: EventSource, handler: impl Into<String>) -> Self {
        Self {
            source,
            timestamp: now_ts(),
            processing_timestamp: None,
            handler: handler.into(),
            subscription_id: None,
            pool_address: None,
            dex_kind: None,
            signature: None,
            slot: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BlockchainEvent {
    Swap {
        #[serde(flatten)]
        base: EventBase,
        swap_info: SwapInfo,
        price: Option<f64>,
        volume_info: Option<VolumeInfo>,
        logs: Vec<String>,
    },
    AccountUpdate {
        #[serde(flatten)]
        base: EventBase,
        price: Option<f64>,
        liquidity_base_asset: Option<f64>,
        liquidity_quality: LiquidityQuality,
        reserves_raw: Option<(f64, f64)>,
        decimals: Option<(u8, u8)>,
        vaults: Option<(String, String)>,
    },
    PoolCreation {
        #[serde(flatten)]
        base: EventBase,
        creation_metadata: CreationMetadata,
        initial_price: Option<f64>,
        monitoring_candidate: bool,
        logs: Vec<String>,
    },
    LogNotification {
        #[serde(flatten)]
        base: EventBase,
        logs: Vec<String>,
        parsed_data: Option<HashMap<String, String>>,
    },
    Unhandled {
        #[serde(flatten)]
        base: EventBase,
        reason: Option<String>,
        raw_message: Option<String>,
    },
}

impl BlockchainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BlockchainEvent::Swap { .. } => "swap",
            BlockchainEvent::AccountUpdate { .. } => "account_update",
            BlockchainEvent::PoolCreation { .. } => "pool_creation",
            BlockchainEvent::LogNotification { .. } => "log_notification",
            BlockchainEvent::Unhandled { .. } => "unhandled",
        }
    }

    pub fn base(&self) -> &EventBase {
        match self {
            BlockchainEvent::Swap { base, .. }
            | BlockchainEvent::AccountUpdate { base, .. }
            | BlockchainEvent::PoolCreation { base, .. }
            | BlockchainEvent::LogNotification { base, .. }
            | BlockchainEvent::Unhandled { base, .. } => base,
        }
    }
}

/// Closed set of price sources, ranked by confidence ordering rules applied
/// by the Price Aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Blockchain,
    RestPrimary,
    RestSecondary,
    Inferred,
}

/// Invariant: price > 0; confidence monotone non-increasing with staleness
/// (enforced by the Price Aggregator's merge rule, not this type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub mint: String,
    pub price_in_base_asset: f64,
    pub price_in_reference_currency: Option<f64>,
    pub source: PriceSource,
    pub dex_kind: Option<DexKind>,
    pub ts: f64,
    pub confidence: f64,
    pub volume: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquidity_quality_monotonic_at_thresholds() {
        assert_eq!(LiquidityQuality::from_base_reserve(0.5), LiquidityQuality::VeryLow);
        assert_eq!(LiquidityQuality::from_base_reserve(1.0), LiquidityQuality::Low);
        assert_eq!(LiquidityQuality::from_base_reserve(10.0), LiquidityQuality::Medium);
        assert_eq!(LiquidityQuality::from_base_reserve(100.0), LiquidityQuality::High);
        assert!(LiquidityQuality::VeryLow < LiquidityQuality::Low);
        assert!(LiquidityQuality::Low < LiquidityQuality::Medium);
        assert!(LiquidityQuality::Medium < LiquidityQuality::High);
    }

    #[test]
    fn swap_info_requires_price_or_ratio_to_emit() {
        let mut s = SwapInfo { found_swap: true, ..Default::default() };
        assert!(!s.is_emittable());
        s.price_ratio = Some(0.5);
        assert!(s.is_emittable());
    }

    #[test]
    fn pool_state_rejects_out_of_range_decimals() {
        let mut p = PoolState {
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
        assert!(!p.decimals_valid());
        p.base_decimals = 19;
        assert!(!p.decimals_valid());
        p.base_decimals = 6;
        assert!(p.decimals_valid());
    }

    #[test]
    fn constant_product_price_matches_scenario_s2() {
        let p = PoolState {
            dex_kind: DexKind::ConstantProduct,
            base_reserve: 1e12,
            quote_reserve: 5e10,
            base_decimals: 6,
            quote_decimals: 9,
            base_vault: String::new(),
            quote_vault: String::new(),
            base_mint: String::new(),
            quote_mint: String::new(),
            direct_price: None,
        };
        let price = p.constant_product_price().unwrap();
        assert!((price - 5e-5).abs() < 1e-12);
    }

    #[test]
    fn creation_metadata_signature_length() {
        let mut m = CreationMetadata { creation_signature: "a".repeat(63), ..Default::default() };
        assert!(!m.signature_valid());
        m.creation_signature = "a".repeat(64);
        assert!(m.signature_valid());
    }
}
