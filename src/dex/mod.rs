//! DEX Parsers: decode per-DEX log vocabularies and binary pool-state
//! layouts into normalized swap/price records.
//!
//! Grounded on the parent infrastructure's `dex_parser.rs` (log-vocabulary
//! swap extraction) and `raydium_pool_state.rs` (fixed-offset binary
//! decoding), generalized from a single hardcoded DEX table into the
//! closed `DexKind` enum from `domain.rs`.

pub mod constant_product;
pub mod concentrated_liquidity;

use crate::domain::{DexKind, PoolState, SwapInfo};
use std::collections::HashMap;

/// Below this lamport-equivalent size a swap is treated as dust and
/// rejected, mirroring the parent infrastructure's `MIN_SWAP_SIZE_LAMPORTS`.
pub const MIN_SWAP_SIZE_BASE_UNITS: f64 = 1_000_000.0;

/// Prices outside this range are rejected as unrealistic.
pub const MIN_REALISTIC_PRICE: f64 = 0.0000001;
pub const MAX_REALISTIC_PRICE: f64 = 10_000.0;

pub trait DexLogParser: Send + Sync {
    fn dex_kind(&self) -> DexKind;

    /// Extracts a `SwapInfo` from a logs vector. Returns a `SwapInfo` with
    /// `found_swap=false` when no swap instruction is recognized.
    fn parse_swap_logs(&self, logs: &[String]) -> SwapInfo;

    /// Decodes a base-64-decoded account-data blob into a `PoolState`.
    fn decode_pool_state(&self, data: &[u8]) -> anyhow::Result<PoolState>;
}

pub struct DexParserRegistry {
    parsers: HashMap<DexKind, Box<dyn DexLogParser>>,
}

impl DexParserRegistry {
    pub fn with_defaults() -> Self {
        let mut parsers: HashMap<DexKind, Box<dyn DexLogParser>> = HashMap::new();
        parsers.insert(DexKind::ConstantProduct, Box::new(constant_product::ConstantProductParser));
        parsers.insert(DexKind::ConcentratedLiquidity, Box::new(concentrated_liquidity::ConcentratedLiquidityParser));
        Self { parsers }
    }

    pub fn get(&self, kind: DexKind) -> Option<&dyn DexLogParser> {
        self.parsers.get(&kind).map(|b| b.as_ref())
    }
}

/// Rejects dust trades and unrealistic prices, shared by every parser
/// implementation's swap extraction.
pub fn sanity_check_swap(mut info: SwapInfo) -> SwapInfo {
    if let Some(price) = info.top_level_price() {
        if !(MIN_REALISTIC_PRICE..=MAX_REALISTIC_PRICE).contains(&price) {
            info.found_swap = false;
            return info;
        }
    }
    if let (Some(amount_in), Some(amount_out)) = (info.amount_in, info.amount_out) {
        if amount_in < MIN_SWAP_SIZE_BASE_UNITS && amount_out < MIN_SWAP_SIZE_BASE_UNITS {
            info.found_swap = false;
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanity_check_rejects_unrealistic_price() {
        let info = SwapInfo {
            found_swap: true,
            price: Some(50_000.0),
            amount_in: Some(2_000_000.0),
            amount_out: Some(2_000_000.0),
            ..Default::default()
        };
        let checked = sanity_check_swap(info);
        assert!(!checked.found_swap);
    }

    #[test]
    fn sanity_check_rejects_dust() {
        let info = SwapInfo {
            found_swap: true,
            price: Some(1.0),
            amount_in: Some(10.0),
            amount_out: Some(10.0),
            ..Default::default()
        };
        let checked = sanity_check_swap(info);
        assert!(!checked.found_swap);
    }
}
