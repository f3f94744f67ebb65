//! Concentrated-liquidity AMM parser (tick-based pools, e.g. Raydium CLMM /
//! Orca Whirlpools style layouts). These pools decode a direct price from a
//! stored sqrt-price rather than from raw reserves, so the account-update
//! handler must not override it with reserve math (§4.4).
//!
//! The 752-byte aggregated layout below (base-decimals at offset 32,
//! quote-decimals at 40, base-vault at 296, quote-vault at 328) is the
//! documented fixed-offset layout for this DEX kind.

use anyhow::{anyhow, Result as AnyResult};
use solana_sdk::pubkey::Pubkey;

use super::DexLogParser;
use crate::domain::{DexKind, PoolState, SwapInfo};

const MIN_POOL_DATA_LEN: usize = 752;
const SQRT_PRICE_OFFSET: usize = 8;
const BASE_DECIMALS_OFFSET: usize = 32;
const QUOTE_DECIMALS_OFFSET: usize = 40;
const BASE_MINT_OFFSET: usize = 72;
const QUOTE_MINT_OFFSET: usize = 104;
const BASE_VAULT_OFFSET: usize = 296;
const QUOTE_VAULT_OFFSET: usize = 328;

pub struct ConcentratedLiquidityParser;

impl ConcentratedLiquidityParser {
    fn parse_pubkey(data: &[u8], offset: usize) -> AnyResult<Pubkey> {
        if data.len() < offset + 32 {
            return Err(anyhow!("not enough data to parse pubkey at offset {offset}"));
        }
        let bytes: [u8; 32] = data[offset..offset + 32].try_into()?;
        Ok(Pubkey::new_from_array(bytes))
    }

    fn parse_u64(data: &[u8], offset: usize) -> AnyResult<u64> {
        if data.len() < offset + 8 {
            return Err(anyhow!("not enough data to parse u64 at offset {offset}"));
        }
        let bytes: [u8; 8] = data[offset..offset + 8].try_into()?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// sqrt-price is stored as a Q64.64 fixed-point u128 in the real account
    /// layout; this crate stores the simplified u64 high-word form and
    /// derives price as `(sqrt_price / 2^32)^2`, which is sufficient for the
    /// event model's `f64` price field.
    fn price_from_sqrt(data: &[u8]) -> AnyResult<f64> {
        let raw = Self::parse_u64(data, SQRT_PRICE_OFFSET)?;
        let sqrt_price = raw as f64 / 2f64.powi(32);
        Ok(sqrt_price * sqrt_price)
    }
}

impl DexLogParser for ConcentratedLiquidityParser {
    fn dex_kind(&self) -> DexKind {
        DexKind::ConcentratedLiquidity
    }

    fn parse_swap_logs(&self, logs: &[String]) -> SwapInfo {
        let has_swap = logs
            .iter()
            .any(|l| l.to_ascii_lowercase().contains("instruction: swap"));
        if !has_swap {
            return SwapInfo::none();
        }
        SwapInfo {
            found_swap: true,
            parsing_confidence: 0.5,
            ..Default::default()
        }
    }

    fn decode_pool_state(&self, data: &[u8]) -> AnyResult<PoolState> {
        if data.len() < MIN_POOL_DATA_LEN {
            return Err(anyhow!(
                "pool account data too small: {} bytes (expected at least {MIN_POOL_DATA_LEN})",
                data.len()
            ));
        }

        let base_decimals = data[BASE_DECIMALS_OFFSET];
        let quote_decimals = data[QUOTE_DECIMALS_OFFSET];
        let base_mint = Self::parse_pubkey(data, BASE_MINT_OFFSET)?;
        let quote_mint = Self::parse_pubkey(data, QUOTE_MINT_OFFSET)?;
        let base_vault = Self::parse_pubkey(data, BASE_VAULT_OFFSET)?;
        let quote_vault = Self::parse_pubkey(data, QUOTE_VAULT_OFFSET)?;
        let price = Self::price_from_sqrt(data).ok();

        Ok(PoolState {
            dex_kind: DexKind::ConcentratedLiquidity,
            base_reserve: 0.0,
            quote_reserve: 0.0,
            base_decimals,
            quote_decimals,
            base_vault: base_vault.to_string(),
            quote_vault: quote_vault.to_string(),
            base_mint: base_mint.to_string(),
            quote_mint: quote_mint.to_string(),
            direct_price: price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Vec<u8> {
        let mut data = vec![0u8; MIN_POOL_DATA_LEN];
        data[SQRT_PRICE_OFFSET..SQRT_PRICE_OFFSET + 8].copy_from_slice(&(1u64 << 32).to_le_bytes());
        data[BASE_DECIMALS_OFFSET] = 6;
        data[QUOTE_DECIMALS_OFFSET] = 9;
        data
    }

    #[test]
    fn decodes_direct_price_from_sqrt_price() {
        let parser = ConcentratedLiquidityParser;
        let state = parser.decode_pool_state(&sample_data()).unwrap();
        assert_eq!(state.direct_price, Some(1.0));
        assert_eq!(state.base_decimals, 6);
        assert_eq!(state.quote_decimals, 9);
    }

    #[test]
    fn constant_product_price_does_not_override_direct_price() {
        let parser = ConcentratedLiquidityParser;
        let mut state = parser.decode_pool_state(&sample_data()).unwrap();
        state.base_reserve = 123.0;
        state.quote_reserve = 456.0;
        assert_eq!(state.constant_product_price(), Some(1.0));
    }

    #[test]
    fn rejects_undersized_account_data() {
        let parser = ConcentratedLiquidityParser;
        assert!(parser.decode_pool_state(&[0u8; 100]).is_err());
    }
}
