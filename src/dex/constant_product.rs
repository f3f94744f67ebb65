//! Constant-product AMM parser (x*y=k pools, e.g. Raydium AMM V4 style
//! layouts). Pool-state offsets are grounded directly on the parent
//! infrastructure's `raydium_pool_state.rs::RaydiumPoolState::parse`.

use anyhow::{anyhow, Result as AnyResult};
use solana_sdk::pubkey::Pubkey;

use super::{sanity_check_swap, DexLogParser};
use crate::domain::{DexKind, PoolState, SwapInfo};

/// Minimum size for the pool-state layout decoded below (matches the
/// parent's 576-byte minimum for the equivalent Raydium account).
const MIN_POOL_DATA_LEN: usize = 576;

pub struct ConstantProductParser;

impl ConstantProductParser {
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
}

impl DexLogParser for ConstantProductParser {
    fn dex_kind(&self) -> DexKind {
        DexKind::ConstantProduct
    }

    /// Case-insensitive match on the Solana runtime's "Program log:
    /// Instruction: Swap" line, same vocabulary the parent's `dex_parser.rs`
    /// scans for before decoding instruction-data amounts.
    fn parse_swap_logs(&self, logs: &[String]) -> SwapInfo {
        let has_swap = logs
            .iter()
            .any(|l| l.to_ascii_lowercase().contains("instruction: swap"));
        if !has_swap {
            return SwapInfo::none();
        }

        // Without access to the raw instruction bytes at this layer, a
        // logs-only match establishes that a swap occurred but not its
        // amounts; callers with instruction data attach those via
        // `parse_swap_amounts` below before the event is emitted.
        SwapInfo {
            found_swap: true,
            parsing_confidence: 0.5,
            ..Default::default()
        }
    }

    /// Coin/decimals/mint offsets per the Raydium AMM V4 account layout:
    /// decimals at 32/40, pubkeys starting at 128 in 32-byte strides.
    fn decode_pool_state(&self, data: &[u8]) -> AnyResult<PoolState> {
        if data.len() < MIN_POOL_DATA_LEN {
            return Err(anyhow!(
                "pool account data too small: {} bytes (expected at least {MIN_POOL_DATA_LEN})",
                data.len()
            ));
        }

        let base_decimals = Self::parse_u64(data, 32)? as u8;
        let quote_decimals = Self::parse_u64(data, 40)? as u8;
        let pool_coin_token_account = Self::parse_pubkey(data, 160)?;
        let pool_pc_token_account = Self::parse_pubkey(data, 192)?;
        let coin_mint = Self::parse_pubkey(data, 224)?;
        let pc_mint = Self::parse_pubkey(data, 256)?;

        Ok(PoolState {
            dex_kind: DexKind::ConstantProduct,
            // Reserves live in the vault token accounts, not this record;
            // the account-update handler fetches them separately and fills
            // these in before computing price. Zero here means "unknown yet".
            base_reserve: 0.0,
            quote_reserve: 0.0,
            base_decimals,
            quote_decimals,
            base_vault: pool_coin_token_account.to_string(),
            quote_vault: pool_pc_token_account.to_string(),
            base_mint: coin_mint.to_string(),
            quote_mint: pc_mint.to_string(),
            direct_price: None,
        })
    }
}

/// Extracts amounts from raw instruction data per the parent's convention:
/// little-endian u64 amounts at bytes [8..16] and [16..24].
pub fn parse_swap_amounts(instruction_data: &[u8], confidence: f64) -> SwapInfo {
    if instruction_data.len() < 24 {
        return SwapInfo::none();
    }
    let amount_in = u64::from_le_bytes(instruction_data[8..16].try_into().unwrap()) as f64;
    let amount_out = u64::from_le_bytes(instruction_data[16..24].try_into().unwrap()) as f64;
    if amount_in <= 0.0 || amount_out <= 0.0 {
        return SwapInfo::none();
    }
    let info = SwapInfo {
        found_swap: true,
        price_ratio: Some(amount_out / amount_in),
        amount_in: Some(amount_in),
        amount_out: Some(amount_out),
        parsing_confidence: confidence,
        ..Default::default()
    };
    sanity_check_swap(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_swap_instruction_log() {
        let parser = ConstantProductParser;
        let logs = vec!["Program log: Instruction: Swap".to_string()];
        let info = parser.parse_swap_logs(&logs);
        assert!(info.found_swap);
    }

    #[test]
    fn no_swap_when_logs_dont_mention_it() {
        let parser = ConstantProductParser;
        let logs = vec!["Program log: Instruction: InitializeAccount".to_string()];
        let info = parser.parse_swap_logs(&logs);
        assert!(!info.found_swap);
    }

    #[test]
    fn pool_state_rejects_undersized_account_data() {
        let parser = ConstantProductParser;
        let data = vec![0u8; 100];
        assert!(parser.decode_pool_state(&data).is_err());
    }

    #[test]
    fn parse_swap_amounts_computes_ratio() {
        let mut data = vec![0u8; 24];
        data[8..16].copy_from_slice(&1_000_000_000u64.to_le_bytes());
        data[16..24].copy_from_slice(&2_000_000_000u64.to_le_bytes());
        let info = parse_swap_amounts(&data, 0.9);
        assert!(info.found_swap);
        assert_eq!(info.price_ratio, Some(2.0));
    }

    #[test]
    fn parse_swap_amounts_rejects_dust() {
        let mut data = vec![0u8; 24];
        data[8..16].copy_from_slice(&10u64.to_le_bytes());
        data[16..24].copy_from_slice(&10u64.to_le_bytes());
        let info = parse_swap_amounts(&data, 0.9);
        assert!(!info.found_swap);
    }
}
