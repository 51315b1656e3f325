// =============================================================================
// MOONWIRE v1.0 - Cross-Asset Swaps
// =============================================================================
//
// When a routed transfer lands in a different asset or on a different chain
// than it left, the router converts the amount through its configured
// pricing table. Pure arithmetic: a rational rate per allowed pair, checked
// multiplication, no side effects.
//
// =============================================================================

use crate::config::AllowedSwap;
use crate::types::{Address, EngineError};

/// Convert `amount` from the sender-side (asset, chain) to the
/// recipient-side pair. Identity pairs pass through untouched; anything else
/// must appear in the allowed-swap table.
pub fn swapped_amount(
    amount: u128,
    from_asset_id: &Address,
    from_chain_id: u64,
    to_asset_id: &Address,
    to_chain_id: u64,
    allowed: &[AllowedSwap],
) -> Result<u128, EngineError> {
    if from_asset_id == to_asset_id && from_chain_id == to_chain_id {
        return Ok(amount);
    }

    let swap = allowed
        .iter()
        .find(|s| {
            s.from_asset_id == *from_asset_id
                && s.from_chain_id == from_chain_id
                && s.to_asset_id == *to_asset_id
                && s.to_chain_id == to_chain_id
        })
        .ok_or_else(|| {
            EngineError::validation(format!(
                "no allowed swap from asset {} (chain {}) to asset {} (chain {})",
                from_asset_id, from_chain_id, to_asset_id, to_chain_id
            ))
        })?;

    if swap.price_denominator == 0 {
        return Err(EngineError::validation("swap price denominator is zero"));
    }
    amount
        .checked_mul(swap.price_numerator as u128)
        .map(|scaled| scaled / swap.price_denominator as u128)
        .ok_or_else(|| EngineError::validation("swap amount overflows"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc_to_matic_usdc() -> AllowedSwap {
        AllowedSwap {
            from_asset_id: Address::zero(),
            from_chain_id: 1,
            to_asset_id: Address::from_bytes([5; 20]),
            to_chain_id: 137,
            price_numerator: 1005,
            price_denominator: 1000,
        }
    }

    #[test]
    fn test_identity_pair_passes_through() {
        let amount =
            swapped_amount(100, &Address::zero(), 1, &Address::zero(), 1, &[]).unwrap();
        assert_eq!(amount, 100);
    }

    #[test]
    fn test_rate_applied() {
        let swaps = [usdc_to_matic_usdc()];
        let amount = swapped_amount(
            100_000_000,
            &Address::zero(),
            1,
            &Address::from_bytes([5; 20]),
            137,
            &swaps,
        )
        .unwrap();
        assert_eq!(amount, 100_500_000);
    }

    #[test]
    fn test_unlisted_pair_rejected() {
        let swaps = [usdc_to_matic_usdc()];
        let err = swapped_amount(
            100,
            &Address::from_bytes([9; 20]),
            1,
            &Address::zero(),
            137,
            &swaps,
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Validation);
    }

    #[test]
    fn test_direction_matters() {
        let swaps = [usdc_to_matic_usdc()];
        // the reverse pair is not listed
        assert!(swapped_amount(
            100,
            &Address::from_bytes([5; 20]),
            137,
            &Address::zero(),
            1,
            &swaps,
        )
        .is_err());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let swaps = [usdc_to_matic_usdc()];
        assert!(swapped_amount(
            u128::MAX,
            &Address::zero(),
            1,
            &Address::from_bytes([5; 20]),
            137,
            &swaps,
        )
        .is_err());
    }
}
