//! Fee reserve sizing
//!
//! The reserve only sizes the hold placed on `current` while a payment is in
//! flight. The fee actually charged is whatever the node reports.

use serde::{Deserialize, Serialize};

/// Fee reserve configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Hold a fee reserve while paying
    pub reserve_enabled: bool,
    /// Proportional part, parts per million of the amount
    pub rate_ppm: u64,
    /// Lower bound of the proportional part
    pub floor_sat: i64,
    /// Fixed part added on top
    pub base_sat: i64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            reserve_enabled: false,
            rate_ppm: 10_000,
            floor_sat: 1,
            base_sat: 0,
        }
    }
}

impl FeeConfig {
    /// `max(ceil(amount * rate_ppm / 1e6), floor) + base`, or 0 when disabled
    pub fn fee_reserve(&self, amount: i64) -> i64 {
        if !self.reserve_enabled {
            return 0;
        }
        let amount = amount.max(0) as i128;
        let proportional = (amount * self.rate_ppm as i128 + 999_999) / 1_000_000;
        let proportional = i64::try_from(proportional).unwrap_or(i64::MAX);
        proportional.max(self.floor_sat).saturating_add(self.base_sat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> FeeConfig {
        FeeConfig {
            reserve_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_reserve_is_zero() {
        assert_eq!(FeeConfig::default().fee_reserve(1_000_000), 0);
    }

    #[test]
    fn test_one_percent_rounded_up() {
        let fees = enabled();
        assert_eq!(fees.fee_reserve(10_000), 100);
        assert_eq!(fees.fee_reserve(10_001), 101);
    }

    #[test]
    fn test_floor_and_base() {
        let fees = FeeConfig {
            base_sat: 2,
            floor_sat: 5,
            ..enabled()
        };
        assert_eq!(fees.fee_reserve(10), 7);
        assert_eq!(fees.fee_reserve(0), 7);
        assert_eq!(fees.fee_reserve(100_000), 1_002);
    }
}
