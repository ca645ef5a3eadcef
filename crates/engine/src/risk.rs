//! Risk classification of a lending position.
//!
//! Pure integer arithmetic on the protocol's WAD encoding (18-decimal fixed
//! point). The raw health factor is compared against WAD-scaled thresholds
//! directly; nothing here goes through floating point, and the no-debt
//! sentinel is never fed into a division.

use alloy::primitives::U256;

use aegis_common::types::{AccountSummary, HealthRatio, RiskAssessment, RiskTier};

/// 1.0 in 18-decimal fixed point.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Ratios at or above this are `Safe`.
pub const SAFE_THRESHOLD_WAD: U256 = U256::from_limbs([1_500_000_000_000_000_000, 0, 0, 0]);

/// Ratios at or above this (but below safe) are `AtRisk`; below is `Danger`.
pub const DANGER_THRESHOLD_WAD: U256 = U256::from_limbs([1_200_000_000_000_000_000, 0, 0, 0]);

/// Below 1.0 the position is eligible for forced liquidation.
pub const LIQUIDATION_THRESHOLD_WAD: U256 = WAD;

/// Interpret a raw on-chain health factor. The protocol signals "no debt"
/// with the maximum representable unsigned integer.
pub fn health_ratio(raw_health_factor_wad: U256) -> HealthRatio {
    if raw_health_factor_wad >= U256::MAX {
        HealthRatio::Unbounded
    } else {
        HealthRatio::Ratio(raw_health_factor_wad)
    }
}

/// Advisory tier. Values equal to a threshold fall into the safer tier.
pub fn risk_tier(ratio: &HealthRatio) -> RiskTier {
    match ratio {
        HealthRatio::Unbounded => RiskTier::Safe,
        HealthRatio::Ratio(r) if *r >= SAFE_THRESHOLD_WAD => RiskTier::Safe,
        HealthRatio::Ratio(r) if *r >= DANGER_THRESHOLD_WAD => RiskTier::AtRisk,
        HealthRatio::Ratio(_) => RiskTier::Danger,
    }
}

/// Liquidation eligibility: strictly below 1.0 and bounded.
pub fn is_at_risk(ratio: &HealthRatio) -> bool {
    match ratio {
        HealthRatio::Unbounded => false,
        HealthRatio::Ratio(r) => *r < LIQUIDATION_THRESHOLD_WAD,
    }
}

/// Full assessment of an account summary.
pub fn assess(summary: &AccountSummary) -> RiskAssessment {
    let ratio = health_ratio(summary.health_factor_wad);
    RiskAssessment {
        ratio,
        tier: risk_tier(&ratio),
        at_risk: is_at_risk(&ratio),
    }
}
