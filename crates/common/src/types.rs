use alloy::primitives::{Address, B256, U256};
use alloy::primitives::utils::format_units;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

/// Supported lending-protocol deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Optimism,
    Arbitrum,
    Base,
}

impl Network {
    /// All deployments the registry knows about.
    pub const ALL: [Network; 4] = [
        Network::Ethereum,
        Network::Optimism,
        Network::Arbitrum,
        Network::Base,
    ];
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Ethereum => write!(f, "ethereum"),
            Network::Optimism => write!(f, "optimism"),
            Network::Arbitrum => write!(f, "arbitrum"),
            Network::Base => write!(f, "base"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ethereum" => Ok(Network::Ethereum),
            "optimism" => Ok(Network::Optimism),
            "arbitrum" => Ok(Network::Arbitrum),
            "base" => Ok(Network::Base),
            other => Err(AggregationError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Resolved connection parameters for one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfig {
    pub network: Network,
    pub display_name: &'static str,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Pool contract (account data + reserve enumeration).
    pub pool: Address,
    /// Protocol data provider (per-reserve token addresses and rates).
    pub data_provider: Address,
    /// Protection (rebalance) contract. Unconfigured on networks where the
    /// contract has not been deployed yet.
    pub protection: Option<Address>,
}

/// Raw result of `Pool.getUserAccountData`, carried at full precision.
///
/// Collateral/debt/borrow values are base-currency integers, thresholds are
/// basis points, the health factor is WAD (18-decimal fixed point).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    pub total_collateral_base: U256,
    pub total_debt_base: U256,
    pub available_borrows_base: U256,
    pub liquidation_threshold_bps: U256,
    pub ltv_bps: U256,
    pub health_factor_wad: U256,
}

/// Token addresses backing one reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReserveTokens {
    pub supply_token: Address,
    pub stable_debt_token: Option<Address>,
    pub variable_debt_token: Option<Address>,
}

/// Interest rates of one reserve, ray-encoded (27-decimal fixed point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReserveRates {
    pub supply_rate_ray: U256,
    pub variable_borrow_rate_ray: U256,
    pub stable_borrow_rate_ray: U256,
}

/// Symbol and decimals of an on-chain token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenMetadata {
    pub symbol: String,
    pub decimals: u8,
}

/// Confirmation of a mined write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxConfirmation {
    pub tx_hash: B256,
}

/// One supplied asset within a position. Balances stay in asset-decimal
/// integers; conversion to display units happens at the presentation
/// boundary only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetPosition {
    pub underlying: Address,
    pub symbol: String,
    pub decimals: u8,
    pub supply_token: Address,
    pub variable_debt_token: Option<Address>,
    pub stable_debt_token: Option<Address>,
    pub balance: U256,
    pub supply_rate_ray: U256,
    pub variable_borrow_rate_ray: U256,
    pub stable_borrow_rate_ray: U256,
    pub usable_as_collateral: bool,
    pub protection_approved: bool,
}

/// A user's reconstructed position on one network.
///
/// Assets preserve reserve-list order and never include zero balances.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub user: Address,
    pub network: Network,
    pub assets: Vec<AssetPosition>,
    pub summary: AccountSummary,
    pub tier: RiskTier,
    pub fetched_at: DateTime<Utc>,
}

/// Why one reserve was left out of an aggregation run.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedReserve {
    pub asset: Address,
    pub stage: FetchStage,
    pub reason: String,
}

/// Per-reserve fetch stages, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStage {
    TokenAddresses,
    Balance,
    Metadata,
    Rates,
}

impl std::fmt::Display for FetchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStage::TokenAddresses => write!(f, "token_addresses"),
            FetchStage::Balance => write!(f, "balance"),
            FetchStage::Metadata => write!(f, "metadata"),
            FetchStage::Rates => write!(f, "rates"),
        }
    }
}

/// Result of one aggregation run: the position plus any reserves that were
/// skipped because a sub-fetch failed. Skips are diagnostics, not errors.
#[derive(Debug, Clone, Serialize)]
pub struct Aggregation {
    pub position: Position,
    pub skipped: Vec<SkippedReserve>,
}

/// Health ratio of a position. `Unbounded` is the protocol's sentinel for a
/// position with no debt; it is never produced by division.
///
/// Ordering: any bounded ratio compares below `Unbounded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthRatio {
    Ratio(U256),
    Unbounded,
}

impl std::fmt::Display for HealthRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthRatio::Unbounded => write!(f, "Infinity"),
            HealthRatio::Ratio(wad) => {
                let s = format_units(*wad, 18).unwrap_or_else(|_| wad.to_string());
                write!(f, "{}", s)
            }
        }
    }
}

/// Advisory risk classification of a health ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Safe,
    AtRisk,
    Danger,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTier::Safe => write!(f, "safe"),
            RiskTier::AtRisk => write!(f, "at_risk"),
            RiskTier::Danger => write!(f, "danger"),
        }
    }
}

/// Stateless risk read-out derived from an account summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub ratio: HealthRatio,
    pub tier: RiskTier,
    /// Strictly below the liquidation line (ratio < 1.0), distinct from the
    /// advisory `Danger` tier at 1.2.
    pub at_risk: bool,
}

/// Last known allowance granted to the protection contract for one asset.
/// Stale after any write; re-queried before it is trusted.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalState {
    pub asset: Address,
    pub supply_token: Address,
    pub approved: bool,
    pub allowance: U256,
    pub checked_at: DateTime<Utc>,
}

/// Which write the protection workflow was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionStage {
    Approval,
    Trigger,
}

impl std::fmt::Display for ProtectionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectionStage::Approval => write!(f, "approval"),
            ProtectionStage::Trigger => write!(f, "protection trigger"),
        }
    }
}

/// Protection workflow state for one (user, network) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Monitoring,
    ApprovalPending { asset: Address },
    Protecting { asset: Address },
    Protected { asset: Address },
    Failed { stage: ProtectionStage, asset: Address, reason: String },
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowState::Idle => write!(f, "idle"),
            WorkflowState::Monitoring => write!(f, "monitoring"),
            WorkflowState::ApprovalPending { asset } => write!(f, "approval_pending({asset})"),
            WorkflowState::Protecting { asset } => write!(f, "protecting({asset})"),
            WorkflowState::Protected { asset } => write!(f, "protected({asset})"),
            WorkflowState::Failed { stage, asset, .. } => {
                write!(f, "failed({stage}, {asset})")
            }
        }
    }
}

/// One workflow transition, for the consumer-facing event log.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEvent {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}
