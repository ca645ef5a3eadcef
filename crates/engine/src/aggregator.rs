//! Position aggregation — reconstructs a user's full multi-asset position
//! from the sequence of dependent remote calls one network requires.
//!
//! The account summary and the reserve list are load-bearing: without them
//! no risk tier can be derived, so their failure aborts the run. Every
//! per-reserve fetch is independent; one malformed or paused reserve is
//! skipped with a diagnostic and never blocks visibility into the rest of
//! the portfolio.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use chrono::Utc;
use futures::StreamExt;
use futures::stream;

use aegis_chain::LendingChain;
use aegis_chain::client::{ChainClient, ChainTimeouts};
use aegis_chain::registry::NetworkRegistry;
use aegis_common::config::AppConfig;
use aegis_common::error::{AggregationError, ChainError};
use aegis_common::types::{
    Aggregation, AssetPosition, FetchStage, Network, Position, SkippedReserve,
};

use crate::risk;

/// Tuning knobs for one aggregator instance.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorOptions {
    /// Bounded fan-out for per-reserve fetches. The remote endpoint may
    /// rate-limit, so this stays small.
    pub max_concurrent_reserve_fetches: usize,
    pub timeouts: ChainTimeouts,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_reserve_fetches: 4,
            timeouts: ChainTimeouts::default(),
        }
    }
}

impl AggregatorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_reserve_fetches: config.max_concurrent_reserve_fetches.max(1),
            timeouts: ChainTimeouts::from_config(config),
        }
    }
}

/// Builds `Position` snapshots for (user, network) pairs.
#[derive(Clone)]
pub struct PositionAggregator {
    registry: Arc<NetworkRegistry>,
    options: AggregatorOptions,
}

impl PositionAggregator {
    pub fn new(registry: Arc<NetworkRegistry>, options: AggregatorOptions) -> Self {
        Self { registry, options }
    }

    /// Resolve the network, connect a client, and aggregate.
    pub async fn aggregate(
        &self,
        user: Address,
        network: Network,
    ) -> Result<Aggregation, AggregationError> {
        let config = self.registry.lookup(network)?;
        let client = ChainClient::connect(config, self.options.timeouts)
            .await
            .map_err(|source| AggregationError::Connect { network, source })?;
        self.aggregate_with(&client, user).await
    }

    /// Aggregate over an already-connected client.
    pub async fn aggregate_with<C: LendingChain>(
        &self,
        chain: &C,
        user: Address,
    ) -> Result<Aggregation, AggregationError> {
        let network = chain.network();

        let summary = chain
            .get_account_summary(user)
            .await
            .map_err(AggregationError::AccountData)?;

        let reserves = chain
            .list_reserves()
            .await
            .map_err(AggregationError::ReserveList)?;

        tracing::debug!(
            network = %network,
            user = %user,
            reserves = reserves.len(),
            "Enumerated reserves"
        );

        let protection = chain.protection_contract();

        // Bounded fan-out; `buffered` yields in input order, so the asset
        // list comes out in reserve order regardless of completion order.
        let results: Vec<Result<Option<AssetPosition>, SkippedReserve>> =
            stream::iter(reserves)
                .map(|asset| fetch_asset(chain, user, asset, protection))
                .buffered(self.options.max_concurrent_reserve_fetches)
                .collect()
                .await;

        let mut assets = Vec::new();
        let mut skipped = Vec::new();
        for result in results {
            match result {
                Ok(Some(position)) => assets.push(position),
                Ok(None) => {}
                Err(diagnostic) => {
                    tracing::warn!(
                        network = %network,
                        asset = %diagnostic.asset,
                        stage = %diagnostic.stage,
                        reason = %diagnostic.reason,
                        "Reserve skipped"
                    );
                    skipped.push(diagnostic);
                }
            }
        }

        let ratio = risk::health_ratio(summary.health_factor_wad);
        let tier = risk::risk_tier(&ratio);

        tracing::info!(
            network = %network,
            user = %user,
            assets = assets.len(),
            skipped = skipped.len(),
            tier = %tier,
            "Position aggregated"
        );

        Ok(Aggregation {
            position: Position {
                user,
                network,
                assets,
                summary,
                tier,
                fetched_at: Utc::now(),
            },
            skipped,
        })
    }
}

/// Fetch one reserve's slice of the position. Zero supply balances resolve
/// to `Ok(None)` — an empty reserve is not a failure.
async fn fetch_asset<C: LendingChain>(
    chain: &C,
    user: Address,
    asset: Address,
    protection: Option<Address>,
) -> Result<Option<AssetPosition>, SkippedReserve> {
    let skip = |stage: FetchStage, e: ChainError| SkippedReserve {
        asset,
        stage,
        reason: e.to_string(),
    };

    let tokens = chain
        .get_reserve_token_addresses(asset)
        .await
        .map_err(|e| skip(FetchStage::TokenAddresses, e))?;

    let balance = chain
        .get_token_balance(tokens.supply_token, user)
        .await
        .map_err(|e| skip(FetchStage::Balance, e))?;

    if balance.is_zero() {
        return Ok(None);
    }

    let metadata = chain
        .get_token_metadata(tokens.supply_token)
        .await
        .map_err(|e| skip(FetchStage::Metadata, e))?;

    let rates = chain
        .get_reserve_rates(asset)
        .await
        .map_err(|e| skip(FetchStage::Rates, e))?;

    // Approval probing is best-effort: a failed allowance read degrades to
    // "not approved" rather than dropping an otherwise complete asset.
    let protection_approved = match protection {
        Some(spender) => match chain
            .get_allowance(tokens.supply_token, user, spender)
            .await
        {
            Ok(allowance) => allowance > U256::ZERO,
            Err(e) => {
                tracing::warn!(
                    asset = %asset,
                    error = %e,
                    "Allowance probe failed; treating as unapproved"
                );
                false
            }
        },
        None => false,
    };

    Ok(Some(AssetPosition {
        underlying: asset,
        symbol: display_symbol(&metadata.symbol),
        decimals: metadata.decimals,
        supply_token: tokens.supply_token,
        variable_debt_token: tokens.variable_debt_token,
        stable_debt_token: tokens.stable_debt_token,
        balance,
        supply_rate_ray: rates.supply_rate_ray,
        variable_borrow_rate_ray: rates.variable_borrow_rate_ray,
        stable_borrow_rate_ray: rates.stable_borrow_rate_ray,
        // The protocol's per-user collateral flag is not read here; supplied
        // assets count as collateral-eligible.
        usable_as_collateral: true,
        protection_approved,
    }))
}

/// Receipt-token symbols carry the protocol's "a" prefix ("aWETH"); the
/// underlying's symbol is what the consumer wants to see.
fn display_symbol(receipt_symbol: &str) -> String {
    receipt_symbol
        .strip_prefix('a')
        .unwrap_or(receipt_symbol)
        .to_string()
}
