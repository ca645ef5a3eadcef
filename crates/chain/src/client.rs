//! One resilient client per network endpoint.
//!
//! Every remote call runs inside an explicit deadline; a call that exceeds it
//! fails with `Timeout` rather than waiting forever. Connection establishment
//! pins the expected chain id so a misrouted or stale endpoint is rejected
//! before any position data is read from it.

use std::future::IntoFuture;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;

use aegis_common::config::AppConfig;
use aegis_common::error::ChainError;
use aegis_common::types::{
    AccountSummary, Network, NetworkConfig, ReserveRates, ReserveTokens, TokenMetadata,
    TxConfirmation,
};

use crate::LendingChain;
use crate::contracts::{IERC20, IPool, IPoolDataProvider, IRebalanceExecutor};

/// Deadlines applied to remote operations.
#[derive(Debug, Clone, Copy)]
pub struct ChainTimeouts {
    /// Connection establishment (chain identity check).
    pub connect: Duration,
    /// A single read call.
    pub call: Duration,
    /// A write, submission through mined confirmation.
    pub write: Duration,
}

impl Default for ChainTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            call: Duration::from_secs(15),
            write: Duration::from_secs(120),
        }
    }
}

impl ChainTimeouts {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_timeout_secs),
            call: Duration::from_secs(config.call_timeout_secs),
            write: Duration::from_secs(config.write_timeout_secs),
        }
    }
}

/// Typed client for one network's Pool, data-provider and token contracts.
///
/// Cloning shares the underlying provider; reads may run concurrently from
/// clones. Write capability requires construction via `connect_with_signer`.
#[derive(Debug, Clone)]
pub struct ChainClient {
    config: NetworkConfig,
    provider: DynProvider,
    signer: Option<Address>,
    timeouts: ChainTimeouts,
}

impl ChainClient {
    /// Connect read-only.
    pub async fn connect(
        config: &NetworkConfig,
        timeouts: ChainTimeouts,
    ) -> Result<Self, ChainError> {
        let url = config.rpc_url.parse().map_err(|e| {
            ChainError::Connection(format!("invalid RPC URL for {}: {e}", config.network))
        })?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Self::pin_chain_identity(config, provider, timeouts, None).await
    }

    /// Connect with a local signer for the approve / protection-trigger path.
    pub async fn connect_with_signer(
        config: &NetworkConfig,
        timeouts: ChainTimeouts,
        signer: PrivateKeySigner,
    ) -> Result<Self, ChainError> {
        let url = config.rpc_url.parse().map_err(|e| {
            ChainError::Connection(format!("invalid RPC URL for {}: {e}", config.network))
        })?;
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url).erased();
        Self::pin_chain_identity(config, provider, timeouts, Some(signer_address)).await
    }

    /// Verify the endpoint serves the configured chain before handing the
    /// client out.
    async fn pin_chain_identity(
        config: &NetworkConfig,
        provider: DynProvider,
        timeouts: ChainTimeouts,
        signer: Option<Address>,
    ) -> Result<Self, ChainError> {
        let reported = match tokio::time::timeout(timeouts.connect, provider.get_chain_id()).await
        {
            Err(_) => {
                return Err(ChainError::Timeout {
                    op: "eth_chainId",
                    timeout: timeouts.connect,
                });
            }
            Ok(Err(e)) => return Err(classify_rpc("eth_chainId", e)),
            Ok(Ok(id)) => id,
        };

        if reported != config.chain_id {
            return Err(ChainError::ChainIdentityMismatch {
                expected: config.chain_id,
                actual: reported,
            });
        }

        tracing::info!(
            network = %config.network,
            chain_id = reported,
            write_capable = signer.is_some(),
            "Chain client connected"
        );

        Ok(Self {
            config: config.clone(),
            provider,
            signer,
            timeouts,
        })
    }

    /// Address of the configured signer, if any.
    pub fn signer_address(&self) -> Option<Address> {
        self.signer
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Run a read call under the per-call deadline.
    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl IntoFuture<Output = Result<T, alloy::contract::Error>>,
    ) -> Result<T, ChainError> {
        match tokio::time::timeout(self.timeouts.call, fut.into_future()).await {
            Err(_) => Err(ChainError::Timeout {
                op,
                timeout: self.timeouts.call,
            }),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_contract(op, e)),
        }
    }
}

#[async_trait]
impl LendingChain for ChainClient {
    fn network(&self) -> Network {
        self.config.network
    }

    fn protection_contract(&self) -> Option<Address> {
        self.config.protection
    }

    async fn get_account_summary(&self, user: Address) -> Result<AccountSummary, ChainError> {
        let pool = IPool::new(self.config.pool, self.provider.clone());
        let call = pool.getUserAccountData(user);
        let data = self.bounded("getUserAccountData", call.call()).await?;

        Ok(AccountSummary {
            total_collateral_base: data.totalCollateralBase,
            total_debt_base: data.totalDebtBase,
            available_borrows_base: data.availableBorrowsBase,
            liquidation_threshold_bps: data.currentLiquidationThreshold,
            ltv_bps: data.ltv,
            health_factor_wad: data.healthFactor,
        })
    }

    async fn list_reserves(&self) -> Result<Vec<Address>, ChainError> {
        let pool = IPool::new(self.config.pool, self.provider.clone());
        let call = pool.getReservesList();
        self.bounded("getReservesList", call.call()).await
    }

    async fn get_reserve_token_addresses(
        &self,
        asset: Address,
    ) -> Result<ReserveTokens, ChainError> {
        let data_provider =
            IPoolDataProvider::new(self.config.data_provider, self.provider.clone());
        let call = data_provider.getReserveTokensAddresses(asset);
        let tokens = self.bounded("getReserveTokensAddresses", call.call()).await?;

        Ok(ReserveTokens {
            supply_token: tokens.aTokenAddress,
            stable_debt_token: optional_address(tokens.stableDebtTokenAddress),
            variable_debt_token: optional_address(tokens.variableDebtTokenAddress),
        })
    }

    async fn get_reserve_rates(&self, asset: Address) -> Result<ReserveRates, ChainError> {
        let data_provider =
            IPoolDataProvider::new(self.config.data_provider, self.provider.clone());
        let call = data_provider.getReserveData(asset);
        let data = self.bounded("getReserveData", call.call()).await?;

        Ok(ReserveRates {
            supply_rate_ray: data.liquidityRate,
            variable_borrow_rate_ray: data.variableBorrowRate,
            stable_borrow_rate_ray: data.stableBorrowRate,
        })
    }

    async fn get_token_balance(
        &self,
        token: Address,
        owner: Address,
    ) -> Result<U256, ChainError> {
        let erc20 = IERC20::new(token, self.provider.clone());
        let call = erc20.balanceOf(owner);
        self.bounded("balanceOf", call.call()).await
    }

    async fn get_token_metadata(&self, token: Address) -> Result<TokenMetadata, ChainError> {
        let erc20 = IERC20::new(token, self.provider.clone());
        let symbol_call = erc20.symbol();
        let decimals_call = erc20.decimals();

        let (symbol, decimals) = tokio::join!(
            self.bounded("symbol", symbol_call.call()),
            self.bounded("decimals", decimals_call.call()),
        );

        Ok(TokenMetadata {
            symbol: symbol?,
            decimals: decimals?,
        })
    }

    async fn get_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        let erc20 = IERC20::new(token, self.provider.clone());
        let call = erc20.allowance(owner, spender);
        self.bounded("allowance", call.call()).await
    }

    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxConfirmation, ChainError> {
        if self.signer.is_none() {
            return Err(ChainError::NoSigner);
        }

        let erc20 = IERC20::new(token, self.provider.clone());
        let fut = async {
            let call = erc20.approve(spender, amount);
            let pending = call
                .send()
                .await
                .map_err(|e| classify_contract("approve", e))?;
            tracing::debug!(tx = %pending.tx_hash(), token = %token, "Approval submitted");

            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| ChainError::Connection(e.to_string()))?;
            if !receipt.status() {
                return Err(ChainError::Remote {
                    op: "approve",
                    reason: "transaction reverted".to_string(),
                });
            }
            Ok(TxConfirmation {
                tx_hash: receipt.transaction_hash,
            })
        };

        match tokio::time::timeout(self.timeouts.write, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout {
                op: "approve",
                timeout: self.timeouts.write,
            }),
        }
    }

    async fn trigger_protection(
        &self,
        contract: Address,
        user: Address,
        asset: Address,
    ) -> Result<TxConfirmation, ChainError> {
        if self.signer.is_none() {
            return Err(ChainError::NoSigner);
        }

        let executor = IRebalanceExecutor::new(contract, self.provider.clone());
        let fut = async {
            let call = executor.rebalance(user, asset);
            let pending = call
                .send()
                .await
                .map_err(|e| classify_contract("rebalance", e))?;
            tracing::debug!(tx = %pending.tx_hash(), asset = %asset, "Protection trigger submitted");

            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| ChainError::Connection(e.to_string()))?;
            if !receipt.status() {
                return Err(ChainError::Remote {
                    op: "rebalance",
                    reason: "transaction reverted".to_string(),
                });
            }
            Ok(TxConfirmation {
                tx_hash: receipt.transaction_hash,
            })
        };

        match tokio::time::timeout(self.timeouts.write, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout {
                op: "rebalance",
                timeout: self.timeouts.write,
            }),
        }
    }
}

/// The protocol encodes "no such token" as the zero address.
fn optional_address(addr: Address) -> Option<Address> {
    (addr != Address::ZERO).then_some(addr)
}

/// Transport-level failures are retryable connection errors; everything the
/// remote answered with (error responses, null or undecodable payloads) is a
/// non-retryable remote rejection.
fn classify_rpc(op: &'static str, err: TransportError) -> ChainError {
    match err {
        RpcError::Transport(kind) => ChainError::Connection(kind.to_string()),
        other => ChainError::Remote {
            op,
            reason: other.to_string(),
        },
    }
}

fn classify_contract(op: &'static str, err: alloy::contract::Error) -> ChainError {
    match err {
        alloy::contract::Error::TransportError(e) => classify_rpc(op, e),
        other => ChainError::Remote {
            op,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::transports::TransportErrorKind;

    #[test]
    fn test_zero_address_maps_to_none() {
        assert_eq!(optional_address(Address::ZERO), None);
        let addr = Address::repeat_byte(0x11);
        assert_eq!(optional_address(addr), Some(addr));
    }

    #[test]
    fn test_transport_failures_classify_as_connection() {
        let err = classify_rpc("balanceOf", RpcError::Transport(TransportErrorKind::BackendGone));
        assert!(matches!(err, ChainError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_remote_responses_classify_as_remote() {
        let err = classify_rpc("balanceOf", RpcError::NullResp);
        assert!(matches!(err, ChainError::Remote { op: "balanceOf", .. }));
        assert!(!err.is_retryable());
    }
}
