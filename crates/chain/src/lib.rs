pub mod client;
pub mod contracts;
pub mod registry;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use aegis_common::error::ChainError;
use aegis_common::types::{
    AccountSummary, Network, ReserveRates, ReserveTokens, TokenMetadata, TxConfirmation,
};

/// The narrow read/write surface the engine needs from one network.
///
/// Implemented by `client::ChainClient` over a live RPC endpoint; abstracted
/// as a trait so the engine can be tested against a scripted mock. All reads
/// are side-effect-free and safe to issue concurrently; callers serialize
/// writes per (token, spender) pair.
#[async_trait]
pub trait LendingChain: Send + Sync {
    /// The deployment this client is connected to.
    fn network(&self) -> Network;

    /// Protection contract on this deployment, if configured.
    fn protection_contract(&self) -> Option<Address>;

    async fn get_account_summary(&self, user: Address) -> Result<AccountSummary, ChainError>;

    /// Reserve addresses in the protocol's enumeration order.
    async fn list_reserves(&self) -> Result<Vec<Address>, ChainError>;

    async fn get_reserve_token_addresses(&self, asset: Address)
    -> Result<ReserveTokens, ChainError>;

    async fn get_reserve_rates(&self, asset: Address) -> Result<ReserveRates, ChainError>;

    async fn get_token_balance(&self, token: Address, owner: Address)
    -> Result<U256, ChainError>;

    async fn get_token_metadata(&self, token: Address) -> Result<TokenMetadata, ChainError>;

    async fn get_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError>;

    /// Write: grant `spender` an allowance of `amount` on `token`. Waits for
    /// the transaction to be mined before returning.
    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxConfirmation, ChainError>;

    /// Write: invoke the protection contract's entry point for one asset.
    /// The contract's internal repayment logic is outside this interface.
    async fn trigger_protection(
        &self,
        contract: Address,
        user: Address,
        asset: Address,
    ) -> Result<TxConfirmation, ChainError>;

    /// Fast path: only the health factor, one call, no reserve enumeration.
    async fn health_factor(&self, user: Address) -> Result<U256, ChainError> {
        Ok(self.get_account_summary(user).await?.health_factor_wad)
    }

    /// Whether the user has any collateral or debt on this deployment.
    async fn has_position(&self, user: Address) -> Result<bool, ChainError> {
        let summary = self.get_account_summary(user).await?;
        Ok(!summary.total_collateral_base.is_zero() || !summary.total_debt_base.is_zero())
    }
}
