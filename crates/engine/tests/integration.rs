//! Integration tests for aggregation and the protection workflow, driven
//! against a scripted in-memory chain. No network access required.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;

use aegis_chain::LendingChain;
use aegis_chain::registry::NetworkRegistry;
use aegis_common::error::{AggregationError, ChainError, WorkflowError};
use aegis_common::types::{
    AccountSummary, FetchStage, Network, ReserveRates, ReserveTokens, RiskTier, TokenMetadata,
    TxConfirmation, WorkflowState,
};
use aegis_engine::aggregator::{AggregatorOptions, PositionAggregator};
use aegis_engine::workflow::ProtectionWorkflow;

// ============================================================
// Scripted chain
// ============================================================

struct MockState {
    network: Network,
    protection: Option<Address>,
    signer: Address,
    summary: Mutex<AccountSummary>,
    summary_times_out: bool,
    reserves: Vec<Address>,
    tokens: HashMap<Address, ReserveTokens>,
    rates: HashMap<Address, ReserveRates>,
    metadata: HashMap<Address, TokenMetadata>,
    balances: HashMap<(Address, Address), U256>,
    allowances: Mutex<HashMap<(Address, Address, Address), U256>>,
    fail_metadata: HashSet<Address>,
    approve_hangs: bool,
    approve_errors: bool,
    trigger_errors: bool,
    health_after_trigger: Option<U256>,
    reserve_list_calls: AtomicU32,
    approve_calls: AtomicU32,
    trigger_calls: AtomicU32,
}

#[derive(Clone)]
struct MockChain {
    state: Arc<MockState>,
}

#[async_trait]
impl LendingChain for MockChain {
    fn network(&self) -> Network {
        self.state.network
    }

    fn protection_contract(&self) -> Option<Address> {
        self.state.protection
    }

    async fn get_account_summary(&self, _user: Address) -> Result<AccountSummary, ChainError> {
        if self.state.summary_times_out {
            return Err(ChainError::Timeout {
                op: "getUserAccountData",
                timeout: Duration::from_secs(15),
            });
        }
        Ok(self.state.summary.lock().unwrap().clone())
    }

    async fn list_reserves(&self) -> Result<Vec<Address>, ChainError> {
        self.state.reserve_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.reserves.clone())
    }

    async fn get_reserve_token_addresses(
        &self,
        asset: Address,
    ) -> Result<ReserveTokens, ChainError> {
        self.state
            .tokens
            .get(&asset)
            .copied()
            .ok_or_else(|| remote("getReserveTokensAddresses"))
    }

    async fn get_reserve_rates(&self, asset: Address) -> Result<ReserveRates, ChainError> {
        self.state
            .rates
            .get(&asset)
            .copied()
            .ok_or_else(|| remote("getReserveData"))
    }

    async fn get_token_balance(
        &self,
        token: Address,
        owner: Address,
    ) -> Result<U256, ChainError> {
        Ok(self
            .state
            .balances
            .get(&(token, owner))
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn get_token_metadata(&self, token: Address) -> Result<TokenMetadata, ChainError> {
        if self.state.fail_metadata.contains(&token) {
            return Err(remote("symbol"));
        }
        self.state
            .metadata
            .get(&token)
            .cloned()
            .ok_or_else(|| remote("symbol"))
    }

    async fn get_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        Ok(self
            .state
            .allowances
            .lock()
            .unwrap()
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TxConfirmation, ChainError> {
        self.state.approve_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.approve_hangs {
            std::future::pending::<()>().await;
        }
        // The write lands on-chain even when the client reports a failure.
        self.state
            .allowances
            .lock()
            .unwrap()
            .insert((token, self.state.signer, spender), amount);
        if self.state.approve_errors {
            return Err(ChainError::Connection(
                "socket closed before response".to_string(),
            ));
        }
        Ok(TxConfirmation {
            tx_hash: B256::repeat_byte(0xAA),
        })
    }

    async fn trigger_protection(
        &self,
        _contract: Address,
        _user: Address,
        _asset: Address,
    ) -> Result<TxConfirmation, ChainError> {
        self.state.trigger_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hf) = self.state.health_after_trigger {
            self.state.summary.lock().unwrap().health_factor_wad = hf;
        }
        if self.state.trigger_errors {
            return Err(ChainError::Connection(
                "socket closed before response".to_string(),
            ));
        }
        Ok(TxConfirmation {
            tx_hash: B256::repeat_byte(0xBB),
        })
    }
}

fn remote(op: &'static str) -> ChainError {
    ChainError::Remote {
        op,
        reason: "execution reverted".to_string(),
    }
}

// ============================================================
// Fixtures
// ============================================================

fn user() -> Address {
    Address::repeat_byte(0xEE)
}

fn usdc() -> Address {
    Address::repeat_byte(0x01)
}

fn dai() -> Address {
    Address::repeat_byte(0x02)
}

fn weth() -> Address {
    Address::repeat_byte(0x03)
}

fn supply_token_of(asset: Address) -> Address {
    Address::repeat_byte(asset.0[0] | 0xA0)
}

fn protection_contract() -> Address {
    Address::repeat_byte(0x77)
}

/// n milli-units in 18-decimal fixed point (1760 -> 1.76).
fn wad_milli(n: u64) -> U256 {
    U256::from(n) * U256::from(10).pow(U256::from(15))
}

/// 2% in ray (27-decimal fixed point).
fn two_percent_ray() -> U256 {
    U256::from(2) * U256::from(10).pow(U256::from(25))
}

fn summary_with_hf(hf: U256) -> AccountSummary {
    AccountSummary {
        total_collateral_base: U256::from(5_000_00000000u64),
        total_debt_base: U256::from(2_000_00000000u64),
        available_borrows_base: U256::from(1_500_00000000u64),
        liquidation_threshold_bps: U256::from(8250),
        ltv_bps: U256::from(8000),
        health_factor_wad: hf,
    }
}

/// Three reserves (USDC, DAI, WETH); only WETH has a non-zero balance of
/// 0.45 at 18 decimals, supplied at a 2% ray-encoded rate; health factor
/// 1.76.
fn base_state() -> MockState {
    let assets = [
        (usdc(), "aUSDC", 6u8),
        (dai(), "aDAI", 18),
        (weth(), "aWETH", 18),
    ];

    let mut tokens = HashMap::new();
    let mut rates = HashMap::new();
    let mut metadata = HashMap::new();
    for (asset, symbol, decimals) in assets {
        let supply = supply_token_of(asset);
        tokens.insert(
            asset,
            ReserveTokens {
                supply_token: supply,
                stable_debt_token: None,
                variable_debt_token: Some(Address::repeat_byte(asset.0[0] | 0xB0)),
            },
        );
        rates.insert(
            asset,
            ReserveRates {
                supply_rate_ray: two_percent_ray(),
                variable_borrow_rate_ray: U256::from(4) * U256::from(10).pow(U256::from(25)),
                stable_borrow_rate_ray: U256::ZERO,
            },
        );
        metadata.insert(
            supply,
            TokenMetadata {
                symbol: symbol.to_string(),
                decimals,
            },
        );
    }

    let mut balances = HashMap::new();
    balances.insert((supply_token_of(weth()), user()), wad_milli(450));

    MockState {
        network: Network::Optimism,
        protection: None,
        signer: user(),
        summary: Mutex::new(summary_with_hf(wad_milli(1760))),
        summary_times_out: false,
        reserves: vec![usdc(), dai(), weth()],
        tokens,
        rates,
        metadata,
        balances,
        allowances: Mutex::new(HashMap::new()),
        fail_metadata: HashSet::new(),
        approve_hangs: false,
        approve_errors: false,
        trigger_errors: false,
        health_after_trigger: None,
        reserve_list_calls: AtomicU32::new(0),
        approve_calls: AtomicU32::new(0),
        trigger_calls: AtomicU32::new(0),
    }
}

fn chain(state: MockState) -> MockChain {
    MockChain {
        state: Arc::new(state),
    }
}

fn aggregator() -> PositionAggregator {
    PositionAggregator::new(
        Arc::new(NetworkRegistry::new(vec![])),
        AggregatorOptions::default(),
    )
}

// ============================================================
// Aggregation
// ============================================================

#[tokio::test]
async fn test_aggregates_single_nonzero_reserve() {
    let chain = chain(base_state());
    let aggregation = aggregator().aggregate_with(&chain, user()).await.unwrap();

    let position = &aggregation.position;
    assert_eq!(position.network, Network::Optimism);
    assert_eq!(position.assets.len(), 1);
    assert!(aggregation.skipped.is_empty());

    let asset = &position.assets[0];
    assert_eq!(asset.underlying, weth());
    assert_eq!(asset.symbol, "WETH");
    assert_eq!(asset.decimals, 18);
    assert_eq!(asset.balance, wad_milli(450));
    assert_eq!(asset.supply_rate_ray, two_percent_ray());
    assert!(asset.variable_debt_token.is_some());
    assert!(asset.stable_debt_token.is_none());
    assert!(!asset.protection_approved);

    assert_eq!(position.summary.health_factor_wad, wad_milli(1760));
    assert_eq!(position.tier, RiskTier::Safe);
}

#[tokio::test]
async fn test_zero_balance_assets_are_excluded() {
    let chain = chain(base_state());
    let aggregation = aggregator().aggregate_with(&chain, user()).await.unwrap();

    // USDC and DAI appear in the reserve list but hold no balance; they are
    // neither assets nor diagnostics.
    let underlyings: Vec<Address> =
        aggregation.position.assets.iter().map(|a| a.underlying).collect();
    assert!(!underlyings.contains(&usdc()));
    assert!(!underlyings.contains(&dai()));
    assert!(aggregation.skipped.is_empty());
}

#[tokio::test]
async fn test_partial_failure_keeps_remaining_assets() {
    let mut state = base_state();
    state.balances.insert((supply_token_of(usdc()), user()), U256::from(1_000_000u64));
    state.balances.insert((supply_token_of(dai()), user()), wad_milli(10_000));
    state.fail_metadata.insert(supply_token_of(dai()));
    let chain = chain(state);

    let aggregation = aggregator().aggregate_with(&chain, user()).await.unwrap();

    // N-1 assets in reserve order, plus one diagnostic for the bad reserve.
    let symbols: Vec<&str> =
        aggregation.position.assets.iter().map(|a| a.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["USDC", "WETH"]);
    assert_eq!(aggregation.skipped.len(), 1);
    assert_eq!(aggregation.skipped[0].asset, dai());
    assert_eq!(aggregation.skipped[0].stage, FetchStage::Metadata);
}

#[tokio::test]
async fn test_aggregation_is_idempotent_without_state_change() {
    let chain = chain(base_state());
    let agg = aggregator();

    let first = agg.aggregate_with(&chain, user()).await.unwrap();
    let second = agg.aggregate_with(&chain, user()).await.unwrap();

    // Equal up to timestamp.
    assert_eq!(first.position.assets, second.position.assets);
    assert_eq!(first.position.summary, second.position.summary);
    assert_eq!(first.position.tier, second.position.tier);
}

#[tokio::test]
async fn test_summary_timeout_aborts_before_reserve_enumeration() {
    let mut state = base_state();
    state.summary_times_out = true;
    let chain = chain(state);

    let err = aggregator().aggregate_with(&chain, user()).await.unwrap_err();
    assert!(matches!(
        err,
        AggregationError::AccountData(ChainError::Timeout { .. })
    ));
    assert!(err.is_retryable());
    assert_eq!(chain.state.reserve_list_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_approval_flag_populated_from_allowance() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    state.allowances.lock().unwrap().insert(
        (supply_token_of(weth()), user(), protection_contract()),
        U256::MAX,
    );
    let chain = chain(state);

    let aggregation = aggregator().aggregate_with(&chain, user()).await.unwrap();
    assert!(aggregation.position.assets[0].protection_approved);
}

// ============================================================
// Protection workflow
// ============================================================

#[tokio::test]
async fn test_approval_already_granted_is_idempotent() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    state.allowances.lock().unwrap().insert(
        (supply_token_of(weth()), user(), protection_contract()),
        U256::MAX,
    );
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();
    let approval = workflow.request_approval(weth()).await.unwrap();

    // No second write; the pending state resolved straight back to
    // monitoring off the fresh allowance read.
    assert_eq!(chain.state.approve_calls.load(Ordering::SeqCst), 0);
    assert!(approval.approved);
    assert_eq!(workflow.state(), &WorkflowState::Monitoring);

    let transitions: Vec<(&str, &str)> = workflow
        .history()
        .iter()
        .map(|e| (e.from.as_str(), e.to.as_str()))
        .collect();
    assert!(transitions.contains(&("monitoring", &format!("approval_pending({})", weth())[..])));
}

#[tokio::test]
async fn test_approval_submits_once_and_rereads_allowance() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();
    assert!(!workflow.position().unwrap().assets[0].protection_approved);

    let approval = workflow.request_approval(weth()).await.unwrap();

    assert_eq!(chain.state.approve_calls.load(Ordering::SeqCst), 1);
    assert!(approval.approved);
    assert_eq!(approval.allowance, U256::MAX);
    assert_eq!(workflow.state(), &WorkflowState::Monitoring);
    // The in-memory position reflects the re-read flag.
    assert!(workflow.position().unwrap().assets[0].protection_approved);
}

#[tokio::test]
async fn test_second_request_while_write_in_flight_is_refused() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    state.approve_hangs = true;
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();

    // Abandon the first request mid-write; the submitted transaction is not
    // cancelled and the key stays claimed.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), workflow.request_approval(weth())).await;
    assert!(abandoned.is_err());
    assert!(matches!(
        workflow.state(),
        WorkflowState::ApprovalPending { .. }
    ));

    let err = workflow.request_approval(weth()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Busy { .. }));
}

#[tokio::test]
async fn test_failed_approve_reconciles_without_resubmitting() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    state.approve_errors = true;
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();
    let err = workflow.request_approval(weth()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::WriteFailed { .. }));
    assert!(matches!(workflow.state(), WorkflowState::Failed { .. }));
    assert_eq!(chain.state.approve_calls.load(Ordering::SeqCst), 1);

    // The approve actually landed on-chain. Retry re-reads the allowance and
    // must not submit a second transaction.
    workflow.retry().await.unwrap();
    assert_eq!(chain.state.approve_calls.load(Ordering::SeqCst), 1);
    assert_eq!(workflow.state(), &WorkflowState::Monitoring);
    assert!(workflow.approval_state(weth()).unwrap().approved);
}

#[tokio::test]
async fn test_at_risk_position_triggers_protection_and_verifies() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    state.summary = Mutex::new(summary_with_hf(wad_milli(900)));
    state.health_after_trigger = Some(wad_milli(1600));
    state.allowances.lock().unwrap().insert(
        (supply_token_of(weth()), user(), protection_contract()),
        U256::MAX,
    );
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    let assessment = workflow.refresh().await.unwrap();
    assert!(assessment.at_risk);
    assert_eq!(assessment.tier, RiskTier::Danger);

    let outcome = workflow.evaluate().await.unwrap().expect("protection ran");

    assert_eq!(chain.state.trigger_calls.load(Ordering::SeqCst), 1);
    assert!(outcome.improved);
    assert!(!outcome.assessment.at_risk);
    assert_eq!(workflow.state(), &WorkflowState::Monitoring);

    let states: Vec<&str> = workflow.history().iter().map(|e| e.to.as_str()).collect();
    assert!(states.iter().any(|s| s.starts_with("protecting")));
    assert!(states.iter().any(|s| s.starts_with("protected")));
}

#[tokio::test]
async fn test_safe_position_takes_no_action() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();
    let outcome = workflow.evaluate().await.unwrap();

    assert!(outcome.is_none());
    assert_eq!(chain.state.trigger_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_trigger_retry_rechecks_position_first() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    state.summary = Mutex::new(summary_with_hf(wad_milli(900)));
    state.trigger_errors = true;
    // The trigger lands despite the client-side failure.
    state.health_after_trigger = Some(wad_milli(1600));
    state.allowances.lock().unwrap().insert(
        (supply_token_of(weth()), user(), protection_contract()),
        U256::MAX,
    );
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();
    let err = workflow.evaluate().await.unwrap_err();
    assert!(matches!(err, WorkflowError::WriteFailed { .. }));
    assert!(matches!(workflow.state(), WorkflowState::Failed { .. }));
    assert_eq!(chain.state.trigger_calls.load(Ordering::SeqCst), 1);

    // Retry sees the recovered ratio and must not fire a second trigger.
    workflow.retry().await.unwrap();
    assert_eq!(chain.state.trigger_calls.load(Ordering::SeqCst), 1);
    assert_eq!(workflow.state(), &WorkflowState::Monitoring);
}

#[tokio::test]
async fn test_approval_requires_protection_contract() {
    let chain = chain(base_state());
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();
    let err = workflow.request_approval(weth()).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::ProtectionUnavailable {
            network: Network::Optimism
        }
    ));
}

#[tokio::test]
async fn test_approval_rejects_asset_outside_position() {
    let mut state = base_state();
    state.protection = Some(protection_contract());
    let chain = chain(state);
    let mut workflow = ProtectionWorkflow::new(chain.clone(), aggregator(), user());

    workflow.refresh().await.unwrap();
    // DAI is in the reserve list but holds no balance, so it is not part of
    // the position.
    let err = workflow.request_approval(dai()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownAsset { asset } if asset == dai()));
}
