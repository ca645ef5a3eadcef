//! Protection workflow — approval and rebalance-trigger coordination for one
//! (user, network) pair.
//!
//! State machine: Idle → Monitoring → ApprovalPending → Protecting →
//! Protected → Monitoring, with Failed reachable from any active state.
//! Writes are serialized through the state itself: a request for a key with
//! a write already in flight is refused. Recovery never trusts in-memory
//! flags — every exit from `Failed` and every entry into `Protected` does a
//! fresh on-chain read first, since a write may have landed even when the
//! client saw an error.

use std::collections::HashMap;

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use serde::Serialize;

use aegis_chain::LendingChain;
use aegis_common::error::{ChainError, WorkflowError};
use aegis_common::types::{
    ApprovalState, Position, ProtectionStage, RiskAssessment, WorkflowEvent, WorkflowState,
};

use crate::aggregator::PositionAggregator;
use crate::risk;

/// Result of a completed protection run.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionOutcome {
    pub tx_hash: B256,
    /// Assessment from the fresh post-trigger aggregation.
    pub assessment: RiskAssessment,
    /// Whether the verified ratio improved over the pre-trigger one.
    pub improved: bool,
}

/// Per-(user, network) protection state machine.
pub struct ProtectionWorkflow<C: LendingChain> {
    chain: C,
    aggregator: PositionAggregator,
    user: Address,
    state: WorkflowState,
    position: Option<Position>,
    assessment: Option<RiskAssessment>,
    approvals: HashMap<Address, ApprovalState>,
    history: Vec<WorkflowEvent>,
}

impl<C: LendingChain> ProtectionWorkflow<C> {
    pub fn new(chain: C, aggregator: PositionAggregator, user: Address) -> Self {
        Self {
            chain,
            aggregator,
            user,
            state: WorkflowState::Idle,
            position: None,
            assessment: None,
            approvals: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Transition log for the consumer-facing event stream.
    pub fn history(&self) -> &[WorkflowEvent] {
        &self.history
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn assessment(&self) -> Option<&RiskAssessment> {
        self.assessment.as_ref()
    }

    pub fn approval_state(&self, asset: Address) -> Option<&ApprovalState> {
        self.approvals.get(&asset)
    }

    /// Re-aggregate the position and refresh the assessment.
    pub async fn refresh(&mut self) -> Result<RiskAssessment, WorkflowError> {
        self.ensure_no_write_in_flight()?;

        let aggregation = self
            .aggregator
            .aggregate_with(&self.chain, self.user)
            .await?;
        if !aggregation.skipped.is_empty() {
            tracing::warn!(
                user = %self.user,
                skipped = aggregation.skipped.len(),
                "Aggregation completed with skipped reserves"
            );
        }

        let assessment = risk::assess(&aggregation.position.summary);
        if self.state == WorkflowState::Idle {
            self.transition(WorkflowState::Monitoring, "position loaded");
        }
        self.position = Some(aggregation.position);
        self.assessment = Some(assessment);
        Ok(assessment)
    }

    /// Ensure the protection contract may move the asset's supply token.
    ///
    /// Idempotent: an already-sufficient allowance resolves without a second
    /// transaction; the reported state comes from a fresh on-chain read
    /// either way.
    pub async fn request_approval(
        &mut self,
        asset: Address,
    ) -> Result<ApprovalState, WorkflowError> {
        self.ensure_no_write_in_flight()?;
        let spender = self.protection_contract()?;
        let supply_token = self.supply_token_of(asset)?;

        self.transition(
            WorkflowState::ApprovalPending { asset },
            "protection approval requested",
        );

        let allowance = match self
            .chain
            .get_allowance(supply_token, self.user, spender)
            .await
        {
            Ok(allowance) => allowance,
            Err(e) => return Err(self.fail(ProtectionStage::Approval, asset, e)),
        };

        if allowance > U256::ZERO {
            let state = self.record_approval(asset, supply_token, allowance);
            self.transition(
                WorkflowState::Monitoring,
                "allowance already granted; no transaction submitted",
            );
            return Ok(state);
        }

        match self.chain.approve(supply_token, spender, U256::MAX).await {
            Ok(confirmation) => {
                tracing::info!(
                    user = %self.user,
                    asset = %asset,
                    tx = %confirmation.tx_hash,
                    "Approval confirmed"
                );
            }
            Err(e) => return Err(self.fail(ProtectionStage::Approval, asset, e)),
        }

        // The flag the consumer sees comes from the chain, not from the fact
        // that the transaction confirmed.
        let granted = match self
            .chain
            .get_allowance(supply_token, self.user, spender)
            .await
        {
            Ok(allowance) => allowance,
            Err(e) => return Err(self.fail(ProtectionStage::Approval, asset, e)),
        };

        let state = self.record_approval(asset, supply_token, granted);
        self.transition(WorkflowState::Monitoring, "approval granted");
        Ok(state)
    }

    /// Trigger protection automatically when the position is liquidation-
    /// eligible and an approved asset is available. Returns `None` when no
    /// action is needed (or possible).
    pub async fn evaluate(&mut self) -> Result<Option<ProtectionOutcome>, WorkflowError> {
        self.ensure_no_write_in_flight()?;
        let assessment = self.assessment.ok_or(WorkflowError::NoPosition)?;
        if !assessment.at_risk {
            return Ok(None);
        }

        let candidate = {
            let position = self.position.as_ref().ok_or(WorkflowError::NoPosition)?;
            position
                .assets
                .iter()
                .find(|a| a.protection_approved)
                .map(|a| a.underlying)
        };
        let Some(asset) = candidate else {
            tracing::warn!(
                user = %self.user,
                "Position at risk but no asset approved for protection"
            );
            return Ok(None);
        };

        self.protect(asset).await.map(Some)
    }

    /// Trigger the protection contract for one asset and verify the result.
    pub async fn protect(&mut self, asset: Address) -> Result<ProtectionOutcome, WorkflowError> {
        self.ensure_no_write_in_flight()?;
        let contract = self.protection_contract()?;
        // Membership check only; the trigger call takes the underlying.
        self.supply_token_of(asset)?;
        let before = self.assessment.map(|a| a.ratio);

        self.transition(
            WorkflowState::Protecting { asset },
            "health ratio at liquidation risk",
        );

        let confirmation = match self.chain.trigger_protection(contract, self.user, asset).await
        {
            Ok(confirmation) => confirmation,
            Err(e) => return Err(self.fail(ProtectionStage::Trigger, asset, e)),
        };

        self.transition(
            WorkflowState::Protected { asset },
            "protection transaction confirmed",
        );

        // Verification is a fresh aggregation, not a re-read of local state.
        let aggregation = match self
            .aggregator
            .aggregate_with(&self.chain, self.user)
            .await
        {
            Ok(aggregation) => aggregation,
            Err(e) => {
                let err = WorkflowError::Aggregation(e);
                self.transition(
                    WorkflowState::Failed {
                        stage: ProtectionStage::Trigger,
                        asset,
                        reason: err.to_string(),
                    },
                    "post-protection verification failed",
                );
                return Err(err);
            }
        };

        let assessment = risk::assess(&aggregation.position.summary);
        let improved = match before {
            Some(previous) => assessment.ratio > previous,
            None => false,
        };

        tracing::info!(
            user = %self.user,
            asset = %asset,
            tx = %confirmation.tx_hash,
            ratio = %assessment.ratio,
            improved,
            "Post-protection verification complete"
        );

        self.position = Some(aggregation.position);
        self.assessment = Some(assessment);
        self.transition(
            WorkflowState::Monitoring,
            if improved {
                "health ratio improved"
            } else {
                "health ratio did not improve"
            },
        );

        Ok(ProtectionOutcome {
            tx_hash: confirmation.tx_hash,
            assessment,
            improved,
        })
    }

    /// Recover from `Failed` by reconciling against on-chain state. The
    /// failed write may have landed, so nothing is re-submitted until a
    /// fresh read says it is still needed.
    pub async fn retry(&mut self) -> Result<(), WorkflowError> {
        let WorkflowState::Failed { stage, asset, .. } = self.state.clone() else {
            return Ok(());
        };

        self.transition(
            WorkflowState::Monitoring,
            "reconciling on-chain state after failure",
        );

        match stage {
            ProtectionStage::Approval => {
                // Re-checks the live allowance; a landed approve resolves
                // without a second transaction.
                self.request_approval(asset).await?;
            }
            ProtectionStage::Trigger => {
                let assessment = self.refresh().await?;
                if assessment.at_risk {
                    self.protect(asset).await?;
                } else {
                    tracing::info!(
                        user = %self.user,
                        asset = %asset,
                        "Position no longer at risk; trigger landed or conditions changed"
                    );
                }
            }
        }

        Ok(())
    }

    fn ensure_no_write_in_flight(&self) -> Result<(), WorkflowError> {
        match &self.state {
            WorkflowState::ApprovalPending { .. } | WorkflowState::Protecting { .. } => {
                Err(WorkflowError::Busy {
                    state: self.state.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn protection_contract(&self) -> Result<Address, WorkflowError> {
        self.chain
            .protection_contract()
            .ok_or(WorkflowError::ProtectionUnavailable {
                network: self.chain.network(),
            })
    }

    fn supply_token_of(&self, asset: Address) -> Result<Address, WorkflowError> {
        let position = self.position.as_ref().ok_or(WorkflowError::NoPosition)?;
        position
            .assets
            .iter()
            .find(|a| a.underlying == asset)
            .map(|a| a.supply_token)
            .ok_or(WorkflowError::UnknownAsset { asset })
    }

    fn record_approval(
        &mut self,
        asset: Address,
        supply_token: Address,
        allowance: U256,
    ) -> ApprovalState {
        let state = ApprovalState {
            asset,
            supply_token,
            approved: allowance > U256::ZERO,
            allowance,
            checked_at: Utc::now(),
        };
        if let Some(position) = self.position.as_mut()
            && let Some(holding) = position.assets.iter_mut().find(|a| a.underlying == asset)
        {
            holding.protection_approved = state.approved;
        }
        self.approvals.insert(asset, state.clone());
        state
    }

    fn fail(
        &mut self,
        stage: ProtectionStage,
        asset: Address,
        source: ChainError,
    ) -> WorkflowError {
        let err = WorkflowError::WriteFailed { stage, source };
        self.transition(
            WorkflowState::Failed {
                stage,
                asset,
                reason: err.to_string(),
            },
            "write did not confirm",
        );
        err
    }

    fn transition(&mut self, to: WorkflowState, reason: &str) {
        tracing::info!(
            user = %self.user,
            network = %self.chain.network(),
            from = %self.state,
            to = %to,
            reason,
            "Workflow transition"
        );
        self.history.push(WorkflowEvent {
            from: self.state.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.state = to;
    }
}
