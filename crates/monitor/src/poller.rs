//! Position poller — periodically re-aggregates the watched position on
//! every configured network and drives the protection workflow where a
//! signer and a protection contract are available.
//!
//! Networks are independent; a failure on one never blocks the others.
//! Retryable aggregation failures get a small bounded retry budget with
//! backoff before the cycle gives up until the next poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;

use aegis_chain::client::{ChainClient, ChainTimeouts};
use aegis_chain::registry::NetworkRegistry;
use aegis_common::config::AppConfig;
use aegis_common::error::AggregationError;
use aegis_common::types::{Aggregation, Network, RiskAssessment, WorkflowState};
use aegis_engine::aggregator::{AggregatorOptions, PositionAggregator};
use aegis_engine::risk;
use aegis_engine::workflow::ProtectionWorkflow;

/// Long-running poller for one watched user across all registered networks.
pub struct PositionPoller {
    registry: Arc<NetworkRegistry>,
    aggregator: PositionAggregator,
    user: Address,
    poll_interval: Duration,
    max_retries: u32,
    timeouts: ChainTimeouts,
    signer: Option<PrivateKeySigner>,
    workflows: HashMap<Network, ProtectionWorkflow<ChainClient>>,
}

impl PositionPoller {
    pub fn new(
        registry: Arc<NetworkRegistry>,
        config: &AppConfig,
        user: Address,
        signer: Option<PrivateKeySigner>,
    ) -> Self {
        Self {
            aggregator: PositionAggregator::new(
                registry.clone(),
                AggregatorOptions::from_config(config),
            ),
            registry,
            user,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_retries: config.max_call_retries,
            timeouts: ChainTimeouts::from_config(config),
            signer,
            workflows: HashMap::new(),
        }
    }

    /// Start the polling loop. Runs until the task is cancelled.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let networks = self.registry.networks();

        tracing::info!(
            user = %self.user,
            networks = networks.len(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            write_capable = self.signer.is_some(),
            "Position poller started"
        );

        loop {
            for network in &networks {
                if let Err(e) = self.poll_network(*network).await {
                    tracing::error!(network = %network, error = %e, "Poll cycle failed");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_network(&mut self, network: Network) -> anyhow::Result<()> {
        if self.signer.is_some() && self.protection_configured(network) {
            self.poll_with_workflow(network).await
        } else {
            self.poll_read_only(network).await
        }
    }

    fn protection_configured(&self, network: Network) -> bool {
        self.registry
            .lookup(network)
            .map(|c| c.protection.is_some())
            .unwrap_or(false)
    }

    /// Read-only cycle: aggregate, assess, report.
    async fn poll_read_only(&self, network: Network) -> anyhow::Result<()> {
        let aggregation = self.aggregate_with_retry(network).await?;
        let assessment = risk::assess(&aggregation.position.summary);
        report(&aggregation, &assessment);
        Ok(())
    }

    /// Write-capable cycle: refresh the workflow, reconcile a failed write
    /// if there is one, and let the workflow auto-trigger protection.
    async fn poll_with_workflow(&mut self, network: Network) -> anyhow::Result<()> {
        if !self.workflows.contains_key(&network) {
            let config = self.registry.lookup(network)?.clone();
            let Some(signer) = self.signer.clone() else {
                anyhow::bail!("signer required for workflow polling on {network}");
            };
            let client =
                ChainClient::connect_with_signer(&config, self.timeouts, signer).await?;
            self.workflows.insert(
                network,
                ProtectionWorkflow::new(client, self.aggregator.clone(), self.user),
            );
        }
        let Some(workflow) = self.workflows.get_mut(&network) else {
            anyhow::bail!("workflow not initialized for {network}");
        };

        if matches!(workflow.state(), WorkflowState::Failed { .. }) {
            workflow.retry().await?;
            return Ok(());
        }

        let assessment = workflow.refresh().await?;
        if let Some(position) = workflow.position() {
            tracing::info!(
                network = %network,
                tier = %assessment.tier,
                ratio = %assessment.ratio,
                at_risk = assessment.at_risk,
                assets = position.assets.len(),
                "Position assessed"
            );
        }

        if let Some(outcome) = workflow.evaluate().await? {
            tracing::info!(
                network = %network,
                tx = %outcome.tx_hash,
                improved = outcome.improved,
                ratio = %outcome.assessment.ratio,
                "Protection executed"
            );
        }

        Ok(())
    }

    async fn aggregate_with_retry(
        &self,
        network: Network,
    ) -> Result<Aggregation, AggregationError> {
        let mut attempt = 0u32;
        loop {
            match self.aggregator.aggregate(self.user, network).await {
                Ok(aggregation) => return Ok(aggregation),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(500u64 << (attempt - 1));
                    tracing::warn!(
                        network = %network,
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Aggregation failed; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Consumer-facing output: the assessed position, summarized at info and
/// carried in full as a JSON payload at debug.
fn report(aggregation: &Aggregation, assessment: &RiskAssessment) {
    tracing::info!(
        network = %aggregation.position.network,
        tier = %assessment.tier,
        ratio = %assessment.ratio,
        at_risk = assessment.at_risk,
        assets = aggregation.position.assets.len(),
        skipped = aggregation.skipped.len(),
        "Position assessed"
    );

    if let Ok(payload) = serde_json::to_string(aggregation) {
        tracing::debug!(payload, "Position snapshot");
    }
}
