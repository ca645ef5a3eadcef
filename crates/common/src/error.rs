use std::time::Duration;

use alloy::primitives::Address;
use thiserror::Error;

use crate::types::{Network, ProtectionStage};

/// Failures of a single remote call on one network's client.
///
/// Timeouts and connectivity failures are retryable by the caller; remote
/// rejections (reverts, malformed responses) are not.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("chain identity mismatch: configured {expected}, endpoint reports {actual}")]
    ChainIdentityMismatch { expected: u64, actual: u64 },

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{op} rejected by remote: {reason}")]
    Remote { op: &'static str, reason: String },

    #[error("client has no signer; write operations unavailable")]
    NoSigner,
}

impl ChainError {
    /// Whether the caller may retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::Connection(_)
                | ChainError::ChainIdentityMismatch { .. }
                | ChainError::Timeout { .. }
        )
    }
}

/// Fatal failures of a whole aggregation run. Per-reserve failures are not
/// errors; they are carried as `SkippedReserve` diagnostics alongside the
/// position.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("failed to connect to {network}: {source}")]
    Connect {
        network: Network,
        #[source]
        source: ChainError,
    },

    #[error("account summary unavailable: {0}")]
    AccountData(#[source] ChainError),

    #[error("reserve list unavailable: {0}")]
    ReserveList(#[source] ChainError),
}

impl AggregationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AggregationError::UnsupportedNetwork(_) => false,
            AggregationError::Connect { source, .. }
            | AggregationError::AccountData(source)
            | AggregationError::ReserveList(source) => source.is_retryable(),
        }
    }
}

/// Failures of the protection workflow. A `WriteFailed` leaves the workflow
/// in `Failed`; recovery re-reads on-chain state instead of re-submitting
/// blindly, since the write may have landed despite the client-side error.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("a write is already in flight for this position (state: {state})")]
    Busy { state: String },

    #[error("asset {asset} is not part of the current position")]
    UnknownAsset { asset: Address },

    #[error("no protection contract configured for {network}")]
    ProtectionUnavailable { network: Network },

    #[error("no position loaded; refresh the workflow first")]
    NoPosition,

    #[error("{stage} write did not confirm: {source}")]
    WriteFailed {
        stage: ProtectionStage,
        #[source]
        source: ChainError,
    },

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(ChainError::Connection("refused".into()).is_retryable());
        assert!(
            ChainError::Timeout {
                op: "getUserAccountData",
                timeout: Duration::from_secs(15),
            }
            .is_retryable()
        );
        assert!(
            ChainError::ChainIdentityMismatch {
                expected: 11155111,
                actual: 1,
            }
            .is_retryable()
        );
        assert!(
            !ChainError::Remote {
                op: "getReserveData",
                reason: "execution reverted".into(),
            }
            .is_retryable()
        );
        assert!(!ChainError::NoSigner.is_retryable());
    }

    #[test]
    fn aggregation_retryability_delegates_to_the_cause() {
        assert!(!AggregationError::UnsupportedNetwork("polygon".into()).is_retryable());
        assert!(
            AggregationError::AccountData(ChainError::Connection("reset".into())).is_retryable()
        );
        assert!(
            !AggregationError::ReserveList(ChainError::Remote {
                op: "getReservesList",
                reason: "revert".into(),
            })
            .is_retryable()
        );
    }
}
