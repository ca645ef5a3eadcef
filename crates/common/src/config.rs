use serde::Deserialize;

use crate::types::Network;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// RPC endpoint per network. Networks without a URL are not monitored.
    pub ethereum_rpc_url: Option<String>,
    pub optimism_rpc_url: Option<String>,
    pub arbitrum_rpc_url: Option<String>,
    pub base_rpc_url: Option<String>,

    /// Protection (rebalance) contract per network, where deployed.
    pub protection_contract_ethereum: Option<String>,
    pub protection_contract_optimism: Option<String>,
    pub protection_contract_arbitrum: Option<String>,
    pub protection_contract_base: Option<String>,

    /// Address whose position the monitor binary watches.
    pub monitor_user_address: Option<String>,

    /// Private key for the write path (approve / protection trigger).
    /// Absent means read-only monitoring.
    pub signer_private_key: Option<String>,

    /// Position polling interval in milliseconds (default: 30000)
    pub poll_interval_ms: u64,

    /// Per-call deadline for remote reads in seconds (default: 15)
    pub call_timeout_secs: u64,

    /// Deadline for connection establishment in seconds (default: 10)
    pub connect_timeout_secs: u64,

    /// Deadline for a write to be mined and confirmed in seconds (default: 120)
    pub write_timeout_secs: u64,

    /// Bounded fan-out for per-reserve fetches within one aggregation (default: 4)
    pub max_concurrent_reserve_fetches: usize,

    /// Retry budget for retryable aggregation failures (default: 2)
    pub max_call_retries: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            ethereum_rpc_url: std::env::var("ETHEREUM_RPC_URL").ok(),
            optimism_rpc_url: std::env::var("OPTIMISM_RPC_URL").ok(),
            arbitrum_rpc_url: std::env::var("ARBITRUM_RPC_URL").ok(),
            base_rpc_url: std::env::var("BASE_RPC_URL").ok(),
            protection_contract_ethereum: std::env::var("PROTECTION_CONTRACT_ETHEREUM").ok(),
            protection_contract_optimism: std::env::var("PROTECTION_CONTRACT_OPTIMISM").ok(),
            protection_contract_arbitrum: std::env::var("PROTECTION_CONTRACT_ARBITRUM").ok(),
            protection_contract_base: std::env::var("PROTECTION_CONTRACT_BASE").ok(),
            monitor_user_address: std::env::var("MONITOR_USER_ADDRESS").ok(),
            signer_private_key: std::env::var("SIGNER_PRIVATE_KEY").ok(),
            poll_interval_ms: std::env::var("POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("POLL_INTERVAL_MS must be a valid u64"))?,
            call_timeout_secs: std::env::var("CALL_TIMEOUT_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CALL_TIMEOUT_SECS must be a valid u64"))?,
            connect_timeout_secs: std::env::var("CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CONNECT_TIMEOUT_SECS must be a valid u64"))?,
            write_timeout_secs: std::env::var("WRITE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WRITE_TIMEOUT_SECS must be a valid u64"))?,
            max_concurrent_reserve_fetches: std::env::var("MAX_CONCURRENT_RESERVE_FETCHES")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .map_err(|_| {
                    anyhow::anyhow!("MAX_CONCURRENT_RESERVE_FETCHES must be a valid usize")
                })?,
            max_call_retries: std::env::var("MAX_CALL_RETRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_CALL_RETRIES must be a valid u32"))?,
        })
    }

    /// RPC URL configured for a network, if any.
    pub fn rpc_url(&self, network: Network) -> Option<&str> {
        match network {
            Network::Ethereum => self.ethereum_rpc_url.as_deref(),
            Network::Optimism => self.optimism_rpc_url.as_deref(),
            Network::Arbitrum => self.arbitrum_rpc_url.as_deref(),
            Network::Base => self.base_rpc_url.as_deref(),
        }
    }

    /// Protection contract address configured for a network, if any.
    pub fn protection_contract(&self, network: Network) -> Option<&str> {
        match network {
            Network::Ethereum => self.protection_contract_ethereum.as_deref(),
            Network::Optimism => self.protection_contract_optimism.as_deref(),
            Network::Arbitrum => self.protection_contract_arbitrum.as_deref(),
            Network::Base => self.protection_contract_base.as_deref(),
        }
    }
}
