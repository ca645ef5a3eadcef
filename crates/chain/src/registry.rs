//! Static registry of the lending protocol's per-network deployments.
//!
//! Chain ids and the Pool / data-provider contract addresses are fixed
//! per deployment; RPC endpoints and the optional protection contract come
//! from environment configuration. A network with no configured RPC URL is
//! absent from the registry and fails lookup with `UnsupportedNetwork`.

use std::collections::HashMap;
use std::str::FromStr;

use alloy::primitives::Address;

use aegis_common::config::AppConfig;
use aegis_common::error::AggregationError;
use aegis_common::types::{Network, NetworkConfig};

/// Pool contract per deployment (Sepolia testnets).
pub const ETHEREUM_POOL: &str = "0x6Ae43d3271ff6888e7Fc43Fd7321a503ff738951";
pub const OPTIMISM_POOL: &str = "0xb50201558B00496A145fE76f7424749556E326D8";
pub const ARBITRUM_POOL: &str = "0xBfC91D59fdAA134A4ED45f7B584cAf96D7792Eff";
pub const BASE_POOL: &str = "0x8bAB6d1b75f19e9eD9fCe8b9BD338844fF79aE27";

/// Protocol data provider per deployment.
pub const ETHEREUM_DATA_PROVIDER: &str = "0x3e9708d80f7B3e43118013075F7e95CE3AB31F31";
pub const OPTIMISM_DATA_PROVIDER: &str = "0x501B4c19dd9C2e06E94dA7b6D5Ed4ddA013EC741";
pub const ARBITRUM_DATA_PROVIDER: &str = "0x12373B5085e3b42D42C1D4ABF3B3Cf4Df0E0Fa01";
pub const BASE_DATA_PROVIDER: &str = "0xBc9f5b7E248451CdD7cA54e717a2BFe1F32b566b";

/// Fixed deployment parameters for one network.
struct Deployment {
    display_name: &'static str,
    chain_id: u64,
    pool: &'static str,
    data_provider: &'static str,
}

fn deployment(network: Network) -> Deployment {
    match network {
        Network::Ethereum => Deployment {
            display_name: "Ethereum Sepolia Testnet",
            chain_id: 11155111,
            pool: ETHEREUM_POOL,
            data_provider: ETHEREUM_DATA_PROVIDER,
        },
        Network::Optimism => Deployment {
            display_name: "Optimism Sepolia Testnet",
            chain_id: 11155420,
            pool: OPTIMISM_POOL,
            data_provider: OPTIMISM_DATA_PROVIDER,
        },
        Network::Arbitrum => Deployment {
            display_name: "Arbitrum Sepolia Testnet",
            chain_id: 421614,
            pool: ARBITRUM_POOL,
            data_provider: ARBITRUM_DATA_PROVIDER,
        },
        Network::Base => Deployment {
            display_name: "Base Sepolia Testnet",
            chain_id: 84532,
            pool: BASE_POOL,
            data_provider: BASE_DATA_PROVIDER,
        },
    }
}

/// Immutable map of configured networks. Safe for unsynchronized concurrent
/// reads; never mutated after construction.
#[derive(Debug)]
pub struct NetworkRegistry {
    configs: HashMap<Network, NetworkConfig>,
}

impl NetworkRegistry {
    /// Build a registry from explicit configs (used directly in tests).
    pub fn new(configs: Vec<NetworkConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.network, c)).collect(),
        }
    }

    /// Build the registry from environment configuration, keeping only the
    /// networks with a configured RPC endpoint.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mut configs = Vec::new();

        for network in Network::ALL {
            let Some(rpc_url) = config.rpc_url(network) else {
                continue;
            };

            let fixed = deployment(network);
            let protection = match config.protection_contract(network) {
                Some(addr) => Some(Address::from_str(addr).map_err(|e| {
                    anyhow::anyhow!("invalid protection contract address for {network}: {e}")
                })?),
                None => None,
            };

            configs.push(NetworkConfig {
                network,
                display_name: fixed.display_name,
                chain_id: fixed.chain_id,
                rpc_url: rpc_url.to_string(),
                pool: Address::from_str(fixed.pool).expect("valid pool address"),
                data_provider: Address::from_str(fixed.data_provider)
                    .expect("valid data provider address"),
                protection,
            });

            tracing::info!(
                network = %network,
                chain_id = fixed.chain_id,
                protection_configured = protection.is_some(),
                "Network registered"
            );
        }

        if configs.is_empty() {
            anyhow::bail!("no networks configured; set at least one *_RPC_URL");
        }

        Ok(Self::new(configs))
    }

    /// Look up a configured network.
    pub fn lookup(&self, network: Network) -> Result<&NetworkConfig, AggregationError> {
        self.configs
            .get(&network)
            .ok_or_else(|| AggregationError::UnsupportedNetwork(network.to_string()))
    }

    /// Look up by string key (e.g., "optimism").
    pub fn lookup_key(&self, key: &str) -> Result<&NetworkConfig, AggregationError> {
        self.lookup(key.parse()?)
    }

    /// Networks present in the registry.
    pub fn networks(&self) -> Vec<Network> {
        let mut networks: Vec<_> = self.configs.keys().copied().collect();
        networks.sort_by_key(|n| n.to_string());
        networks
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(network: Network) -> NetworkConfig {
        let fixed = deployment(network);
        NetworkConfig {
            network,
            display_name: fixed.display_name,
            chain_id: fixed.chain_id,
            rpc_url: "http://localhost:8545".to_string(),
            pool: Address::from_str(fixed.pool).unwrap(),
            data_provider: Address::from_str(fixed.data_provider).unwrap(),
            protection: None,
        }
    }

    #[test]
    fn test_lookup_configured_network() {
        let registry = NetworkRegistry::new(vec![test_config(Network::Optimism)]);
        let config = registry.lookup(Network::Optimism).unwrap();
        assert_eq!(config.chain_id, 11155420);
        assert_eq!(config.pool, Address::from_str(OPTIMISM_POOL).unwrap());
    }

    #[test]
    fn test_lookup_unconfigured_network_fails() {
        let registry = NetworkRegistry::new(vec![test_config(Network::Optimism)]);
        let err = registry.lookup(Network::Base).unwrap_err();
        assert!(matches!(err, AggregationError::UnsupportedNetwork(k) if k == "base"));
    }

    #[test]
    fn test_lookup_key_parses_and_resolves() {
        let registry = NetworkRegistry::new(vec![test_config(Network::Arbitrum)]);
        assert_eq!(
            registry.lookup_key("arbitrum").unwrap().chain_id,
            421614
        );
        assert!(registry.lookup_key("solana").is_err());
    }

    #[test]
    fn test_all_deployments_have_distinct_chain_ids() {
        let mut ids: Vec<u64> = Network::ALL.iter().map(|n| deployment(*n).chain_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), Network::ALL.len());
    }

    #[test]
    fn test_deployment_addresses_parse() {
        for network in Network::ALL {
            let fixed = deployment(network);
            Address::from_str(fixed.pool).unwrap();
            Address::from_str(fixed.data_provider).unwrap();
        }
    }
}
