use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;

use aegis_chain::registry::NetworkRegistry;
use aegis_common::config::AppConfig;
use aegis_monitor::poller::PositionPoller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aegis_monitor=info,aegis_engine=info,aegis_chain=info".into()),
        )
        .json()
        .init();

    tracing::info!("Aegis position monitor starting...");

    // Load configuration and register networks
    let config = AppConfig::from_env()?;
    let registry = Arc::new(NetworkRegistry::from_config(&config)?);

    let user = config
        .monitor_user_address
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("MONITOR_USER_ADDRESS environment variable is required"))?;
    let user = Address::from_str(user)
        .map_err(|e| anyhow::anyhow!("invalid MONITOR_USER_ADDRESS: {e}"))?;

    let signer = match config.signer_private_key.as_deref() {
        Some(key) => Some(
            key.parse::<PrivateKeySigner>()
                .map_err(|e| anyhow::anyhow!("invalid SIGNER_PRIVATE_KEY: {e}"))?,
        ),
        None => {
            tracing::info!("No signer configured; monitoring read-only");
            None
        }
    };

    let mut poller = PositionPoller::new(registry, &config, user, signer);

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = poller.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Position poller exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Aegis position monitor stopped.");
    Ok(())
}
