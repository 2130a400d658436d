// mcp-gateway binary - wires config, store, manager and gateway together
//
// Startup sequence:
// 1. Parse CLI, handle subcommands (config inspection) and exit early
// 2. Load layered configuration and validate it
// 3. Pick the store backing (Redis if store_url is set, in-memory otherwise)
//    and the token codec (signed in gateway mode, opaque in direct mode)
// 4. Spawn the periodic expired-session sweep
// 5. Serve until ctrl-c, then shut down gracefully

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_gateway::cli::{handle_subcommand, Cli};
use mcp_gateway::config::{Config, Mode};
use mcp_gateway::gateway;
use mcp_gateway::session::{
    MemoryStore, PortAllocator, RedisStore, SessionManager, SessionStore, TokenCodec,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if handle_subcommand(&cli) {
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load().context("Failed to load configuration")?;
    cli.serve.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        mode = ?config.mode(),
        bind = %config.bind_addr,
        ports = format!("{}-{}", config.port_min, config.port_max),
        "mcp-gateway {} starting",
        mcp_gateway::config::VERSION
    );

    // Store backing: presence of a store URL selects the shared Redis store;
    // a distributed deployment with the in-memory map would hand out tokens
    // other gateway instances cannot resolve
    let store: Arc<dyn SessionStore> = match &config.store_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .context("Failed to connect to session store")?;
            tracing::info!("Using Redis session store");
            Arc::new(store)
        }
        None => {
            tracing::info!("Using in-memory session store (single instance)");
            Arc::new(MemoryStore::new())
        }
    };

    let codec = match config.mode() {
        Mode::Gateway => {
            // validate() guarantees the secret is present in gateway mode
            let secret = config.signing_secret.as_deref().unwrap_or_default();
            TokenCodec::signed(secret)
        }
        Mode::Direct => TokenCodec::opaque(),
    };

    let ports = PortAllocator::new(config.port_range(), config.blocked_ports.iter().copied());
    let manager = Arc::new(SessionManager::new(
        store,
        ports,
        codec,
        config.manager_config(),
    ));

    // Periodic sweep: the authority on expiry in direct mode, a safety net
    // behind the store TTL in gateway mode
    let sweep_manager = manager.clone();
    let sweep_interval = std::time::Duration::from_secs(config.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_manager.sweep_expired().await {
                tracing::warn!("Session sweep failed: {e}");
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    gateway::start_gateway(config, manager, shutdown_rx).await
}
