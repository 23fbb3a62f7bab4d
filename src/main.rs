//! Matchstake Server
//!
//! Escrow-backed peer-to-peer wagering on played-match outcomes.
//! Serves wager operations over WebSocket; the expiry sweep runs in the
//! background.

use anyhow::Context;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use matchstake::network::auth::AuthConfig;
use matchstake::network::server::{ServerConfig, WagerServer};
use matchstake::ports::escrow::InMemoryLedger;
use matchstake::ports::extractor::ScoreboardJsonExtractor;
use matchstake::wager::engine::{EngineConfig, WagerEngine};
use matchstake::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Matchstake Server v{}", VERSION);

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("MATCHSTAKE_BIND") {
        config.bind_addr = addr
            .parse()
            .with_context(|| format!("invalid MATCHSTAKE_BIND address: {addr}"))?;
    }

    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        warn!("AUTH_SECRET / AUTH_PUBLIC_KEY_PEM not set; clients cannot authenticate");
    }

    // The in-memory ledger is a development stand-in for the custodial
    // backend; it holds no real value across restarts.
    let ledger = InMemoryLedger::new();
    warn!("using in-memory escrow ledger; stakes do not survive a restart");

    let engine = WagerEngine::new(ledger, ScoreboardJsonExtractor::new(), EngineConfig::default());
    let server = WagerServer::new(config, auth, engine);

    server.run().await.context("server terminated")?;
    Ok(())
}
