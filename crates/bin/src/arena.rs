//! Spore arena game server.

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Spore Arena Server v{}", env!("CARGO_PKG_VERSION"));

    let config = server::Config::load()?;
    info!("Loaded configuration");
    info!("  Port: {}", config.server.port);
    info!("  Spores: {}", config.game.max_spores);
    info!("  Database: {}", config.database.path);

    let store = server::SqliteScoreStore::open(&config.database.path)?;
    server::run(config, Arc::new(store)).await?;

    Ok(())
}
