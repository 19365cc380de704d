use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use sendbox::provider::HttpProvider;
use sendbox::worker::Dispatcher;
use sendbox::{config, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load .env (local dev)
    dotenvy::dotenv().ok();

    let cfg = config::Config::from_env()?;
    let pool = db::connect(&cfg.database_url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("db connected + migrations applied");

    let provider = Arc::new(HttpProvider::new(
        cfg.provider_base_url.clone(),
        cfg.provider_api_key.clone(),
    ));

    let mut dispatcher = Dispatcher::new(pool, provider, cfg.dispatcher());
    dispatcher.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    dispatcher.stop().await;

    Ok(())
}
