use std::sync::Arc;

use lobbycast::{AppState, app, config::Config, store::SqliteStore};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lobbycast=info,tower_http=info"));
    let subscriber = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(config.database_url.as_str())
        .await?;
    let store = SqliteStore::new(db_pool, config.watch_buffer);
    store.migrate().await?;

    let bind_address = config.bind_address.clone();
    let state = AppState::start(Arc::new(store), config);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "lobbycast listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
