use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod password;
mod rate_limiter;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::from_env();

    // Clients load the weights themselves; a bad model directory only
    // degrades the login page, so keep serving the API.
    let model_dir = config.model_dir.clone();
    match tokio::task::spawn_blocking(move || facegate_models::verify_models_dir(&model_dir)).await? {
        Ok(()) => tracing::info!(dir = %config.model_dir.display(), "model assets verified"),
        Err(e) => tracing::warn!(
            dir = %config.model_dir.display(),
            error = %e,
            "model assets failed verification; run `facegate setup`"
        ),
    }

    let store = store::AuthStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let users = store.count_users().await?;
    tracing::info!(db = %config.db_path.display(), users, "database ready");

    let bind = config.bind;
    let app = api::router(api::AppState::new(store, config));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!(addr = %bind, "facegated ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    tracing::info!("facegated shutting down");
    Ok(())
}
