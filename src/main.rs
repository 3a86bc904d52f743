use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use duty_tracker::api;
use duty_tracker::config::Config;
use duty_tracker::engine::eviction::run_stale_eviction;
use duty_tracker::error::AppError;
use duty_tracker::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let shared_state = Arc::new(AppState::new(&config));

    let resumed = shared_state.duties.resume_all().await?;
    tracing::info!(resumed, "resumed tracking for active duties");

    if let Some(max_age) = config.stale_after {
        tokio::spawn(run_stale_eviction(
            shared_state.clone(),
            config.eviction_interval,
            max_age,
        ));
    }

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    let stopped = shared_state.sessions.stop_all();
    tracing::info!(stopped, "tracking sessions stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
