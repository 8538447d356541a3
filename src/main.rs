use std::sync::Arc;

use datahub::background::{flush_loop, sweep_loop};
use datahub::config::HubConfig;
use datahub::delivery::HttpCallback;
use datahub::hub::Hub;
use datahub::server::{AppState, build_router};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datahub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HubConfig::from_env()?;
    let callback = HttpCallback::new(config.callback_timeout)?;
    let hub = Arc::new(Hub::open(&config, callback)?);

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&hub),
        config.sweep_interval,
        shutdown.child_token(),
    ));
    let flusher = tokio::spawn(flush_loop(
        Arc::clone(&hub),
        config.flush_interval,
        shutdown.child_token(),
    ));

    let app = build_router(AppState::new(Arc::clone(&hub)));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, app_url = %config.app_url, "listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let (sweep, flush) = tokio::join!(sweeper, flusher);
    for (task, result) in [("sweep", sweep), ("flush", flush)] {
        if let Err(e) = result {
            error!(task, error = %e, "background loop failed");
        }
    }
    hub.shutdown().await?;
    info!("stopped");
    Ok(())
}
