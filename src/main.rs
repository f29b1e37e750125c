use std::sync::Arc;
use std::time::Duration;

use clinicaltrials_mcp::{
    build_app,
    config::Config,
    launch::{self, ShutdownCoordinator},
    logging, AppState,
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    logging::init_logging();

    if let Err(err) = run().await {
        error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let state = AppState::new(&config);
    let app = build_app(state);

    let listener = launch::bind_with_retry(
        &config.bind_addr,
        config.bind_port,
        config.max_port_retries,
        Duration::from_millis(config.port_retry_delay_ms),
    )
    .await?;

    // The bound port may differ from the configured one.
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        endpoint = %config.endpoint_path,
        session_mode = %config.session_mode,
        environment = %config.environment,
        "server listening"
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(launch::shutdown_signal(coordinator))
        .await?;

    info!("shutdown complete");
    Ok(())
}
