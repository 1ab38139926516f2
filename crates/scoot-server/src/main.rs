use clap::Parser;
use scoot_core::Registry;
use scoot_server::config::{CliArgs, ServerConfig};
use scoot_server::telemetry::{TelemetryProviders, init_telemetry};
use scoot_server::{ScooterService, Server, ServerHandle};
use std::sync::Arc;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let registry = Arc::new(Registry::standard()?);
    let service = Arc::new(ScooterService::new(&config.service_settings())?);

    if let Some(path) = &config.users_file {
        let added = service.users().seed_from_file(path)?;
        tracing::info!(users = added, file = %path.display(), "seeded users");
    }
    service.grid().seed_random(config.scooters, &mut rand::rng());
    let scanner = service.start();
    service.scanner().trigger();

    let server = Server::bind(&config.server_addr, Arc::clone(&service), registry).await?;
    log_startup_info(&config);

    let handle = server.handle();
    let shutdown = tokio::spawn(shutdown_signal(handle, Arc::clone(&service), providers));
    server.serve().await?;

    // The listener is gone; wait for the scanner and exporters to wind down.
    shutdown.await?;
    scanner.await?;
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting scooter service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting scooter service on {} with a {}x{} grid and {} scooters",
            config.server_addr,
            config.grid_size,
            config.grid_size,
            config.scooters
        );
    }
}

async fn shutdown_signal(
    handle: ServerHandle,
    service: Arc<ScooterService>,
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Stop accepting connections
    handle.stop();

    // 2. Stop the reward scanner
    service.shutdown();

    // 3. Flush exporters
    providers.shutdown();
}
