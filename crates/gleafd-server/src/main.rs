use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use gleafd_core::IdService;
use gleafd_server::server::config::{CliArgs, Config};
use gleafd_server::server::storage::{MySqlSegmentRepository, RedisMachineStorage};
use gleafd_server::server::{http, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = Config::load(args)?;

    telemetry::init(&config.log)?;

    let mut builder = IdService::builder().name(&config.name).addr(&config.addr);
    if config.segment.enable {
        let repo = MySqlSegmentRepository::connect(&config.segment.db_url()).await?;
        builder = builder.segment_repository(Arc::new(repo));
    }
    if config.snowflake.enable {
        let storage = RedisMachineStorage::connect(&config.snowflake.redis_addr).await?;
        builder = builder.machine_storage(Arc::new(storage));
    }
    let svc = Arc::new(builder.build().await?);

    let shutdown = CancellationToken::new();
    let app = http::router(Arc::clone(&svc), shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(name = %config.name, addr = %config.addr, "server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    shutdown.cancel();
    svc.close().await;
    tracing::info!("service shut down successfully");
    Ok(())
}

async fn shutdown_signal() {
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
        () = ctrl_c => {
            tracing::info!("received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("received SIGTERM signal");
        },
    }
}
