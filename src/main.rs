use anyhow::Context as _;
use energy_meter_gateway::server::{self, AppState};
use energy_meter_gateway::{Acquisition, AppConfig, BroadcastHub, ModbusTransport, SqliteSink};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("energy_meter_gateway=info")),
        )
        .init();

    info!("Starting energy meter gateway");
    let config = AppConfig::from_env().context("invalid configuration")?;
    config.log_summary();
    let registry = config.register_maps().context("invalid register maps")?;

    let sink = Arc::new(
        SqliteSink::open(&config.db_path)
            .await
            .with_context(|| format!("cannot open database {}", config.db_path.display()))?,
    );
    let hub = Arc::new(BroadcastHub::new());

    // HTTP comes up first so health and live subscribers work while the bus is still connecting
    let socket_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("cannot bind {socket_addr}"))?;

    let transport = ModbusTransport::new(config.endpoint.clone(), config.read_timeout);
    let acquisition = Acquisition::spawn(transport, registry, sink, hub.clone(), config.acquisition);

    let http_shutdown = CancellationToken::new();
    let state = AppState {
        hub,
        acquisition: acquisition.control(),
    };
    let mut http = tokio::spawn(server::serve(listener, state, http_shutdown.clone()));

    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        result = &mut http => Some(result),
    };

    acquisition.shutdown().await;
    http_shutdown.cancel();
    let result = match early_exit {
        Some(result) => {
            error!("HTTP server stopped unexpectedly");
            result
        }
        None => http.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    info!("Energy meter gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
