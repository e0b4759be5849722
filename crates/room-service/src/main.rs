//! Room Service
//!
//! Signaling server for one multi-party media room: tracks peers and their
//! streams, announces changes over a WebSocket and brokers negotiation with
//! the media engine over HTTP.

use room_service::actors::{ActorMetrics, RoomActor};
use room_service::config::Config;
use room_service::engine::{LoopbackEngine, MediaEngine};
use room_service::negotiation::Negotiator;
use room_service::observability::{init_metrics_recorder, HealthState};
use room_service::routes::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        listen_ips = ?config.listen_ips,
        event_channel_capacity = config.event_channel_capacity,
        "Configuration loaded successfully"
    );

    // Install the Prometheus recorder before anything records
    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        e
    })?;

    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::new(config.listen_ips.clone()));

    // Spawn the room actor
    let root_token = CancellationToken::new();
    let (room, room_task) = RoomActor::spawn(
        config.event_channel_capacity,
        root_token.child_token(),
        ActorMetrics::new(),
    );

    let health = Arc::new(HealthState::new());
    let drain_period = config.drain_period;
    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let negotiator = Negotiator::new(room, engine);
    let state = Arc::new(AppState {
        negotiator: negotiator.clone(),
        config,
    });
    let app = routes::build_routes(state, Arc::clone(&health), metrics_handle);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    health.set_ready();
    info!("Room Service listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&health), negotiator, drain_period))
        .await?;

    root_token.cancel();
    match tokio::time::timeout(Duration::from_secs(5), room_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Room actor task failed: {}", e),
        Err(_) => warn!("Room actor shutdown timed out"),
    }

    info!("Room Service shutdown complete");

    Ok(())
}

/// Resolves with the name of the first termination signal received.
async fn termination_signal() -> &'static str {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("SIGINT handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}

/// Stops admitting peers, retires every peer and releases what it owned in
/// the engine, then holds the listener open for the drain period.
async fn shutdown_signal(health: Arc<HealthState>, negotiator: Negotiator, drain_period: Duration) {
    let signal_name = termination_signal().await;
    info!(signal = signal_name, "Shutting down room");

    health.set_not_ready();
    match negotiator.shutdown().await {
        Ok(peers) => info!(peers, "Room peers released"),
        Err(e) => {
            error!("Room shutdown failed: {}", e);
            negotiator.room().cancel();
        }
    }

    if !drain_period.is_zero() {
        warn!(drain_secs = drain_period.as_secs(), "Draining in-flight negotiations");
        tokio::time::sleep(drain_period).await;
    }
}
