//! Test server harness for E2E testing
//!
//! Provides `TestRoomServer` for spawning real room service instances in tests.

use room_service::actors::{ActorMetrics, RoomActor, RoomActorHandle, RoomState};
use room_service::config::Config;
use room_service::engine::{EngineCounts, LoopbackEngine, MediaEngine};
use room_service::negotiation::Negotiator;
use room_service::observability::{detached_metrics_handle, HealthState};
use room_service::routes::{self, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning the room service in E2E tests.
///
/// Each instance has its own room actor, loopback engine and (detached)
/// metrics recorder, so tests can run in parallel in one process.
pub struct TestRoomServer {
    addr: SocketAddr,
    config: Config,
    engine: Arc<LoopbackEngine>,
    room: RoomActorHandle,
    negotiator: Negotiator,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestRoomServer {
    /// Spawn a server with default test configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with_vars(&[]).await
    }

    /// Spawn a server with extra `ROOM_*` variables layered over the test
    /// defaults (e.g. a tiny `ROOM_EVENT_CHANNEL_CAPACITY`).
    pub async fn spawn_with_vars(extra: &[(&str, &str)]) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([(
            "ROOM_BIND_ADDRESS".to_string(),
            "127.0.0.1:0".to_string(),
        )]);
        for (key, value) in extra {
            vars.insert((*key).to_string(), (*value).to_string());
        }

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let engine = Arc::new(LoopbackEngine::new(config.listen_ips.clone()));
        let cancel_token = CancellationToken::new();
        let (room, _room_task) = RoomActor::spawn(
            config.event_channel_capacity,
            cancel_token.child_token(),
            ActorMetrics::new(),
        );

        let health = Arc::new(HealthState::new());
        health.set_ready();
        let metrics_handle = detached_metrics_handle()
            .map_err(|e| anyhow::anyhow!("Failed to build metrics handle: {}", e))?;

        let negotiator = Negotiator::new(room.clone(), Arc::clone(&engine) as Arc<dyn MediaEngine>);
        let state = Arc::new(AppState {
            negotiator: negotiator.clone(),
            config: config.clone(),
        });

        // Build routes using room-service's real route builder
        let app = routes::build_routes(state, health, metrics_handle);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            engine,
            room,
            negotiator,
            cancel_token,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the signaling WebSocket URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/room", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Live engine entities, for leak assertions.
    pub async fn engine_counts(&self) -> EngineCounts {
        self.engine.counts().await
    }

    /// Whether the engine reports the producer or consumer as paused.
    pub async fn engine_paused(&self, entity_id: &str) -> Option<bool> {
        self.engine.is_paused(entity_id).await
    }

    /// Room actor counters.
    pub async fn room_state(&self) -> Result<RoomState, anyhow::Error> {
        self.room
            .get_state()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read room state: {}", e))
    }

    /// Run the server's graceful room shutdown. Returns the number of peers
    /// retired. The HTTP listener stays up until the harness is dropped.
    pub async fn shutdown(&self) -> Result<usize, anyhow::Error> {
        self.negotiator
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("Room shutdown failed: {}", e))
    }

    /// Poll until `check` holds for the room state, or time out.
    pub async fn wait_for_room(
        &self,
        check: impl Fn(&RoomState) -> bool,
    ) -> Result<RoomState, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let state = self.room_state().await?;
            if check(&state) {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("Room never reached expected state: {:?}", state);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Poll until `check` holds for the engine counts, or time out.
    ///
    /// Engine entities are released after the peer leaves the directory, so
    /// leak assertions must wait for the release to finish.
    pub async fn wait_for_engine(
        &self,
        check: impl Fn(&EngineCounts) -> bool,
    ) -> Result<EngineCounts, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let counts = self.engine_counts().await;
            if check(&counts) {
                return Ok(counts);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("Engine never reached expected counts: {:?}", counts);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestRoomServer {
    fn drop(&mut self) {
        // Close every signaling connection and stop the HTTP server
        self.cancel_token.cancel();
        self._handle.abort();
    }
}
