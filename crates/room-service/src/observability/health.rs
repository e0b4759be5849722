//! Liveness and readiness probes.
//!
//! The room moves through three phases: `Starting` until the listener is
//! bound, `Accepting` while peers may join, and `Draining` once shutdown
//! begins. `/ready` answers 200 only while accepting; `/health` answers 200
//! for as long as the process serves requests at all.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle phase reported by the probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Starting,
    Accepting,
    Draining,
}

impl RoomPhase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RoomPhase::Accepting,
            2 => RoomPhase::Draining,
            _ => RoomPhase::Starting,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            RoomPhase::Starting => 0,
            RoomPhase::Accepting => 1,
            RoomPhase::Draining => 2,
        }
    }
}

/// Shared probe state, flipped by `main` around the serve loop.
#[derive(Debug, Default)]
pub struct HealthState {
    phase: AtomicU8,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener bound; peers may join.
    pub fn set_ready(&self) {
        self.phase.store(RoomPhase::Accepting.as_u8(), Ordering::SeqCst);
    }

    /// Shutdown started. There is no way back to `Accepting`.
    pub fn set_not_ready(&self) {
        self.phase.store(RoomPhase::Draining.as_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn phase(&self) -> RoomPhase {
        RoomPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == RoomPhase::Accepting
    }
}

#[derive(Debug, Serialize)]
struct ProbeBody {
    phase: RoomPhase,
}

/// Router with `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness))
        .with_state(health_state)
}

async fn readiness(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<ProbeBody>) {
    let phase = state.phase();
    let status = if phase == RoomPhase::Accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ProbeBody { phase }))
}
