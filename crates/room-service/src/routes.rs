//! HTTP routes for the room service.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::negotiation::Negotiator;
use crate::observability::{health_router, HealthState};
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Front door to the room actor and the media engine.
    pub negotiator: Negotiator,

    /// Service configuration.
    pub config: Config,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health`, `/ready` - Probes
/// - `/metrics` - Prometheus metrics endpoint
/// - `/room` - Signaling WebSocket
/// - `/peers` - Room snapshot
/// - `/capabilities`, `/rtp_capabilities` - Engine capability descriptor
/// - `/create_transport`, `/transport_connect`, `/transport_produce`,
///   `/transport_consume` - Negotiation
/// - `/control`, `/control_producer`, `/control_consumer` - Pause/resume/close
/// - CORS for the configured origins
/// - TraceLayer for request logging
/// - Request timeout from configuration
pub fn build_routes(
    state: Arc<AppState>,
    health: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    let request_timeout = state.config.request_timeout;

    let room_routes = Router::new()
        .route("/room", get(handlers::room_socket))
        .route("/peers", get(handlers::list_peers))
        .route("/capabilities", get(handlers::capabilities))
        .route("/rtp_capabilities", get(handlers::capabilities))
        .route("/create_transport", post(handlers::create_transport))
        .route("/transport_connect", post(handlers::transport_connect))
        .route("/transport_produce", post(handlers::transport_produce))
        .route("/transport_consume", post(handlers::transport_consume))
        .route("/control", post(handlers::control))
        .route("/control_producer", post(handlers::control_producer))
        .route("/control_consumer", post(handlers::control_consumer))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer (innermost)
    // 2. TraceLayer
    // 3. CorsLayer
    // 4. http_metrics_middleware (outermost)
    room_routes
        .merge(health_router(health))
        .merge(metrics_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(middleware::from_fn(http_metrics_middleware))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    target: "room.service",
                    origin = %origin,
                    error = %e,
                    "Ignoring invalid CORS origin"
                );
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RoomActor};
    use crate::engine::{LoopbackEngine, MediaEngine};
    use crate::observability::detached_metrics_handle;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app() -> Router {
        let (room, _task) = RoomActor::spawn(16, CancellationToken::new(), ActorMetrics::new());
        let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::default());
        let state = Arc::new(AppState {
            negotiator: Negotiator::new(room, engine),
            config: Config::default(),
        });
        build_routes(
            state,
            Arc::new(HealthState::new()),
            detached_metrics_handle().unwrap(),
        )
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[tokio::test]
    async fn test_capabilities_and_alias_agree() {
        let app = app();
        let (status, caps) = get_json(app.clone(), "/capabilities").await;
        assert_eq!(status, StatusCode::OK);
        assert!(caps["codecs"].is_array());

        let (status, alias) = get_json(app, "/rtp_capabilities").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(caps, alias);
    }

    #[tokio::test]
    async fn test_empty_room_snapshot() {
        let (status, peers) = get_json(app(), "/peers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(peers, json!([]));
    }

    #[tokio::test]
    async fn test_create_transport_unknown_peer_is_404() {
        let (status, body) = post_json(
            app(),
            "/create_transport",
            json!({"socketId": "ghost", "direction": "send"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_create_transport_without_direction_is_400() {
        let (status, body) =
            post_json(app(), "/create_transport", json!({"socketId": "ghost"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_malformed_body_is_400_envelope() {
        let (status, body) =
            post_json(app(), "/transport_produce", json!({"socketId": 7})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_control_unknown_action_is_400_before_lookup() {
        let (status, body) = post_json(
            app(),
            "/control",
            json!({
                "socketId": "ghost",
                "entityKind": "producer",
                "entityId": "p1",
                "action": "explode"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_legacy_control_routes_are_wired() {
        let (status, _) = post_json(
            app(),
            "/control_consumer",
            json!({"socketId": "ghost", "consumerId": "c1", "action": "resume"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_routes_merged() {
        let (status, _) = get_json(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_json(app(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/peers")
            .header(header::ORIGIN, "http://localhost:3000")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://localhost:3000"
        );
    }
}
