mod api;
mod config;
mod dedup;
mod engine;
mod error;
mod presence;
mod protocol;
mod router;
mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tandem_common::protocol::ws::Envelope;
use tandem_common::types::PresenceUpdate;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::config::HubConfig;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(HubConfig::from_env());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    let (ws_state, api_state) = build_states(Arc::clone(&config));
    let app = build_router(ws_state.clone(), api_state);
    spawn_maintenance(ws_state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind hub listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting tandem hub");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("hub server exited unexpectedly")
}

fn build_states(config: Arc<HubConfig>) -> (ws::WsState, api::ApiState) {
    let engine = engine::CollabEngine::new().with_history_horizon(config.history_horizon);
    let presence = presence::PresenceStore::new().with_liveness_ms(config.presence_liveness_ms);
    let events = router::EventRouter::new()
        .with_history_cap(config.event_history_cap)
        .with_typing_ttl(config.typing_ttl());
    let dedup = dedup::DedupStore::new().with_ttl(config.dedup_ttl());
    let registry = ws::SessionRegistry::default();

    let ws_state = ws::WsState {
        config: Arc::clone(&config),
        engine: engine.clone(),
        presence: presence.clone(),
        events: events.clone(),
        registry,
        dedup,
    };
    let api_state = api::ApiState { config, engine, presence, events };

    (ws_state, api_state)
}

fn build_router(ws_state: ws::WsState, api_state: api::ApiState) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(ws_state))
            .merge(api::router(api_state)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Periodic hygiene: expired dedup acks, stale typing signals, and presence
/// entries past the liveness window (broadcast offline to their room).
fn spawn_maintenance(state: ws::WsState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tick.tick().await;
            run_maintenance(&state).await;
        }
    });
}

async fn run_maintenance(state: &ws::WsState) {
    let evicted_acks = state.dedup.evict_expired().await;
    let expired_typing = state.events.evict_expired_typing().await;

    let swept = state.presence.sweep_stale().await;
    let swept_count = swept.len();
    for entry in swept {
        let Some(room) = entry.current_room.clone() else {
            continue;
        };
        let frame = Envelope::presence(PresenceUpdate::from(entry));
        state.registry.broadcast_to_room(&room, &frame).await;
    }

    let sessions = state.registry.session_count().await;
    debug!(evicted_acks, expired_typing, swept = swept_count, sessions, "maintenance pass");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
