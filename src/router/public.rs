//! Unauthenticated health probe with per-phase server counts

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::ephemeral::ServerRegistry;
use crate::ephemeral::outcome::ServerState;

#[derive(Serialize, Default)]
struct ServerCounts {
    accepting: usize,
    draining: usize,
    finished: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    servers: ServerCounts,
}

pub fn public_router(registry: Arc<ServerRegistry>) -> Router {
    Router::new()
        .route("/api/v1/public/ping", get(health))
        .with_state(registry)
}

async fn health(State(registry): State<Arc<ServerRegistry>>) -> Json<HealthResponse> {
    let mut servers = ServerCounts::default();
    for status in registry.list() {
        match status.state {
            ServerState::Accepting => servers.accepting += 1,
            ServerState::Draining | ServerState::Terminating => servers.draining += 1,
            ServerState::Done { .. } => servers.finished += 1,
        }
    }

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        servers,
    })
}
