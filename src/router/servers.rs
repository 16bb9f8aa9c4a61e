use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::ephemeral::{ServerRegistry, ServerStatus};

#[derive(Clone)]
pub struct ServersState {
    pub registry: Arc<ServerRegistry>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct CancelResponse {
    id: String,
    message: String,
}

pub fn servers_router(registry: Arc<ServerRegistry>) -> Router {
    let state = ServersState { registry };

    Router::new()
        .route("/servers", get(list_servers))
        .route("/servers/:id", get(get_server).delete(cancel_server))
        .with_state(state)
}

async fn list_servers(State(state): State<ServersState>) -> Json<Vec<ServerStatus>> {
    Json(state.registry.list())
}

async fn get_server(
    State(state): State<ServersState>,
    Path(id): Path<String>,
) -> Result<Json<ServerStatus>, (StatusCode, Json<ErrorResponse>)> {
    match state.registry.get(&id) {
        Some(status) => Ok(Json(status)),
        None => Err(not_found(&id)),
    }
}

/// Stop accepting new sessions. Sessions already running are left alone.
async fn cancel_server(
    State(state): State<ServersState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), (StatusCode, Json<ErrorResponse>)> {
    if state.registry.cancel(&id) {
        Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                id,
                message: "Server is shutting down".to_string(),
            }),
        ))
    } else {
        Err(not_found(&id))
    }
}

fn not_found(id: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Server not found: {}", id),
        }),
    )
}
