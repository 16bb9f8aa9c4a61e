//! `/create?amount=<text>` provisions a payment server and returns the
//! command the payer should run.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::ephemeral::ServerRegistry;

#[derive(Clone)]
pub struct CreateState {
    pub registry: Arc<ServerRegistry>,
}

#[derive(Deserialize)]
struct CreateQuery {
    amount: Option<String>,
}

pub fn create_router(registry: Arc<ServerRegistry>) -> Router {
    let state = CreateState { registry };

    Router::new()
        .route("/create", any(create))
        .with_state(state)
}

async fn create(
    State(state): State<CreateState>,
    Query(query): Query<CreateQuery>,
) -> Response {
    let amount = match query.amount {
        Some(amount) if !amount.is_empty() => amount,
        _ => return (StatusCode::BAD_REQUEST, "missing amount\n").into_response(),
    };

    match state.registry.create(&amount).await {
        Ok(descriptor) => {
            (StatusCode::OK, format!("{}\r\n", descriptor.connection_string)).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to create payment server: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to create payment server: {}\n", e),
            ).into_response()
        }
    }
}
