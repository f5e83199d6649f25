pub mod webhook;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

/// Build the gateway router: a health probe plus the two webhook
/// endpoints the chat platform delivers to.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/webhook/event", post(webhook::event))
        .route("/webhook/card", post(webhook::card))
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}
