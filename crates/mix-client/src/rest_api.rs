use crate::{metrics_text, Client, StatusReport};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct EnableRequest {
    enabled: bool,
}

pub fn router(client: Arc<Client>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/mix", post(mix))
        .route("/enabled", post(set_enabled))
        .route("/metrics", get(metrics))
        .with_state(client)
}

pub async fn status(State(client): State<Arc<Client>>) -> Json<StatusReport> {
    Json(client.status().await)
}

pub async fn mix(State(client): State<Arc<Client>>) -> Result<Json<StatusReport>, String> {
    client.mix_now().await.map(Json).map_err(|e| e.to_string())
}

pub async fn set_enabled(
    State(client): State<Arc<Client>>,
    Json(req): Json<EnableRequest>,
) -> Json<StatusReport> {
    Json(client.set_enabled(req.enabled).await)
}

pub async fn metrics() -> Result<String, String> {
    metrics_text().map_err(|e| e.to_string())
}
