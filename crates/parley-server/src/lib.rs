pub mod config;

use std::path::Path;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use parley_gateway::Gateway;
use parley_types::api::HealthResponse;

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// All HTTP routes: the WebSocket gateway, finalized uploads and a health check.
pub fn build_router(gateway: Gateway, upload_dir: &Path) -> Router {
    let api = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(gateway);

    Router::new()
        .merge(api)
        .nest_service("/uploads", ServeDir::new(upload_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.token.filter(|t| !t.is_empty());
    ws.on_upgrade(move |socket| parley_gateway::handle_socket(socket, gateway, token))
}

async fn health(State(gateway): State<Gateway>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: gateway.connection_count(),
    })
}
