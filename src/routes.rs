use axum::{
    debug_handler,
    extract::{Query, State},
    http::Method,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::{registry::ConnectionRecord, store::Message, ws, AppResult, AppState};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/ws", get(ws::chat_ws))
        .route("/messages", get(recent_messages))
        .route("/presence", get(presence))
        .with_state(state)
        .layer(cors)
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<u32>,
}

#[debug_handler]
pub(crate) async fn recent_messages(
    State(state): State<AppState>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let limit = limit.unwrap_or(state.config.history_limit);
    Ok(Json(state.log.recent_messages(limit).await?))
}

#[debug_handler]
pub(crate) async fn presence(State(state): State<AppState>) -> Json<Vec<ConnectionRecord>> {
    Json(state.registry.snapshot())
}
