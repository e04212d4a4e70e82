// HTTP request handlers
use crate::infrastructure::chunked_json::stream_from_receiver;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

const CHANGE_STREAM_BUFFER: usize = 64;

#[derive(Deserialize)]
pub struct WindowQuery {
    pub window_seconds: Option<i64>,
}

/// One batch of changed entity ids, as sent on `/changes`
#[derive(Debug, Clone, Serialize)]
pub struct ChangeBatch {
    pub changed: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

async fn respond<T: Serialize>(status: StatusCode, data: &T, headers: &HeaderMap) -> Response {
    match json_response(status, data, accepts_brotli(headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// List tracked entity ids
pub async fn list_entities(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let ids = state.manager.list_ids();
    respond(StatusCode::OK, &json!({ "entities": ids }), &headers).await
}

/// Latest snapshot for one entity
pub async fn get_entity(
    Path(id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.manager.get_entity(&id) {
        Some(snapshot) => respond(StatusCode::OK, &snapshot, &headers).await,
        None => {
            let body = json!({ "error": format!("entity `{}` is not tracked", id) });
            respond(StatusCode::NOT_FOUND, &body, &headers).await
        }
    }
}

/// Introspection of every data source
pub async fn list_sources(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let sources = state.manager.introspect();
    respond(StatusCode::OK, &sources, &headers).await
}

/// Buffered samples for one source, optionally limited to a trailing window
pub async fn source_samples(
    Path(name): Path<String>,
    Query(query): Query<WindowQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(source) = state.manager.source(&name) else {
        let body = json!({ "error": format!("unknown source `{}`", name) });
        return respond(StatusCode::NOT_FOUND, &body, &headers).await;
    };

    match query.window_seconds {
        Some(seconds) => {
            let samples = source.slice_since(seconds.saturating_mul(1_000));
            let body = json!({ "entity_id": source.entity_id(), "samples": samples });
            respond(StatusCode::OK, &body, &headers).await
        }
        None => respond(StatusCode::OK, &source.get_current_data(), &headers).await,
    }
}

/// Stream entity-change batches until the client disconnects
pub async fn stream_changes(headers: HeaderMap, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel(CHANGE_STREAM_BUFFER);

    let sender = tx.clone();
    let mut subscription = state.manager.add_entity_change_listener(move |ids| {
        let batch = ChangeBatch {
            changed: ids.to_vec(),
            at: Utc::now(),
        };
        if sender.try_send(batch).is_err() {
            tracing::debug!("Change stream client lagging or gone, dropping batch");
        }
    });

    // Unregister the listener once the client goes away.
    tokio::spawn(async move {
        tx.closed().await;
        subscription.unsubscribe();
        tracing::debug!("Change stream client disconnected");
    });

    stream_from_receiver(rx, accepts_brotli(&headers)).await
}
