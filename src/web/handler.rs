//! Route handlers.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::status::Wait;
use super::{AppState, REQUEST_ID_HEADER};
use crate::model::Item;
use crate::queue::{AddOptions, PopOptions};

/// Prefix of the value echoed back when a request is accepted.
pub const ACK_PREFIX: &str = "[BACKEND - ACK]";

/// Weight given to requests submitted over HTTP.
pub const DEFAULT_WEIGHT: u64 = 1;

/// Longest a client poll is held open before the current state is returned.
pub const LONG_POLL: Duration = Duration::from_secs(60);

const SHUTTING_DOWN: &str = "server shutting down";

/// Body of `POST /{bucket}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Payload for the worker.
    #[serde(default)]
    pub data_from_frontend: String,
    /// `true` submits a new request; `false` cancels the one named by the
    /// `Request-Id` header.
    pub create_request: bool,
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
}

async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

/// `POST /{bucket}`: queue a new request, or cancel an existing one.
pub async fn create_request(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ClientRequest>,
) -> Json<Item> {
    if !req.create_request {
        let Some(id) = request_id(&headers) else {
            return Json(Item::failed(format!(
                "cancel requires a {REQUEST_ID_HEADER} header"
            )));
        };
        return match state.board.cancel(&id) {
            Some(item) => {
                info!(%bucket, request_id = %id, "request canceled");
                Json(item)
            }
            None => Json(Item::failed(format!("unknown request id {id:?}"))),
        };
    }

    let item = Item::new(&bucket, DEFAULT_WEIGHT, req.data_from_frontend)
        .with_request_id(Uuid::new_v4().to_string());

    let opts = AddOptions {
        ttl: state.default_ttl,
    };
    if let Err(e) = state.queue.add(&item, opts).await {
        warn!(%bucket, "failed to add request: {e}");
        let mut failed = item;
        failed.error = e.to_string();
        return Json(failed);
    }
    state.board.insert(item.clone());
    info!(
        %bucket,
        request_id = %item.request_id,
        key = %item.key,
        tracked = state.board.len(),
        "request queued"
    );

    let mut ack = item;
    ack.value = format!("{ACK_PREFIX} {}", ack.value);
    Json(ack)
}

/// `GET /{bucket}`: wait until the request named by the `Request-Id`
/// header is done, or [`LONG_POLL`] elapses.
pub async fn fetch_request(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Json<Item> {
    let Some(id) = request_id(&headers) else {
        return Json(Item::failed(format!("missing {REQUEST_ID_HEADER} header")));
    };

    let mut closing = state.closing.clone();
    let waited = tokio::select! {
        waited = state.board.wait_done(&id, LONG_POLL) => waited,
        _ = closed(&mut closing) => return Json(Item::failed(SHUTTING_DOWN)),
    };

    match waited {
        Wait::Done(item) => {
            info!(%bucket, request_id = %id, "request done");
            Json(item)
        }
        Wait::Pending(item) => Json(item),
        Wait::Unknown => Json(Item::failed(format!("unknown request id {id:?}"))),
    }
}

/// `GET /{bucket}/queue`: pop the next item, blocking until one exists.
pub async fn fetch_queue(State(state): State<AppState>, Path(bucket): Path<String>) -> Json<Item> {
    let watcher = state.queue.pop(&bucket, PopOptions::default()).await;

    let mut closing = state.closing.clone();
    tokio::select! {
        item = watcher => Json(item),
        _ = closed(&mut closing) => Json(Item::failed(SHUTTING_DOWN)),
    }
}

/// `POST /{bucket}/queue`: record a worker's result for its request.
pub async fn post_queue(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Json(item): Json<Item>,
) -> Json<Item> {
    if item.request_id.is_empty() {
        return Json(Item::failed("worker result has no request_id"));
    }
    if !state.board.update(item.clone()) {
        warn!(%bucket, request_id = %item.request_id, "result for unknown request");
        return Json(Item::failed(format!(
            "unknown request id {:?}",
            item.request_id
        )));
    }
    info!(
        %bucket,
        request_id = %item.request_id,
        progress = item.progress,
        "worker reported"
    );
    Json(item)
}
