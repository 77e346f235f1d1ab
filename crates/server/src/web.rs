use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tower_http::services::ServeDir;

use squawk_protocol::Config;

use crate::broadcast::Dispatcher;
use crate::capture::CaptureHub;
use crate::floor::FloorArbiter;
use crate::recordings::RecordingStore;
use crate::session::SessionRegistry;
use crate::signaling;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub arbiter: Arc<FloorArbiter>,
    pub dispatcher: Dispatcher,
    pub capture: Arc<CaptureHub>,
    pub recordings: RecordingStore,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let serve_dir = ServeDir::new(&state.config.web_root);

    Router::new()
        .route("/ws", get(member_ws_upgrade))
        .route("/ws/monitor", get(monitor_ws_upgrade))
        .route("/api/srt/list", get(srt_list))
        .route("/api/srt/get", get(srt_get))
        .route("/api/srt/save", post(srt_save))
        .route("/api/audio", get(audio))
        .with_state(state)
        .fallback_service(serve_dir)
}

async fn member_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| signaling::handle_member_ws(socket, state))
}

async fn monitor_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| signaling::handle_monitor_ws(socket, state))
}

#[derive(Deserialize)]
struct FileQuery {
    file: String,
}

#[derive(Deserialize)]
struct SaveRequest {
    file: String,
    content: String,
}

/// GET /api/srt/list — newest transcripts with their paired audio files.
async fn srt_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "files": state.recordings.list() }))
}

/// GET /api/srt/get?file= — one transcript parsed into segments.
async fn srt_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Response {
    match state.recordings.get(&query.file) {
        Ok(segments) => Json(json!({ "file": query.file, "segments": segments })).into_response(),
        Err(e) => {
            tracing::debug!(file = query.file, "Transcript fetch failed: {e:#}");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// POST /api/srt/save — overwrite a transcript, backing up the old version.
async fn srt_save(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveRequest>,
) -> Response {
    match state.recordings.save(&request.file, &request.content) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => {
            tracing::warn!(file = request.file, "Transcript save failed: {e:#}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Parse a single `bytes=a-b` range against a resource of `len` bytes.
///
/// Handles the three RFC 7233 single-range forms (`a-b`, `a-`, `-n`); an
/// over-long end is clamped to the last byte. Returns `None` when the range
/// is unsatisfiable.
fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (first, last) = spec.split_once('-')?;
    if len == 0 {
        return None;
    }

    if first.is_empty() {
        // Suffix form: the final n bytes
        let n: u64 = last.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((len.saturating_sub(n), len - 1));
    }

    let start: u64 = first.parse().ok()?;
    let end: u64 = if last.is_empty() {
        len - 1
    } else {
        last.parse::<u64>().ok()?.min(len - 1)
    };
    if start > end {
        return None;
    }
    Some((start, end))
}

/// GET /api/audio?file= — WAV bytes with HTTP Range support for scrubbing.
async fn audio(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Response {
    let path = match state.recordings.resolve_wav(&query.file) {
        Ok(path) => path,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Cannot open {}: {e}", query.file) })),
            )
                .into_response();
        }
    };
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, len));

    match range {
        // No Range header: the whole file
        None => match read_slice(&mut file, 0, len).await {
            Ok(body) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "audio/wav".to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                body,
            )
                .into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        },
        Some(Some((start, end))) => {
            match read_slice(&mut file, start, end - start + 1).await {
                Ok(body) => (
                    StatusCode::PARTIAL_CONTENT,
                    [
                        (header::CONTENT_TYPE, "audio/wav".to_string()),
                        (header::ACCEPT_RANGES, "bytes".to_string()),
                        (
                            header::CONTENT_RANGE,
                            format!("bytes {start}-{end}/{len}"),
                        ),
                    ],
                    body,
                )
                    .into_response(),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            }
        }
        Some(None) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{len}"))],
        )
            .into_response(),
    }
}

async fn read_slice(
    file: &mut tokio::fs::File,
    start: u64,
    count: u64,
) -> std::io::Result<Vec<u8>> {
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut body = Vec::with_capacity(count as usize);
    file.take(count).read_to_end(&mut body).await?;
    Ok(body)
}
