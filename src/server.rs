//! HTTP serving surface
//!
//! - `GET /download/:hash` serves an object through the `ObjectCache`
//! - `GET /measure/:size` streams `size` MiB of zeros for bandwidth measurement
//! - `GET /api/status` reports session state, sync progress and cache stats
//! - `GET /health`

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::cache::{CacheStats, ObjectCache};
use crate::counters::{Counters, ServeCounters};
use crate::coordinator::CURRENT_VERSION;
use crate::download::progress::{ProgressSnapshot, SyncProgress};
use crate::error::NodeError;
use crate::session::SessionState;

/// Largest accepted measurement, in MiB
pub const MAX_MEASURE_MIB: u32 = 200;

static ZERO_MIB: [u8; 1024 * 1024] = [0; 1024 * 1024];

pub struct ServerState {
    pub cache: Arc<ObjectCache>,
    pub counters: Arc<ServeCounters>,
    pub progress: Arc<SyncProgress>,
    pub session: watch::Receiver<SessionState>,
    pub started_at: Instant,
}

pub type SharedState = Arc<ServerState>;

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/download/:hash", get(download))
        .route("/measure/:size", get(measure))
        .route("/api/status", get(status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn download(State(state): State<SharedState>, Path(hash): Path<String>) -> Response {
    match state.cache.get(&hash).await {
        Ok(data) => {
            state.counters.record(data.len() as u64);
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                data,
            )
                .into_response()
        }
        Err(NodeError::NotFound(_)) => {
            debug!(hash = %hash, "Requested object not present");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            error!(hash = %hash, error = %e, "Failed to serve object");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn measure(Path(size): Path<u32>) -> Response {
    if size > MAX_MEASURE_MIB {
        return (
            StatusCode::BAD_REQUEST,
            format!("size must be at most {} MiB", MAX_MEASURE_MIB),
        )
            .into_response();
    }
    let chunks = futures::stream::iter(
        (0..size).map(|_| Ok::<_, std::io::Error>(Bytes::from_static(&ZERO_MIB))),
    );
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub session: SessionState,
    pub sync: ProgressSnapshot,
    pub cache: CacheStats,
    pub served_hits: u64,
    pub served_bytes: u64,
}

async fn status(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: CURRENT_VERSION.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        session: *state.session.borrow(),
        sync: state.progress.snapshot(),
        cache: state.cache.stats(),
        served_hits: state.counters.current_hit_count(),
        served_bytes: state.counters.current_byte_count(),
    })
}

async fn health() -> impl IntoResponse {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::ContentStore;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn state(dir: &TempDir) -> (SharedState, Arc<ContentStore>) {
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let (_tx, rx) = watch::channel(SessionState::Active);
        let state = Arc::new(ServerState {
            cache: Arc::new(ObjectCache::new(Arc::clone(&store), &CacheConfig::default())),
            counters: Arc::new(ServeCounters::new()),
            progress: Arc::new(SyncProgress::default()),
            session: rx,
            started_at: Instant::now(),
        });
        (state, store)
    }

    #[tokio::test]
    async fn test_download_counts_served_bytes() {
        let dir = TempDir::new().unwrap();
        let (state, store) = state(&dir).await;
        store
            .write("900150983cd24fb0d6963f7d28e17f72", b"abc")
            .await
            .unwrap();

        let response = create_router(Arc::clone(&state))
            .oneshot(
                Request::get("/download/900150983cd24fb0d6963f7d28e17f72")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"abc");
        assert_eq!(state.counters.current_hit_count(), 1);
        assert_eq!(state.counters.current_byte_count(), 3);
    }

    #[tokio::test]
    async fn test_download_missing_is_404() {
        let dir = TempDir::new().unwrap();
        let (state, _store) = state(&dir).await;
        let response = create_router(state)
            .oneshot(
                Request::get("/download/d41d8cd98f00b204e9800998ecf8427e")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_measure_streams_zeros() {
        let dir = TempDir::new().unwrap();
        let (state, _store) = state(&dir).await;
        let response = create_router(state)
            .oneshot(Request::get("/measure/2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 2 * 1024 * 1024);
        assert!(body.iter().all(|b| *b == 0));
    }
}
