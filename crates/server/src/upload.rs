//! `UploadEndpoint` (§4.3): `POST /upload/{code}` — validates and stores one
//! JPEG frame, then opportunistically kicks off one inference pass.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use crcoach_protocol::{Quality, SessionCode, UploadResponse};

use crate::dispatcher::{DispatchOutcome, InferenceDispatcher};
use crate::error::AppError;
use crate::session::SessionRegistry;
use crate::store::FrameStore;

pub struct UploadDeps {
    pub frame_store: Arc<FrameStore>,
    pub sessions: Arc<SessionRegistry>,
    pub dispatcher: Arc<InferenceDispatcher>,
}

/// Increments the right dropped-frame counter for `/api/stream-stats`.
pub struct DroppedFrameCounters {
    pub locked: std::sync::atomic::AtomicU64,
    pub throttled: std::sync::atomic::AtomicU64,
}

impl Default for DroppedFrameCounters {
    fn default() -> Self {
        Self {
            locked: std::sync::atomic::AtomicU64::new(0),
            throttled: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

pub async fn handle_upload(
    deps: &UploadDeps,
    dropped: &DroppedFrameCounters,
    code: SessionCode,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<UploadResponse, AppError> {
    if body.len() < 2 || body[0] != 0xFF || body[1] != 0xD8 {
        return Err(AppError::InvalidPayload("JPEG SOI marker missing".to_string()));
    }

    let quality = Quality::from_header(
        headers
            .get("X-Quality-Level")
            .and_then(|v| v.to_str().ok()),
    );

    let start = std::time::Instant::now();
    let jpeg = bytes::Bytes::copy_from_slice(&body);

    deps.frame_store
        .save(&code, jpeg.clone(), quality)
        .await
        .map_err(|err| AppError::InvalidPayload(err.to_string()))?;
    deps.sessions.get_or_create_touch(&code).await?;

    match deps.dispatcher.clone().try_dispatch(code, jpeg).await {
        DispatchOutcome::Dispatched => {}
        DispatchOutcome::SkippedLocked => {
            dropped.locked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        DispatchOutcome::SkippedThrottled => {
            dropped
                .throttled
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    Ok(UploadResponse::Ok {
        processed_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}

/// axum handler glue. Extraction of the raw body can itself fail on client
/// disconnect mid-read; taking `Result<Bytes, BytesRejection>` instead of a
/// bare `Bytes` surfaces that failure to us instead of letting axum's default
/// rejection handling swallow it, so that branch returns the benign
/// `client_disconnected` status instead of propagating an error (§4.3, §7).
pub async fn upload_handler(
    State(state): State<Arc<crate::web::AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<axum::Json<UploadResponse>, AppError> {
    let code = SessionCode::parse(&code).map_err(|err| AppError::InvalidPayload(err.to_string()))?;
    if !state.rate_limiter.is_allowed(code.as_str()).await {
        return Err(AppError::RateLimited);
    }
    let body = match body {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(%err, "client disconnected mid-upload");
            return Ok(axum::Json(UploadResponse::ClientDisconnected));
        }
    };
    let dropped = state.dropped_counters_for(&code).await;
    let response = handle_upload(&state.upload, &dropped, code, &headers, body).await?;
    Ok(axum::Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{NoopDetector, NoopTimerOcr};
    use crate::fanout::InferenceFanout;
    use crate::inference_store::InferenceStore;
    use std::time::Duration;

    fn deps() -> UploadDeps {
        UploadDeps {
            frame_store: Arc::new(FrameStore::new()),
            sessions: Arc::new(SessionRegistry::new(10, Duration::from_secs(60))),
            dispatcher: Arc::new(InferenceDispatcher::new(
                Arc::new(NoopDetector),
                Arc::new(NoopTimerOcr),
                false,
                Arc::new(InferenceStore::new(Duration::from_secs(60))),
                Arc::new(InferenceFanout::new(Duration::from_millis(100))),
                Duration::from_millis(10),
            )),
        }
    }

    #[tokio::test]
    async fn rejects_payload_missing_soi() {
        let deps = deps();
        let dropped = DroppedFrameCounters::default();
        let err = handle_upload(
            &deps,
            &dropped,
            SessionCode::parse("1234").unwrap(),
            &HeaderMap::new(),
            Bytes::from_static(b"not a jpeg"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn accepts_valid_jpeg_and_stores_it() {
        let deps = deps();
        let dropped = DroppedFrameCounters::default();
        let code = SessionCode::parse("1234").unwrap();
        let response = handle_upload(
            &deps,
            &dropped,
            code.clone(),
            &HeaderMap::new(),
            Bytes::from_static(&[0xFF, 0xD8, 1, 2, 3]),
        )
        .await
        .unwrap();
        assert!(matches!(response, UploadResponse::Ok { .. }));
        assert!(deps.frame_store.contains(&code).await);
    }

    #[tokio::test]
    async fn second_upload_within_interval_increments_throttled_counter() {
        let deps = deps();
        let dropped = DroppedFrameCounters::default();
        let code = SessionCode::parse("1234").unwrap();
        for _ in 0..2 {
            handle_upload(
                &deps,
                &dropped,
                code.clone(),
                &HeaderMap::new(),
                Bytes::from_static(&[0xFF, 0xD8, 1]),
            )
            .await
            .unwrap();
        }
        assert_eq!(dropped.throttled.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
