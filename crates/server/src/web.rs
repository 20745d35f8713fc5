//! Router assembly and the small HTTP handlers that don't warrant their own
//! module (§6). `AppState` wires every component together; the heavier
//! handlers (`/upload`, `/offer`, `/inference/ws`) live in their own modules
//! and take thin slices of this state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use crcoach_protocol::{
    CrcoachConfig, DroppedFrameStats, HealthResponse, IceConfigResponse, IceServerInfo,
    InferenceHealth, OfferRequest, OfferResponse, SessionCode, StreamInferenceSummary,
    StreamStatsResponse,
};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use crate::dispatcher::InferenceDispatcher;
use crate::error::AppError;
use crate::fanout::InferenceFanout;
use crate::inference_store::InferenceStore;
use crate::rate_limiter::RateLimiter;
use crate::session::SessionRegistry;
use crate::signaling::{self, SignalingDeps};
use crate::store::FrameStore;
use crate::upload::{self, DroppedFrameCounters, UploadDeps};

/// Request body cap for `/upload/{code}`: a handful of megabytes, generous
/// for a single compressed frame while bounding worst-case memory.
const MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

pub struct AppState {
    pub config: CrcoachConfig,
    pub frame_store: Arc<FrameStore>,
    pub sessions: Arc<SessionRegistry>,
    pub inference_store: Arc<InferenceStore>,
    pub fanout: Arc<InferenceFanout>,
    pub dispatcher: Arc<InferenceDispatcher>,
    pub upload: UploadDeps,
    pub signaling: SignalingDeps,
    pub dropped: RwLock<HashMap<SessionCode, Arc<DroppedFrameCounters>>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub async fn dropped_counters_for(&self, code: &SessionCode) -> Arc<DroppedFrameCounters> {
        if let Some(counters) = self.dropped.read().await.get(code) {
            return Arc::clone(counters);
        }
        let mut dropped = self.dropped.write().await;
        Arc::clone(
            dropped
                .entry(code.clone())
                .or_insert_with(|| Arc::new(DroppedFrameCounters::default())),
        )
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/upload/{code}", post(upload::upload_handler))
        .route("/offer", post(offer_handler))
        .route("/inference/{code}", get(get_inference))
        .route("/inference/active/sessions", get(active_sessions))
        .route("/inference/ws/{code}", get(inference_ws_handler))
        .route("/health", get(health_check))
        .route("/api/stream-stats/{code}", get(stream_stats))
        .route("/api/ice-config", get(ice_config))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn offer_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<OfferRequest>,
) -> Result<Json<OfferResponse>, AppError> {
    let code = SessionCode::parse(&req.code).map_err(|err| AppError::InvalidPayload(err.to_string()))?;
    let (sdp, sdp_type) =
        signaling::handle_offer(&state.signaling, code, req.sdp, req.sdp_type, addr.ip()).await?;
    Ok(Json(OfferResponse { sdp, sdp_type }))
}

async fn get_inference(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let code = SessionCode::parse(&code).map_err(|err| AppError::InvalidPayload(err.to_string()))?;
    state
        .inference_store
        .get(&code)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no inference result yet".to_string()))
}

async fn active_sessions(
    State(state): State<Arc<AppState>>,
) -> Json<crcoach_protocol::ActiveSessionsResponse> {
    let active_sessions: Vec<String> = state
        .inference_store
        .list_active()
        .await
        .into_iter()
        .map(|code| code.to_string())
        .collect();
    Json(crcoach_protocol::ActiveSessionsResponse {
        count: active_sessions.len(),
        active_sessions,
    })
}

async fn inference_ws_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let code = SessionCode::parse(&code).map_err(|err| AppError::InvalidPayload(err.to_string()))?;
    Ok(ws.on_upgrade(move |socket| async move {
        state.fanout.run_subscriber(socket, code).await;
    }))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.sessions.active_codes().await.len(),
        inference: InferenceHealth {
            active_results: state.inference_store.count_active().await,
            dispatch_independent_of_subscribers: true,
            timer_ocr_enabled: state.config.inference.enable_timer_ocr,
            error_count: state.dispatcher.error_count(),
        },
    })
}

async fn stream_stats(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<StreamStatsResponse>, AppError> {
    let code = SessionCode::parse(&code).map_err(|err| AppError::InvalidPayload(err.to_string()))?;

    let last_upload_secs_ago = state
        .frame_store
        .age(&code)
        .await
        .map(|age| age.as_secs());

    let dropped = state.dropped_counters_for(&code).await;
    let locked = dropped.locked.load(Ordering::Relaxed);
    let throttled = dropped.throttled.load(Ordering::Relaxed);
    let dropped_frames = DroppedFrameStats {
        count: locked + throttled,
        last_reason: match (locked, throttled) {
            (0, 0) => None,
            (_, t) if t > 0 => Some("throttled"),
            _ => Some("locked"),
        },
        locked,
        throttled,
    };

    let inference = state.inference_store.get(&code).await.map(|result| StreamInferenceSummary {
        available: true,
        detections: result.detections.len(),
        last_inference_time_ms: result.inference_time_ms,
        success: true,
    });

    Ok(Json(StreamStatsResponse {
        code: code.to_string(),
        active: last_upload_secs_ago.is_some(),
        last_upload_secs_ago,
        dropped_frames,
        inference,
    }))
}

/// Mirrors the ICE configuration baked into `/offer`'s own peer connections
/// (§6), for browser clients that want to build a diagnostic `RTCPeerConnection`.
async fn ice_config(State(state): State<Arc<AppState>>) -> Json<IceConfigResponse> {
    Json(IceConfigResponse {
        ice_servers: vec![IceServerInfo {
            urls: state.config.ice.stun_urls.clone(),
        }],
        bundle_policy: "max-bundle",
        rtcp_mux_policy: "require",
        sdp_semantics: "unified-plan",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{NoopDetector, NoopTimerOcr};
    use crate::rate_limiter::ConnectionLimiter;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn build_state() -> Arc<AppState> {
        let config = CrcoachConfig::default();
        let frame_store = Arc::new(FrameStore::new());
        let sessions = Arc::new(SessionRegistry::new(
            config.session.max_viewers_per_session,
            config.timeouts.session_timeout,
        ));
        let inference_store = Arc::new(InferenceStore::new(config.timeouts.inference_ttl));
        let fanout = Arc::new(InferenceFanout::new(config.timeouts.inference_interval));
        let dispatcher = Arc::new(InferenceDispatcher::new(
            Arc::new(NoopDetector),
            Arc::new(NoopTimerOcr),
            config.inference.enable_timer_ocr,
            Arc::clone(&inference_store),
            Arc::clone(&fanout),
            config.timeouts.inference_interval,
        ));
        Arc::new(AppState {
            upload: UploadDeps {
                frame_store: Arc::clone(&frame_store),
                sessions: Arc::clone(&sessions),
                dispatcher: Arc::clone(&dispatcher),
            },
            signaling: SignalingDeps {
                frame_store: Arc::clone(&frame_store),
                sessions: Arc::clone(&sessions),
                video: config.video.clone(),
                timeouts: config.timeouts.clone(),
                ice: config.ice.clone(),
                connection_limiter: Arc::new(ConnectionLimiter::new(
                    config.rate_limit.max_connections_per_ip,
                )),
            },
            frame_store,
            sessions,
            inference_store,
            fanout,
            dispatcher,
            dropped: RwLock::new(HashMap::new()),
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit.window,
                config.rate_limit.max_messages_per_connection,
            )),
            started_at: Instant::now(),
            config,
        })
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_router(build_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn offer_without_broadcast_is_404() {
        let app = build_router(build_state())
            .layer(axum::extract::connect_info::MockConnectInfo(client_addr()));
        let body = serde_json::json!({"code": "1234", "sdp": "v=0", "type": "offer"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/offer")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_then_inference_is_absent_without_a_result_yet() {
        let app = build_router(build_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload/1234")
                    .header("X-Quality-Level", "low")
                    .body(Body::from(vec![0xFF, 0xD8, 1, 2, 3]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ice_config_reports_defaults() {
        let app = build_router(build_state());
        let response = app
            .oneshot(Request::builder().uri("/api/ice-config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_stats_reports_inactive_for_unknown_code() {
        let app = build_router(build_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream-stats/9999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
