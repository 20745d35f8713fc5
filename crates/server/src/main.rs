mod config;
mod dispatcher;
mod error;
mod fanout;
mod inference_store;
mod rate_limiter;
mod session;
mod signaling;
mod store;
mod track;
mod upload;
mod watchdog;
mod web;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::dispatcher::{InferenceDispatcher, NoopDetector, NoopTimerOcr};
use crate::fanout::InferenceFanout;
use crate::inference_store::InferenceStore;
use crate::rate_limiter::{ConnectionLimiter, RateLimiter};
use crate::session::SessionRegistry;
use crate::signaling::SignalingDeps;
use crate::store::FrameStore;
use crate::upload::UploadDeps;
use crate::watchdog::WatchdogDeps;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::load_config()?;

    let frame_store = Arc::new(FrameStore::new());
    let sessions = Arc::new(SessionRegistry::with_max_sessions(
        config.session.max_viewers_per_session,
        config.session.max_sessions,
        config.timeouts.session_timeout,
    ));
    let inference_store = Arc::new(InferenceStore::new(config.timeouts.inference_ttl));
    let fanout = Arc::new(InferenceFanout::new(config.timeouts.inference_interval));

    // No detection or timer-OCR model is wired in by default; both
    // capabilities fall back to their no-op implementations so the pipeline
    // still runs end to end (frames stored, health reported) without one.
    let dispatcher = Arc::new(InferenceDispatcher::new(
        Arc::new(NoopDetector),
        Arc::new(NoopTimerOcr),
        config.inference.enable_timer_ocr,
        Arc::clone(&inference_store),
        Arc::clone(&fanout),
        config.timeouts.inference_interval,
    ));

    let connection_limiter = Arc::new(ConnectionLimiter::new(config.rate_limit.max_connections_per_ip));
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.window,
        config.rate_limit.max_messages_per_connection,
    ));

    let state = Arc::new(AppState {
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
            connection_limiter: Arc::clone(&connection_limiter),
        },
        dropped: RwLock::new(HashMap::new()),
        rate_limiter,
        started_at: Instant::now(),
        frame_store: Arc::clone(&frame_store),
        sessions: Arc::clone(&sessions),
        inference_store: Arc::clone(&inference_store),
        fanout: Arc::clone(&fanout),
        dispatcher,
        config: config.clone(),
    });

    let watchdog_deps = WatchdogDeps {
        frame_store,
        sessions,
        inference_store,
        fanout,
        frame_timeout: config.timeouts.frame_timeout,
    };
    tokio::spawn(watchdog::run(watchdog_deps, config.timeouts.watchdog_interval));

    let app = web::build_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT combination")?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("crcoach server listening on http://{bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    tracing::info!("crcoach server shut down; no state is persisted across restarts");

    Ok(())
}

/// Waits for ctrl_c or SIGTERM. There is nothing to persist on the way out
/// (§6: "no persisted state; process restart loses all sessions"), so this
/// is a plain signal wait rather than a save-and-exit sequence.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
