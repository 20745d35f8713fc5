//! Watchdog (§4.9): periodic sweep that tears down sessions whose broadcast
//! went stale or that sat idle and empty past `SessionTimeout`, and expires
//! old inference results.

use std::sync::Arc;
use std::time::Duration;

use crate::fanout::InferenceFanout;
use crate::inference_store::InferenceStore;
use crate::session::{CloseReason, SessionRegistry};
use crate::store::FrameStore;

pub struct WatchdogDeps {
    pub frame_store: Arc<FrameStore>,
    pub sessions: Arc<SessionRegistry>,
    pub inference_store: Arc<InferenceStore>,
    pub fanout: Arc<InferenceFanout>,
    pub frame_timeout: Duration,
}

/// Run the watchdog loop forever. Never returns; any per-tick failure is
/// logged and the loop continues after the next interval rather than
/// propagating out (§4.9's "watchdog never throws out of its loop").
pub async fn run(deps: WatchdogDeps, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        sweep_once(&deps).await;
    }
}

async fn sweep_once(deps: &WatchdogDeps) {
    let stale = deps.frame_store.stale_codes(deps.frame_timeout).await;
    for code in &stale {
        tracing::debug!(%code, "frame stale past timeout, tearing down session");
        deps.sessions.close_all(code, CloseReason::SessionTimedOut).await;
        deps.frame_store.delete(code).await;
    }

    // §4.9: a session that had a viewer and now has none (`Draining`) is
    // torn down on the very next tick, independent of frame freshness — a
    // broadcaster uploading to an empty code does not keep the session
    // alive. Already-removed sessions (FrameStore deleted above) are simply
    // absent from this sweep.
    for code in deps.sessions.sweep_draining().await {
        tracing::debug!(%code, "session draining with no viewers, tearing down");
        deps.frame_store.delete(&code).await;
    }

    let idle = deps.sessions.sweep().await;
    for code in idle {
        deps.frame_store.delete(&code).await;
    }

    let expired = deps.inference_store.sweep_expired().await;
    if expired > 0 {
        tracing::debug!(expired, "swept expired inference results");
    }

    deps.fanout.sweep().await;
}
