//! `SignalingEndpoint` (§4.4): `POST /offer` — negotiates one WebRTC viewer
//! peer per call and wires it to a `FrameTrackProducer` for its code.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crcoach_protocol::{IceConfig, SessionCode, TimeoutConfig, VideoConfig};
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::AppError;
use crate::rate_limiter::ConnectionLimiter;
use crate::session::{PeerHandle, SessionRegistry};
use crate::store::FrameStore;
use crate::track::{self, FrameTrackProducer};

/// Number of 100ms polls of FrameStore before giving up with a 404 (§4.4 step 1).
const GRACE_POLL_ATTEMPTS: u32 = 10;
const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct SignalingDeps {
    pub frame_store: Arc<FrameStore>,
    pub sessions: Arc<SessionRegistry>,
    pub video: VideoConfig,
    pub timeouts: TimeoutConfig,
    pub ice: IceConfig,
    pub connection_limiter: Arc<ConnectionLimiter>,
}

/// Negotiate a new viewer peer for `code` against the offer `sdp`/`sdp_type`,
/// returning the local description to send back to the browser.
pub async fn handle_offer(
    deps: &SignalingDeps,
    code: SessionCode,
    sdp: String,
    _sdp_type: String,
    client_ip: IpAddr,
) -> Result<(String, String), AppError> {
    wait_for_broadcast(&deps.frame_store, &code).await?;

    let connection_guard = deps
        .connection_limiter
        .try_acquire(client_ip)
        .await
        .ok_or(AppError::RateLimited)?;

    let peer_connection = Arc::new(build_peer_connection(&deps.ice).await?);

    let peer_id = Uuid::new_v4();
    let (peer_handle, close_rx) = PeerHandle::new(peer_id);
    deps.sessions.attach_viewer(&code, peer_handle).await?;

    // From here on any failure must detach the viewer and close the
    // half-built peer before returning (§5: "the half-built peer is closed
    // and removed before the handler returns"), so every early exit below
    // goes through this cleanup rather than a bare `?`.
    match negotiate(deps, &code, peer_id, &peer_connection, sdp, close_rx, connection_guard).await {
        Ok(result) => {
            deps.sessions.mark_webrtc_established(&code).await;
            Ok(result)
        }
        Err(err) => {
            deps.sessions.detach(&code, peer_id).await;
            let _ = peer_connection.close().await;
            Err(err)
        }
    }
}

/// The ordered §4.4 steps 3-7: apply the remote offer, attach the track and
/// frame producer, answer, and wait for ICE gathering. Pulled out of
/// `handle_offer` so its caller can cleanly detach/close on any failure.
async fn negotiate(
    deps: &SignalingDeps,
    code: &SessionCode,
    peer_id: Uuid,
    peer_connection: &Arc<RTCPeerConnection>,
    sdp: String,
    mut close_rx: tokio::sync::mpsc::UnboundedReceiver<crate::session::CloseReason>,
    connection_guard: crate::rate_limiter::ConnectionGuard,
) -> Result<(String, String), AppError> {
    let offer = RTCSessionDescription::offer(sdp)
        .map_err(|err| AppError::InvalidPayload(format!("invalid SDP offer: {err}")))?;

    peer_connection
        .set_remote_description(offer)
        .await
        .map_err(|err| AppError::InvalidPayload(format!("failed to set remote description: {err}")))?;

    let track = track::new_track(code.as_str());
    peer_connection
        .add_track(Arc::clone(&track) as Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>)
        .await
        .map_err(|err| AppError::InvalidPayload(format!("failed to attach video track: {err}")))?;

    let (stream_timeout_tx, mut stream_timeout_rx) = tokio::sync::mpsc::unbounded_channel();
    let producer = FrameTrackProducer::spawn(
        code.clone(),
        Arc::clone(&deps.frame_store),
        track,
        deps.video.clone(),
        deps.timeouts.max_frame_age,
        deps.timeouts.frame_timeout,
        stream_timeout_tx,
    );
    let producer_slot = Arc::new(Mutex::new(Some(producer)));

    register_lifecycle_hooks(
        Arc::clone(peer_connection),
        Arc::clone(&deps.sessions),
        Arc::clone(&producer_slot),
        code.clone(),
        peer_id,
    );

    let answer = match peer_connection.create_answer(None).await {
        Ok(answer) => answer,
        Err(err) => {
            stop_producer(&producer_slot).await;
            return Err(AppError::InvalidPayload(format!("failed to create answer: {err}")));
        }
    };

    if let Err(err) = peer_connection.set_local_description(answer).await {
        stop_producer(&producer_slot).await;
        return Err(AppError::InvalidPayload(format!("failed to set local description: {err}")));
    }

    // Eagerly close this peer if the registry asks (e.g. evicted on sweep)
    // or if its own frame producer reports the stream has gone stale.
    let close_pc = Arc::clone(peer_connection);
    tokio::spawn(async move {
        let _connection_guard = connection_guard;
        tokio::select! {
            _ = close_rx.recv() => {}
            _ = stream_timeout_rx.recv() => {}
        }
        let _ = close_pc.close().await;
    });

    let gathering = peer_connection.gathering_complete_promise().await;
    let _ = tokio::time::timeout(deps.timeouts.ice_timeout, gathering).await;

    let local = peer_connection
        .local_description()
        .await
        .ok_or_else(|| AppError::InvalidPayload("no local description after negotiation".to_string()))?;

    Ok((local.sdp, "answer".to_string()))
}

async fn stop_producer(producer_slot: &Mutex<Option<FrameTrackProducer>>) {
    if let Some(producer) = producer_slot.lock().await.take() {
        producer.stop();
    }
}

/// Grace-poll FrameStore for an active broadcast, 404ing if none appears.
async fn wait_for_broadcast(store: &FrameStore, code: &SessionCode) -> Result<(), AppError> {
    for attempt in 0..GRACE_POLL_ATTEMPTS {
        if store.contains(code).await {
            return Ok(());
        }
        if attempt + 1 < GRACE_POLL_ATTEMPTS {
            tokio::time::sleep(GRACE_POLL_INTERVAL).await;
        }
    }
    Err(AppError::NotFound("no active broadcast".to_string()))
}

async fn build_peer_connection(ice: &IceConfig) -> Result<RTCPeerConnection, AppError> {
    let mut media_engine = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|err| AppError::InvalidPayload(format!("failed to register interceptors: {err}")))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    // bundle_policy/rtcp_mux_policy mirror what /api/ice-config advertises to
    // browser clients; webrtc-rs only ever negotiates unified-plan SDP, so
    // there is no corresponding sdp_semantics knob to set here.
    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        }],
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    };

    api.new_peer_connection(config)
        .await
        .map_err(|err| AppError::InvalidPayload(format!("failed to create peer connection: {err}")))
}

/// On transition to failed/closed/disconnected, detach the viewer and drop
/// its frame producer. Unlike a remote-desktop peer worth nursing through a
/// network blip, a viewer peer here is cheap to recreate, so this closes
/// eagerly rather than leaving a zombie pinned in the registry (§4.4).
fn register_lifecycle_hooks(
    peer_connection: Arc<RTCPeerConnection>,
    sessions: Arc<SessionRegistry>,
    producer_slot: Arc<Mutex<Option<FrameTrackProducer>>>,
    code: SessionCode,
    peer_id: Uuid,
) {
    peer_connection.on_peer_connection_state_change(Box::new(move |state| {
        let sessions = Arc::clone(&sessions);
        let producer_slot = Arc::clone(&producer_slot);
        let code = code.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Closed
                | RTCPeerConnectionState::Disconnected => {
                    tracing::debug!(%code, ?state, "viewer peer closing");
                    sessions.detach(&code, peer_id).await;
                    if let Some(producer) = producer_slot.lock().await.take() {
                        producer.stop();
                    }
                }
                _ => {}
            }
        })
    }));
}

