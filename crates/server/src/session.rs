//! `SessionRegistry` (§4.2): tracks broadcaster and viewer peers per
//! session code, enforces `MaxViewers`, and runs the session state machine
//! described in §4.9.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crcoach_protocol::SessionCode;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::error::{AppError, WS_CLOSE_REPLACED};

/// Reason passed to a peer's close channel so it can pick the right
/// WebSocket/PeerConnection close code on its way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Replaced,
    Evicted,
    SessionTimedOut,
}

impl CloseReason {
    pub fn ws_close_code(self) -> u16 {
        match self {
            CloseReason::Replaced => WS_CLOSE_REPLACED,
            CloseReason::Evicted | CloseReason::SessionTimedOut => 1001,
        }
    }
}

/// A handle a registry holds on a live peer. The owning task (the offer
/// handler, the signaling WebSocket loop) listens on the paired receiver and
/// tears its connection down when a reason arrives.
pub struct PeerHandle {
    pub id: Uuid,
    closer: mpsc::UnboundedSender<CloseReason>,
}

impl PeerHandle {
    pub fn new(id: Uuid) -> (Self, mpsc::UnboundedReceiver<CloseReason>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, closer: tx }, rx)
    }

    /// Request that the peer close. Ignored if the peer has already gone away.
    fn request_close(&self, reason: CloseReason) {
        let _ = self.closer.send(reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Live,
    Draining,
}

pub struct Session {
    pub code: SessionCode,
    pub state: SessionState,
    broadcaster: Option<PeerHandle>,
    viewers: HashMap<Uuid, PeerHandle>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
    pub connection_attempts: u64,
    pub webrtc_established: bool,
}

impl Session {
    fn new(code: SessionCode) -> Self {
        let now = Instant::now();
        Self {
            code,
            state: SessionState::Empty,
            broadcaster: None,
            viewers: HashMap::new(),
            created_at: now,
            last_activity: now,
            message_count: 0,
            connection_attempts: 0,
            webrtc_established: false,
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    #[allow(dead_code)]
    pub fn has_broadcaster(&self) -> bool {
        self.broadcaster.is_some()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.message_count += 1;
    }

    fn recompute_state(&mut self) {
        self.state = if self.viewers.is_empty() && self.broadcaster.is_none() {
            if self.state == SessionState::Empty {
                SessionState::Empty
            } else {
                SessionState::Draining
            }
        } else {
            SessionState::Live
        };
    }
}

/// Maintains `code -> Session`. A single `RwLock<HashMap<..>>` guards the
/// whole table, consistent with the store's locking model; per-session
/// mutation (attach/detach) takes the write lock only for the duration of a
/// hashmap update, never across an await on peer I/O.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionCode, Session>>,
    max_viewers: usize,
    max_sessions: usize,
    session_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_viewers: usize, session_timeout: Duration) -> Self {
        Self::with_max_sessions(max_viewers, usize::MAX, session_timeout)
    }

    pub fn with_max_sessions(max_viewers: usize, max_sessions: usize, session_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_viewers,
            max_sessions,
            session_timeout,
        }
    }

    /// Touch (or create) the session for `code`. Rejects creating a session
    /// past `MaxSessions` total active codes; an existing code is always
    /// touched regardless of the cap.
    pub async fn get_or_create_touch(&self, code: &SessionCode) -> Result<(), AppError> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(code) && sessions.len() >= self.max_sessions {
            return Err(AppError::SessionFull);
        }
        let session = sessions
            .entry(code.clone())
            .or_insert_with(|| Session::new(code.clone()));
        session.connection_attempts += 1;
        session.touch();
        Ok(())
    }

    /// Attach a broadcaster, evicting any existing one first (last-writer-wins, §9).
    ///
    /// Broadcasting in this system is a sequence of anonymous, stateless
    /// `POST /upload/{code}` calls (§4.3) rather than a held-open connection,
    /// so nothing ever calls this in practice: the "at most one broadcaster,
    /// last writer wins" invariant it exists to enforce is already satisfied
    /// structurally by `FrameStore::save`'s unconditional per-code overwrite
    /// (§4.1). Kept for the case a future signaling path gives broadcasters a
    /// real peer connection of their own.
    #[allow(dead_code)]
    pub async fn attach_broadcaster(&self, code: &SessionCode, peer: PeerHandle) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(code.clone())
            .or_insert_with(|| Session::new(code.clone()));
        if let Some(old) = session.broadcaster.take() {
            old.request_close(CloseReason::Replaced);
        }
        session.broadcaster = Some(peer);
        session.touch();
        session.recompute_state();
    }

    /// Mark that a viewer's offer/answer exchange completed for `code`
    /// (§3's `webrtcEstablished`). No-op if the session has since been swept.
    pub async fn mark_webrtc_established(&self, code: &SessionCode) {
        if let Some(session) = self.sessions.write().await.get_mut(code) {
            session.webrtc_established = true;
        }
    }

    /// Attach a viewer, rejecting with `SessionFull` once `MaxViewers` is reached.
    pub async fn attach_viewer(&self, code: &SessionCode, peer: PeerHandle) -> Result<(), AppError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(code.clone())
            .or_insert_with(|| Session::new(code.clone()));
        if session.viewers.len() >= self.max_viewers {
            return Err(AppError::SessionFull);
        }
        session.viewers.insert(peer.id, peer);
        session.touch();
        session.recompute_state();
        Ok(())
    }

    /// Detach a peer (broadcaster or viewer) by id. No-op if the session or
    /// peer is already gone.
    pub async fn detach(&self, code: &SessionCode, peer_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(code) {
            if session.broadcaster.as_ref().is_some_and(|b| b.id == peer_id) {
                session.broadcaster = None;
            }
            session.viewers.remove(&peer_id);
            session.touch();
            session.recompute_state();
        }
    }

    pub async fn viewer_count(&self, code: &SessionCode) -> usize {
        self.sessions
            .read()
            .await
            .get(code)
            .map(|s| s.viewer_count())
            .unwrap_or(0)
    }

    pub async fn webrtc_established(&self, code: &SessionCode) -> bool {
        self.sessions
            .read()
            .await
            .get(code)
            .map(|s| s.webrtc_established)
            .unwrap_or(false)
    }

    #[allow(dead_code)]
    pub async fn has_broadcaster(&self, code: &SessionCode) -> bool {
        self.sessions
            .read()
            .await
            .get(code)
            .map(|s| s.has_broadcaster())
            .unwrap_or(false)
    }

    pub async fn active_codes(&self) -> Vec<SessionCode> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Close and remove every peer registered for `code`.
    pub async fn close_all(&self, code: &SessionCode, reason: CloseReason) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(code) {
            if let Some(b) = session.broadcaster {
                b.request_close(reason);
            }
            for (_, v) in session.viewers {
                v.request_close(reason);
            }
        }
    }

    /// Remove every session currently `Draining` (had a viewer, now has
    /// none) — torn down on the very next watchdog tick regardless of frame
    /// freshness, matching `_watch_code`'s `empty` check in the original.
    /// A session that has never had a viewer stays `Empty` and is left to
    /// the idle-timeout sweep below, since the original's watchdog task for
    /// a code only starts once a viewer peer connection is added.
    pub async fn sweep_draining(&self) -> Vec<SessionCode> {
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();
        sessions.retain(|code, session| {
            if session.state == SessionState::Draining {
                removed.push(code.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove sessions with no peers that have been idle longer than
    /// `SessionTimeout`. Returns the removed codes.
    pub async fn sweep(&self) -> Vec<SessionCode> {
        let mut sessions = self.sessions.write().await;
        let timeout = self.session_timeout;
        let mut removed = Vec::new();
        sessions.retain(|code, session| {
            let idle_empty = session.broadcaster.is_none()
                && session.viewers.is_empty()
                && session.last_activity.elapsed() > timeout;
            if idle_empty {
                removed.push(code.clone());
            }
            !idle_empty
        });
        removed
    }
}
