//! Per-peer sliding-window rate limiter (§5) and per-IP concurrent
//! connection cap, backing the `RateLimited` error taxonomy member (§7).

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Sliding window of message timestamps per peer key (e.g. a peer id or IP).
pub struct RateLimiter {
    window: Duration,
    max_per_window: u32,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record one message for `key` and report whether it is within quota.
    pub async fn is_allowed(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let entry = hits.entry(key.to_string()).or_default();
        while let Some(&oldest) = entry.front() {
            if now.duration_since(oldest) > self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() as u32 >= self.max_per_window {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Drop tracking state for keys with no recent activity, bounding memory.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut hits = self.hits.lock().await;
        hits.retain(|_, entry| {
            entry.retain(|&t| now.duration_since(t) <= window);
            !entry.is_empty()
        });
    }
}

/// Tracks concurrently-open connections per source IP, enforcing
/// `MaxConnectionsPerIP` (§5).
pub struct ConnectionLimiter {
    max_per_ip: u32,
    open: Mutex<HashMap<IpAddr, u32>>,
}

/// Owns an `Arc` back to its limiter (rather than a borrow) so the guard can
/// be held across an `.await` boundary or moved into a spawned task for the
/// lifetime of a WebRTC peer connection, not just one handler call.
pub struct ConnectionGuard {
    limiter: Arc<ConnectionLimiter>,
    ip: IpAddr,
}

impl ConnectionLimiter {
    pub fn new(max_per_ip: u32) -> Self {
        Self {
            max_per_ip,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Try to reserve a connection slot for `ip`. Returns `None` if the
    /// per-IP cap is already reached; otherwise a guard that releases the
    /// slot on drop.
    pub async fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionGuard> {
        let mut open = self.open.lock().await;
        let count = open.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return None;
        }
        *count += 1;
        Some(ConnectionGuard {
            limiter: Arc::clone(self),
            ip,
        })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let limiter = Arc::clone(&self.limiter);
        let ip = self.ip;
        // Synchronous blocking_lock is unsafe inside an async runtime; instead
        // spawn the decrement so Drop never blocks the executor.
        tokio::spawn(async move {
            let mut open = limiter.open.lock().await;
            if let Some(count) = open.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    open.remove(&ip);
                }
            }
        });
    }
}
