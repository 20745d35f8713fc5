//! `FrameStore` (§4.1): latest JPEG, save timestamp, and quality tier per
//! session code.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crcoach_protocol::{Quality, SessionCode};
use tokio::sync::RwLock;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

#[derive(Clone)]
pub struct FrameEntry {
    pub jpeg: bytes::Bytes,
    pub saved_at: Instant,
    pub quality: Quality,
}

/// Thread-safe keyed map from `SessionCode` to the latest frame.
///
/// A single `RwLock<HashMap<..>>` guards the whole table. Critical sections
/// are a hashmap lookup plus a `Bytes` clone (cheap, refcounted) — never an
/// await — so contention across unrelated codes stays negligible without
/// the complexity of per-code sharding.
pub struct FrameStore {
    entries: RwLock<HashMap<SessionCode, FrameEntry>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and store a JPEG. Rejects payloads missing the SOI marker.
    pub async fn save(
        &self,
        code: &SessionCode,
        jpeg: bytes::Bytes,
        quality: Quality,
    ) -> Result<(), &'static str> {
        if jpeg.len() < 2 || jpeg[0..2] != JPEG_SOI {
            return Err("JPEG SOI marker missing");
        }
        let entry = FrameEntry {
            jpeg,
            saved_at: Instant::now(),
            quality,
        };
        self.entries.write().await.insert(code.clone(), entry);
        Ok(())
    }

    pub async fn get_latest(&self, code: &SessionCode) -> Option<FrameEntry> {
        self.entries.read().await.get(code).cloned()
    }

    pub async fn age(&self, code: &SessionCode) -> Option<Duration> {
        self.entries
            .read()
            .await
            .get(code)
            .map(|e| e.saved_at.elapsed())
    }

    pub async fn delete(&self, code: &SessionCode) {
        self.entries.write().await.remove(code);
    }

    pub async fn contains(&self, code: &SessionCode) -> bool {
        self.entries.read().await.contains_key(code)
    }

    /// Codes whose newest frame is older than `max_age`. Used by the watchdog.
    pub async fn stale_codes(&self, max_age: Duration) -> Vec<SessionCode> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.saved_at.elapsed() > max_age)
            .map(|(code, _)| code.clone())
            .collect()
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
