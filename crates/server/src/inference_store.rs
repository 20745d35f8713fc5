//! `InferenceStore` (§4.7): latest detection/timer result per code, with a
//! TTL and a monotonicity guard on the result timestamp (§5).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crcoach_protocol::{InferenceResult, SessionCode};
use tokio::sync::RwLock;

struct Entry {
    result: InferenceResult,
    saved_at: Instant,
}

pub struct InferenceStore {
    entries: RwLock<HashMap<SessionCode, Entry>>,
    ttl: Duration,
}

impl InferenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Write a result, rejecting it if a newer result is already stored for
    /// this code (compare-and-set on `timestamp`, §5's monotonicity guarantee).
    pub async fn save(&self, code: &SessionCode, result: InferenceResult) {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(code) {
            if existing.result.timestamp >= result.timestamp {
                tracing::debug!(
                    %code,
                    existing = existing.result.timestamp,
                    incoming = result.timestamp,
                    "dropping out-of-order inference result"
                );
                return;
            }
        }
        entries.insert(
            code.clone(),
            Entry {
                result,
                saved_at: Instant::now(),
            },
        );
    }

    /// Returns the result if present and not expired. Does not delete on
    /// expiry — that is `sweep_expired`'s job — it simply treats it as absent.
    pub async fn get(&self, code: &SessionCode) -> Option<InferenceResult> {
        let entries = self.entries.read().await;
        let entry = entries.get(code)?;
        if entry.saved_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.result.clone())
    }

    pub async fn list_active(&self) -> Vec<SessionCode> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, e)| e.saved_at.elapsed() <= self.ttl)
            .map(|(code, _)| code.clone())
            .collect()
    }

    pub async fn count_active(&self) -> usize {
        self.list_active().await.len()
    }

    /// Delete entries whose TTL has elapsed. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.saved_at.elapsed() <= self.ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crcoach_protocol::Detection;

    fn code(s: &str) -> SessionCode {
        SessionCode::parse(s).unwrap()
    }

    fn result(timestamp: u64) -> InferenceResult {
        InferenceResult {
            detections: vec![Detection {
                class: "princess_tower".to_string(),
                confidence: 0.9,
                bbox: crcoach_protocol::BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
            }],
            timer: None,
            inference_time_ms: 5.0,
            image_width: 320,
            image_height: 180,
            annotated_frame: None,
            timestamp,
        }
    }

    #[tokio::test]
    async fn save_then_get_roundtrips() {
        let store = InferenceStore::new(Duration::from_secs(120));
        store.save(&code("1234"), result(1)).await;
        let got = store.get(&code("1234")).await.unwrap();
        assert_eq!(got.timestamp, 1);
    }

    #[tokio::test]
    async fn older_completion_does_not_replace_newer_result() {
        let store = InferenceStore::new(Duration::from_secs(120));
        store.save(&code("1234"), result(10)).await;
        store.save(&code("1234"), result(5)).await; // completed later but logically older
        let got = store.get(&code("1234")).await.unwrap();
        assert_eq!(got.timestamp, 10);
    }

    #[tokio::test]
    async fn strictly_newer_result_replaces() {
        let store = InferenceStore::new(Duration::from_secs(120));
        store.save(&code("1234"), result(1)).await;
        store.save(&code("1234"), result(2)).await;
        let got = store.get(&code("1234")).await.unwrap();
        assert_eq!(got.timestamp, 2);
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let store = InferenceStore::new(Duration::from_millis(0));
        store.save(&code("1234"), result(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get(&code("1234")).await.is_none());
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_expired() {
        let store = InferenceStore::new(Duration::from_millis(10));
        store.save(&code("1234"), result(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.save(&code("5678"), result(1)).await;
        let removed = store.sweep_expired().await;
        assert_eq!(removed, 1);
        assert!(store.get(&code("5678")).await.is_some());
    }

    #[tokio::test]
    async fn list_active_excludes_expired() {
        let store = InferenceStore::new(Duration::from_millis(10));
        store.save(&code("1234"), result(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.list_active().await.is_empty());
    }
}
