//! `InferenceFanout` (§4.8): `GET /inference/ws/{code}`, a broadcast channel
//! per code plus a heartbeat that covers subscribers waiting through a quiet
//! period (resolved design, see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use crcoach_protocol::{InferenceResult, InferenceWsMessage, SessionCode};
use tokio::sync::{RwLock, broadcast};

const CHANNEL_CAPACITY: usize = 32;

struct CodeChannel {
    tx: broadcast::Sender<InferenceResult>,
    /// Flipped by `publish`, cleared by the heartbeat after it has told every
    /// subscriber about the fresh result once.
    has_fresh_result: AtomicBool,
}

/// Registry of per-code broadcast channels backing `/inference/ws/{code}`.
pub struct InferenceFanout {
    channels: RwLock<HashMap<SessionCode, Arc<CodeChannel>>>,
    heartbeat_interval: Duration,
}

impl InferenceFanout {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            heartbeat_interval,
        }
    }

    async fn channel_for(&self, code: &SessionCode) -> Arc<CodeChannel> {
        if let Some(ch) = self.channels.read().await.get(code) {
            return Arc::clone(ch);
        }
        let mut channels = self.channels.write().await;
        Arc::clone(channels.entry(code.clone()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            Arc::new(CodeChannel {
                tx,
                has_fresh_result: AtomicBool::new(false),
            })
        }))
    }

    /// Publish a freshly-stored result to every subscriber of `code`.
    pub async fn publish(&self, code: &SessionCode, result: InferenceResult) {
        let channel = self.channel_for(code).await;
        channel.has_fresh_result.store(true, Ordering::Relaxed);
        // A send failing just means nobody is subscribed right now.
        let _ = channel.tx.send(result);
    }

    pub async fn subscriber_count(&self, code: &SessionCode) -> usize {
        self.channels
            .read()
            .await
            .get(code)
            .map(|ch| ch.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drive one WebSocket subscriber until it disconnects or the channel closes.
    pub async fn run_subscriber(&self, mut socket: WebSocket, code: SessionCode) {
        let channel = self.channel_for(&code).await;
        let mut results = channel.tx.subscribe();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = results.recv() => {
                    let msg = match result {
                        Ok(result) => InferenceWsMessage::InferenceUpdate { data: result },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(%code, skipped = n, "inference fanout subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if !send_json(&mut socket, &msg).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    let had_fresh = channel.has_fresh_result.swap(false, Ordering::Relaxed);
                    if !had_fresh && !send_json(&mut socket, &InferenceWsMessage::NoData).await {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }
    }

    /// Drop channels with no subscribers. Cheap hashmap maintenance run
    /// alongside the watchdog sweep; does not touch dispatch behavior (the
    /// dispatcher keeps running off upload traffic regardless of subscribers).
    pub async fn sweep(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, ch| ch.tx.receiver_count() > 0);
    }
}

async fn send_json(socket: &mut WebSocket, msg: &InferenceWsMessage) -> bool {
    let Ok(json) = serde_json::to_string(msg) else {
        return false;
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crcoach_protocol::Detection;

    fn code() -> SessionCode {
        SessionCode::parse("1234").unwrap()
    }

    fn result() -> InferenceResult {
        InferenceResult {
            detections: vec![Detection {
                class: "tower".into(),
                confidence: 0.5,
                bbox: crcoach_protocol::BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
            }],
            timer: None,
            inference_time_ms: 1.0,
            image_width: 10,
            image_height: 10,
            annotated_frame: None,
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn publish_before_subscribe_is_not_an_error() {
        let fanout = InferenceFanout::new(Duration::from_millis(50));
        fanout.publish(&code(), result()).await;
        assert_eq!(fanout.subscriber_count(&code()).await, 0);
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let fanout = InferenceFanout::new(Duration::from_millis(50));
        let channel = fanout.channel_for(&code()).await;
        let mut rx = channel.tx.subscribe();
        fanout.publish(&code(), result()).await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.timestamp, 1);
    }

    #[tokio::test]
    async fn sweep_removes_channels_with_no_subscribers() {
        let fanout = InferenceFanout::new(Duration::from_millis(50));
        {
            let _ch = fanout.channel_for(&code()).await;
        }
        fanout.sweep().await;
        assert_eq!(fanout.channels.read().await.len(), 0);
    }
}
