//! `InferenceDispatcher` (§4.6) and its two back-end collaborators: object
//! detection and the timer-OCR pipeline (supplemented feature, see
//! SPEC_FULL.md §10.5). Both are capabilities behind narrow traits so a
//! build without a model wires in a no-op implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use crcoach_protocol::{Detection, InferenceResult, SessionCode, TimerReading};
use tokio::sync::Mutex;

use crate::fanout::InferenceFanout;
use crate::inference_store::InferenceStore;

#[derive(Debug, Clone)]
pub struct DetectOutput {
    pub detections: Vec<Detection>,
    pub image_width: u32,
    pub image_height: u32,
    pub inference_time_ms: f64,
}

/// Object detector back-end, consumed one uploaded JPEG at a time.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, jpeg: &[u8]) -> anyhow::Result<DetectOutput>;
    async fn annotate(&self, jpeg: &[u8], detections: &[Detection]) -> anyhow::Result<Vec<u8>>;
}

/// Timer-OCR back-end. Runs independently of `Detector` so an outage in one
/// never blanks the other's slot of `InferenceResult`.
#[async_trait]
pub trait TimerOcr: Send + Sync {
    async fn read_timer(&self, jpeg: &[u8]) -> anyhow::Result<Option<TimerReading>>;
}

/// Wired in when no detection model is configured; always reports zero
/// detections rather than failing the pipeline.
pub struct NoopDetector;

#[async_trait]
impl Detector for NoopDetector {
    async fn detect(&self, _jpeg: &[u8]) -> anyhow::Result<DetectOutput> {
        Ok(DetectOutput {
            detections: Vec::new(),
            image_width: 0,
            image_height: 0,
            inference_time_ms: 0.0,
        })
    }

    async fn annotate(&self, jpeg: &[u8], _detections: &[Detection]) -> anyhow::Result<Vec<u8>> {
        Ok(jpeg.to_vec())
    }
}

/// Wired in when timer OCR is disabled or no model is configured.
pub struct NoopTimerOcr;

#[async_trait]
impl TimerOcr for NoopTimerOcr {
    async fn read_timer(&self, _jpeg: &[u8]) -> anyhow::Result<Option<TimerReading>> {
        Ok(None)
    }
}

pub enum DispatchOutcome {
    Dispatched,
    SkippedLocked,
    SkippedThrottled,
}

struct CodeState {
    last_dispatch: Instant,
    busy: bool,
}

/// Runs detection (and, independently, timer OCR) on freshly uploaded
/// frames, subject to a per-code lock and interval, and publishes results.
pub struct InferenceDispatcher {
    detector: Arc<dyn Detector>,
    timer_ocr: Arc<dyn TimerOcr>,
    timer_ocr_enabled: bool,
    store: Arc<InferenceStore>,
    fanout: Arc<InferenceFanout>,
    interval: Duration,
    state: Mutex<HashMap<SessionCode, CodeState>>,
    error_count: AtomicU64,
}

impl InferenceDispatcher {
    pub fn new(
        detector: Arc<dyn Detector>,
        timer_ocr: Arc<dyn TimerOcr>,
        timer_ocr_enabled: bool,
        store: Arc<InferenceStore>,
        fanout: Arc<InferenceFanout>,
        interval: Duration,
    ) -> Self {
        Self {
            detector,
            timer_ocr,
            timer_ocr_enabled,
            store,
            fanout,
            interval,
            state: Mutex::new(HashMap::new()),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Try to start one detection pass for `code`. Never blocks on the
    /// detector itself: on success it spawns the work and returns
    /// immediately; on a busy code or one dispatched too recently it returns
    /// without doing anything (§4.3's "uploads never await inference").
    pub async fn try_dispatch(self: &Arc<Self>, code: SessionCode, jpeg: bytes::Bytes) -> DispatchOutcome {
        {
            let mut state = self.state.lock().await;
            let entry = state.entry(code.clone()).or_insert_with(|| CodeState {
                last_dispatch: Instant::now() - self.interval,
                busy: false,
            });
            if entry.busy {
                return DispatchOutcome::SkippedLocked;
            }
            if entry.last_dispatch.elapsed() < self.interval {
                return DispatchOutcome::SkippedThrottled;
            }
            entry.busy = true;
            entry.last_dispatch = Instant::now();
        }

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run_one(code.clone(), jpeg).await;
            let mut state = dispatcher.state.lock().await;
            if let Some(entry) = state.get_mut(&code) {
                entry.busy = false;
            }
        });

        DispatchOutcome::Dispatched
    }

    async fn run_one(&self, code: SessionCode, jpeg: bytes::Bytes) {
        let detect_result = self.detector.detect(&jpeg).await;
        let timer_result = if self.timer_ocr_enabled {
            self.timer_ocr.read_timer(&jpeg).await
        } else {
            Ok(None)
        };

        let detect = match detect_result {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(%code, %err, "detection failed, dropping result");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let timer = match timer_result {
            Ok(t) => t,
            Err(err) => {
                tracing::warn!(%code, %err, "timer OCR failed, continuing without a reading");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        let annotated_frame = if detect.detections.is_empty() {
            None
        } else {
            match self.detector.annotate(&jpeg, &detect.detections).await {
                Ok(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                Err(err) => {
                    tracing::debug!(%code, %err, "annotation failed, result still published without it");
                    None
                }
            }
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let result = InferenceResult {
            detections: detect.detections,
            timer,
            inference_time_ms: detect.inference_time_ms,
            image_width: detect.image_width,
            image_height: detect.image_height,
            annotated_frame,
            timestamp,
        };

        self.store.save(&code, result.clone()).await;
        self.fanout.publish(&code, result).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDetector {
        detections: Vec<Detection>,
    }

    #[async_trait]
    impl Detector for FixedDetector {
        async fn detect(&self, _jpeg: &[u8]) -> anyhow::Result<DetectOutput> {
            Ok(DetectOutput {
                detections: self.detections.clone(),
                image_width: 100,
                image_height: 100,
                inference_time_ms: 2.0,
            })
        }

        async fn annotate(&self, jpeg: &[u8], _detections: &[Detection]) -> anyhow::Result<Vec<u8>> {
            Ok(jpeg.to_vec())
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl Detector for FailingDetector {
        async fn detect(&self, _jpeg: &[u8]) -> anyhow::Result<DetectOutput> {
            anyhow::bail!("model unavailable")
        }

        async fn annotate(&self, jpeg: &[u8], _detections: &[Detection]) -> anyhow::Result<Vec<u8>> {
            Ok(jpeg.to_vec())
        }
    }

    fn code() -> SessionCode {
        SessionCode::parse("1234").unwrap()
    }

    #[tokio::test]
    async fn dispatch_writes_result_to_store() {
        let dispatcher = Arc::new(InferenceDispatcher::new(
            Arc::new(FixedDetector { detections: vec![] }),
            Arc::new(NoopTimerOcr),
            false,
            Arc::new(InferenceStore::new(Duration::from_secs(60))),
            Arc::new(InferenceFanout::new(Duration::from_millis(100))),
            Duration::from_millis(10),
        ));
        let outcome = dispatcher
            .clone()
            .try_dispatch(code(), bytes::Bytes::from_static(&[0xFF, 0xD8]))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Dispatched));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatcher.store.get(&code()).await.is_some());
    }

    #[tokio::test]
    async fn second_dispatch_within_interval_is_throttled() {
        let dispatcher = Arc::new(InferenceDispatcher::new(
            Arc::new(FixedDetector { detections: vec![] }),
            Arc::new(NoopTimerOcr),
            false,
            Arc::new(InferenceStore::new(Duration::from_secs(60))),
            Arc::new(InferenceFanout::new(Duration::from_millis(100))),
            Duration::from_secs(10),
        ));
        dispatcher
            .clone()
            .try_dispatch(code(), bytes::Bytes::from_static(&[0xFF, 0xD8]))
            .await;
        let second = dispatcher
            .clone()
            .try_dispatch(code(), bytes::Bytes::from_static(&[0xFF, 0xD8]))
            .await;
        assert!(matches!(second, DispatchOutcome::SkippedThrottled));
    }

    #[tokio::test]
    async fn failing_detector_increments_error_count_without_panicking() {
        let dispatcher = Arc::new(InferenceDispatcher::new(
            Arc::new(FailingDetector),
            Arc::new(NoopTimerOcr),
            false,
            Arc::new(InferenceStore::new(Duration::from_secs(60))),
            Arc::new(InferenceFanout::new(Duration::from_millis(100))),
            Duration::from_millis(10),
        ));
        dispatcher
            .clone()
            .try_dispatch(code(), bytes::Bytes::from_static(&[0xFF, 0xD8]))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.error_count(), 1);
        assert!(dispatcher.store.get(&code()).await.is_none());
    }
}
