//! `FrameTrackProducer` (§4.5): a per-viewer pacing loop that turns the
//! latest JPEG in `FrameStore` into RGB samples written to a WebRTC track.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crcoach_protocol::{Quality, SessionCode, VideoConfig};
use image::imageops::FilterType;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::store::FrameStore;

/// Nominal pacing tick. The source frame rate is whatever the uploader sends;
/// this only controls how often we sample FrameStore and emit.
const TICK_INTERVAL: Duration = Duration::from_millis(50);
const RESIZE_HYSTERESIS_PX: i64 = 20;
const FAST_RESIZE_THRESHOLD: Duration = Duration::from_millis(50);
const BLANK_WIDTH: u32 = 320;
const BLANK_HEIGHT: u32 = 240;

/// Raw-RGB media capability carried over the video track. There is no
/// negotiated hardware codec here (unlike the H.264 tracks elsewhere in this
/// codebase) — the browser-side player is expected to consume raw frames
/// directly, the same way a `TrackLocalStaticSample` is used for any other
/// payload type in this stack.
pub fn rgb_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/x-raw-rgb24".to_string(),
        clock_rate: 90000,
        ..Default::default()
    }
}

pub fn new_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        rgb_codec_capability(),
        "video".to_string(),
        stream_id.to_string(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerSignal {
    /// Frames for this code have been absent for `FrameTimeout`.
    StreamTimedOut,
}

struct ProducerState {
    last_quality: Option<Quality>,
    target_width: u32,
    scale: Option<f32>,
    last_frame: Option<bytes::Bytes>,
    last_frame_at: Option<Instant>,
    consecutive_stale_frames: u32,
    max_stale_frames: u32,
    blank_rgb: Vec<u8>,
}

impl ProducerState {
    fn new(video: &VideoConfig) -> Self {
        Self {
            last_quality: None,
            target_width: video.width_medium,
            scale: None,
            last_frame: None,
            last_frame_at: None,
            consecutive_stale_frames: 0,
            max_stale_frames: video.max_stale_frames,
            blank_rgb: vec![0u8; (BLANK_WIDTH * BLANK_HEIGHT * 3) as usize],
        }
    }

    /// True once a stale/replayed frame has been shown `max_stale_frames`
    /// times in a row and the viewer should see blank output instead.
    fn past_stale_budget(&self) -> bool {
        self.consecutive_stale_frames > self.max_stale_frames
    }

    fn decode_and_resize(&mut self, jpeg: &[u8], age: Duration) -> (Vec<u8>, u32, u32) {
        let decoded = match image::load_from_memory(jpeg) {
            Ok(img) => img.to_rgb8(),
            Err(_) => {
                return (self.blank_rgb.clone(), BLANK_WIDTH, BLANK_HEIGHT);
            }
        };

        let (w, h) = decoded.dimensions();
        if (w as i64 - self.target_width as i64).abs() <= RESIZE_HYSTERESIS_PX {
            return (decoded.into_raw(), w, h);
        }

        let scale = *self
            .scale
            .get_or_insert_with(|| self.target_width as f32 / w as f32);
        let new_h = ((h as f32) * scale).round().max(1.0) as u32;

        let filter = if age > FAST_RESIZE_THRESHOLD || self.consecutive_stale_frames > 0 {
            FilterType::Nearest
        } else {
            FilterType::Triangle
        };

        let resized = image::imageops::resize(&decoded, self.target_width, new_h, filter);
        let (rw, rh) = resized.dimensions();
        (resized.into_raw(), rw, rh)
    }
}

/// Spawns the pacing loop and returns a handle. Dropping the handle (or
/// calling `stop`) aborts the task, which is how the signaling layer tears a
/// producer down when its peer closes.
pub struct FrameTrackProducer {
    handle: JoinHandle<()>,
}

impl FrameTrackProducer {
    pub fn spawn(
        code: SessionCode,
        store: Arc<FrameStore>,
        track: Arc<TrackLocalStaticSample>,
        video: VideoConfig,
        max_frame_age: Duration,
        frame_timeout: Duration,
        signal_tx: mpsc::UnboundedSender<ProducerSignal>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut state = ProducerState::new(&video);
            let mut absent_since: Option<Instant> = None;
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            let pts_counter = AtomicU64::new(0);

            loop {
                ticker.tick().await;

                let entry = store.get_latest(&code).await;

                let (jpeg, age, quality): (bytes::Bytes, Duration, Quality) = match entry {
                    Some(entry) => {
                        absent_since = None;
                        let age = entry.saved_at.elapsed();
                        if age <= max_frame_age {
                            state.consecutive_stale_frames = 0;
                        } else {
                            state.consecutive_stale_frames += 1;
                        }
                        state.last_frame = Some(entry.jpeg.clone());
                        state.last_frame_at = Some(entry.saved_at);
                        (entry.jpeg, age, entry.quality)
                    }
                    None => match (&state.last_frame, state.last_frame_at) {
                        (Some(bytes), Some(saved_at)) => {
                            state.consecutive_stale_frames += 1;
                            (bytes.clone(), saved_at.elapsed(), state.last_quality.unwrap_or_default())
                        }
                        _ => {
                            let first_absent = *absent_since.get_or_insert_with(Instant::now);
                            if first_absent.elapsed() > frame_timeout {
                                let _ = signal_tx.send(ProducerSignal::StreamTimedOut);
                                return;
                            }
                            let rgb = state.blank_rgb.clone();
                            write_sample(&track, rgb, &pts_counter).await;
                            continue;
                        }
                    },
                };

                if state.last_quality != Some(quality) {
                    state.target_width = quality.target_width(&video);
                    state.scale = None;
                    state.last_quality = Some(quality);
                }

                let rgb = if state.past_stale_budget() {
                    state.blank_rgb.clone()
                } else {
                    state.decode_and_resize(&jpeg, age).0
                };
                write_sample(&track, rgb, &pts_counter).await;
            }
        });

        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for FrameTrackProducer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn write_sample(track: &Arc<TrackLocalStaticSample>, data: Vec<u8>, pts_counter: &AtomicU64) {
    pts_counter.fetch_add(1, Ordering::Relaxed);
    let sample = Sample {
        data: bytes::Bytes::from(data),
        duration: TICK_INTERVAL,
        ..Default::default()
    };
    if let Err(err) = track.write_sample(&sample).await {
        tracing::debug!(%err, "failed to write video sample, viewer likely gone");
    }
}

#[allow(dead_code)]
fn as_track_local(track: &Arc<TrackLocalStaticSample>) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>
}

#[cfg(test)]
mod tests {
    use super::*;
    use crcoach_protocol::VideoConfig;

    fn tiny_jpeg() -> Vec<u8> {
        let mut buf = Vec::new();
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    #[test]
    fn decode_and_resize_returns_blank_on_garbage_input() {
        let video = VideoConfig::default();
        let mut state = ProducerState::new(&video);
        let (rgb, w, h) = state.decode_and_resize(b"not a jpeg", Duration::from_millis(10));
        assert_eq!(w, BLANK_WIDTH);
        assert_eq!(h, BLANK_HEIGHT);
        assert_eq!(rgb.len(), (BLANK_WIDTH * BLANK_HEIGHT * 3) as usize);
    }

    #[test]
    fn decode_and_resize_decodes_valid_jpeg() {
        let video = VideoConfig::default();
        let mut state = ProducerState::new(&video);
        state.target_width = 4; // within hysteresis of the 4px source, no resize
        let jpeg = tiny_jpeg();
        let (rgb, w, h) = state.decode_and_resize(&jpeg, Duration::from_millis(10));
        assert_eq!(w, 4);
        assert_eq!(h, 4);
        assert_eq!(rgb.len(), 4 * 4 * 3);
    }

    #[test]
    fn decode_and_resize_applies_target_width_outside_hysteresis() {
        let video = VideoConfig::default();
        let mut state = ProducerState::new(&video);
        state.target_width = 160;
        let jpeg = tiny_jpeg();
        let (_rgb, w, _h) = state.decode_and_resize(&jpeg, Duration::from_millis(200));
        assert_eq!(w, 160);
    }

    #[test]
    fn past_stale_budget_false_within_limit() {
        let video = VideoConfig::default();
        let mut state = ProducerState::new(&video);
        state.consecutive_stale_frames = video.max_stale_frames;
        assert!(!state.past_stale_budget());
    }

    #[test]
    fn past_stale_budget_true_once_exceeded() {
        let video = VideoConfig::default();
        let mut state = ProducerState::new(&video);
        state.consecutive_stale_frames = video.max_stale_frames + 1;
        assert!(state.past_stale_budget());
    }
}
