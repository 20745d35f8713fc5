//! Core data model shared between the frame store, session registry,
//! inference pipeline, and the HTTP/WebSocket surface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A four-digit decimal session identifier. The only key used to address a
/// broadcast: frame storage, session lookup, and inference results are all
/// keyed by `SessionCode`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionCodeError {
    #[error("session code must be exactly 4 digits, got {0} characters")]
    WrongLength(usize),
    #[error("session code must be all decimal digits")]
    NotDigits,
}

impl SessionCode {
    pub fn parse(raw: &str) -> Result<Self, SessionCodeError> {
        if raw.len() != 4 {
            return Err(SessionCodeError::WrongLength(raw.len()));
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SessionCodeError::NotDigits);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Requested streaming quality tier, carried alongside each uploaded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Medium
    }
}

impl Quality {
    /// Parse the `X-Quality-Level` header value, defaulting to `Medium` for
    /// anything absent or unrecognized (§4.3).
    pub fn from_header(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("low") => Quality::Low,
            Some("high") => Quality::High,
            _ => Quality::Medium,
        }
    }

    pub fn target_width(self, video: &crate::VideoConfig) -> u32 {
        match self {
            Quality::Low => video.width_low,
            Quality::Medium => video.width_medium,
            Quality::High => video.width_high,
        }
    }
}

/// A single detected object, produced by the detector back-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// A single timer-OCR reading, the second analysis pipeline named in §1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerReading {
    pub seconds: u32,
    pub confidence: f32,
}

/// Per-code detection/annotation result, written by the `InferenceDispatcher`
/// and read by the HTTP surface and `InferenceFanout` (§3, §4.6, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub detections: Vec<Detection>,
    pub timer: Option<TimerReading>,
    pub inference_time_ms: f64,
    pub image_width: u32,
    pub image_height: u32,
    /// Base64-encoded JPEG with detections overlaid, if annotation succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_frame: Option<String>,
    /// Monotonic write timestamp (milliseconds since an arbitrary epoch),
    /// used for the compare-and-set monotonicity guarantee in §5.
    pub timestamp: u64,
}
