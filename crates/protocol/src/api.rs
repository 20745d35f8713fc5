//! JSON shapes for the HTTP and WebSocket surface (§6).

use serde::{Deserialize, Serialize};

use crate::InferenceResult;

/// Body of `POST /offer`.
#[derive(Debug, Clone, Deserialize)]
pub struct OfferRequest {
    pub code: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

/// Response of `POST /offer`.
#[derive(Debug, Clone, Serialize)]
pub struct OfferResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

/// Response of `POST /upload/{code}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadResponse {
    Ok { processed_time_ms: f64 },
    ClientDisconnected,
}

/// Uniform error body for 4xx/5xx HTTP responses (§7).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSessionsResponse {
    pub active_sessions: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceHealth {
    pub active_results: usize,
    pub dispatch_independent_of_subscribers: bool,
    pub timer_ocr_enabled: bool,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub inference: InferenceHealth,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DroppedFrameStats {
    pub count: u64,
    pub last_reason: Option<&'static str>,
    pub locked: u64,
    pub throttled: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInferenceSummary {
    pub available: bool,
    pub detections: usize,
    pub last_inference_time_ms: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatsResponse {
    pub code: String,
    pub active: bool,
    pub last_upload_secs_ago: Option<u64>,
    pub dropped_frames: DroppedFrameStats,
    pub inference: Option<StreamInferenceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IceConfigResponse {
    pub ice_servers: Vec<IceServerInfo>,
    pub bundle_policy: &'static str,
    pub rtcp_mux_policy: &'static str,
    pub sdp_semantics: &'static str,
}

/// Server→client frames on `/inference/ws/{code}` (§4.8).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InferenceWsMessage {
    InferenceUpdate { data: InferenceResult },
    NoData,
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_request_deserializes_camel_type_field() {
        let json = r#"{"code":"1234","sdp":"v=0","type":"offer"}"#;
        let req: OfferRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.code, "1234");
        assert_eq!(req.sdp_type, "offer");
    }

    #[test]
    fn upload_response_ok_serializes_with_status_tag() {
        let resp = UploadResponse::Ok {
            processed_time_ms: 12.5,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""status":"ok""#));
        assert!(json.contains("processed_time_ms"));
    }

    #[test]
    fn upload_response_client_disconnected_tag() {
        let json = serde_json::to_string(&UploadResponse::ClientDisconnected).unwrap();
        assert_eq!(json, r#"{"status":"client_disconnected"}"#);
    }

    #[test]
    fn inference_ws_no_data_has_no_data_field() {
        let json = serde_json::to_string(&InferenceWsMessage::NoData).unwrap();
        assert_eq!(json, r#"{"type":"no_data"}"#);
    }
}
