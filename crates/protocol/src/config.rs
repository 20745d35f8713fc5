use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration, assembled entirely from environment variables.
///
/// There is no config file: every field is independently overridable via
/// an env var, falling back to the defaults below when unset or unparsable.
#[derive(Debug, Clone)]
pub struct CrcoachConfig {
    pub server: ServerConfig,
    pub timeouts: TimeoutConfig,
    pub video: VideoConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub ice: IceConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub frame_timeout: Duration,
    pub max_frame_age: Duration,
    pub ice_timeout: Duration,
    pub watchdog_interval: Duration,
    pub inference_interval: Duration,
    pub session_timeout: Duration,
    pub inference_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub max_bitrate: u32,
    pub min_bitrate: u32,
    pub width_low: u32,
    pub width_medium: u32,
    pub width_high: u32,
    /// Consecutive stale ticks a viewer replays the last real frame before
    /// the producer switches to blank output.
    pub max_stale_frames: u32,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub max_viewers_per_session: usize,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_messages_per_connection: u32,
    pub max_connections_per_ip: u32,
}

/// STUN/ICE server configuration for WebRTC NAT traversal. Not independently
/// overridable per §6 — fixed to the values the signaling endpoint requires.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub enable_timer_ocr: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(500),
            max_frame_age: Duration::from_millis(100),
            ice_timeout: Duration::from_millis(2000),
            watchdog_interval: Duration::from_millis(250),
            inference_interval: Duration::from_millis(100),
            session_timeout: Duration::from_secs(5 * 60),
            inference_ttl: Duration::from_secs(120),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_bitrate: 1500,
            min_bitrate: 500,
            width_low: 160,
            width_medium: 320,
            width_high: 480,
            max_stale_frames: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_viewers_per_session: 10,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_messages_per_connection: 100,
            max_connections_per_ip: 20,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            enable_timer_ocr: true,
        }
    }
}

impl Default for CrcoachConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            timeouts: TimeoutConfig::default(),
            video: VideoConfig::default(),
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            ice: IceConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

fn env_parsed<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("{name}={raw:?} is not valid, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parsed(name, default.as_millis() as u64))
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parsed(name, default.as_secs()))
}

impl CrcoachConfig {
    /// Build configuration from the process environment, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: env_parsed("SERVER_PORT", defaults.server.port),
            },
            timeouts: TimeoutConfig {
                frame_timeout: env_millis("FRAME_TIMEOUT", defaults.timeouts.frame_timeout),
                max_frame_age: env_millis("MAX_FRAME_AGE_MS", defaults.timeouts.max_frame_age),
                ice_timeout: env_millis("ICE_TIMEOUT", defaults.timeouts.ice_timeout),
                watchdog_interval: env_millis(
                    "WATCHDOG_INTERVAL",
                    defaults.timeouts.watchdog_interval,
                ),
                inference_interval: env_millis(
                    "INFERENCE_INTERVAL_MS",
                    defaults.timeouts.inference_interval,
                ),
                session_timeout: env_secs(
                    "SESSION_TIMEOUT_SECS",
                    defaults.timeouts.session_timeout,
                ),
                inference_ttl: env_secs("INFERENCE_TTL_SECS", defaults.timeouts.inference_ttl),
            },
            video: VideoConfig {
                max_bitrate: env_parsed("MAX_BITRATE", defaults.video.max_bitrate),
                min_bitrate: env_parsed("MIN_BITRATE", defaults.video.min_bitrate),
                width_low: env_parsed("WIDTH_LOW", defaults.video.width_low),
                width_medium: env_parsed("WIDTH_MEDIUM", defaults.video.width_medium),
                width_high: env_parsed("WIDTH_HIGH", defaults.video.width_high),
                max_stale_frames: env_parsed(
                    "MAX_STALE_FRAMES",
                    defaults.video.max_stale_frames,
                ),
            },
            session: SessionConfig {
                max_sessions: env_parsed("MAX_SESSIONS", defaults.session.max_sessions),
                max_viewers_per_session: env_parsed(
                    "MAX_VIEWERS_PER_SESSION",
                    defaults.session.max_viewers_per_session,
                ),
            },
            rate_limit: RateLimitConfig {
                window: env_secs("RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window),
                max_messages_per_connection: env_parsed(
                    "MAX_MESSAGES_PER_CONNECTION",
                    defaults.rate_limit.max_messages_per_connection,
                ),
                max_connections_per_ip: env_parsed(
                    "MAX_CONNECTIONS_PER_IP",
                    defaults.rate_limit.max_connections_per_ip,
                ),
            },
            ice: IceConfig::default(),
            inference: InferenceConfig {
                enable_timer_ocr: env_parsed(
                    "ENABLE_TIMER_OCR",
                    defaults.inference.enable_timer_ocr,
                ),
            },
        }
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: SERVER_PORT must be between 1 and 65535, got 0.".to_string());
        }

        if self.session.max_viewers_per_session == 0 {
            issues.push("ERROR: MAX_VIEWERS_PER_SESSION must be >= 1.".to_string());
        }

        if self.session.max_sessions == 0 {
            issues.push("ERROR: MAX_SESSIONS must be >= 1.".to_string());
        }

        if self.video.min_bitrate > self.video.max_bitrate {
            issues.push(format!(
                "ERROR: MIN_BITRATE ({}) must not exceed MAX_BITRATE ({}).",
                self.video.min_bitrate, self.video.max_bitrate
            ));
        }

        if self.video.max_stale_frames == 0 {
            issues.push("ERROR: MAX_STALE_FRAMES must be >= 1.".to_string());
        }

        if !(self.video.width_low < self.video.width_medium
            && self.video.width_medium < self.video.width_high)
        {
            issues.push(format!(
                "WARNING: quality tier widths are not strictly increasing \
                 (low={}, medium={}, high={}); quality switches may not behave as expected.",
                self.video.width_low, self.video.width_medium, self.video.width_high
            ));
        }

        if self.timeouts.max_frame_age > self.timeouts.frame_timeout {
            issues.push(format!(
                "WARNING: MAX_FRAME_AGE_MS ({:?}) exceeds FRAME_TIMEOUT ({:?}); \
                 frames will rarely be classified as fresh.",
                self.timeouts.max_frame_age, self.timeouts.frame_timeout
            ));
        }

        if self.timeouts.ice_timeout > Duration::from_secs(10) {
            issues.push(format!(
                "WARNING: ICE_TIMEOUT of {:?} is unusually long; viewers may perceive \
                 the connection as hung before it completes.",
                self.timeouts.ice_timeout
            ));
        }

        if self.timeouts.watchdog_interval > self.timeouts.frame_timeout {
            issues.push(format!(
                "WARNING: WATCHDOG_INTERVAL ({:?}) exceeds FRAME_TIMEOUT ({:?}); \
                 stale sessions will take longer than FrameTimeout to evict.",
                self.timeouts.watchdog_interval, self.timeouts.frame_timeout
            ));
        }

        if self.rate_limit.max_messages_per_connection == 0 {
            issues.push(
                "ERROR: MAX_MESSAGES_PER_CONNECTION must be >= 1.".to_string(),
            );
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'."
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = CrcoachConfig::default();
        assert_eq!(config.timeouts.frame_timeout, Duration::from_millis(500));
        assert_eq!(config.timeouts.max_frame_age, Duration::from_millis(100));
        assert_eq!(config.timeouts.ice_timeout, Duration::from_millis(2000));
        assert_eq!(
            config.timeouts.watchdog_interval,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.timeouts.inference_interval,
            Duration::from_millis(100)
        );
        assert_eq!(config.timeouts.session_timeout, Duration::from_secs(300));
        assert_eq!(config.timeouts.inference_ttl, Duration::from_secs(120));
        assert_eq!(config.video.width_low, 160);
        assert_eq!(config.video.width_medium, 320);
        assert_eq!(config.video.width_high, 480);
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(CrcoachConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = CrcoachConfig::default();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("SERVER_PORT")));
    }

    #[test]
    fn validate_max_viewers_zero_is_error() {
        let mut config = CrcoachConfig::default();
        config.session.max_viewers_per_session = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("MAX_VIEWERS_PER_SESSION")));
    }

    #[test]
    fn validate_bitrate_inversion_is_error() {
        let mut config = CrcoachConfig::default();
        config.video.min_bitrate = 2000;
        config.video.max_bitrate = 1000;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("MIN_BITRATE")));
    }

    #[test]
    fn validate_non_monotonic_widths_is_warning() {
        let mut config = CrcoachConfig::default();
        config.video.width_medium = 100;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:") && i.contains("widths")));
    }

    #[test]
    fn validate_long_ice_timeout_is_warning() {
        let mut config = CrcoachConfig::default();
        config.timeouts.ice_timeout = Duration::from_secs(30);
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("ICE_TIMEOUT")));
    }

    #[test]
    fn validate_bad_stun_url_is_error() {
        let mut config = CrcoachConfig::default();
        config.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("STUN URL")));
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = CrcoachConfig::default();
        config.server.port = 0;
        config.session.max_sessions = 0;
        config.session.max_viewers_per_session = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.len() >= 3);
    }
}
