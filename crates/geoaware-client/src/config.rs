//! Client configuration from environment.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the live geoawareness feed
    pub stream_url: String,
    /// Base URL of the one-shot zones endpoint, keyed by space id
    pub fallback_url: String,
    pub space_id: String,
    /// Bearer credential supplied by the caller
    pub auth_token: Option<String>,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub fallback_enabled: bool,
    pub fallback_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://localhost:8000/ws/geoawareness".to_string(),
            fallback_url: "http://localhost:8000/geoawareness/zones".to_string(),
            space_id: "default".to_string(),
            auth_token: None,
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            fallback_enabled: true,
            fallback_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(
        stream_url: impl Into<String>,
        fallback_url: impl Into<String>,
        space_id: impl Into<String>,
    ) -> Self {
        Self {
            stream_url: stream_url.into(),
            fallback_url: fallback_url.into(),
            space_id: space_id.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stream_url: env::var("GEOAWARE_STREAM_URL").unwrap_or(defaults.stream_url),
            fallback_url: env::var("GEOAWARE_FALLBACK_URL").unwrap_or(defaults.fallback_url),
            space_id: env::var("GEOAWARE_SPACE_ID").unwrap_or(defaults.space_id),
            auth_token: env::var("GEOAWARE_TOKEN")
                .ok()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            max_retries: env::var("GEOAWARE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            base_delay: env::var("GEOAWARE_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: env::var("GEOAWARE_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            fallback_enabled: env::var("GEOAWARE_FALLBACK_ENABLED")
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.fallback_enabled),
            fallback_timeout: env::var("GEOAWARE_FALLBACK_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.fallback_timeout),
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
