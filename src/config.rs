//! Stream client configuration
//!
//! Every knob has a production default and can be overridden from the
//! environment (a `.env` file is honoured through `dotenv`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay between reconnect attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`, capped at `backoff_max_ms`
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "exponential" | "exp" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    // Endpoints
    pub ws_base_url: String,
    pub api_base_url: String,
    pub api_token: Option<String>,

    // Reconnect policy
    pub backoff: BackoffKind,
    pub reconnect_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,

    // Connection timing
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,

    // Trade reconciliation
    pub refresh_debounce_ms: u64,
    /// 0 disables the periodic refresh loop
    pub refresh_interval_secs: u64,
    pub all_trades_cap: usize,
    pub open_trades_cap: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://127.0.0.1:8000/ws".to_string(),
            api_base_url: "http://127.0.0.1:8000/api".to_string(),
            api_token: None,

            // Linear: 3s, 6s, 9s ... give up after 10 attempts
            backoff: BackoffKind::Linear,
            reconnect_base_ms: 3_000,
            backoff_max_ms: 30_000,
            max_reconnect_attempts: 10,

            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 10_000,

            refresh_debounce_ms: 1_000,
            refresh_interval_secs: 30,
            all_trades_cap: 200,
            open_trades_cap: 100,
        }
    }
}

impl StreamConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(v) = std::env::var("STREAM_WS_URL") {
            if !v.trim().is_empty() {
                config.ws_base_url = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("STREAM_API_URL") {
            if !v.trim().is_empty() {
                config.api_base_url = v.trim().trim_end_matches('/').to_string();
            }
        }
        config.api_token = std::env::var("STREAM_API_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty());

        if let Ok(v) = std::env::var("STREAM_BACKOFF") {
            config.backoff = v.parse().unwrap_or(config.backoff);
        }
        if let Ok(v) = std::env::var("STREAM_RECONNECT_BASE_MS") {
            config.reconnect_base_ms = v.parse().unwrap_or(config.reconnect_base_ms);
        }
        if let Ok(v) = std::env::var("STREAM_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v.parse().unwrap_or(config.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("STREAM_RECONNECT_MAX_ATTEMPTS") {
            config.max_reconnect_attempts = v.parse().unwrap_or(config.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("STREAM_HEARTBEAT_MS") {
            config.heartbeat_interval_ms = v
                .parse::<u64>()
                .ok()
                .filter(|&ms| ms > 0)
                .unwrap_or(config.heartbeat_interval_ms);
        }
        if let Ok(v) = std::env::var("STREAM_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().unwrap_or(config.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("STREAM_REFRESH_DEBOUNCE_MS") {
            config.refresh_debounce_ms = v.parse().unwrap_or(config.refresh_debounce_ms);
        }
        if let Ok(v) = std::env::var("STREAM_REFRESH_INTERVAL_SECS") {
            config.refresh_interval_secs = v.parse().unwrap_or(config.refresh_interval_secs);
        }
        if let Ok(v) = std::env::var("STREAM_ALL_TRADES_CAP") {
            config.all_trades_cap = v
                .parse::<usize>()
                .ok()
                .filter(|&cap| cap > 0)
                .unwrap_or(config.all_trades_cap);
        }
        if let Ok(v) = std::env::var("STREAM_OPEN_TRADES_CAP") {
            config.open_trades_cap = v
                .parse::<usize>()
                .ok()
                .filter(|&cap| cap > 0)
                .unwrap_or(config.open_trades_cap);
        }

        config
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_dashboard_caps() {
        let config = StreamConfig::default();
        assert_eq!(config.backoff, BackoffKind::Linear);
        assert_eq!(config.all_trades_cap, 200);
        assert_eq!(config.open_trades_cap, 100);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_kind_parse() {
        assert_eq!("linear".parse::<BackoffKind>().unwrap(), BackoffKind::Linear);
        assert_eq!(" EXP ".parse::<BackoffKind>().unwrap(), BackoffKind::Exponential);
        assert!("fibonacci".parse::<BackoffKind>().is_err());
    }
}
