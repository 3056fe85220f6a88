// Signaling server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Everything the socket loop needs at runtime lives here so
// no module reads the environment after startup.

use std::net::SocketAddr;
use std::time::Duration;

/// Core signaling server configuration.
///
/// Constructed via [`SignalingConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `lumicast_signaling=debug`).
    pub log_filter: String,
    /// Max chat messages per sender per stream within the rate window.
    pub chat_rate_limit: u32,
    /// Length of the sliding chat rate window.
    pub chat_rate_window: Duration,
    /// Server ping cadence on live sockets.
    pub heartbeat_interval: Duration,
    /// How long a missing pong is tolerated before disconnecting.
    pub heartbeat_timeout: Duration,
    /// Largest accepted inbound WebSocket frame, in bytes. Recording chunks
    /// arrive base64-encoded, so this bounds chunk size too.
    pub max_frame_bytes: usize,
}

impl SignalingConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `LUMICAST_HOST` | `0.0.0.0` |
    /// | `LUMICAST_PORT` | `8080` |
    /// | `LUMICAST_LOG_FILTER` | `info` |
    /// | `LUMICAST_CHAT_RATE_LIMIT` | `5` |
    /// | `LUMICAST_CHAT_RATE_WINDOW_SECS` | `10` |
    /// | `LUMICAST_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `LUMICAST_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `LUMICAST_MAX_FRAME_BYTES` | `1048576` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("LUMICAST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("LUMICAST_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("LUMICAST_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let chat_rate_limit = env("LUMICAST_CHAT_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(5);
        let chat_rate_window_secs = env("LUMICAST_CHAT_RATE_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u64| *v > 0)
            .unwrap_or(10);

        let heartbeat_interval_ms = env("LUMICAST_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u64| *v > 0)
            .unwrap_or(15_000);
        let heartbeat_timeout_ms = env("LUMICAST_HEARTBEAT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u64| *v > 0)
            .unwrap_or(10_000);

        let max_frame_bytes = env("LUMICAST_MAX_FRAME_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &usize| *v > 0)
            .unwrap_or(1024 * 1024);

        Self {
            listen_addr,
            log_filter,
            chat_rate_limit,
            chat_rate_window: Duration::from_secs(chat_rate_window_secs),
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
            max_frame_bytes,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = SignalingConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.chat_rate_limit, 5);
        assert_eq!(cfg.chat_rate_window, Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(15_000));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_millis(10_000));
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("LUMICAST_HOST", "127.0.0.1");
        m.insert("LUMICAST_PORT", "3000");
        let cfg = SignalingConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("LUMICAST_PORT", "not_a_number");
        let cfg = SignalingConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn chat_rate_overrides() {
        let mut m = HashMap::new();
        m.insert("LUMICAST_CHAT_RATE_LIMIT", "20");
        m.insert("LUMICAST_CHAT_RATE_WINDOW_SECS", "60");
        let cfg = SignalingConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.chat_rate_limit, 20);
        assert_eq!(cfg.chat_rate_window, Duration::from_secs(60));
    }

    #[test]
    fn zero_rate_limit_falls_back_to_default() {
        let mut m = HashMap::new();
        m.insert("LUMICAST_CHAT_RATE_LIMIT", "0");
        let cfg = SignalingConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.chat_rate_limit, 5);
    }

    #[test]
    fn heartbeat_overrides() {
        let mut m = HashMap::new();
        m.insert("LUMICAST_HEARTBEAT_INTERVAL_MS", "5000");
        m.insert("LUMICAST_HEARTBEAT_TIMEOUT_MS", "2000");
        let cfg = SignalingConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(5000));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_millis(2000));
    }
}
