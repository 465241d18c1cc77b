// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the neorest message runtime server.
#[derive(Debug, Clone, clap::Parser)]
pub struct NeorestConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "NEOREST_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9800, env = "NEOREST_PORT")]
    pub port: u16,

    /// Retry-timer scan tick, in milliseconds.
    #[arg(long, default_value_t = 10, env = "NEOREST_RETRY_SCAN_MS")]
    pub retry_scan_ms: u64,

    /// Age at which an unacknowledged outbound envelope is re-sent.
    #[arg(long, default_value_t = 3000, env = "NEOREST_RETRY_DEADLINE_MS")]
    pub retry_deadline_ms: u64,

    /// Ping round length: how long to wait for a pong before closing.
    #[arg(long, default_value_t = 5000, env = "NEOREST_PING_ROUND_MS")]
    pub ping_round_ms: u64,

    /// Back-off between ping rounds while disconnected.
    #[arg(long, default_value_t = 100, env = "NEOREST_PING_BACKOFF_MS")]
    pub ping_backoff_ms: u64,

    /// Server-side grace window after a transport close before `onClose` fires.
    #[arg(long, default_value_t = 5000, env = "NEOREST_CLOSE_GRACE_MS")]
    pub close_grace_ms: u64,

    /// Client-side delay before attempting a reconnect after a close.
    #[arg(long, default_value_t = 500, env = "NEOREST_RECONNECT_RETRY_MS")]
    pub reconnect_retry_ms: u64,

    /// HTTP poll loop interval.
    #[arg(long, default_value_t = 1000, env = "NEOREST_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Rate-limit window length.
    #[arg(long, default_value_t = 1000, env = "NEOREST_RATE_WINDOW_MS")]
    pub rate_window_ms: u64,

    /// Rate-limit threshold: route sends per window before the soft 429
    /// notice fires. The send itself still proceeds (advisory limiter).
    #[arg(long, default_value_t = 100, env = "NEOREST_RATE_LIMIT")]
    pub rate_limit: u32,
}

impl NeorestConfig {
    pub fn retry_scan_interval(&self) -> Duration {
        Duration::from_millis(self.retry_scan_ms)
    }

    pub fn retry_deadline(&self) -> Duration {
        Duration::from_millis(self.retry_deadline_ms)
    }

    pub fn ping_round(&self) -> Duration {
        Duration::from_millis(self.ping_round_ms)
    }

    pub fn ping_backoff(&self) -> Duration {
        Duration::from_millis(self.ping_backoff_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn reconnect_retry(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

impl Default for NeorestConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9800,
            retry_scan_ms: 10,
            retry_deadline_ms: 3000,
            ping_round_ms: 5000,
            ping_backoff_ms: 100,
            close_grace_ms: 5000,
            reconnect_retry_ms: 500,
            poll_interval_ms: 1000,
            rate_window_ms: 1000,
            rate_limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_parsing_with_no_args_produces_documented_defaults() {
        let cfg = NeorestConfig::parse_from(["neorest"]);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9800);
        assert_eq!(cfg.rate_limit, 100);
    }

    #[test]
    fn cli_parsing_overrides_defaults() {
        let cfg = NeorestConfig::parse_from(["neorest", "--host", "0.0.0.0", "--port", "9900"]);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9900);
    }

    #[test]
    fn defaults_match_the_documented_numbers() {
        let cfg = NeorestConfig::default();
        assert_eq!(cfg.retry_scan_interval(), Duration::from_millis(10));
        assert_eq!(cfg.retry_deadline(), Duration::from_millis(3000));
        assert_eq!(cfg.ping_round(), Duration::from_millis(5000));
        assert_eq!(cfg.close_grace(), Duration::from_millis(5000));
        assert_eq!(cfg.reconnect_retry(), Duration::from_millis(500));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1000));
        assert_eq!(cfg.rate_window(), Duration::from_millis(1000));
        assert_eq!(cfg.rate_limit, 100);
    }
}
