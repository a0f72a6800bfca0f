// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Connection settings shared by the request client and the event channel.
#[derive(Debug, Clone, clap::Args)]
pub struct ClientConfig {
    /// Base URL of the dashboard API (requests are resolved against it).
    #[arg(long, default_value = "http://127.0.0.1:8080/api", env = "DASHLINK_BASE_URL")]
    pub base_url: String,

    /// Push channel URL. Derived from the base URL origin (`ws(s)://host/ws`) when unset.
    #[arg(long, env = "DASHLINK_WS_URL")]
    pub ws_url: Option<String>,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value_t = 30000, env = "DASHLINK_TIMEOUT_MS")]
    pub timeout_ms: u64,

    /// Numeric response code the backend uses for an expired access token
    /// (the string code `TOKEN_EXPIRED` is always recognized).
    #[arg(long, default_value_t = 40101, env = "DASHLINK_EXPIRED_CODE")]
    pub expired_code: i64,

    /// Push channel open timeout in milliseconds.
    #[arg(long, default_value_t = 10000, env = "DASHLINK_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: u64,

    /// Heartbeat interval in milliseconds. An unanswered heartbeat marks the
    /// connection half-open.
    #[arg(long, default_value_t = 30000, env = "DASHLINK_HEARTBEAT_MS")]
    pub heartbeat_ms: u64,

    /// Max reconnect attempts after an unclean close before giving up.
    #[arg(long, default_value_t = 5, env = "DASHLINK_RECONNECT_ATTEMPTS")]
    pub reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts in milliseconds.
    #[arg(long, default_value_t = 5000, env = "DASHLINK_RECONNECT_DELAY_MS")]
    pub reconnect_delay_ms: u64,

    /// Directory for persisted credentials.
    #[arg(long, env = "DASHLINK_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

impl ClientConfig {
    /// Config pointing at `base_url` with default timings.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ws_url: None,
            timeout_ms: 30000,
            expired_code: 40101,
            connect_timeout_ms: 10000,
            heartbeat_ms: 30000,
            reconnect_attempts: 5,
            reconnect_delay_ms: 5000,
            state_dir: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("--base-url must be an http(s) URL, got {:?}", self.base_url);
        }
        if let Some(ref ws) = self.ws_url {
            if !ws.starts_with("ws://") && !ws.starts_with("wss://") {
                anyhow::bail!("--ws-url must be a ws(s) URL, got {ws:?}");
            }
        }
        if self.reconnect_attempts == 0 {
            anyhow::bail!("--reconnect-attempts must be at least 1");
        }
        if self.heartbeat_ms == 0 || self.timeout_ms == 0 || self.connect_timeout_ms == 0 {
            anyhow::bail!("timeouts and the heartbeat interval must be non-zero");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Resolve the push channel URL.
    pub fn push_url(&self) -> String {
        match self.ws_url {
            Some(ref url) => url.clone(),
            None => derive_ws_url(&self.base_url),
        }
    }

    /// Resolve the state directory for persisted credentials.
    ///
    /// Checks `--state-dir`, then `$XDG_STATE_HOME/dashlink`,
    /// then `$HOME/.local/state/dashlink`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("dashlink");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/state/dashlink");
        }
        PathBuf::from(".dashlink")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.state_dir().join("credentials.json")
    }
}

/// Build the push channel URL from the API base URL's origin.
fn derive_ws_url(base_url: &str) -> String {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else {
        base_url.replacen("http://", "ws://", 1)
    };
    // Keep scheme + authority, drop any API path prefix.
    let origin_end = ws_base
        .find("://")
        .and_then(|i| ws_base[i + 3..].find('/').map(|j| i + 3 + j))
        .unwrap_or(ws_base.len());
    format!("{}/ws", &ws_base[..origin_end])
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
