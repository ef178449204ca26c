//! Channel configuration
//!
//! Defaults match a stock Godot editor: the debug adapter listens on 6006 and
//! the editor plugin dials back to the bridge on 6505. Every field can be
//! overridden from the environment.

use crate::error::{BridgeError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the debug adapter (DAP) channel
#[derive(Debug, Clone)]
pub struct DapConfig {
    /// Host the Godot debug adapter listens on (default: 127.0.0.1)
    pub host: String,
    /// Debug adapter port (default: 6006)
    pub port: u16,
    /// Deadline for the TCP connect
    pub connect_timeout: Duration,
    /// Deadline for each request
    pub request_timeout: Duration,
    /// How long a graceful disconnect waits for the peer to close
    pub disconnect_grace: Duration,
    /// Captured output lines kept for polling
    pub output_capacity: usize,
}

impl Default for DapConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6006,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(1),
            output_capacity: 1000,
        }
    }
}

impl DapConfig {
    /// `host:port` of the debug adapter
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for the editor plugin (WebSocket) channel
#[derive(Debug, Clone)]
pub struct EditorConfig {
    /// Address to bind the WebSocket server to (default: 127.0.0.1)
    pub host: String,
    /// WebSocket port (default: 6505)
    pub port: u16,
    /// How long a request waits for the editor plugin to connect
    pub connect_timeout: Duration,
    /// Deadline for each request
    pub request_timeout: Duration,
    /// Deadline for the HTTP upgrade handshake of an inbound peer
    pub handshake_timeout: Duration,
    /// Ping interval while connected; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Captured output lines kept for polling
    pub output_capacity: usize,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6505,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Some(Duration::from_secs(10)),
            output_capacity: 1000,
        }
    }
}

impl EditorConfig {
    /// `host:port` the server binds to
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for both channels
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub dap: DapConfig,
    pub editor: EditorConfig,
}

impl BridgeConfig {
    /// Defaults overridden by `GODOT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("GODOT_DAP_HOST") {
            config.dap.host = host;
        }
        if let Some(port) = parse_var(&lookup, "GODOT_DAP_PORT")? {
            config.dap.port = port;
        }
        if let Some(host) = lookup("GODOT_EDITOR_HOST") {
            config.editor.host = host;
        }
        if let Some(port) = parse_var(&lookup, "GODOT_EDITOR_PORT")? {
            config.editor.port = port;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "GODOT_REQUEST_TIMEOUT_MS")? {
            config.dap.request_timeout = Duration::from_millis(ms);
            config.editor.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "GODOT_CONNECT_TIMEOUT_MS")? {
            config.dap.connect_timeout = Duration::from_millis(ms);
            config.editor.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "GODOT_HEARTBEAT_INTERVAL_MS")? {
            // 0 turns heartbeats off
            config.editor.heartbeat_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(capacity) = parse_var::<usize, _>(&lookup, "GODOT_OUTPUT_CAPACITY")? {
            config.dap.output_capacity = capacity;
            config.editor.output_capacity = capacity;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            BridgeError::InvalidArguments(format!("{}={:?}: {}", key, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.dap.address(), "127.0.0.1:6006");
        assert_eq!(config.editor.address(), "127.0.0.1:6505");
        assert_eq!(config.dap.output_capacity, 1000);
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("GODOT_DAP_PORT", "7007"),
            ("GODOT_EDITOR_HOST", "0.0.0.0"),
            ("GODOT_REQUEST_TIMEOUT_MS", "1500"),
            ("GODOT_HEARTBEAT_INTERVAL_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.dap.port, 7007);
        assert_eq!(config.editor.host, "0.0.0.0");
        assert_eq!(config.dap.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.editor.request_timeout, Duration::from_millis(1500));
        assert!(config.editor.heartbeat_interval.is_none());
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("GODOT_DAP_PORT", "sixty")]))
            .unwrap_err();
        assert!(err.to_string().contains("GODOT_DAP_PORT"));
    }
}
