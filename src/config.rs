//! Konfiguration des Call-Cores
//!
//! Standardwerte, Überschreibung per Umgebungsvariablen (`SIGNALING_URL`,
//! `CALL_*`, `TURN_*`) oder per JSON-Datei.

use crate::ice::IceConfig;
use crate::media::MediaConstraints;
use crate::monitor::MonitorConfig;
use crate::peer::default_ice_servers;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default Signaling URL (lokaler Relay)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787/relay";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config file: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

// ============================================================================
// ICE SERVER
// ============================================================================

/// STUN/TURN Server wie in `RTCIceServer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub gathering_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub stats_poll_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Wie lange ein eingehender Anruf klingelt, bevor er verworfen wird
    pub ring_timeout_ms: u64,
    /// Aufnahme automatisch starten sobald verbunden
    pub auto_record: bool,
    pub media: MediaConstraints,
    /// Neuer Anruf beendet den aktiven, statt abgelehnt zu werden
    pub replace_active_call: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        let ice = IceConfig::default();
        let monitor = MonitorConfig::default();
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            gathering_timeout_ms: ice.gathering_timeout.as_millis() as u64,
            connection_timeout_ms: ice.connection_timeout.as_millis() as u64,
            stats_poll_interval_ms: monitor.poll_interval.as_millis() as u64,
            max_reconnect_attempts: monitor.max_reconnect_attempts,
            reconnect_base_delay_ms: monitor.base_delay.as_millis() as u64,
            reconnect_max_delay_ms: monitor.max_delay.as_millis() as u64,
            ring_timeout_ms: 45_000,
            auto_record: false,
            media: MediaConstraints::default(),
            replace_active_call: false,
        }
    }
}

impl CallConfig {
    /// Liest die Konfiguration aus den Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Liest eine JSON-Konfiguration; fehlende Felder behalten ihren Standardwert
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Wie `from_env`, aber mit beliebiger Quelle für die Variablen
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(ms) = parse_ms(&lookup, "CALL_GATHERING_TIMEOUT_MS")? {
            config.gathering_timeout_ms = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "CALL_CONNECTION_TIMEOUT_MS")? {
            config.connection_timeout_ms = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "CALL_RING_TIMEOUT_MS")? {
            config.ring_timeout_ms = ms;
        }
        if let Some(url) = lookup("TURN_URL") {
            config.ice_servers.push(IceServerConfig {
                urls: vec![url],
                username: lookup("TURN_USERNAME"),
                credential: lookup("TURN_CREDENTIAL"),
            });
        }

        Ok(config)
    }

    pub fn ice_config(&self) -> IceConfig {
        IceConfig {
            gathering_timeout: Duration::from_millis(self.gathering_timeout_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
        }
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.stats_poll_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            ..MonitorConfig::default()
        }
    }
}

fn parse_ms<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.gathering_timeout_ms, 10_000);
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.ring_timeout(), Duration::from_secs(45));
        assert!(!config.replace_active_call);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn test_env_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            ("SIGNALING_URL", "wss://relay.example.org/ws"),
            ("CALL_GATHERING_TIMEOUT_MS", "2500"),
            ("CALL_RING_TIMEOUT_MS", "20000"),
            ("TURN_URL", "turn:turn.example.org:3478"),
            ("TURN_USERNAME", "alice"),
            ("TURN_CREDENTIAL", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.signaling_url, "wss://relay.example.org/ws");
        assert_eq!(config.ice_config().gathering_timeout, Duration::from_millis(2500));
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert_eq!(config.ring_timeout_ms, 20_000);

        let turn = config.ice_servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(turn.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_invalid_timeout_is_rejected() {
        let err = CallConfig::from_lookup(lookup(&[("CALL_CONNECTION_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_json_keeps_missing_defaults() {
        let config = CallConfig::from_json(
            r#"{"replace_active_call": true, "media": {"echoCancellation": false}}"#,
        )
        .unwrap();

        assert!(config.replace_active_call);
        assert!(!config.media.echo_cancellation);
        assert!(config.media.noise_suppression);
        assert_eq!(config.gathering_timeout_ms, 10_000);
    }
}
