//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_RELAY__DRAIN_TIMEOUT_MS,
//!    ...; the double underscore separates section from key so multi-word
//!    keys stay intact)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub relay: RelayConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Default audio format sessions start with before any `configure` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    /// Whether the default pipeline validates PCM structure before echoing.
    pub validate_pcm: bool,
}

/// Relay behavior tuning.
///
/// ## Fields:
/// - `outbound_queue_capacity`: backpressure threshold of each session's send
///   queue; overflow drops the oldest queued frame
/// - `drain_timeout_ms`: how long a closing session may spend flushing its
///   queue before being force-closed
/// - `heartbeat_interval_secs`: how often the server pings idle connections
/// - `client_timeout_secs`: missing heartbeats for this long closes the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub outbound_queue_capacity: usize,
    pub drain_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl RelayConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of concurrent relay sessions; further connection
    /// attempts are refused at the acceptor.
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8765,
            },
            audio: AudioConfig {
                sample_rate: 16000, // 16kHz mono 16-bit PCM, the usual voice format
                channels: 1,
                bit_depth: 16,
                validate_pcm: false,
            },
            relay: RelayConfig {
                outbound_queue_capacity: 64,
                drain_timeout_ms: 3000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and APP_* environment
    /// variables, in that priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: override server host
    /// - `APP_RELAY__DRAIN_TIMEOUT_MS=1000`: override the drain timeout
    /// - `HOST` / `PORT`: special cases used by deployment platforms
    pub fn load() -> Result<Self> {
        // Section and key are joined by a double underscore; a single
        // underscore would split multi-word keys like drain_timeout_ms.
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms commonly inject bare HOST/PORT variables that
        // don't follow the APP_ prefix convention.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense. Catching these at
    /// startup beats failing on the first connection.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.outbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Outbound queue capacity must be greater than 0"));
        }

        if self.relay.drain_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Drain timeout must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs >= self.relay.client_timeout_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be shorter than the client timeout"
            ));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate cannot be 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config updates via the
    /// HTTP surface). Only the fields present in the JSON are touched; the
    /// result is re-validated before being accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(rate) = audio.get("sample_rate").and_then(|v| v.as_u64()) {
                self.audio.sample_rate = rate as u32;
            }
            if let Some(channels) = audio.get("channels").and_then(|v| v.as_u64()) {
                self.audio.channels = channels as u8;
            }
            if let Some(bits) = audio.get("bit_depth").and_then(|v| v.as_u64()) {
                self.audio.bit_depth = bits as u8;
            }
            if let Some(validate) = audio.get("validate_pcm").and_then(|v| v.as_bool()) {
                self.audio.validate_pcm = validate;
            }
        }

        if let Some(relay) = partial.get("relay") {
            if let Some(capacity) = relay.get("outbound_queue_capacity").and_then(|v| v.as_u64()) {
                self.relay.outbound_queue_capacity = capacity as usize;
            }
            if let Some(timeout) = relay.get("drain_timeout_ms").and_then(|v| v.as_u64()) {
                self.relay.drain_timeout_ms = timeout;
            }
            if let Some(interval) = relay.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.relay.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = relay.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.relay.client_timeout_secs = timeout;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8765);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.heartbeat_interval_secs = 120;
        config.relay.client_timeout_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_reaches_multi_word_key() {
        env::set_var("APP_RELAY__DRAIN_TIMEOUT_MS", "1234");
        let config = AppConfig::load().unwrap();
        env::remove_var("APP_RELAY__DRAIN_TIMEOUT_MS");

        assert_eq!(config.relay.drain_timeout_ms, 1234);
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"relay": {"drain_timeout_ms": 500}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.relay.drain_timeout_ms, 500);
        // Untouched fields keep their values.
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
