use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub webrtc: WebRtcConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed to open the signalling WebSocket. Empty means any
    /// origin is accepted.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN/TURN urls handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Deadline for one SDP negotiation round.
    pub sdp_timeout_seconds: u64,
    /// Interval between PLI keyframe requests per published video track.
    pub keyframe_interval_seconds: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            sdp_timeout_seconds: 10,
            keyframe_interval_seconds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum buffered outbound signalling messages per client before the
    /// connection is dropped as a slow consumer.
    pub outbound_queue: usize,
    /// How long a graceful shutdown waits for clients to drain.
    pub shutdown_grace_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            shutdown_grace_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" for development, "json" for production.
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional `ssfu.toml` (path
    /// overridable via `SSFU_CONFIG`) and `SSFU_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("SSFU_CONFIG").unwrap_or_else(|_| "ssfu.toml".to_string());

        let builder = ConfigBuilder::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("SSFU").separator("__"))
            .build()?;

        builder.try_deserialize()
    }

    /// Validate the configuration, collecting every problem so misconfigured
    /// deployments fail fast with a complete report.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.listen_address().parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.host/server.port do not form a bindable address: {:?}",
                self.listen_address()
            ));
        }
        if self.webrtc.sdp_timeout_seconds == 0 {
            errors.push("webrtc.sdp_timeout_seconds must be non-zero".to_string());
        }
        if self.webrtc.keyframe_interval_seconds == 0 {
            errors.push("webrtc.keyframe_interval_seconds must be non-zero".to_string());
        }
        if self.transport.outbound_queue == 0 {
            errors.push("transport.outbound_queue must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    #[must_use]
    pub fn sdp_timeout(&self) -> Duration {
        Duration::from_secs(self.webrtc.sdp_timeout_seconds)
    }

    #[must_use]
    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_secs(self.webrtc.keyframe_interval_seconds)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.transport.shutdown_grace_seconds)
    }
}
