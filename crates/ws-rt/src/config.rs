//! Server configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 8080
//! idle_timeout_ms = 30000
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WsError};
use crate::frame::MAX_CONTROL_PAYLOAD;

pub const DEFAULT_PORT: u16 = 23949;

/// Configuration for the WebSocket server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default 23949, `0` for auto-assign).
    pub port: u16,
    /// Largest payload accepted in a single frame.
    pub max_frame_size: usize,
    /// Largest reassembled message.
    pub max_message_size: usize,
    /// Bytes requested from the socket per read.
    pub read_buffer_size: usize,
    /// Largest HTTP upgrade request accepted.
    pub max_handshake_bytes: usize,
    pub handshake_timeout_ms: u64,
    /// Close connections that send nothing for this long. Off by default.
    pub idle_timeout_ms: Option<u64>,
    /// How long `stop()` waits for connections to finish the close handshake
    /// before shutting their sockets down.
    pub shutdown_grace_ms: u64,
    /// Reject unmasked client frames with 1002.
    pub require_masked_frames: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            max_frame_size: 16 * 1024 * 1024,   // 16 MiB
            max_message_size: 16 * 1024 * 1024, // 16 MiB
            read_buffer_size: 4096,
            max_handshake_bytes: 8192,
            handshake_timeout_ms: 5_000,
            idle_timeout_ms: None,
            shutdown_grace_ms: 2_000,
            require_masked_frames: false,
        }
    }
}

impl ServerConfig {
    /// Defaults bound to `host:port`.
    pub fn bind(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<ServerConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WsError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML config.
    pub fn from_toml_str(content: &str) -> Result<ServerConfig> {
        let config: ServerConfig = toml::from_str(content)
            .map_err(|e| WsError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(WsError::Config("read_buffer_size must be non-zero".into()));
        }
        if self.max_handshake_bytes == 0 {
            return Err(WsError::Config("max_handshake_bytes must be non-zero".into()));
        }
        if self.max_frame_size < MAX_CONTROL_PAYLOAD {
            return Err(WsError::Config(format!(
                "max_frame_size must be at least {} bytes",
                MAX_CONTROL_PAYLOAD
            )));
        }
        if self.max_message_size < self.max_frame_size {
            return Err(WsError::Config(
                "max_message_size must not be smaller than max_frame_size".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` as passed to `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        // Bare IPv6 literals need brackets.
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parsed bind address, when `host` is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.bind_addr().parse().ok()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 23949);
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
        assert_eq!(cfg.idle_timeout(), None);
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(5));
        assert!(!cfg.require_masked_frames);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = ServerConfig::from_toml_str(
            r#"
port = 9001
idle_timeout_ms = 1500
require_masked_frames = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.idle_timeout(), Some(Duration::from_millis(1500)));
        assert!(cfg.require_masked_frames);
        assert_eq!(cfg.read_buffer_size, 4096);
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(ServerConfig::from_toml_str("").unwrap(), ServerConfig::default());
    }

    #[test]
    fn unknown_field_rejected() {
        let err = ServerConfig::from_toml_str("prot = 1").unwrap_err();
        assert!(matches!(err, WsError::Config(_)));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn validate_rejects_bad_limits() {
        let cfg = ServerConfig {
            read_buffer_size: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServerConfig {
            max_frame_size: 100,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServerConfig {
            max_frame_size: 1024,
            max_message_size: 512,
            ..ServerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_message_size"));
    }

    #[test]
    fn bind_addr_formats() {
        assert_eq!(ServerConfig::bind("127.0.0.1", 80).bind_addr(), "127.0.0.1:80");
        assert_eq!(ServerConfig::bind("::1", 80).bind_addr(), "[::1]:80");
        assert!(ServerConfig::bind("::1", 80).socket_addr().is_some());
        assert_eq!(ServerConfig::bind("localhost", 80).socket_addr(), None);
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host = \"127.0.0.1\"\nport = 0\nshutdown_grace_ms = 50").unwrap();
        let cfg = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.shutdown_grace(), Duration::from_millis(50));
    }

    #[test]
    fn from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
