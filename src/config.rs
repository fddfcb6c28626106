//! Configuration module for the SSL-VPN client
//!
//! This module provides TOML-based configuration parsing and validation
//! plus the connection [`Profile`] handed in by the front-end.

use crate::error::{Result, VpnError};
use crate::protocol::constants::{MAX_MTU, MIN_MTU};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Client behaviour switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Skip server certificate verification
    #[serde(default)]
    pub skip_verify: bool,
    /// Identify as AnyConnect towards the gateway
    #[serde(default = "default_true")]
    pub cisco_compat: bool,
    /// Never negotiate the DTLS channel
    #[serde(default)]
    pub no_dtls: bool,
    /// Keep LAN traffic outside the tunnel
    #[serde(default = "default_true")]
    pub allow_lan: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            skip_verify: false,
            cisco_compat: true,
            no_dtls: false,
            allow_lan: true,
        }
    }
}

/// Tunnel data-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// MTU advertised in the CONNECT request
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Name of the TUN interface (platform may override, e.g. utun)
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
    /// Reserved header bytes on TUN read/write, `None` picks the platform default
    #[serde(default)]
    pub tun_offset: Option<usize>,
    /// Capacity of each packet queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// DTLS dial plus handshake timeout in seconds
    #[serde(default = "default_dtls_timeout")]
    pub dtls_handshake_timeout: u64,
    /// Read deadline refresh tick in seconds
    #[serde(default = "default_read_deadline_tick")]
    pub read_deadline_tick: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            tun_name: default_tun_name(),
            tun_offset: None,
            queue_capacity: default_queue_capacity(),
            dtls_handshake_timeout: default_dtls_timeout(),
            read_deadline_tick: default_read_deadline_tick(),
        }
    }
}

impl TunnelSettings {
    /// Header offset applied symmetrically on TUN read and write
    pub fn header_offset(&self) -> usize {
        self.tun_offset.unwrap_or(if cfg!(target_os = "macos") { 4 } else { 0 })
    }

    pub fn dtls_timeout(&self) -> Duration {
        Duration::from_secs(self.dtls_handshake_timeout)
    }

    pub fn read_deadline_interval(&self) -> Duration {
        Duration::from_secs(self.read_deadline_tick)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Dump raw negotiation headers at debug level
    #[serde(default)]
    pub dump_headers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dump_headers: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client behaviour
    #[serde(default)]
    pub client: ClientConfig,
    /// Tunnel settings
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mtu = self.tunnel.mtu as usize;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(VpnError::Config(format!(
                "MTU must be between {MIN_MTU} and {MAX_MTU}"
            )));
        }

        if self.tunnel.tun_name.is_empty() || self.tunnel.tun_name.len() >= 16 {
            return Err(VpnError::Config(
                "TUN name must be between 1 and 15 characters".to_string(),
            ));
        }

        if self.tunnel.queue_capacity == 0 {
            return Err(VpnError::Config(
                "Queue capacity cannot be zero".to_string(),
            ));
        }

        if self.tunnel.dtls_handshake_timeout == 0 || self.tunnel.read_deadline_tick == 0 {
            return Err(VpnError::Config(
                "Timers must be at least one second".to_string(),
            ));
        }

        if log::LevelFilter::from_str(&self.logging.level).is_err() {
            return Err(VpnError::Config(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VpnError::Config(format!("Failed to parse TOML: {e}")))
    }
}

/// Connection profile supplied by the front-end on every connect
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Gateway host, optionally with `:port`
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub group: String,
    #[serde(default, rename = "secret")]
    pub secret_key: String,
}

impl Profile {
    /// Host with the HTTPS port appended when missing
    pub fn host_with_port(&self) -> String {
        if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:443", self.host)
        }
    }

    /// Host without port, used for SNI
    pub fn hostname(&self) -> &str {
        self.host.split(':').next().unwrap_or(&self.host)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(VpnError::Config("Server host cannot be empty".to_string()));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_mtu() -> u16 {
    1399
}

fn default_tun_name() -> String {
    if cfg!(target_os = "windows") {
        "SSLCon".to_string()
    } else if cfg!(target_os = "macos") {
        "utun".to_string()
    } else {
        "sslcon".to_string()
    }
}

fn default_queue_capacity() -> usize {
    64
}

fn default_dtls_timeout() -> u64 {
    10
}

fn default_read_deadline_tick() -> u64 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_parsing() {
        let toml_content = r#"
[client]
skip_verify = true
no_dtls = true

[tunnel]
mtu = 1400
queue_capacity = 128

[logging]
level = "debug"
"#;

        let config = toml_content
            .parse::<Config>()
            .expect("Failed to parse config");
        assert!(config.client.skip_verify);
        assert!(config.client.no_dtls);
        assert!(config.client.cisco_compat);
        assert_eq!(config.tunnel.mtu, 1400);
        assert_eq!(config.tunnel.queue_capacity, 128);
        assert_eq!(config.tunnel.dtls_handshake_timeout, 10);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.tunnel.mtu = 100;
        assert!(config.validate().is_err());

        config.tunnel.mtu = 1500;
        assert!(config.validate().is_ok());
        config.tunnel.mtu = 2040;
        assert!(config.validate().is_ok());
        config.tunnel.mtu = 2041;
        assert!(config.validate().is_err());

        config.tunnel.mtu = 1399;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file_and_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tunnel]\ntun_name = \"vpn0\"\ntun_offset = 4").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.tunnel.tun_name, "vpn0");
        assert_eq!(config.tunnel.header_offset(), 4);

        let round = config.to_toml().unwrap().parse::<Config>().unwrap();
        assert_eq!(round.tunnel.tun_name, "vpn0");
    }

    #[test]
    fn test_profile_host_with_port() {
        let profile = Profile {
            host: "vpn.example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(profile.host_with_port(), "vpn.example.com:443");
        assert_eq!(profile.hostname(), "vpn.example.com");

        let profile = Profile {
            host: "vpn.example.com:8443".to_string(),
            ..Default::default()
        };
        assert_eq!(profile.host_with_port(), "vpn.example.com:8443");
        assert_eq!(profile.hostname(), "vpn.example.com");
        assert!(Profile::default().validate().is_err());
    }
}
