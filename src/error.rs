//! Error types and handling for the SSL-VPN tunnel core

use thiserror::Error;

/// Main error type for VPN operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network connectivity errors
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication errors reported by the authenticator
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Framing and wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tunnel negotiation rejected or malformed
    #[error("Tunnel negotiation failed: {0}")]
    Negotiation(String),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// DTLS dial and handshake errors
    #[error("DTLS error: {0}")]
    Dtls(String),

    /// TUN interface errors
    #[error("TUN error: {0}")]
    TunTap(String),

    /// Routing errors
    #[error("Routing error: {0}")]
    Routing(String),

    /// DNS configuration errors
    #[error("DNS error: {0}")]
    Dns(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias for VPN operations
pub type Result<T> = std::result::Result<T, VpnError>;

// Implement From for common error types
impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<rustls::Error> for VpnError {
    fn from(err: rustls::Error) -> Self {
        VpnError::Tls(format!("TLS error: {err}"))
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(err: serde_json::Error) -> Self {
        VpnError::Other(format!("JSON error: {err}"))
    }
}

impl From<hex::FromHexError> for VpnError {
    fn from(err: hex::FromHexError) -> Self {
        VpnError::Protocol(format!("Invalid hex value: {err}"))
    }
}
