//! rsslcon - OpenConnect/AnyConnect compatible SSL-VPN tunnel core
//!
//! The crate takes over once a front-end has authenticated against the
//! gateway: it negotiates the tunnel on the TLS connection, relays packets
//! between a TUN device and the gateway over CSTP (TLS) and, when offered,
//! DTLS, and supervises both channels until the session ends.
//!
//! ## What This Crate Provides
//! - Tunnel negotiation and CSTP/DTLS framing
//! - The pooled packet pipeline between the TUN device and both channels
//! - DTLS session resumption with fallback to TLS, dead peer detection, read
//!   deadlines
//! - Route planning, a Linux route controller and domain based split tunneling
//! - Configuration parsing and validation (TOML format)
//!
//! ## What The Embedding Application Provides
//! - Login ([`client::Authenticator`])
//! - Optionally its own TUN device, route controller and
//!   [`tunnel::dtls::DtlsConnector`]

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod tunnel;

pub use client::{Authenticator, CloseReason, VpnClient};
pub use config::{Config, Profile};
pub use error::{Result, VpnError};
pub use session::{ConnSession, Session};
pub use tunnel::{AuthenticatedConn, TunnelOrchestrator};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
