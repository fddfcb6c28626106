//! OpenConnect CSTP/DTLS wire protocol
//!
//! Payload types are shared by both channels. The TLS channel frames every
//! payload with an 8-byte header, the DTLS channel with a single type byte.

use std::fmt;

pub mod framing;
pub mod negotiate;
pub mod pool;

pub use framing::{decode_dtls, decode_tls, encode_dtls, encode_tls};
pub use pool::{Payload, PayloadPool, BUFFER_SIZE};

// Protocol constants
pub mod constants {
    /// `S` `T` `F` `0x01`
    pub const TLS_MAGIC: [u8; 4] = [0x53, 0x54, 0x46, 0x01];
    pub const TLS_HEADER_LEN: usize = 8;
    /// Largest MTU whose TLS frames fit a pooled buffer
    pub const MAX_MTU: usize = super::BUFFER_SIZE - TLS_HEADER_LEN;
    pub const MIN_MTU: usize = 576;
    pub const DTLS_HEADER_LEN: usize = 1;
    pub const TUNNEL_PATH: &str = "/CSCOSSLC/tunnel";
    pub const DEFAULT_PORT: u16 = 443;
    pub const DNS_PORT: u16 = 53;
    /// DTLS 1.2 protocol version, prefixed to the pre-master secret
    pub const DTLS12_VERSION: [u8; 2] = [0xFE, 0xFD];
    pub const MASTER_SECRET_LEN: usize = 48;
}

/// The available payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PayloadType {
    /// IPv4 or IPv6 packet
    #[default]
    Data = 0x00,
    DpdRequest = 0x03,
    DpdResponse = 0x04,
    Disconnect = 0x05,
    Keepalive = 0x07,
    Compressed = 0x08,
    Terminate = 0x09,
}

impl PayloadType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_data(self) -> bool {
        self == PayloadType::Data
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PayloadType::Data),
            0x03 => Ok(PayloadType::DpdRequest),
            0x04 => Ok(PayloadType::DpdResponse),
            0x05 => Ok(PayloadType::Disconnect),
            0x07 => Ok(PayloadType::Keepalive),
            0x08 => Ok(PayloadType::Compressed),
            0x09 => Ok(PayloadType::Terminate),
            other => Err(other),
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadType::Data => "DATA",
            PayloadType::DpdRequest => "DPD-REQ",
            PayloadType::DpdResponse => "DPD-RESP",
            PayloadType::Disconnect => "DISCONNECT",
            PayloadType::Keepalive => "KEEPALIVE",
            PayloadType::Compressed => "COMPRESSED",
            PayloadType::Terminate => "TERMINATE",
        };
        f.write_str(name)
    }
}
