// CSTP framing for the TLS and DTLS channels.
//
// TLS frame:  53 54 46 01 | length (u16 BE) | type | 00 | payload
// DTLS frame: type | payload
//
// Encoding and decoding work in place on the payload buffer so that pooled
// buffers keep their capacity across the round trip.

use super::constants::{DTLS_HEADER_LEN, TLS_HEADER_LEN, TLS_MAGIC};
use super::{Payload, PayloadType};
use crate::error::{Result, VpnError};

/// Validate a TLS frame header and return `(type byte, payload length)`
pub fn parse_tls_header(header: &[u8]) -> Result<(u8, usize)> {
    if header.len() < TLS_HEADER_LEN {
        return Err(VpnError::Protocol(format!(
            "TLS frame header too short: {} bytes",
            header.len()
        )));
    }
    if header[..4] != TLS_MAGIC {
        return Err(VpnError::Protocol(format!(
            "Invalid TLS frame magic: {}",
            hex::encode(&header[..4])
        )));
    }
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    Ok((header[6], length))
}

fn payload_type(byte: u8) -> Result<PayloadType> {
    PayloadType::try_from(byte)
        .map_err(|b| VpnError::Protocol(format!("Unknown payload type: {b:#04x}")))
}

/// Strip the 8-byte header from a received TLS frame
pub fn decode_tls(pl: &mut Payload) -> Result<()> {
    let (type_byte, length) = parse_tls_header(&pl.data)?;
    pl.ptype = payload_type(type_byte)?;

    if pl.ptype.is_data() {
        let end = TLS_HEADER_LEN + length;
        if end > pl.data.len() {
            return Err(VpnError::Protocol(format!(
                "TLS frame truncated: header says {length} bytes, got {}",
                pl.data.len() - TLS_HEADER_LEN
            )));
        }
        pl.data.copy_within(TLS_HEADER_LEN..end, 0);
        pl.data.truncate(length);
    } else {
        pl.data.clear();
    }
    Ok(())
}

/// Prefix a payload with the 8-byte header, control payloads become header only
pub fn encode_tls(pl: &mut Payload) -> Result<()> {
    if pl.ptype.is_data() {
        let length = pl.data.len();
        let wire_len = u16::try_from(length).map_err(|_| {
            VpnError::Protocol(format!("Payload of {length} bytes does not fit a TLS frame"))
        })?;
        pl.data.resize(length + TLS_HEADER_LEN, 0);
        pl.data.copy_within(0..length, TLS_HEADER_LEN);
        pl.data[..4].copy_from_slice(&TLS_MAGIC);
        pl.data[4..6].copy_from_slice(&wire_len.to_be_bytes());
        pl.data[6] = PayloadType::Data.as_byte();
        pl.data[7] = 0x00;
    } else {
        pl.data.clear();
        pl.data.extend_from_slice(&TLS_MAGIC);
        pl.data.extend_from_slice(&[0x00, 0x00, pl.ptype.as_byte(), 0x00]);
    }
    Ok(())
}

/// Strip the type byte from a received DTLS datagram
pub fn decode_dtls(pl: &mut Payload) -> Result<()> {
    let Some(&type_byte) = pl.data.first() else {
        return Err(VpnError::Protocol("Empty DTLS datagram".to_string()));
    };
    pl.ptype = payload_type(type_byte)?;

    if pl.ptype.is_data() {
        let length = pl.data.len() - DTLS_HEADER_LEN;
        pl.data.copy_within(DTLS_HEADER_LEN.., 0);
        pl.data.truncate(length);
    } else {
        pl.data.clear();
    }
    Ok(())
}

/// Prefix a payload with the DTLS type byte, control payloads become one byte
pub fn encode_dtls(pl: &mut Payload) {
    if pl.ptype.is_data() {
        let length = pl.data.len();
        pl.data.resize(length + DTLS_HEADER_LEN, 0);
        pl.data.copy_within(0..length, DTLS_HEADER_LEN);
        pl.data[0] = PayloadType::Data.as_byte();
    } else {
        pl.data.clear();
        pl.data.push(pl.ptype.as_byte());
    }
}
