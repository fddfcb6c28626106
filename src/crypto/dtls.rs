//! DTLS 1.2 record protection and the messages of a resumed handshake
//!
//! AnyConnect gateways only accept an abbreviated handshake that resumes the
//! session agreed over CSTP. No key exchange happens, so all that is needed
//! is the TLS 1.2 PRF, the AES-GCM record layer and the hello / finished
//! messages.

use crate::error::{Result, VpnError};
use crate::protocol::constants::DTLS12_VERSION;

#[cfg(all(feature = "ring-crypto", not(feature = "aws-lc-crypto")))]
use ring::{aead, digest, hmac};

#[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
use aws_lc_rs::{aead, digest, hmac};

#[cfg(all(feature = "ring-crypto", feature = "aws-lc-crypto"))]
use ring::{aead, digest, hmac};

// Record content types
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

// Handshake message types
pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;
pub const HANDSHAKE_HELLO_VERIFY_REQUEST: u8 = 3;
pub const HANDSHAKE_FINISHED: u8 = 20;

pub const RECORD_HEADER_LEN: usize = 13;
pub const HANDSHAKE_HEADER_LEN: usize = 12;
pub const RANDOM_LEN: usize = 32;
pub const VERIFY_DATA_LEN: usize = 12;
const EXPLICIT_NONCE_LEN: usize = 8;
const TAG_LEN: usize = 16;
const FIXED_IV_LEN: usize = 4;

pub const CLIENT_FINISHED: &[u8] = b"client finished";
pub const SERVER_FINISHED: &[u8] = b"server finished";

/// Largest record overhead added by [`RecordCipher::seal`]
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_LEN + EXPLICIT_NONCE_LEN + TAG_LEN;

/// Hash behind the PRF and the handshake transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfHash {
    Sha256,
    Sha384,
}

impl PrfHash {
    fn hmac(self) -> hmac::Algorithm {
        match self {
            PrfHash::Sha256 => hmac::HMAC_SHA256,
            PrfHash::Sha384 => hmac::HMAC_SHA384,
        }
    }

    fn digest(self) -> &'static digest::Algorithm {
        match self {
            PrfHash::Sha256 => &digest::SHA256,
            PrfHash::Sha384 => &digest::SHA384,
        }
    }
}

/// TLS 1.2 PRF, `P_hash(secret, label + seed)` cut to `len` bytes
pub fn prf(hash: PrfHash, secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let key = hmac::Key::new(hash.hmac(), secret);
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let mut out = Vec::with_capacity(len + 48);
    let mut a = hmac::sign(&key, &label_seed).as_ref().to_vec();
    while out.len() < len {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&a);
        ctx.update(&label_seed);
        out.extend_from_slice(ctx.sign().as_ref());
        a = hmac::sign(&key, &a).as_ref().to_vec();
    }
    out.truncate(len);
    out
}

/// Write keys and implicit nonces of an AES-GCM suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlock {
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_iv: [u8; FIXED_IV_LEN],
    pub server_iv: [u8; FIXED_IV_LEN],
}

impl KeyBlock {
    pub fn derive(
        hash: PrfHash,
        key_len: usize,
        master_secret: &[u8],
        client_random: &[u8],
        server_random: &[u8],
    ) -> Self {
        let mut seed = Vec::with_capacity(2 * RANDOM_LEN);
        seed.extend_from_slice(server_random);
        seed.extend_from_slice(client_random);
        let block = prf(
            hash,
            master_secret,
            b"key expansion",
            &seed,
            2 * key_len + 2 * FIXED_IV_LEN,
        );

        let (client_key, rest) = block.split_at(key_len);
        let (server_key, rest) = rest.split_at(key_len);
        let mut client_iv = [0u8; FIXED_IV_LEN];
        let mut server_iv = [0u8; FIXED_IV_LEN];
        client_iv.copy_from_slice(&rest[..FIXED_IV_LEN]);
        server_iv.copy_from_slice(&rest[FIXED_IV_LEN..]);
        Self {
            client_key: client_key.to_vec(),
            server_key: server_key.to_vec(),
            client_iv,
            server_iv,
        }
    }
}

/// Handshake messages covered by the finished hashes
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<u8>,
}

impl Transcript {
    pub fn push(&mut self, raw_message: &[u8]) {
        self.messages.extend_from_slice(raw_message);
    }

    pub fn verify_data(&self, hash: PrfHash, master_secret: &[u8], label: &[u8]) -> Vec<u8> {
        let digest = digest::digest(hash.digest(), &self.messages);
        prf(hash, master_secret, label, digest.as_ref(), VERIFY_DATA_LEN)
    }
}

/// 64-bit record sequence number: epoch then 48-bit sequence
fn seq_num(epoch: u16, seq: u64) -> [u8; 8] {
    (((epoch as u64) << 48) | (seq & 0xFFFF_FFFF_FFFF)).to_be_bytes()
}

/// AES-GCM protection of one direction
pub struct RecordCipher {
    key: aead::LessSafeKey,
    fixed_iv: [u8; FIXED_IV_LEN],
}

impl RecordCipher {
    pub fn new(key: &[u8], fixed_iv: [u8; FIXED_IV_LEN]) -> Result<Self> {
        let algorithm = match key.len() {
            16 => &aead::AES_128_GCM,
            32 => &aead::AES_256_GCM,
            n => return Err(VpnError::Crypto(format!("Unsupported AES-GCM key length {n}"))),
        };
        let key = aead::UnboundKey::new(algorithm, key)
            .map_err(|e| VpnError::Crypto(format!("Invalid record key: {e:?}")))?;
        Ok(Self {
            key: aead::LessSafeKey::new(key),
            fixed_iv,
        })
    }

    fn nonce(&self, explicit: &[u8]) -> aead::Nonce {
        let mut nonce = [0u8; FIXED_IV_LEN + EXPLICIT_NONCE_LEN];
        nonce[..FIXED_IV_LEN].copy_from_slice(&self.fixed_iv);
        nonce[FIXED_IV_LEN..].copy_from_slice(explicit);
        aead::Nonce::assume_unique_for_key(nonce)
    }

    fn aad(content_type: u8, epoch: u16, seq: u64, len: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&seq_num(epoch, seq));
        aad[8] = content_type;
        aad[9..11].copy_from_slice(&DTLS12_VERSION);
        aad[11..].copy_from_slice(&(len as u16).to_be_bytes());
        aad
    }

    /// Encrypt `plaintext` into a complete record
    pub fn seal(
        &self,
        content_type: u8,
        epoch: u16,
        seq: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let explicit = seq_num(epoch, seq);
        let aad = Self::aad(content_type, epoch, seq, plaintext.len());

        let mut sealed = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(self.nonce(&explicit), aead::Aad::from(aad), &mut sealed)
            .map_err(|e| VpnError::Crypto(format!("Record encryption failed: {e:?}")))?;

        let mut body = Vec::with_capacity(EXPLICIT_NONCE_LEN + sealed.len());
        body.extend_from_slice(&explicit);
        body.extend_from_slice(&sealed);
        Ok(encode_record(content_type, epoch, seq, &body))
    }

    /// Decrypt the body of a protected record
    pub fn open(&self, record: &Record<'_>) -> Result<Vec<u8>> {
        if record.body.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
            return Err(VpnError::Dtls(format!(
                "Protected record too short: {} bytes",
                record.body.len()
            )));
        }
        let (explicit, sealed) = record.body.split_at(EXPLICIT_NONCE_LEN);
        let aad = Self::aad(
            record.content_type,
            record.epoch,
            record.seq,
            sealed.len() - TAG_LEN,
        );

        let mut in_out = sealed.to_vec();
        let len = self
            .key
            .open_in_place(self.nonce(explicit), aead::Aad::from(aad), &mut in_out)
            .map_err(|_| VpnError::Dtls("Record authentication failed".to_string()))?
            .len();
        in_out.truncate(len);
        Ok(in_out)
    }
}

/// One record of a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub content_type: u8,
    pub epoch: u16,
    pub seq: u64,
    pub body: &'a [u8],
}

pub fn encode_record(content_type: u8, epoch: u16, seq: u64, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    record.push(content_type);
    record.extend_from_slice(&DTLS12_VERSION);
    record.extend_from_slice(&seq_num(epoch, seq));
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(body);
    record
}

/// Split a datagram into its records
pub fn split_records(mut datagram: &[u8]) -> Result<Vec<Record<'_>>> {
    let mut records = Vec::new();
    while !datagram.is_empty() {
        if datagram.len() < RECORD_HEADER_LEN {
            return Err(VpnError::Dtls("Truncated record header".to_string()));
        }
        let epoch = u16::from_be_bytes([datagram[3], datagram[4]]);
        let mut seq = [0u8; 8];
        seq[2..].copy_from_slice(&datagram[5..11]);
        let len = u16::from_be_bytes([datagram[11], datagram[12]]) as usize;
        let end = RECORD_HEADER_LEN + len;
        if datagram.len() < end {
            return Err(VpnError::Dtls(format!(
                "Record claims {len} bytes, {} available",
                datagram.len() - RECORD_HEADER_LEN
            )));
        }
        records.push(Record {
            content_type: datagram[0],
            epoch,
            seq: u64::from_be_bytes(seq),
            body: &datagram[RECORD_HEADER_LEN..end],
        });
        datagram = &datagram[end..];
    }
    Ok(records)
}

/// Handshake message with its 12-byte header
pub fn handshake_message(msg_type: u8, message_seq: u16, body: &[u8]) -> Vec<u8> {
    let len = (body.len() as u32).to_be_bytes();
    let mut msg = Vec::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
    msg.push(msg_type);
    msg.extend_from_slice(&len[1..]);
    msg.extend_from_slice(&message_seq.to_be_bytes());
    msg.extend_from_slice(&[0, 0, 0]);
    msg.extend_from_slice(&len[1..]);
    msg.extend_from_slice(body);
    msg
}

/// A parsed handshake message; `raw` is what goes into the transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage<'a> {
    pub msg_type: u8,
    pub message_seq: u16,
    pub body: &'a [u8],
    pub raw: &'a [u8],
}

fn u24(b: &[u8]) -> usize {
    ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
}

/// Handshake messages of a record body. Fragmented messages are rejected.
pub fn split_handshake(mut body: &[u8]) -> Result<Vec<HandshakeMessage<'_>>> {
    let mut messages = Vec::new();
    while !body.is_empty() {
        if body.len() < HANDSHAKE_HEADER_LEN {
            return Err(VpnError::Dtls("Truncated handshake header".to_string()));
        }
        let len = u24(&body[1..4]);
        let offset = u24(&body[6..9]);
        let fragment = u24(&body[9..12]);
        if offset != 0 || fragment != len {
            return Err(VpnError::Dtls("Fragmented handshake message".to_string()));
        }
        let end = HANDSHAKE_HEADER_LEN + len;
        if body.len() < end {
            return Err(VpnError::Dtls("Truncated handshake message".to_string()));
        }
        messages.push(HandshakeMessage {
            msg_type: body[0],
            message_seq: u16::from_be_bytes([body[4], body[5]]),
            body: &body[HANDSHAKE_HEADER_LEN..end],
            raw: &body[..end],
        });
        body = &body[end..];
    }
    Ok(messages)
}

/// ClientHello asking to resume `session_id`
pub fn client_hello(
    random: &[u8; RANDOM_LEN],
    session_id: &[u8],
    cookie: &[u8],
    cipher_suites: &[u16],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(64 + session_id.len() + cookie.len());
    body.extend_from_slice(&DTLS12_VERSION);
    body.extend_from_slice(random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(session_id);
    body.push(cookie.len() as u8);
    body.extend_from_slice(cookie);
    body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
    for id in cipher_suites {
        body.extend_from_slice(&id.to_be_bytes());
    }
    // null compression only
    body.extend_from_slice(&[1, 0]);
    // empty renegotiation_info
    body.extend_from_slice(&[0x00, 0x05, 0xff, 0x01, 0x00, 0x01, 0x00]);
    body
}

/// Cookie of a HelloVerifyRequest
pub fn parse_hello_verify_request(body: &[u8]) -> Result<Vec<u8>> {
    let len = *body
        .get(2)
        .ok_or_else(|| VpnError::Dtls("Truncated HelloVerifyRequest".to_string()))?
        as usize;
    body.get(3..3 + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| VpnError::Dtls("Truncated HelloVerifyRequest cookie".to_string()))
}

/// Fields of a ServerHello the client acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
}

pub fn parse_server_hello(body: &[u8]) -> Result<ServerHello> {
    let truncated = || VpnError::Dtls("Truncated ServerHello".to_string());
    let random = body.get(2..2 + RANDOM_LEN).ok_or_else(truncated)?;
    let sid_len = *body.get(2 + RANDOM_LEN).ok_or_else(truncated)? as usize;
    let sid_start = 3 + RANDOM_LEN;
    let session_id = body.get(sid_start..sid_start + sid_len).ok_or_else(truncated)?;
    let suite = body
        .get(sid_start + sid_len..sid_start + sid_len + 2)
        .ok_or_else(truncated)?;

    let mut server_random = [0u8; RANDOM_LEN];
    server_random.copy_from_slice(random);
    Ok(ServerHello {
        random: server_random,
        session_id: session_id.to_vec(),
        cipher_suite: u16::from_be_bytes([suite[0], suite[1]]),
    })
}
