//! The optional DTLS channel
//!
//! The handshake and record layer belong to a [`DtlsConnector`], by default
//! the [`ResumingConnector`]. This module dials the UDP socket, resumes the
//! session negotiated over CSTP through a [`ResumptionStore`], and runs the
//! datagram pumps. Any DTLS failure only closes the DTLS sub-session; traffic
//! then falls back to TLS.

use super::supervisor::read_deadline;
use crate::crypto::dtls::{
    client_hello, encode_record, handshake_message, parse_hello_verify_request,
    parse_server_hello, split_handshake, split_records, HandshakeMessage, KeyBlock, PrfHash,
    RecordCipher, Transcript, CLIENT_FINISHED, CONTENT_ALERT, CONTENT_APPLICATION_DATA,
    CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE, HANDSHAKE_CLIENT_HELLO, HANDSHAKE_FINISHED,
    HANDSHAKE_HELLO_VERIFY_REQUEST, HANDSHAKE_SERVER_HELLO, RANDOM_LEN, RECORD_OVERHEAD,
    SERVER_FINISHED,
};
use crate::crypto::SecretGenerator;
use crate::error::{Result, VpnError};
use crate::protocol::{decode_dtls, encode_dtls, Payload, PayloadType, BUFFER_SIZE};
use crate::session::ConnSession;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// DTLS 1.2 cipher suites a gateway may pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    EcdheEcdsaAes128GcmSha256,
    EcdheRsaAes128GcmSha256,
    EcdheEcdsaAes256GcmSha384,
    EcdheRsaAes256GcmSha384,
    /// Reported by ocserv for legacy resumption, decrypts like the ECDHE variant
    RsaAes128GcmSha256,
    RsaAes256GcmSha384,
}

impl CipherSuite {
    /// IANA identifier
    pub fn id(self) -> u16 {
        match self {
            CipherSuite::EcdheEcdsaAes128GcmSha256 => 0xc02b,
            CipherSuite::EcdheRsaAes128GcmSha256 => 0xc02f,
            CipherSuite::EcdheEcdsaAes256GcmSha384 => 0xc02c,
            CipherSuite::EcdheRsaAes256GcmSha384 => 0xc030,
            CipherSuite::RsaAes128GcmSha256 => 0x009c,
            CipherSuite::RsaAes256GcmSha384 => 0x009d,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|suite| suite.id() == id)
    }

    /// OpenSSL style name, as used in the negotiation headers
    pub fn openssl_name(self) -> &'static str {
        match self {
            CipherSuite::EcdheEcdsaAes128GcmSha256 => "ECDHE-ECDSA-AES128-GCM-SHA256",
            CipherSuite::EcdheRsaAes128GcmSha256 => "ECDHE-RSA-AES128-GCM-SHA256",
            CipherSuite::EcdheEcdsaAes256GcmSha384 => "ECDHE-ECDSA-AES256-GCM-SHA384",
            CipherSuite::EcdheRsaAes256GcmSha384 => "ECDHE-RSA-AES256-GCM-SHA384",
            CipherSuite::RsaAes128GcmSha256 => "AES128-GCM-SHA256",
            CipherSuite::RsaAes256GcmSha384 => "AES256-GCM-SHA384",
        }
    }

    pub fn from_openssl_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|suite| suite.openssl_name().eq_ignore_ascii_case(name.trim()))
    }

    /// IANA name, e.g. `TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256`
    pub fn iana_name(self) -> &'static str {
        match self {
            CipherSuite::EcdheEcdsaAes128GcmSha256 => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            CipherSuite::EcdheRsaAes128GcmSha256 => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            CipherSuite::EcdheEcdsaAes256GcmSha384 => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            CipherSuite::EcdheRsaAes256GcmSha384 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            CipherSuite::RsaAes128GcmSha256 => "TLS_RSA_WITH_AES_128_GCM_SHA256",
            CipherSuite::RsaAes256GcmSha384 => "TLS_RSA_WITH_AES_256_GCM_SHA384",
        }
    }

    /// Hash of the PRF and the finished messages
    pub fn prf_hash(self) -> PrfHash {
        match self {
            CipherSuite::EcdheEcdsaAes256GcmSha384
            | CipherSuite::EcdheRsaAes256GcmSha384
            | CipherSuite::RsaAes256GcmSha384 => PrfHash::Sha384,
            _ => PrfHash::Sha256,
        }
    }

    /// AES-GCM key length in bytes
    pub fn key_len(self) -> usize {
        match self.prf_hash() {
            PrfHash::Sha384 => 32,
            PrfHash::Sha256 => 16,
        }
    }

    const ALL: [CipherSuite; 6] = [
        CipherSuite::EcdheEcdsaAes128GcmSha256,
        CipherSuite::EcdheRsaAes128GcmSha256,
        CipherSuite::EcdheEcdsaAes256GcmSha384,
        CipherSuite::EcdheRsaAes256GcmSha384,
        CipherSuite::RsaAes128GcmSha256,
        CipherSuite::RsaAes256GcmSha384,
    ];
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.iana_name())
    }
}

/// Suites offered in the handshake for the name the gateway negotiated
pub fn select_cipher_suites(negotiated: &str) -> Vec<CipherSuite> {
    vec![CipherSuite::from_openssl_name(negotiated)
        .unwrap_or(CipherSuite::EcdheEcdsaAes128GcmSha256)]
}

/// Session parameters used for DTLS resumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionSession {
    pub id: Vec<u8>,
    pub secret: Vec<u8>,
}

/// Session cache consulted by the DTLS handshake
pub trait SessionStore: Send + Sync {
    fn set(&self, key: &[u8], session: ResumptionSession) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<ResumptionSession>>;
    fn del(&self, key: &[u8]) -> Result<()>;
}

/// Always hands out the session agreed during CSTP negotiation
#[derive(Debug, Clone)]
pub struct ResumptionStore {
    session: ResumptionSession,
}

impl ResumptionStore {
    /// `dtls_id` is the hex session id from the negotiation headers
    pub fn new(dtls_id: &str, master_secret: Vec<u8>) -> Result<Self> {
        Ok(Self {
            session: ResumptionSession {
                id: hex::decode(dtls_id.trim())?,
                secret: master_secret,
            },
        })
    }
}

impl SessionStore for ResumptionStore {
    fn set(&self, _key: &[u8], _session: ResumptionSession) -> Result<()> {
        Ok(())
    }

    fn get(&self, _key: &[u8]) -> Result<Option<ResumptionSession>> {
        Ok(Some(self.session.clone()))
    }

    fn del(&self, _key: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Handshake inputs
pub struct DtlsHandshake {
    pub server: SocketAddr,
    pub cipher_suites: Vec<CipherSuite>,
    pub session_store: Arc<dyn SessionStore>,
    /// Gateways present self-signed DTLS certificates; the session is
    /// authenticated by the resumed secret. Resumed handshakes carry no
    /// certificate at all.
    pub insecure_skip_verify: bool,
}

/// An established DTLS association
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, buf: &[u8]) -> Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    /// Suite agreed in the handshake
    fn cipher_suite(&self) -> Option<CipherSuite>;
    async fn close(&self);
}

/// Performs the DTLS handshake over a connected UDP socket
#[async_trait]
pub trait DtlsConnector: Send + Sync {
    async fn handshake(
        &self,
        socket: UdpSocket,
        params: DtlsHandshake,
    ) -> Result<Arc<dyn DatagramConn>>;
}

const RETRANSMIT_INITIAL: Duration = Duration::from_secs(1);
const RETRANSMIT_MAX: Duration = Duration::from_secs(8);
const MAX_DATAGRAM: usize = BUFFER_SIZE + RECORD_OVERHEAD + 64;

/// DTLS 1.2 client that resumes the session agreed during negotiation.
///
/// The ClientHello carries the `X-DTLS-Session-ID`, and the secret sent as
/// `X-DTLS-Master-Secret` is the master secret of that session. Gateways
/// answer with ServerHello, ChangeCipherSpec and Finished; anything else
/// means they refused to resume.
#[derive(Debug, Clone)]
pub struct ResumingConnector {
    retransmit: Duration,
}

impl ResumingConnector {
    /// `retransmit` is the first flight timeout, doubled on each loss
    pub fn new(retransmit: Duration) -> Self {
        Self { retransmit }
    }
}

impl Default for ResumingConnector {
    fn default() -> Self {
        Self::new(RETRANSMIT_INITIAL)
    }
}

#[async_trait]
impl DtlsConnector for ResumingConnector {
    async fn handshake(
        &self,
        socket: UdpSocket,
        params: DtlsHandshake,
    ) -> Result<Arc<dyn DatagramConn>> {
        let key = params.server.to_string();
        let session = params
            .session_store
            .get(key.as_bytes())?
            .ok_or_else(|| VpnError::Dtls(format!("No DTLS session to resume for {key}")))?;
        let mut client_random = [0u8; RANDOM_LEN];
        SecretGenerator::new().fill(&mut client_random)?;

        let offered = params.cipher_suites.iter().map(|s| s.id()).collect();
        let mut state = ResumeHandshake::new(session, client_random, offered);
        let mut interval = self.retransmit;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        socket.send(&state.client_hello()).await?;

        let established = loop {
            let n = match timeout(interval, socket.recv(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    log::debug!("DTLS flight lost after {interval:?}, retransmitting");
                    socket.send(&state.client_hello()).await?;
                    interval = (interval * 2).min(RETRANSMIT_MAX);
                    continue;
                }
            };
            match state.on_datagram(&buf[..n])? {
                Step::Wait => {}
                Step::Send(flight) => {
                    socket.send(&flight).await?;
                }
                Step::Done(established) => break established,
            }
        };

        socket.send(&established.final_flight).await?;
        log::debug!("DTLS session resumed with {}", established.suite);
        Ok(Arc::new(ResumedConn {
            socket,
            suite: established.suite,
            client: established.client,
            server: established.server,
            final_flight: established.final_flight,
            next_seq: AtomicU64::new(1),
            recv_buf: tokio::sync::Mutex::new(vec![0u8; MAX_DATAGRAM]),
            closed: CancellationToken::new(),
        }))
    }
}

enum Step {
    Wait,
    Send(Vec<u8>),
    Done(Established),
}

/// Keys agreed by a ServerHello, waiting for the gateway's Finished
struct Pending {
    suite: CipherSuite,
    transcript: Transcript,
    client: RecordCipher,
    server: RecordCipher,
}

struct Established {
    suite: CipherSuite,
    client: RecordCipher,
    server: RecordCipher,
    /// ChangeCipherSpec and Finished, resent if the gateway repeats its flight
    final_flight: Vec<u8>,
}

/// Client side of an abbreviated handshake, free of IO
struct ResumeHandshake {
    session: ResumptionSession,
    client_random: [u8; RANDOM_LEN],
    offered: Vec<u16>,
    cookie: Vec<u8>,
    hello_seq: u16,
    record_seq: u64,
    hello: Vec<u8>,
    pending: Option<Pending>,
}

impl ResumeHandshake {
    fn new(
        session: ResumptionSession,
        client_random: [u8; RANDOM_LEN],
        offered: Vec<u16>,
    ) -> Self {
        Self {
            session,
            client_random,
            offered,
            cookie: Vec::new(),
            hello_seq: 0,
            record_seq: 0,
            hello: Vec::new(),
            pending: None,
        }
    }

    fn next_record_seq(&mut self) -> u64 {
        let seq = self.record_seq;
        self.record_seq += 1;
        seq
    }

    /// The current ClientHello in a fresh record
    fn client_hello(&mut self) -> Vec<u8> {
        let body = client_hello(&self.client_random, &self.session.id, &self.cookie, &self.offered);
        self.hello = handshake_message(HANDSHAKE_CLIENT_HELLO, self.hello_seq, &body);
        let seq = self.next_record_seq();
        encode_record(CONTENT_HANDSHAKE, 0, seq, &self.hello)
    }

    fn on_datagram(&mut self, datagram: &[u8]) -> Result<Step> {
        let records = match split_records(datagram) {
            Ok(records) => records,
            Err(e) => {
                log::debug!("Ignoring DTLS datagram: {e}");
                return Ok(Step::Wait);
            }
        };

        for record in records {
            match (record.content_type, record.epoch) {
                (CONTENT_HANDSHAKE, 0) => {
                    for msg in split_handshake(record.body)? {
                        match msg.msg_type {
                            HANDSHAKE_HELLO_VERIFY_REQUEST => {
                                self.cookie = parse_hello_verify_request(msg.body)?;
                                self.hello_seq += 1;
                                self.pending = None;
                                return Ok(Step::Send(self.client_hello()));
                            }
                            HANDSHAKE_SERVER_HELLO => self.on_server_hello(&msg)?,
                            other => {
                                return Err(VpnError::Dtls(format!(
                                    "Unexpected handshake message {other}"
                                )))
                            }
                        }
                    }
                }
                (CONTENT_HANDSHAKE, 1) => {
                    let Some(pending) = self.pending.take() else {
                        continue;
                    };
                    let plain = pending.server.open(&record)?;
                    return Ok(Step::Done(self.finish(pending, &plain)?));
                }
                (CONTENT_ALERT, 0) => {
                    return Err(VpnError::Dtls(format!(
                        "Gateway sent alert {}",
                        hex::encode(record.body)
                    )))
                }
                _ => {}
            }
        }
        Ok(Step::Wait)
    }

    fn on_server_hello(&mut self, msg: &HandshakeMessage<'_>) -> Result<()> {
        let hello = parse_server_hello(msg.body)?;
        if hello.session_id != self.session.id {
            return Err(VpnError::Dtls(
                "Gateway refused to resume the DTLS session".to_string(),
            ));
        }
        let suite = CipherSuite::from_id(hello.cipher_suite)
            .filter(|suite| self.offered.contains(&suite.id()))
            .ok_or_else(|| {
                VpnError::Dtls(format!("Gateway chose cipher 0x{:04x}", hello.cipher_suite))
            })?;

        let keys = KeyBlock::derive(
            suite.prf_hash(),
            suite.key_len(),
            &self.session.secret,
            &self.client_random,
            &hello.random,
        );
        let mut transcript = Transcript::default();
        transcript.push(&self.hello);
        transcript.push(msg.raw);
        self.pending = Some(Pending {
            suite,
            transcript,
            client: RecordCipher::new(&keys.client_key, keys.client_iv)?,
            server: RecordCipher::new(&keys.server_key, keys.server_iv)?,
        });
        Ok(())
    }

    /// Check the gateway's Finished and build ours
    fn finish(&mut self, pending: Pending, plain: &[u8]) -> Result<Established> {
        let Pending {
            suite,
            mut transcript,
            client,
            server,
        } = pending;
        let hash = suite.prf_hash();

        let messages = split_handshake(plain)?;
        let finished = messages
            .iter()
            .find(|m| m.msg_type == HANDSHAKE_FINISHED)
            .ok_or_else(|| VpnError::Dtls("Expected Finished from gateway".to_string()))?;
        if finished.body != transcript.verify_data(hash, &self.session.secret, SERVER_FINISHED) {
            return Err(VpnError::Dtls("Gateway Finished does not verify".to_string()));
        }
        transcript.push(finished.raw);

        let verify = transcript.verify_data(hash, &self.session.secret, CLIENT_FINISHED);
        let ccs_seq = self.next_record_seq();
        let mut final_flight = encode_record(CONTENT_CHANGE_CIPHER_SPEC, 0, ccs_seq, &[1]);
        let ours = handshake_message(HANDSHAKE_FINISHED, self.hello_seq + 1, &verify);
        final_flight.extend(client.seal(CONTENT_HANDSHAKE, 1, 0, &ours)?);

        Ok(Established {
            suite,
            client,
            server,
            final_flight,
        })
    }
}

/// Association produced by [`ResumingConnector`]
struct ResumedConn {
    socket: UdpSocket,
    suite: CipherSuite,
    client: RecordCipher,
    server: RecordCipher,
    final_flight: Vec<u8>,
    /// Epoch 1 sequence; 0 went to our Finished
    next_seq: AtomicU64,
    recv_buf: tokio::sync::Mutex<Vec<u8>>,
    closed: CancellationToken,
}

#[async_trait]
impl DatagramConn for ResumedConn {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = self.client.seal(CONTENT_APPLICATION_DATA, 1, seq, buf)?;
        self.socket.send(&record).await?;
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut datagram = self.recv_buf.lock().await;
        loop {
            let n = tokio::select! {
                _ = self.closed.cancelled() => {
                    return Err(VpnError::Dtls("DTLS connection closed".to_string()))
                }
                r = self.socket.recv(&mut datagram[..]) => r?,
            };
            let records = match split_records(&datagram[..n]) {
                Ok(records) => records,
                Err(e) => {
                    log::debug!("Dropping DTLS datagram: {e}");
                    continue;
                }
            };

            let mut repeat_finished = false;
            for record in records {
                match (record.content_type, record.epoch) {
                    (CONTENT_APPLICATION_DATA, 1) => match self.server.open(&record) {
                        Ok(plain) if plain.len() <= buf.len() => {
                            buf[..plain.len()].copy_from_slice(&plain);
                            return Ok(plain.len());
                        }
                        Ok(plain) => log::debug!("Dropping {} byte DTLS record", plain.len()),
                        Err(e) => log::debug!("Dropping DTLS record: {e}"),
                    },
                    (CONTENT_ALERT, 1) => {
                        let alert = self.server.open(&record)?;
                        // fatal level or close_notify
                        if alert.first() == Some(&2) || alert.get(1) == Some(&0) {
                            return Err(VpnError::Dtls(format!(
                                "Gateway closed DTLS with alert {}",
                                hex::encode(&alert)
                            )));
                        }
                    }
                    (CONTENT_HANDSHAKE, _) | (CONTENT_CHANGE_CIPHER_SPEC, _) => {
                        repeat_finished = true;
                    }
                    _ => {}
                }
            }
            if repeat_finished {
                self.socket.send(&self.final_flight).await?;
            }
        }
    }

    fn cipher_suite(&self) -> Option<CipherSuite> {
        Some(self.suite)
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        // warning level close_notify
        if let Ok(alert) = self.client.seal(CONTENT_ALERT, 1, seq, &[1, 0]) {
            let _ = self.socket.send(&alert).await;
        }
    }
}

/// Dial the gateway's DTLS port and complete the handshake
pub async fn dial(
    cs: &ConnSession,
    connector: &dyn DtlsConnector,
    master_secret: Vec<u8>,
) -> Result<Arc<dyn DatagramConn>> {
    let port: u16 = cs
        .dtls_port
        .trim()
        .parse()
        .map_err(|e| VpnError::Dtls(format!("Invalid DTLS port {}: {e}", cs.dtls_port)))?;
    let ip = cs
        .server_address
        .parse()
        .map_err(|e| VpnError::Dtls(format!("Invalid server address {}: {e}", cs.server_address)))?;
    let server = SocketAddr::new(ip, port);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;

    let params = DtlsHandshake {
        server,
        cipher_suites: select_cipher_suites(&cs.dtls_cipher_suite()),
        session_store: Arc::new(ResumptionStore::new(&cs.dtls_id, master_secret)?),
        insecure_skip_verify: true,
    };
    connector.handshake(socket, params).await
}

/// Bring up the DTLS channel and run it until it ends.
///
/// Always fires the DTLS setup latch. Failures leave the tunnel on TLS.
pub async fn run_channel(
    cs: Arc<ConnSession>,
    connector: Arc<dyn DtlsConnector>,
    master_secret: Vec<u8>,
    handshake_timeout: Duration,
) {
    if cs.dtls_port.is_empty() {
        log::warn!("Gateway offered no DTLS port, staying on TLS");
        cs.finish_dtls_setup();
        return;
    }

    let dialing = dial(&cs, connector.as_ref(), master_secret);
    let conn = match timeout(handshake_timeout, dialing).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            log::error!("DTLS handshake failed: {e}");
            cs.finish_dtls_setup();
            return;
        }
        Err(_) => {
            log::error!("DTLS handshake timed out after {handshake_timeout:?}");
            cs.finish_dtls_setup();
            return;
        }
    };

    if cs.dtls().is_closed() {
        conn.close().await;
        cs.finish_dtls_setup();
        return;
    }

    let Some(rx) = cs.payload_out_dtls.take_receiver() else {
        log::error!("DTLS channel already started");
        conn.close().await;
        cs.finish_dtls_setup();
        return;
    };

    cs.set_dtls_connected(true);
    cs.set_dtls_cipher_suite(conn.cipher_suite().map(|s| s.iana_name()).unwrap_or(""));
    cs.finish_dtls_setup();
    log::info!("DTLS channel negotiation succeeded, cipher {}", cs.dtls_cipher_suite());

    let writer = tokio::spawn(write_pump(conn.clone(), rx, cs.clone()));
    read_pump(conn, cs).await;
    let _ = writer.await;
}

/// Gateway to inbound queue
pub async fn read_pump(conn: Arc<dyn DatagramConn>, cs: Arc<ConnSession>) {
    let dead = read_deadline(cs.dtls_dpd_time);
    let mut deadline = Instant::now() + dead;
    let token = cs.dtls().token().clone();

    loop {
        if cs.take_dtls_deadline_reset() {
            deadline = Instant::now() + dead;
        }

        let mut pl = cs.pool().acquire();
        let read = tokio::select! {
            _ = token.cancelled() => None,
            r = timeout_at(deadline, conn.recv(&mut pl.data)) => Some(r),
        };
        let n = match read {
            None => break,
            Some(Err(_)) => {
                log::error!("DTLS read deadline exceeded");
                break;
            }
            Some(Ok(Err(e))) => {
                log::error!("DTLS server to payload in error: {e}");
                break;
            }
            Some(Ok(Ok(n))) => n,
        };
        if n == 0 {
            cs.pool().release(pl);
            continue;
        }
        pl.data.truncate(n);
        cs.stat.add_received(n);

        match decode_dtls(&mut pl) {
            Ok(()) => {}
            Err(e) => {
                log::debug!("Ignoring DTLS datagram: {e}");
                cs.pool().release(pl);
                continue;
            }
        }

        match pl.ptype {
            PayloadType::Data => {
                let sent = tokio::select! {
                    r = cs.payload_in.sender().send(pl) => r.is_ok(),
                    _ = token.cancelled() => false,
                };
                if !sent {
                    break;
                }
            }
            PayloadType::DpdRequest => {
                pl.ptype = PayloadType::DpdResponse;
                tokio::select! {
                    _ = cs.payload_out_dtls.sender().send(pl) => {}
                    _ = token.cancelled() => break,
                }
            }
            PayloadType::Disconnect | PayloadType::Terminate => {
                log::info!("Gateway closed the DTLS channel");
                cs.pool().release(pl);
                break;
            }
            PayloadType::DpdResponse => {
                log::debug!("DTLS DPD response");
                cs.pool().release(pl);
            }
            PayloadType::Keepalive | PayloadType::Compressed => {
                cs.pool().release(pl);
            }
        }
    }

    log::info!("DTLS channel read exit");
    conn.close().await;
    cs.close_dtls();
}

/// Outbound DTLS queue to gateway
pub async fn write_pump(
    conn: Arc<dyn DatagramConn>,
    mut rx: mpsc::Receiver<Payload>,
    cs: Arc<ConnSession>,
) {
    let token = cs.dtls().token().clone();

    loop {
        let mut pl = tokio::select! {
            _ = token.cancelled() => break,
            p = rx.recv() => match p {
                Some(p) => p,
                None => break,
            },
        };

        encode_dtls(&mut pl);
        match conn.send(&pl.data).await {
            Ok(n) => cs.stat.add_sent(n),
            Err(e) => {
                log::error!("DTLS payload out to server error: {e}");
                break;
            }
        }
        cs.pool().release(pl);
    }

    log::info!("DTLS channel write exit");
    conn.close().await;
    cs.close_dtls();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::tests::{endpoint, params};
    use crate::session::Session;
    use tokio::sync::Mutex;

    /// In-memory association fed by the test
    pub(crate) struct FakeDatagram {
        pub(crate) inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
        pub(crate) outbound: mpsc::Sender<Vec<u8>>,
        pub(crate) closed: tokio_util::sync::CancellationToken,
    }

    #[async_trait]
    impl DatagramConn for FakeDatagram {
        async fn send(&self, buf: &[u8]) -> Result<usize> {
            self.outbound
                .send(buf.to_vec())
                .await
                .map_err(|_| VpnError::Dtls("peer gone".to_string()))?;
            Ok(buf.len())
        }

        async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                _ = self.closed.cancelled() => Err(VpnError::Dtls("closed".to_string())),
                d = inbound.recv() => {
                    let d = d.ok_or_else(|| VpnError::Dtls("peer gone".to_string()))?;
                    buf[..d.len()].copy_from_slice(&d);
                    Ok(d.len())
                }
            }
        }

        fn cipher_suite(&self) -> Option<CipherSuite> {
            Some(CipherSuite::EcdheRsaAes256GcmSha384)
        }

        async fn close(&self) {
            self.closed.cancel();
        }
    }

    /// Connector that succeeds with a [`FakeDatagram`] or fails
    pub(crate) struct FakeConnector {
        pub(crate) conn: std::sync::Mutex<Option<Arc<FakeDatagram>>>,
        pub(crate) seen: std::sync::Mutex<Option<(Vec<CipherSuite>, Option<ResumptionSession>)>>,
    }

    impl FakeConnector {
        pub(crate) fn new(conn: Option<Arc<FakeDatagram>>) -> Self {
            Self {
                conn: std::sync::Mutex::new(conn),
                seen: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl DtlsConnector for FakeConnector {
        async fn handshake(
            &self,
            _socket: UdpSocket,
            params: DtlsHandshake,
        ) -> Result<Arc<dyn DatagramConn>> {
            let resumed = params.session_store.get(b"any")?;
            *self.seen.lock().unwrap() = Some((params.cipher_suites, resumed));
            match self.conn.lock().unwrap().take() {
                Some(conn) => Ok(conn),
                None => Err(VpnError::Dtls("handshake rejected".to_string())),
            }
        }
    }

    pub(crate) fn fake_pair() -> (
        Arc<FakeDatagram>,
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<Vec<u8>>,
    ) {
        let (to_client, from_server) = mpsc::channel(16);
        let (to_server, from_client) = mpsc::channel(16);
        let conn = Arc::new(FakeDatagram {
            inbound: Mutex::new(from_server),
            outbound: to_server,
            closed: tokio_util::sync::CancellationToken::new(),
        });
        (conn, to_client, from_client)
    }

    pub(crate) fn loopback() -> crate::session::Endpoint {
        let mut ep = endpoint();
        ep.server_address = "127.0.0.1".to_string();
        ep
    }

    pub(crate) fn dtls_params() -> crate::protocol::negotiate::TunnelParams {
        let mut p = params();
        p.dtls_port = "4443".to_string();
        p.dtls_id = "0a0b0c".to_string();
        p.dtls_dpd = 30;
        p.dtls_cipher_suite = "ECDHE-RSA-AES256-GCM-SHA384".to_string();
        p
    }

    #[test]
    fn test_cipher_suite_selection() {
        assert_eq!(
            select_cipher_suites("ECDHE-RSA-AES128-GCM-SHA256"),
            vec![CipherSuite::EcdheRsaAes128GcmSha256]
        );
        assert_eq!(
            select_cipher_suites("AES256-GCM-SHA384"),
            vec![CipherSuite::RsaAes256GcmSha384]
        );
        assert_eq!(
            select_cipher_suites("Unknown"),
            vec![CipherSuite::EcdheEcdsaAes128GcmSha256]
        );
        assert_eq!(CipherSuite::from_id(0x009c), Some(CipherSuite::RsaAes128GcmSha256));
        assert_eq!(
            CipherSuite::EcdheEcdsaAes128GcmSha256.to_string(),
            "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"
        );
    }

    #[test]
    fn test_resumption_store_is_synthetic() {
        let store = ResumptionStore::new("0a0b", vec![0xFE, 0xFD, 1]).unwrap();
        store
            .set(b"k", ResumptionSession { id: vec![], secret: vec![] })
            .unwrap();
        store.del(b"k").unwrap();
        let session = store.get(b"whatever").unwrap().unwrap();
        assert_eq!(session.id, vec![0x0a, 0x0b]);
        assert_eq!(session.secret, vec![0xFE, 0xFD, 1]);
        assert!(ResumptionStore::new("zz", vec![]).is_err());
    }

    #[tokio::test]
    async fn test_handshake_failure_falls_back_to_tls() {
        let session = Session::new();
        let cs = session.new_conn_session(loopback(), dtls_params());
        let connector = Arc::new(FakeConnector::new(None));

        run_channel(cs.clone(), connector, vec![0xFE, 0xFD], Duration::from_secs(5)).await;
        assert!(cs.is_dtls_setup_finished());
        assert!(!cs.is_dtls_connected());
        assert!(!cs.is_closed());
    }

    #[tokio::test]
    async fn test_missing_port_skips_dtls() {
        let session = Session::new();
        let cs = session.new_conn_session(endpoint(), params());
        let connector = Arc::new(FakeConnector::new(None));
        run_channel(cs.clone(), connector.clone(), vec![], Duration::from_secs(5)).await;
        assert!(cs.is_dtls_setup_finished());
        assert!(connector.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_relays_and_degrades() {
        let session = Session::new();
        let cs = session.new_conn_session(loopback(), dtls_params());
        let mut inbound = cs.payload_in.take_receiver().unwrap();
        let (conn, to_client, mut from_client) = fake_pair();
        let connector = Arc::new(FakeConnector::new(Some(conn)));

        let channel = tokio::spawn(run_channel(
            cs.clone(),
            connector.clone(),
            vec![0xFE, 0xFD, 7],
            Duration::from_secs(5),
        ));
        cs.wait_dtls_setup().await;
        assert!(cs.is_dtls_connected());
        assert_eq!(cs.dtls_cipher_suite(), "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384");
        {
            let seen = connector.seen.lock().unwrap();
            let (suites, resumed) = seen.as_ref().unwrap();
            assert_eq!(suites, &vec![CipherSuite::EcdheRsaAes256GcmSha384]);
            assert_eq!(resumed.as_ref().unwrap().id, vec![0x0a, 0x0b, 0x0c]);
        }

        to_client.send(vec![0x00, 0x45, 0x00]).await.unwrap();
        let pl = inbound.recv().await.unwrap();
        assert_eq!(pl.data, vec![0x45, 0x00]);

        to_client.send(vec![0x03]).await.unwrap();
        assert_eq!(from_client.recv().await.unwrap(), vec![0x04]);

        to_client.send(vec![0x05]).await.unwrap();
        channel.await.unwrap();
        assert!(!cs.is_dtls_connected());
        assert!(cs.dtls_cipher_suite().is_empty());
        assert!(!cs.is_closed());
    }

    struct GatewayEnd {
        socket: UdpSocket,
        peer: SocketAddr,
        client: RecordCipher,
        server: RecordCipher,
    }

    /// Gateway side of a resumed handshake: cookie exchange, then the
    /// abbreviated flight. Replies with `reply_id` as the session id.
    async fn resume_gateway(
        socket: UdpSocket,
        reply_id: Vec<u8>,
        secret: Vec<u8>,
        suite: CipherSuite,
    ) -> Option<GatewayEnd> {
        let mut buf = vec![0u8; 4096];
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        let first = buf[..n].to_vec();
        let records = split_records(&first).unwrap();
        let msgs = split_handshake(records[0].body).unwrap();
        assert_eq!(msgs[0].msg_type, HANDSHAKE_CLIENT_HELLO);
        let hvr = handshake_message(
            HANDSHAKE_HELLO_VERIFY_REQUEST,
            0,
            &[0xfe, 0xff, 2, 0x99, 0x98],
        );
        socket
            .send_to(&encode_record(CONTENT_HANDSHAKE, 0, 0, &hvr), peer)
            .await
            .unwrap();

        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let second = buf[..n].to_vec();
        let records = split_records(&second).unwrap();
        assert_eq!(records[0].seq, 1);
        let msgs = split_handshake(records[0].body).unwrap();
        let hello = &msgs[0];
        assert_eq!(hello.message_seq, 1);
        let body = hello.body;
        let sid_len = body[34] as usize;
        assert_eq!(&body[35..35 + sid_len], &[0x0a, 0x0b, 0x0c]);
        let cookie_at = 35 + sid_len;
        assert_eq!(&body[cookie_at..cookie_at + 3], &[2, 0x99, 0x98]);
        let suite_id = suite.id().to_be_bytes();
        assert_eq!(
            &body[cookie_at + 3..cookie_at + 7],
            &[0, 2, suite_id[0], suite_id[1]]
        );

        let server_random = [0x55u8; RANDOM_LEN];
        let mut sh_body = crate::protocol::constants::DTLS12_VERSION.to_vec();
        sh_body.extend_from_slice(&server_random);
        sh_body.push(reply_id.len() as u8);
        sh_body.extend_from_slice(&reply_id);
        sh_body.extend_from_slice(&suite_id);
        sh_body.push(0);
        let sh = handshake_message(HANDSHAKE_SERVER_HELLO, 1, &sh_body);

        let hash = suite.prf_hash();
        let keys = KeyBlock::derive(hash, suite.key_len(), &secret, &body[2..34], &server_random);
        let client = RecordCipher::new(&keys.client_key, keys.client_iv).unwrap();
        let server = RecordCipher::new(&keys.server_key, keys.server_iv).unwrap();
        let mut transcript = Transcript::default();
        transcript.push(hello.raw);
        transcript.push(&sh);
        let verify = transcript.verify_data(hash, &secret, SERVER_FINISHED);
        let fin = handshake_message(HANDSHAKE_FINISHED, 2, &verify);
        transcript.push(&fin);

        let mut flight = encode_record(CONTENT_HANDSHAKE, 0, 1, &sh);
        flight.extend(encode_record(CONTENT_CHANGE_CIPHER_SPEC, 0, 2, &[1]));
        flight.extend(server.seal(CONTENT_HANDSHAKE, 1, 0, &fin).unwrap());
        socket.send_to(&flight, peer).await.unwrap();
        if reply_id != [0x0a, 0x0b, 0x0c] {
            return None;
        }

        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let records = split_records(&buf[..n]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content_type, CONTENT_CHANGE_CIPHER_SPEC);
        assert_eq!(records[1].epoch, 1);
        let plain = client.open(&records[1]).unwrap();
        let theirs = split_handshake(&plain).unwrap();
        assert_eq!(theirs[0].msg_type, HANDSHAKE_FINISHED);
        assert_eq!(theirs[0].message_seq, 2);
        assert_eq!(
            theirs[0].body,
            transcript.verify_data(hash, &secret, CLIENT_FINISHED)
        );

        Some(GatewayEnd {
            socket,
            peer,
            client,
            server,
        })
    }

    fn resume_params(server: SocketAddr, suite: CipherSuite, secret: &[u8]) -> DtlsHandshake {
        DtlsHandshake {
            server,
            cipher_suites: vec![suite],
            session_store: Arc::new(ResumptionStore::new("0a0b0c", secret.to_vec()).unwrap()),
            insecure_skip_verify: true,
        }
    }

    #[tokio::test]
    async fn test_resuming_connector_over_loopback() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = gateway.local_addr().unwrap();
        let secret = crate::crypto::make_master_secret().unwrap();
        let suite = CipherSuite::EcdheRsaAes256GcmSha384;
        let gw = tokio::spawn(resume_gateway(
            gateway,
            vec![0x0a, 0x0b, 0x0c],
            secret.clone(),
            suite,
        ));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        let conn = ResumingConnector::default()
            .handshake(socket, resume_params(server, suite, &secret))
            .await
            .unwrap();
        assert_eq!(conn.cipher_suite(), Some(suite));
        let gw = gw.await.unwrap().unwrap();

        conn.send(&[0x00, 0x45, 0x00]).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (n, _) = gw.socket.recv_from(&mut buf).await.unwrap();
        let records = split_records(&buf[..n]).unwrap();
        assert_eq!((records[0].epoch, records[0].seq), (1, 1));
        assert_eq!(gw.client.open(&records[0]).unwrap(), vec![0x00, 0x45, 0x00]);

        let dpd = gw.server.seal(CONTENT_APPLICATION_DATA, 1, 1, &[0x03]).unwrap();
        gw.socket.send_to(&dpd, gw.peer).await.unwrap();
        let mut pl = vec![0u8; BUFFER_SIZE];
        let n = conn.recv(&mut pl).await.unwrap();
        assert_eq!(&pl[..n], &[0x03]);

        conn.close().await;
        let (n, _) = gw.socket.recv_from(&mut buf).await.unwrap();
        let records = split_records(&buf[..n]).unwrap();
        assert_eq!(records[0].content_type, CONTENT_ALERT);
        assert_eq!(gw.client.open(&records[0]).unwrap(), vec![1, 0]);
        assert!(conn.recv(&mut pl).await.is_err());
    }

    #[tokio::test]
    async fn test_resuming_connector_refused() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = gateway.local_addr().unwrap();
        let secret = crate::crypto::make_master_secret().unwrap();
        let suite = CipherSuite::EcdheEcdsaAes128GcmSha256;
        let gw = tokio::spawn(resume_gateway(gateway, vec![0x01], secret.clone(), suite));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        let result = ResumingConnector::default()
            .handshake(socket, resume_params(server, suite, &secret))
            .await;
        assert!(matches!(result, Err(VpnError::Dtls(_))));
        assert!(gw.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_over_resumed_session() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = gateway.local_addr().unwrap().port();
        let secret = crate::crypto::make_master_secret().unwrap();
        let suite = CipherSuite::EcdheRsaAes256GcmSha384;
        let gw = tokio::spawn(resume_gateway(
            gateway,
            vec![0x0a, 0x0b, 0x0c],
            secret.clone(),
            suite,
        ));

        let session = Session::new();
        let mut p = dtls_params();
        p.dtls_port = port.to_string();
        let cs = session.new_conn_session(loopback(), p);
        let channel = tokio::spawn(run_channel(
            cs.clone(),
            Arc::new(ResumingConnector::default()),
            secret,
            Duration::from_secs(5),
        ));
        cs.wait_dtls_setup().await;
        assert!(cs.is_dtls_connected());
        assert_eq!(cs.dtls_cipher_suite(), "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384");
        let gw = gw.await.unwrap().unwrap();

        // DPD request is answered on DTLS
        let dpd = gw.server.seal(CONTENT_APPLICATION_DATA, 1, 1, &[0x03]).unwrap();
        gw.socket.send_to(&dpd, gw.peer).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (n, _) = gw.socket.recv_from(&mut buf).await.unwrap();
        let records = split_records(&buf[..n]).unwrap();
        assert_eq!(gw.client.open(&records[0]).unwrap(), vec![0x04]);

        let bye = gw.server.seal(CONTENT_APPLICATION_DATA, 1, 2, &[0x05]).unwrap();
        gw.socket.send_to(&bye, gw.peer).await.unwrap();
        channel.await.unwrap();
        assert!(!cs.is_dtls_connected());
        assert!(!cs.is_closed());
    }
}
