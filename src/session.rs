//! Session state shared by every tunnel task
//!
//! A [`Session`] lives as long as the client and survives reconnects. Each
//! established tunnel gets a fresh [`ConnSession`], shared by the channel
//! pumps, the TUN bridge and the supervisors through an `Arc`.

use crate::protocol::negotiate::TunnelParams;
use crate::protocol::{Payload, PayloadPool};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the inbound and outbound packet queues
pub const QUEUE_CAPACITY: usize = 64;

/// Domain to resolved IPv4 addresses
pub type ResolvedCache = HashMap<String, HashSet<Ipv4Addr>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_str(value: &RwLock<String>) -> String {
    value
        .read()
        .map(|v| v.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

fn write_str(value: &RwLock<String>, new: &str) {
    let mut guard = value.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = new.to_string();
}

/// How the last tunnel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Closed on user request
    Disconnected,
    /// Torn down by an error or by the gateway
    Aborted,
}

/// Client-lifetime session context
pub struct Session {
    token: RwLock<String>,
    master_secret: Mutex<Vec<u8>>,
    active_close: AtomicBool,
    close_signal: Mutex<CancellationToken>,
    current: Mutex<Option<Arc<ConnSession>>>,
    pool: Arc<PayloadPool>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Self::with_pool(Arc::new(PayloadPool::default()))
    }

    pub fn with_pool(pool: Arc<PayloadPool>) -> Arc<Self> {
        let close_signal = CancellationToken::new();
        close_signal.cancel();
        Arc::new(Self {
            token: RwLock::new(String::new()),
            master_secret: Mutex::new(Vec::new()),
            active_close: AtomicBool::new(false),
            close_signal: Mutex::new(close_signal),
            current: Mutex::new(None),
            pool,
        })
    }

    /// Store the credentials of a fresh authentication
    pub fn set_credentials(&self, token: &str, master_secret: Vec<u8>) {
        write_str(&self.token, token);
        *lock(&self.master_secret) = master_secret;
    }

    /// Replace only the pre-master secret (reconnect keeps the token)
    pub fn set_master_secret(&self, master_secret: Vec<u8>) {
        *lock(&self.master_secret) = master_secret;
    }

    pub fn token(&self) -> String {
        read_str(&self.token)
    }

    pub fn master_secret(&self) -> Vec<u8> {
        lock(&self.master_secret).clone()
    }

    pub fn pool(&self) -> Arc<PayloadPool> {
        self.pool.clone()
    }

    pub fn set_active_close(&self, active: bool) {
        self.active_close.store(active, Ordering::SeqCst);
    }

    /// True when the user asked for the disconnect
    pub fn is_active_close(&self) -> bool {
        self.active_close.load(Ordering::SeqCst)
    }

    /// The tunnel currently owned by this session
    pub fn current(&self) -> Option<Arc<ConnSession>> {
        lock(&self.current).clone()
    }

    /// Token cancelled when the current tunnel closes.
    ///
    /// Already cancelled when no tunnel has been established.
    pub fn closed_signal(&self) -> CancellationToken {
        lock(&self.close_signal).clone()
    }

    /// Wait until the current tunnel closes and report why
    pub async fn wait_closed(&self) -> CloseReason {
        self.closed_signal().cancelled().await;
        if self.is_active_close() {
            CloseReason::Disconnected
        } else {
            CloseReason::Aborted
        }
    }

    /// Create the connection session for a freshly negotiated tunnel and make
    /// it the current one
    pub fn new_conn_session(
        self: &Arc<Self>,
        endpoint: Endpoint,
        params: TunnelParams,
    ) -> Arc<ConnSession> {
        self.new_conn_session_with_capacity(endpoint, params, QUEUE_CAPACITY)
    }

    pub fn new_conn_session_with_capacity(
        self: &Arc<Self>,
        endpoint: Endpoint,
        params: TunnelParams,
        queue_capacity: usize,
    ) -> Arc<ConnSession> {
        let close_signal = CancellationToken::new();
        let cs = Arc::new(ConnSession::new(
            Arc::downgrade(self),
            self.pool.clone(),
            close_signal.clone(),
            endpoint,
            params,
            queue_capacity,
        ));

        self.set_active_close(false);
        *lock(&self.close_signal) = close_signal;
        *lock(&self.current) = Some(cs.clone());
        cs
    }

    fn detach(&self, cs: &ConnSession) {
        let mut current = lock(&self.current);
        if current
            .as_ref()
            .is_some_and(|cur| std::ptr::eq(Arc::as_ptr(cur), cs))
        {
            *current = None;
        }
    }
}

/// Addresses of the TLS connection the tunnel was negotiated on
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub server_address: String,
    pub local_address: String,
    pub hostname: String,
    pub tls_cipher_suite: String,
}

/// Byte counters
#[derive(Debug, Default)]
pub struct Stat {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Stat {
    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One bounded packet queue. The receiver is taken by the consuming pump.
pub struct PacketQueue {
    tx: mpsc::Sender<Payload>,
    rx: Mutex<Option<mpsc::Receiver<Payload>>>,
}

impl PacketQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn sender(&self) -> &mpsc::Sender<Payload> {
        &self.tx
    }

    /// Hand the receiving end to its pump, `None` if already taken
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Payload>> {
        lock(&self.rx).take()
    }
}

/// The DTLS sub-session, closed on its own when the DTLS channel fails
pub struct DtlsSession {
    token: CancellationToken,
    closed: AtomicBool,
}

impl DtlsSession {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// State of one established tunnel
pub struct ConnSession {
    session: Weak<Session>,
    pool: Arc<PayloadPool>,
    close_signal: CancellationToken,

    pub server_address: String,
    pub local_address: String,
    pub hostname: String,
    tun_name: RwLock<String>,
    pub vpn_address: String,
    pub vpn_mask: String,
    pub mtu: u32,
    pub dns: Vec<String>,
    pub split_include: Vec<String>,
    pub split_exclude: Vec<String>,

    pub dynamic_split_tunneling: bool,
    pub dynamic_split_include_domains: Vec<String>,
    pub dynamic_split_exclude_domains: Vec<String>,
    pub dynamic_split_include_resolved: Mutex<ResolvedCache>,
    pub dynamic_split_exclude_resolved: Mutex<ResolvedCache>,

    pub tls_cipher_suite: String,
    pub tls_dpd_time: u32,
    pub tls_keepalive_time: u32,
    pub dtls_port: String,
    pub dtls_dpd_time: u32,
    pub dtls_keepalive_time: u32,
    pub dtls_id: String,
    dtls_cipher_suite: RwLock<String>,
    pub stat: Stat,

    close_token: CancellationToken,
    closed: AtomicBool,
    pub payload_in: PacketQueue,
    pub payload_out_tls: PacketQueue,
    pub payload_out_dtls: PacketQueue,

    dtls_connected: AtomicBool,
    dtls_setup: watch::Sender<bool>,
    dtls: DtlsSession,

    reset_tls_read_deadline: AtomicBool,
    reset_dtls_read_deadline: AtomicBool,
}

impl ConnSession {
    fn new(
        session: Weak<Session>,
        pool: Arc<PayloadPool>,
        close_signal: CancellationToken,
        endpoint: Endpoint,
        params: TunnelParams,
        queue_capacity: usize,
    ) -> Self {
        let close_token = CancellationToken::new();
        let dtls = DtlsSession {
            token: close_token.child_token(),
            closed: AtomicBool::new(false),
        };
        let (dtls_setup, _) = watch::channel(false);
        let dynamic_split_tunneling = params.dynamic_split_tunneling();

        Self {
            session,
            pool,
            close_signal,
            server_address: endpoint.server_address,
            local_address: endpoint.local_address,
            hostname: endpoint.hostname,
            tun_name: RwLock::new(String::new()),
            vpn_address: params.vpn_address,
            vpn_mask: params.vpn_mask,
            mtu: params.mtu,
            dns: params.dns,
            split_include: params.split_include,
            split_exclude: params.split_exclude,
            dynamic_split_tunneling,
            dynamic_split_include_domains: params.dynamic_include_domains,
            dynamic_split_exclude_domains: params.dynamic_exclude_domains,
            dynamic_split_include_resolved: Mutex::new(HashMap::new()),
            dynamic_split_exclude_resolved: Mutex::new(HashMap::new()),
            tls_cipher_suite: endpoint.tls_cipher_suite,
            tls_dpd_time: params.tls_dpd,
            tls_keepalive_time: params.tls_keepalive,
            dtls_port: params.dtls_port,
            dtls_dpd_time: params.dtls_dpd,
            dtls_keepalive_time: params.dtls_keepalive,
            dtls_id: params.dtls_id,
            dtls_cipher_suite: RwLock::new(params.dtls_cipher_suite),
            stat: Stat::default(),
            close_token,
            closed: AtomicBool::new(false),
            payload_in: PacketQueue::new(queue_capacity),
            payload_out_tls: PacketQueue::new(queue_capacity),
            payload_out_dtls: PacketQueue::new(queue_capacity),
            dtls_connected: AtomicBool::new(false),
            dtls_setup,
            dtls,
            reset_tls_read_deadline: AtomicBool::new(true),
            reset_dtls_read_deadline: AtomicBool::new(true),
        }
    }

    pub fn pool(&self) -> &PayloadPool {
        &self.pool
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Cancelled once the session closes
    pub fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    pub fn tun_name(&self) -> String {
        read_str(&self.tun_name)
    }

    pub fn set_tun_name(&self, name: &str) {
        write_str(&self.tun_name, name);
    }

    pub fn dtls_cipher_suite(&self) -> String {
        read_str(&self.dtls_cipher_suite)
    }

    pub fn set_dtls_cipher_suite(&self, name: &str) {
        write_str(&self.dtls_cipher_suite, name);
    }

    pub fn dtls(&self) -> &DtlsSession {
        &self.dtls
    }

    pub fn is_dtls_connected(&self) -> bool {
        self.dtls_connected.load(Ordering::SeqCst)
    }

    pub fn set_dtls_connected(&self, connected: bool) {
        self.dtls_connected.store(connected, Ordering::SeqCst);
    }

    /// Fire the DTLS setup latch, success or not
    pub fn finish_dtls_setup(&self) {
        self.dtls_setup.send_replace(true);
    }

    pub fn is_dtls_setup_finished(&self) -> bool {
        *self.dtls_setup.borrow()
    }

    /// Wait until the DTLS channel either came up or gave up
    pub async fn wait_dtls_setup(&self) {
        let mut rx = self.dtls_setup.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Take the TLS read deadline reset request
    pub fn take_tls_deadline_reset(&self) -> bool {
        self.reset_tls_read_deadline.swap(false, Ordering::AcqRel)
    }

    pub fn take_dtls_deadline_reset(&self) -> bool {
        self.reset_dtls_read_deadline.swap(false, Ordering::AcqRel)
    }

    /// Ask both read pumps to refresh their deadline
    pub fn request_deadline_reset(&self) {
        self.reset_tls_read_deadline.store(true, Ordering::Release);
        self.reset_dtls_read_deadline.store(true, Ordering::Release);
    }

    /// Close the DTLS sub-session only. Traffic falls back to TLS.
    pub fn close_dtls(&self) {
        if self.dtls.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dtls.token.cancel();
        self.set_dtls_connected(false);
        self.set_dtls_cipher_suite("");
        log::info!("DTLS channel closed, traffic continues over TLS");
    }

    /// Close the tunnel. Safe to call from any task, runs once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.is_dtls_connected() {
            self.close_dtls();
        }
        self.close_token.cancel();
        // status() callers must not wait for a DTLS channel that never comes
        self.finish_dtls_setup();

        if let Some(session) = self.session.upgrade() {
            session.detach(self);
        }
        self.close_signal.cancel();
        log::info!("Tunnel session closed");
    }

    /// Serializable view including live counters
    pub fn snapshot(&self) -> ConnSnapshot {
        ConnSnapshot {
            server_address: self.server_address.clone(),
            local_address: self.local_address.clone(),
            hostname: self.hostname.clone(),
            tun_name: self.tun_name(),
            vpn_address: self.vpn_address.clone(),
            vpn_mask: self.vpn_mask.clone(),
            dns: self.dns.clone(),
            mtu: self.mtu,
            split_include: self.split_include.clone(),
            split_exclude: self.split_exclude.clone(),
            dynamic_split_tunneling: self.dynamic_split_tunneling,
            dynamic_split_include_domains: self.dynamic_split_include_domains.clone(),
            dynamic_split_exclude_domains: self.dynamic_split_exclude_domains.clone(),
            tls_cipher_suite: self.tls_cipher_suite.clone(),
            tls_dpd_time: self.tls_dpd_time,
            tls_keepalive_time: self.tls_keepalive_time,
            dtls_port: self.dtls_port.clone(),
            dtls_dpd_time: self.dtls_dpd_time,
            dtls_keepalive_time: self.dtls_keepalive_time,
            dtls_cipher_suite: self.dtls_cipher_suite(),
            dtls_connected: self.is_dtls_connected(),
            stat: self.stat.snapshot(),
        }
    }
}

/// Status snapshot handed to front-ends
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnSnapshot {
    pub server_address: String,
    pub local_address: String,
    pub hostname: String,
    pub tun_name: String,
    pub vpn_address: String,
    pub vpn_mask: String,
    pub dns: Vec<String>,
    pub mtu: u32,
    pub split_include: Vec<String>,
    pub split_exclude: Vec<String>,
    pub dynamic_split_tunneling: bool,
    pub dynamic_split_include_domains: Vec<String>,
    pub dynamic_split_exclude_domains: Vec<String>,
    pub tls_cipher_suite: String,
    pub tls_dpd_time: u32,
    pub tls_keepalive_time: u32,
    pub dtls_port: String,
    pub dtls_dpd_time: u32,
    pub dtls_keepalive_time: u32,
    pub dtls_cipher_suite: String,
    pub dtls_connected: bool,
    pub stat: StatSnapshot,
}
