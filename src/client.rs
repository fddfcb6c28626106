//! VPN client - entry points for front-ends
//!
//! [`VpnClient`] owns the client-lifetime [`Session`] and drives the
//! collaborators: an [`Authenticator`] for login, and the tunnel
//! orchestrator for everything after it.

use crate::config::{Config, Profile};
use crate::crypto::make_master_secret;
use crate::error::{Result, VpnError};
use crate::routing::{IpRouteController, RouteController};
use crate::session::{lock, ConnSession, Session, StatSnapshot};
use crate::tunnel::dtls::{DtlsConnector, ResumingConnector};
use crate::tunnel::tun::{NativeTunFactory, TunFactory};
use crate::tunnel::{AuthenticatedConn, Tunnel, TunnelOrchestrator};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub use crate::session::CloseReason;

/// Login collaborator.
///
/// `dial` opens the TLS connection to the gateway; `authenticate` runs the
/// login exchange on it and returns the session token. Reconnects only dial,
/// reusing the token obtained earlier.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn dial(&self, profile: &Profile) -> Result<AuthenticatedConn>;

    async fn authenticate(&self, profile: &Profile, conn: &mut AuthenticatedConn) -> Result<String>;
}

/// SSL-VPN client
pub struct VpnClient {
    orchestrator: TunnelOrchestrator,
    authenticator: Arc<dyn Authenticator>,
    session: Arc<Session>,
    profile: Mutex<Option<Profile>>,
    tunnel: Mutex<Option<Tunnel>>,
}

impl VpnClient {
    /// Create a client from validated configuration and its collaborators
    pub fn new(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        tun_factory: Arc<dyn TunFactory>,
        routes: Arc<dyn RouteController>,
        dtls: Arc<dyn DtlsConnector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            orchestrator: TunnelOrchestrator::new(config, tun_factory, routes, dtls),
            authenticator,
            session: Session::new(),
            profile: Mutex::new(None),
            tunnel: Mutex::new(None),
        })
    }

    /// Client using the native TUN device, the `ip` route controller and
    /// the built-in DTLS resumption
    pub fn native(config: Config, authenticator: Arc<dyn Authenticator>) -> Result<Self> {
        Self::new(
            config,
            authenticator,
            Arc::new(NativeTunFactory),
            Arc::new(IpRouteController::default()),
            Arc::new(ResumingConnector::default()),
        )
    }

    pub fn config(&self) -> &Config {
        self.orchestrator.config()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<ConnSession>> {
        self.session.current().filter(|cs| !cs.is_closed())
    }

    fn disconnected_message(&self) -> String {
        match lock(&self.profile).as_ref() {
            Some(profile) => format!("disconnected from {}", profile.host),
            None => "disconnected".to_string(),
        }
    }

    /// Authenticate with `profile` and bring the tunnel up
    pub async fn connect(&self, profile: Profile) -> Result<()> {
        profile.validate()?;
        if self.is_connected() {
            return Err(VpnError::InvalidState(format!(
                "Already connected to {}",
                profile.host
            )));
        }
        log::info!("Connecting to {}", profile.host_with_port());

        let result = self.login_and_setup(&profile).await;
        *lock(&self.profile) = Some(profile);
        if let Err(e) = result {
            log::error!("Connect failed: {e}");
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    async fn login_and_setup(&self, profile: &Profile) -> Result<()> {
        let mut conn = self.authenticator.dial(profile).await?;
        let token = self.authenticator.authenticate(profile, &mut conn).await?;
        if token.is_empty() {
            return Err(VpnError::Authentication(format!(
                "{} issued no session token",
                profile.host
            )));
        }
        self.session.set_credentials(&token, make_master_secret()?);
        self.setup(conn).await
    }

    async fn setup(&self, conn: AuthenticatedConn) -> Result<()> {
        let tunnel = self.orchestrator.setup_tunnel(&self.session, conn).await?;
        log::info!(
            "Connected to {} as {}",
            tunnel.conn.hostname,
            tunnel.conn.vpn_address
        );
        *lock(&self.tunnel) = Some(tunnel);
        Ok(())
    }

    /// Re-establish the tunnel with the existing session token.
    ///
    /// Does nothing while connected. Only meant for short outages; an expired
    /// token makes negotiation fail and a full `connect` is needed.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let profile = lock(&self.profile)
            .clone()
            .ok_or_else(|| VpnError::InvalidState("Never connected".to_string()))?;
        if self.session.token().is_empty() {
            return Err(VpnError::InvalidState("No session token to reuse".to_string()));
        }
        log::info!("Reconnecting to {}", profile.host_with_port());

        self.session.set_master_secret(make_master_secret()?);
        let result = async {
            let conn = self.authenticator.dial(&profile).await?;
            self.setup(conn).await
        }
        .await;
        if let Err(e) = result {
            log::error!("Reconnect failed: {e}");
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Close the tunnel on user request and undo routes and DNS
    pub async fn disconnect(&self) {
        self.session.set_active_close(true);
        let tunnel = lock(&self.tunnel).take();
        if let Some(Tunnel { conn, plan }) = tunnel {
            if !conn.is_closed() {
                let plan = plan.with_resolved_excludes(&conn);
                if let Err(e) = self.orchestrator.routes().reset(&plan).await {
                    log::error!("Route reset failed: {e}");
                }
            }
            conn.close();
        }
    }

    /// Tunnel status, available once DTLS setup finished either way
    pub async fn status(&self) -> Result<serde_json::Value> {
        let cs = self
            .current()
            .ok_or_else(|| VpnError::InvalidState(self.disconnected_message()))?;
        cs.wait_dtls_setup().await;
        if cs.is_closed() {
            return Err(VpnError::InvalidState(self.disconnected_message()));
        }
        Ok(serde_json::to_value(cs.snapshot())?)
    }

    /// Byte counters of the current tunnel
    pub fn stats(&self) -> Result<StatSnapshot> {
        self.current()
            .map(|cs| cs.stat.snapshot())
            .ok_or_else(|| VpnError::InvalidState(self.disconnected_message()))
    }

    /// Wait until the current tunnel closes and report why
    pub async fn wait_closed(&self) -> CloseReason {
        self.session.wait_closed().await
    }
}

impl Drop for VpnClient {
    fn drop(&mut self) {
        // the TUN bridge resets routes on its way out
        if let Some(tunnel) = lock(&self.tunnel).take() {
            tunnel.conn.close();
        }
    }
}
