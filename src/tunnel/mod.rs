//! Tunnel setup
//!
//! [`TunnelOrchestrator::setup_tunnel`] takes an authenticated stream,
//! negotiates the tunnel over it, and brings up the data plane in order:
//! TUN device and routes, TLS channel, DTLS channel, supervisors. A failure
//! before the channels start undoes everything done so far.

pub mod dtls;
pub mod split;
pub mod supervisor;
pub mod tls;
pub mod tun;

use self::dtls::DtlsConnector;
use self::tun::{TunDevice, TunFactory};
use crate::config::Config;
use crate::error::{Result, VpnError};
use crate::protocol::negotiate::{
    read_response, TunnelHeaders, TunnelParams, TunnelRequest, ADVERTISED_DTLS_CIPHERS,
};
use crate::routing::{InterfaceConfig, RouteController, RoutePlan};
use crate::session::{ConnSession, Endpoint, Session};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Byte stream the tunnel runs on, normally TLS over TCP
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Stream left behind by a successful authentication
pub struct AuthenticatedConn {
    /// Buffered so no byte read past the response head is lost
    pub stream: BufReader<Box<dyn TunnelStream>>,
    pub endpoint: Endpoint,
    /// Value of the `Host` header, `host:port`
    pub host_with_port: String,
}

impl AuthenticatedConn {
    pub fn new<S>(stream: S, endpoint: Endpoint, host_with_port: impl Into<String>) -> Self
    where
        S: TunnelStream + 'static,
    {
        Self {
            stream: BufReader::new(Box::new(stream)),
            endpoint,
            host_with_port: host_with_port.into(),
        }
    }
}

/// A running tunnel
#[derive(Clone)]
pub struct Tunnel {
    pub conn: Arc<ConnSession>,
    pub plan: RoutePlan,
}

/// `User-Agent` sent during negotiation
pub fn user_agent(cisco_compat: bool) -> String {
    if cisco_compat {
        "AnyConnect".to_string()
    } else {
        format!("{} {}", crate::NAME, crate::VERSION)
    }
}

/// Host name of this machine, `localhost` when it cannot be determined
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Send the CONNECT request and read the response head
pub async fn negotiate<S>(
    stream: &mut BufReader<S>,
    request: &TunnelRequest,
    dump_headers: bool,
) -> Result<TunnelHeaders>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.to_http().as_bytes()).await?;
    stream.flush().await?;

    let headers = read_response(stream).await?;
    if dump_headers {
        for (name, value) in headers.iter() {
            log::debug!("{name}: {value}");
        }
    }
    Ok(headers)
}

/// Wires the collaborators together for each new tunnel
pub struct TunnelOrchestrator {
    config: Config,
    tun_factory: Arc<dyn TunFactory>,
    routes: Arc<dyn RouteController>,
    dtls: Arc<dyn DtlsConnector>,
}

impl TunnelOrchestrator {
    pub fn new(
        config: Config,
        tun_factory: Arc<dyn TunFactory>,
        routes: Arc<dyn RouteController>,
        dtls: Arc<dyn DtlsConnector>,
    ) -> Self {
        Self {
            config,
            tun_factory,
            routes,
            dtls,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routes(&self) -> Arc<dyn RouteController> {
        self.routes.clone()
    }

    /// Negotiate over `conn` and start every tunnel task.
    ///
    /// On error the stream is shut down and no device, route or DNS change
    /// is left behind.
    pub async fn setup_tunnel(
        &self,
        session: &Arc<Session>,
        conn: AuthenticatedConn,
    ) -> Result<Tunnel> {
        let AuthenticatedConn {
            mut stream,
            endpoint,
            host_with_port,
        } = conn;
        let no_dtls = self.config.client.no_dtls;

        let request = TunnelRequest {
            host_with_port,
            client_hostname: local_hostname(),
            user_agent: user_agent(self.config.client.cisco_compat),
            mtu: self.config.tunnel.mtu,
            session_token: session.token(),
            local_address: endpoint.local_address.clone(),
            master_secret: session.master_secret(),
            dtls_ciphers: (!no_dtls).then(|| ADVERTISED_DTLS_CIPHERS.to_string()),
        };

        let dump_headers = self.config.logging.dump_headers;
        let headers = match negotiate(&mut stream, &request, dump_headers).await {
            Ok(headers) => headers,
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };
        let params = TunnelParams::from_headers(&headers, no_dtls);
        log::info!(
            "Tunnel negotiated: address {} mask {} mtu {}",
            params.vpn_address,
            params.vpn_mask,
            params.mtu
        );

        let cs = session.new_conn_session_with_capacity(
            endpoint,
            params,
            self.config.tunnel.queue_capacity,
        );

        let (dev, plan) = match self.setup_device(&cs).await {
            Ok(ready) => ready,
            Err(e) => {
                let _ = stream.shutdown().await;
                cs.close();
                return Err(e);
            }
        };
        log::info!("TLS channel negotiation succeeded");

        self::tun::start(
            dev,
            cs.clone(),
            self.config.tunnel.header_offset(),
            self.routes.clone(),
            plan.clone(),
        );
        if let Err(e) = tls::start(stream, cs.clone()) {
            cs.close();
            return Err(e);
        }

        if no_dtls || cs.dtls_port.is_empty() {
            cs.finish_dtls_setup();
        } else {
            tokio::spawn(dtls::run_channel(
                cs.clone(),
                self.dtls.clone(),
                session.master_secret(),
                self.config.tunnel.dtls_timeout(),
            ));
        }

        supervisor::spawn_dpd_timer(cs.clone());
        supervisor::spawn_read_deadline_timer(
            cs.clone(),
            self.config.tunnel.read_deadline_interval(),
        );

        Ok(Tunnel { conn: cs, plan })
    }

    /// Create the TUN device, then configure it and the routes
    async fn setup_device(&self, cs: &Arc<ConnSession>) -> Result<(Arc<dyn TunDevice>, RoutePlan)> {
        let dev = self
            .tun_factory
            .create(&self.config.tunnel.tun_name, cs.mtu)
            .await?;
        cs.set_tun_name(&dev.name());

        let mut planned = None;
        let configured = async {
            let local = self.routes.local_interface().await?;
            let plan = RoutePlan::for_session(cs, &local, self.config.client.allow_lan)?;
            let plan = planned.insert(plan);
            self.routes
                .configure_interface(&InterfaceConfig::for_session(cs)?)
                .await?;
            self.routes.set_routes(plan).await
        }
        .await;

        match (configured, planned) {
            (Ok(()), Some(plan)) => Ok((dev, plan)),
            (result, plan) => {
                if let Some(plan) = plan {
                    if let Err(e) = self.routes.reset(&plan).await {
                        log::error!("Route rollback failed: {e}");
                    }
                }
                dev.close().await;
                Err(result.err().unwrap_or_else(|| {
                    VpnError::InvalidState("Route plan missing after setup".to_string())
                }))
            }
        }
    }
}
