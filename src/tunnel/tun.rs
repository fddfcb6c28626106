//! Bridge between the TUN interface and the channel queues

use super::split;
use crate::error::{Result, VpnError};
use crate::routing::{RouteController, RoutePlan};
use crate::session::ConnSession;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Packet oriented virtual interface.
///
/// `offset` bytes in front of the packet are reserved for a platform header
/// on both read and write.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Interface name as assigned by the OS
    fn name(&self) -> String;

    /// Read one packet into `buf[offset..]`, returning its length
    async fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize>;

    /// Write the packet found at `buf[offset..]`
    async fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize>;

    async fn close(&self);
}

/// Creates TUN devices for new tunnels
#[async_trait]
pub trait TunFactory: Send + Sync {
    async fn create(&self, name: &str, mtu: u32) -> Result<Arc<dyn TunDevice>>;
}

/// `utun` prefixes each packet with the address family
const MACOS_AF_HEADER: usize = if cfg!(target_os = "macos") { 4 } else { 0 };
const AF_INET: u8 = 2;
const AF_INET6: u8 = 30;

/// TUN device backed by the `tun` crate
pub struct NativeTun {
    name: String,
    reader: Mutex<Option<ReadHalf<::tun::AsyncDevice>>>,
    writer: Mutex<Option<WriteHalf<::tun::AsyncDevice>>>,
    closed: CancellationToken,
}

impl NativeTun {
    /// Create and bring up the interface
    pub fn create(name: &str, mtu: u32) -> Result<Self> {
        use ::tun::Device as _;

        let mut config = ::tun::Configuration::default();
        // a bare `utun` lets the kernel pick the unit number
        if !(cfg!(target_os = "macos") && name == "utun") {
            config.name(name);
        }
        if mtu > 0 {
            config.mtu(mtu as i32);
        }
        config.up();

        #[cfg(target_os = "linux")]
        config.platform(|config| {
            config.packet_information(false);
        });

        let device = ::tun::create_as_async(&config)
            .map_err(|e| VpnError::TunTap(format!("Failed to create TUN device: {e}")))?;
        let name = device
            .get_ref()
            .name()
            .map_err(|e| VpnError::TunTap(format!("Failed to read TUN name: {e}")))?;
        log::info!("TUN device {name} created");

        let (reader, writer) = tokio::io::split(device);
        Ok(Self {
            name,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        })
    }

    fn check_offset(offset: usize) -> Result<()> {
        if offset < MACOS_AF_HEADER {
            return Err(VpnError::TunTap(format!(
                "Offset {offset} leaves no room for the {MACOS_AF_HEADER} byte packet header"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TunDevice for NativeTun {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        Self::check_offset(offset)?;
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| VpnError::TunTap("TUN device closed".to_string()))?;
        let start = offset - MACOS_AF_HEADER;
        let n = tokio::select! {
            _ = self.closed.cancelled() => {
                return Err(VpnError::TunTap("TUN device closed".to_string()));
            }
            r = reader.read(&mut buf[start..]) => r?,
        };
        if n == 0 {
            return Err(VpnError::TunTap("TUN device returned end of file".to_string()));
        }
        Ok(n.saturating_sub(MACOS_AF_HEADER))
    }

    async fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        Self::check_offset(offset)?;
        if buf.len() <= offset {
            return Ok(0);
        }
        let start = offset - MACOS_AF_HEADER;
        if MACOS_AF_HEADER > 0 {
            let family = if buf[offset] >> 4 == 6 { AF_INET6 } else { AF_INET };
            buf[start..offset].copy_from_slice(&[0, 0, 0, family]);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| VpnError::TunTap("TUN device closed".to_string()))?;
        writer.write_all(&buf[start..]).await?;
        Ok(buf.len() - offset)
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        log::info!("TUN device {} closed", self.name);
    }
}

/// Creates [`NativeTun`] devices
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTunFactory;

#[async_trait]
impl TunFactory for NativeTunFactory {
    async fn create(&self, name: &str, mtu: u32) -> Result<Arc<dyn TunDevice>> {
        Ok(Arc::new(NativeTun::create(name, mtu)?))
    }
}

/// Device to outbound queues. DTLS is used while it is connected.
pub async fn tun_to_payload_out(dev: Arc<dyn TunDevice>, cs: Arc<ConnSession>, offset: usize) {
    loop {
        let mut pl = cs.pool().acquire();
        let read = tokio::select! {
            _ = cs.close_token().cancelled() => None,
            r = dev.read(&mut pl.data, offset) => Some(r),
        };
        let n = match read {
            None => break,
            Some(Err(e)) => {
                log::error!("TUN to payload out error: {e}");
                break;
            }
            Some(Ok(n)) => n,
        };
        if n == 0 || offset + n > pl.data.len() {
            cs.pool().release(pl);
            continue;
        }
        pl.data.copy_within(offset..offset + n, 0);
        pl.data.truncate(n);

        if cs.is_dtls_connected() {
            tokio::select! {
                _ = cs.payload_out_dtls.sender().send(pl) => {}
                // dropped when DTLS goes away while the queue is full
                _ = cs.dtls().token().cancelled() => {}
            }
        } else {
            let sent = tokio::select! {
                r = cs.payload_out_tls.sender().send(pl) => r.is_ok(),
                _ = cs.close_token().cancelled() => false,
            };
            if !sent {
                break;
            }
        }
    }

    log::info!("TUN to payload out exit");
    dev.close().await;
}

/// Inbound queue to device.
///
/// Owns teardown: unless the user disconnected, routes are reset when the
/// bridge stops.
pub async fn payload_in_to_tun(
    dev: Arc<dyn TunDevice>,
    cs: Arc<ConnSession>,
    offset: usize,
    routes: Arc<dyn RouteController>,
    plan: RoutePlan,
) {
    match cs.payload_in.take_receiver() {
        Some(mut rx) => loop {
            let mut pl = tokio::select! {
                _ = cs.close_token().cancelled() => break,
                p = rx.recv() => match p {
                    Some(p) => p,
                    None => break,
                },
            };

            if cs.dynamic_split_tunneling && split::is_dns_response(&pl.data) {
                let packet = pl.data.clone();
                let cs = cs.clone();
                let routes = routes.clone();
                tokio::spawn(async move {
                    split::dynamic_split_routes(&packet, &cs, routes.as_ref()).await;
                });
            }

            let written = if offset > 0 {
                let mut expand = vec![0u8; offset + pl.len()];
                expand[offset..].copy_from_slice(&pl.data);
                dev.write(&mut expand, offset).await
            } else {
                dev.write(&mut pl.data, 0).await
            };
            cs.pool().release(pl);
            if let Err(e) = written {
                log::error!("Payload in to TUN error: {e}");
                break;
            }
        },
        None => log::error!("Inbound queue already consumed"),
    }

    log::info!("Payload in to TUN exit");
    let active = cs.session().is_some_and(|s| s.is_active_close());
    if !active {
        if let Err(e) = routes.reset(&plan.with_resolved_excludes(&cs)).await {
            log::error!("Route reset failed: {e}");
        }
    }
    cs.close();
    dev.close().await;
}

/// Start both directions of the bridge
pub fn start(
    dev: Arc<dyn TunDevice>,
    cs: Arc<ConnSession>,
    offset: usize,
    routes: Arc<dyn RouteController>,
    plan: RoutePlan,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let out = tokio::spawn(tun_to_payload_out(dev.clone(), cs.clone(), offset));
    let inbound = tokio::spawn(payload_in_to_tun(dev, cs, offset, routes, plan));
    (out, inbound)
}
