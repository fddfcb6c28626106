//! Routing and DNS configuration
//!
//! The tunnel core decides *what* has to be routed ([`RoutePlan`]); a
//! [`RouteController`] applies it to the operating system.

use crate::error::{Result, VpnError};
use crate::session::{lock, ConnSession};
use async_trait::async_trait;
use ipnet::{ipv4_mask_to_prefix, Ipv4Net};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Metric of routes through the tunnel
pub const TUNNEL_ROUTE_METRIC: u32 = 6;
/// Metric of routes kept on the physical interface
pub const EXCLUDE_ROUTE_METRIC: u32 = 5;
/// Metric given to the original default route in full-tunnel mode
pub const DEFAULT_ROUTE_METRIC: u32 = 10;

/// The physical interface carrying the TLS connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalInterface {
    pub name: String,
    pub ip4: String,
    pub gateway: String,
    /// Network of the interface, excluded from the tunnel when LAN access is allowed
    pub network: Option<Ipv4Net>,
}

/// Address configuration of the TUN interface
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    pub tun_name: String,
    pub address: Ipv4Net,
    pub mtu: u32,
}

impl InterfaceConfig {
    pub fn for_session(cs: &ConnSession) -> Result<Self> {
        Ok(Self {
            tun_name: cs.tun_name(),
            address: ip_mask_to_cidr(&cs.vpn_address, &cs.vpn_mask)?,
            mtu: cs.mtu,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteVia {
    /// Through the TUN interface
    Tunnel,
    /// Through the local gateway
    Gateway,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub destination: Ipv4Net,
    pub via: RouteVia,
    pub metric: Option<u32>,
}

impl RouteRequest {
    pub fn tunnel(destination: Ipv4Net) -> Self {
        Self {
            destination,
            via: RouteVia::Tunnel,
            metric: Some(TUNNEL_ROUTE_METRIC),
        }
    }

    pub fn gateway(destination: Ipv4Net) -> Self {
        Self {
            destination,
            via: RouteVia::Gateway,
            metric: Some(EXCLUDE_ROUTE_METRIC),
        }
    }

    /// Host route through the tunnel
    pub fn tunnel_host(ip: Ipv4Addr) -> Self {
        Self::tunnel(Ipv4Net::from(ip))
    }

    /// Host route through the local gateway
    pub fn gateway_host(ip: Ipv4Addr) -> Self {
        Self::gateway(Ipv4Net::from(ip))
    }
}

/// Everything the routing collaborator has to apply for one tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    pub tun_name: String,
    pub local: LocalInterface,
    /// Gateway address, always reached through the local gateway
    pub server: RouteRequest,
    /// No split-include list: everything goes through the tunnel
    pub full_tunnel: bool,
    pub include: Vec<RouteRequest>,
    pub exclude: Vec<RouteRequest>,
    pub dns_servers: Vec<Ipv4Addr>,
    /// DNS servers that must be reached through the tunnel
    pub dns_routes: Vec<RouteRequest>,
    /// Host routes added for dynamically resolved exclude domains
    pub resolved_excludes: Vec<RouteRequest>,
}

impl RoutePlan {
    /// Plan the routes of a tunnel session
    pub fn for_session(cs: &ConnSession, local: &LocalInterface, allow_lan: bool) -> Result<Self> {
        let server_ip: Ipv4Addr = cs.server_address.parse().map_err(|e| {
            VpnError::Routing(format!("Invalid server address {}: {e}", cs.server_address))
        })?;
        let server = RouteRequest {
            destination: Ipv4Net::from(server_ip),
            via: RouteVia::Gateway,
            metric: None,
        };

        let full_tunnel = cs.split_include.is_empty();
        let include = if full_tunnel {
            vec![RouteRequest::tunnel(Ipv4Net::default())]
        } else {
            cs.split_include
                .iter()
                .map(|ip_mask| parse_ip_mask(ip_mask).map(|net| RouteRequest::tunnel(net.trunc())))
                .collect::<Result<Vec<_>>>()?
        };

        let mut exclude = cs
            .split_exclude
            .iter()
            .map(|ip_mask| parse_ip_mask(ip_mask).map(|net| RouteRequest::gateway(net.trunc())))
            .collect::<Result<Vec<_>>>()?;
        if allow_lan && full_tunnel {
            if let Some(lan) = local.network {
                exclude.push(RouteRequest::gateway(lan.trunc()));
            }
        }

        let dns_servers = cs
            .dns
            .iter()
            .filter_map(|dns| match dns.parse::<Ipv4Addr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    log::warn!("Ignoring non-IPv4 DNS server {dns}");
                    None
                }
            })
            .collect::<Vec<_>>();

        // DNS responses must cross the tunnel for domain based routing to see them
        let dns_routes = if cs.dynamic_split_include_domains.is_empty() {
            Vec::new()
        } else {
            dns_servers.iter().map(|ip| RouteRequest::tunnel_host(*ip)).collect()
        };

        Ok(Self {
            tun_name: cs.tun_name(),
            local: local.clone(),
            server,
            full_tunnel,
            include,
            exclude,
            dns_servers,
            dns_routes,
            resolved_excludes: Vec::new(),
        })
    }

    /// Add the host routes created for resolved exclude domains, so reset removes them
    pub fn with_resolved_excludes(mut self, cs: &ConnSession) -> Self {
        let resolved = lock(&cs.dynamic_split_exclude_resolved);
        let mut ips: Vec<Ipv4Addr> = resolved.values().flatten().copied().collect();
        ips.sort();
        ips.dedup();
        self.resolved_excludes = ips.into_iter().map(RouteRequest::gateway_host).collect();
        self
    }
}

/// Convert `ip` plus dotted `mask` to a prefix
pub fn ip_mask_to_cidr(ip: &str, mask: &str) -> Result<Ipv4Net> {
    let addr: Ipv4Addr = ip
        .trim()
        .parse()
        .map_err(|e| VpnError::Routing(format!("Invalid address {ip}: {e}")))?;
    let mask: Ipv4Addr = mask
        .trim()
        .parse()
        .map_err(|e| VpnError::Routing(format!("Invalid netmask {mask}: {e}")))?;
    let prefix = ipv4_mask_to_prefix(mask)
        .map_err(|e| VpnError::Routing(format!("Invalid netmask {mask}: {e}")))?;
    Ipv4Net::new(addr, prefix).map_err(|e| VpnError::Routing(e.to_string()))
}

/// Parse `a.b.c.d/m.m.m.m` or `a.b.c.d/len`
pub fn parse_ip_mask(ip_mask: &str) -> Result<Ipv4Net> {
    let (ip, mask) = ip_mask
        .split_once('/')
        .ok_or_else(|| VpnError::Routing(format!("Invalid route {ip_mask}")))?;
    if mask.contains('.') {
        ip_mask_to_cidr(ip, mask)
    } else {
        ip_mask
            .trim()
            .parse()
            .map_err(|e| VpnError::Routing(format!("Invalid route {ip_mask}: {e}")))
    }
}

/// Applies routing and DNS changes to the host
#[async_trait]
pub trait RouteController: Send + Sync {
    /// Discover the interface currently holding the default route
    async fn local_interface(&self) -> Result<LocalInterface>;

    /// Bring up the TUN interface with its address and MTU
    async fn configure_interface(&self, config: &InterfaceConfig) -> Result<()>;

    async fn set_routes(&self, plan: &RoutePlan) -> Result<()>;

    /// Add routes discovered at runtime. Best effort.
    async fn add_routes(&self, routes: &[RouteRequest]) -> Result<()>;

    /// Undo `set_routes`. Does nothing if routes were never set.
    async fn reset(&self, plan: &RoutePlan) -> Result<()>;
}

/// Linux implementation on top of the `ip` command and `/etc/resolv.conf`
pub struct IpRouteController {
    resolv_conf: PathBuf,
    resolv_backup: PathBuf,
    dns_delay: Duration,
    configured: AtomicBool,
    local: Mutex<Option<LocalInterface>>,
    tun_name: Mutex<String>,
    /// Pending resolv.conf override
    dns_task: Mutex<Option<JoinHandle<()>>>,
    /// Set once resolv.conf holds the tunnel's servers
    dns_overridden: Arc<AtomicBool>,
}

impl Default for IpRouteController {
    fn default() -> Self {
        Self::new("/etc/resolv.conf", "/tmp/resolv.conf.bak")
    }
}

impl IpRouteController {
    pub fn new(resolv_conf: impl Into<PathBuf>, resolv_backup: impl Into<PathBuf>) -> Self {
        Self {
            resolv_conf: resolv_conf.into(),
            resolv_backup: resolv_backup.into(),
            // some cloud images rewrite resolv.conf right after route changes
            dns_delay: Duration::from_secs(2),
            configured: AtomicBool::new(false),
            local: Mutex::new(None),
            tun_name: Mutex::new(String::new()),
            dns_task: Mutex::new(None),
            dns_overridden: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wait `delay` after the routes are set before touching resolv.conf
    pub fn with_dns_delay(mut self, delay: Duration) -> Self {
        self.dns_delay = delay;
        self
    }

    /// Override resolv.conf after the DNS delay
    fn schedule_dns_override(&self, servers: Vec<Ipv4Addr>) {
        let resolv_conf = self.resolv_conf.clone();
        let backup = self.resolv_backup.clone();
        let delay = self.dns_delay;
        let overridden = self.dns_overridden.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match override_resolv_conf(&resolv_conf, &backup, &servers) {
                Ok(()) => overridden.store(true, Ordering::SeqCst),
                Err(e) => log::error!("Set DNS failed: {e}"),
            }
        });
        if let Some(previous) = lock(&self.dns_task).replace(task) {
            previous.abort();
        }
    }

    /// Cancel a pending override, then undo a completed one
    async fn restore_dns(&self) -> Result<()> {
        let task = lock(&self.dns_task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if self.dns_overridden.swap(false, Ordering::SeqCst) {
            restore_resolv_conf(&self.resolv_conf, &self.resolv_backup)?;
        }
        Ok(())
    }

    async fn ip(args: &[&str]) -> Result<String> {
        log::debug!("ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| VpnError::Routing(format!("Failed to run ip: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(VpnError::Routing(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn apply(route: &RouteRequest, tun_name: &str, local: &LocalInterface) -> Result<()> {
        let destination = route.destination.to_string();
        let metric = route.metric.map(|m| m.to_string());
        let mut args = vec!["-4", "route", "replace", destination.as_str()];
        match route.via {
            RouteVia::Tunnel => args.extend(["dev", tun_name]),
            RouteVia::Gateway => {
                args.extend(["via", local.gateway.as_str(), "dev", local.name.as_str()])
            }
        }
        if let Some(ref metric) = metric {
            args.extend(["metric", metric.as_str()]);
        }
        Self::ip(&args).await.map(|_| ())
    }

    async fn remove(route: &RouteRequest, local: &LocalInterface) {
        let destination = route.destination.to_string();
        let mut args = vec!["-4", "route", "del", destination.as_str()];
        if route.via == RouteVia::Gateway {
            args.extend(["dev", local.name.as_str()]);
        }
        if let Err(e) = Self::ip(&args).await {
            log::debug!("{e}");
        }
    }

    fn local_or_err(&self) -> Result<LocalInterface> {
        lock(&self.local)
            .clone()
            .ok_or_else(|| VpnError::Routing("Local interface unknown".to_string()))
    }
}

#[async_trait]
impl RouteController for IpRouteController {
    async fn local_interface(&self) -> Result<LocalInterface> {
        let route = Self::ip(&["-4", "route", "get", "8.8.8.8"]).await?;
        let mut local = parse_route_get(&route)?;
        if let Ok(addrs) = Self::ip(&["-4", "-o", "addr", "show", "dev", &local.name]).await {
            local.network = parse_addr_network(&addrs, &local.ip4);
        }
        log::info!(
            "Local interface {} address {} gateway {}",
            local.name,
            local.ip4,
            local.gateway
        );
        *lock(&self.local) = Some(local.clone());
        Ok(local)
    }

    async fn configure_interface(&self, config: &InterfaceConfig) -> Result<()> {
        let mtu = config.mtu.to_string();
        let address = config.address.to_string();
        Self::ip(&["link", "set", "dev", &config.tun_name, "up"]).await?;
        Self::ip(&["link", "set", "dev", &config.tun_name, "multicast", "off"]).await?;
        if config.mtu > 0 {
            Self::ip(&["link", "set", "dev", &config.tun_name, "mtu", &mtu]).await?;
        }
        Self::ip(&["-4", "addr", "replace", &address, "dev", &config.tun_name]).await?;
        *lock(&self.tun_name) = config.tun_name.clone();
        Ok(())
    }

    async fn set_routes(&self, plan: &RoutePlan) -> Result<()> {
        if lock(&self.local).is_none() {
            *lock(&self.local) = Some(plan.local.clone());
        }
        let local = self.local_or_err()?;
        *lock(&self.tun_name) = plan.tun_name.clone();
        self.configured.store(true, Ordering::SeqCst);

        Self::apply(&plan.server, &plan.tun_name, &local).await?;

        if plan.full_tunnel {
            // demote the existing default route below the tunnel
            for _ in 0..8 {
                if Self::ip(&["-4", "route", "del", "default", "dev", &local.name]).await.is_err() {
                    break;
                }
            }
            let metric = DEFAULT_ROUTE_METRIC.to_string();
            Self::ip(&[
                "-4", "route", "add", "default", "via", &local.gateway, "dev", &local.name,
                "metric", &metric,
            ])
            .await?;
        }

        for route in plan.include.iter().chain(plan.exclude.iter()) {
            Self::apply(route, &plan.tun_name, &local).await?;
        }

        if !plan.dns_servers.is_empty() {
            for route in &plan.dns_routes {
                if let Err(e) = Self::apply(route, &plan.tun_name, &local).await {
                    log::warn!("DNS route failed: {e}");
                }
            }

            self.schedule_dns_override(plan.dns_servers.clone());
        }
        Ok(())
    }

    async fn add_routes(&self, routes: &[RouteRequest]) -> Result<()> {
        let local = self.local_or_err()?;
        let tun_name = lock(&self.tun_name).clone();
        for route in routes {
            if let Err(e) = Self::apply(route, &tun_name, &local).await {
                log::debug!("Dynamic route {} failed: {e}", route.destination);
            }
        }
        Ok(())
    }

    async fn reset(&self, plan: &RoutePlan) -> Result<()> {
        if !self.configured.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let local = self.local_or_err()?;

        if plan.full_tunnel {
            let _ = Self::ip(&["-4", "route", "del", "default", "dev", &local.name]).await;
            if let Err(e) = Self::ip(&[
                "-4", "route", "add", "default", "via", &local.gateway, "dev", &local.name,
            ])
            .await
            {
                log::warn!("Restoring default route failed: {e}");
            }
        }

        Self::remove(&plan.server, &local).await;
        for route in plan.exclude.iter().chain(plan.resolved_excludes.iter()) {
            Self::remove(route, &local).await;
        }

        self.restore_dns().await?;
        log::info!("Routes reset");
        Ok(())
    }
}

/// Parse `ip -4 route get` output: `8.8.8.8 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 0`
pub fn parse_route_get(output: &str) -> Result<LocalInterface> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    let value = |key: &str| {
        tokens
            .windows(2)
            .find(|w| w[0] == key)
            .map(|w| w[1].to_string())
    };

    let name = value("dev")
        .ok_or_else(|| VpnError::Routing("No default route interface".to_string()))?;
    Ok(LocalInterface {
        name,
        ip4: value("src").unwrap_or_default(),
        gateway: value("via").unwrap_or_default(),
        network: None,
    })
}

/// Find the prefix of `ip4` in `ip -4 -o addr show` output
pub fn parse_addr_network(output: &str, ip4: &str) -> Option<Ipv4Net> {
    output
        .split_whitespace()
        .filter_map(|token| token.parse::<Ipv4Net>().ok())
        .find(|net| net.addr().to_string() == ip4)
        .map(|net| net.trunc())
}

/// Back up `resolv_conf` and replace it with the tunnel's name servers
pub fn override_resolv_conf(resolv_conf: &Path, backup: &Path, servers: &[Ipv4Addr]) -> Result<()> {
    fs::copy(resolv_conf, backup)
        .map_err(|e| VpnError::Dns(format!("Backup of {} failed: {e}", resolv_conf.display())))?;
    let content: String = servers
        .iter()
        .map(|dns| format!("nameserver {dns}\n"))
        .collect();
    fs::write(resolv_conf, content)
        .map_err(|e| VpnError::Dns(format!("Writing {} failed: {e}", resolv_conf.display())))
}

/// Put the backed up resolver configuration back in place and drop the backup
pub fn restore_resolv_conf(resolv_conf: &Path, backup: &Path) -> Result<()> {
    if !backup.exists() {
        return Ok(());
    }
    fs::copy(backup, resolv_conf)
        .map_err(|e| VpnError::Dns(format!("Restoring {} failed: {e}", resolv_conf.display())))?;
    fs::remove_file(backup)
        .map_err(|e| VpnError::Dns(format!("Removing {} failed: {e}", backup.display())))
}
