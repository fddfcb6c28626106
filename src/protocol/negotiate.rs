//! Tunnel negotiation: the `CONNECT /CSCOSSLC/tunnel` exchange
//!
//! The request advertises client capabilities (MTU, session cookie, DTLS
//! master secret and cipher suites). The `200 OK` response headers carry the
//! tunnel parameters, parsed here into [`TunnelParams`].

use super::constants::{MAX_MTU, TUNNEL_PATH};
use crate::error::{Result, VpnError};
use regex::Regex;
use std::fmt::Write as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// DTLS cipher suites advertised to the gateway
pub const ADVERTISED_DTLS_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:AES128-GCM-SHA256";

/// Upper bound for the response head, guards against a misbehaving peer
const MAX_RESPONSE_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// Client side of the CONNECT request
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub host_with_port: String,
    pub client_hostname: String,
    pub user_agent: String,
    pub mtu: u16,
    pub session_token: String,
    pub local_address: String,
    pub master_secret: Vec<u8>,
    /// `None` when DTLS is disabled
    pub dtls_ciphers: Option<String>,
}

impl TunnelRequest {
    /// Render the request head
    pub fn to_http(&self) -> String {
        let mut req = String::with_capacity(512);
        let _ = write!(req, "CONNECT {TUNNEL_PATH} HTTP/1.1\r\n");
        let _ = write!(req, "Host: {}\r\n", self.host_with_port);
        let _ = write!(req, "User-Agent: {}\r\n", self.user_agent);
        let _ = write!(req, "X-CSTP-Version: 1\r\n");
        let _ = write!(req, "X-CSTP-Hostname: {}\r\n", self.client_hostname);
        let _ = write!(req, "X-CSTP-VPNAddress-Type: IPv4\r\n");
        let _ = write!(req, "X-CSTP-MTU: {}\r\n", self.mtu);
        let _ = write!(req, "X-CSTP-Base-MTU: {}\r\n", self.mtu);
        let _ = write!(req, "Cookie: webvpn={}\r\n", self.session_token);
        if !self.local_address.is_empty() {
            let _ = write!(req, "X-CSTP-Local-VPNAddress-IP4: {}\r\n", self.local_address);
        }
        let _ = write!(
            req,
            "X-DTLS-Master-Secret: {}\r\n",
            hex::encode(&self.master_secret)
        );
        if let Some(ref ciphers) = self.dtls_ciphers {
            let _ = write!(req, "X-DTLS12-CipherSuite: {ciphers}\r\n");
        }
        req.push_str("\r\n");
        req
    }
}

/// Response headers, names compared case-insensitively, repeats preserved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelHeaders(Vec<(String, String)>);

impl TunnelHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, empty string when absent
    pub fn get(&self, name: &str) -> &str {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// All non-empty values for a repeatable header
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(n, v)| n.eq_ignore_ascii_case(name) && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
            .collect()
    }

    /// Integer header value, 0 when absent or malformed
    pub fn get_int(&self, name: &str) -> u32 {
        self.get(name).trim().parse().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

/// Read the response head of the CONNECT request.
///
/// The reader is left positioned on the first tunnel frame.
pub async fn read_response<R>(reader: &mut R) -> Result<TunnelHeaders>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let before = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(VpnError::Negotiation(
                "connection closed during tunnel negotiation".to_string(),
            ));
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(VpnError::Negotiation("response head too large".to_string()));
        }
        let line = &head[before..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut raw_headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(VpnError::Negotiation("incomplete response head".to_string()));
        }
        Err(e) => {
            return Err(VpnError::Negotiation(format!("malformed response: {e}")));
        }
    }

    let code = response.code.unwrap_or(0);
    if code != 200 {
        return Err(VpnError::Negotiation(format!(
            "{code} {}",
            response.reason.unwrap_or("")
        )));
    }

    let mut headers = TunnelHeaders::new();
    for header in response.headers.iter() {
        headers.push(
            header.name,
            String::from_utf8_lossy(header.value).trim().to_string(),
        );
    }
    Ok(headers)
}

/// Tunnel parameters assigned by the gateway
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelParams {
    pub vpn_address: String,
    pub vpn_mask: String,
    pub mtu: u32,
    pub dns: Vec<String>,
    pub split_include: Vec<String>,
    pub split_exclude: Vec<String>,
    pub tls_dpd: u32,
    pub tls_keepalive: u32,
    pub dtls_id: String,
    pub dtls_port: String,
    pub dtls_dpd: u32,
    pub dtls_keepalive: u32,
    pub dtls_cipher_suite: String,
    pub dynamic_include_domains: Vec<String>,
    pub dynamic_exclude_domains: Vec<String>,
}

impl TunnelParams {
    /// Parse the response headers. With `no_dtls` the DTLS cipher is `Unknown`.
    pub fn from_headers(headers: &TunnelHeaders, no_dtls: bool) -> Self {
        let mut dtls_id = headers.get("X-DTLS-Session-ID").to_string();
        if dtls_id.is_empty() {
            // newer ocserv releases
            dtls_id = headers.get("X-DTLS-App-ID").to_string();
        }

        let dtls_cipher_suite = if no_dtls {
            "Unknown".to_string()
        } else {
            headers.get("X-DTLS12-CipherSuite").to_string()
        };

        let (dynamic_include_domains, dynamic_exclude_domains) =
            parse_post_auth_domains(headers.get("X-CSTP-Post-Auth-XML"));

        let mut mtu = headers.get_int("X-CSTP-MTU");
        if mtu as usize > MAX_MTU {
            log::warn!("Gateway MTU {mtu} exceeds the payload buffers, using {MAX_MTU}");
            mtu = MAX_MTU as u32;
        }

        Self {
            vpn_address: headers.get("X-CSTP-Address").to_string(),
            vpn_mask: headers.get("X-CSTP-Netmask").to_string(),
            mtu,
            dns: headers.get_all("X-CSTP-DNS"),
            split_include: headers.get_all("X-CSTP-Split-Include"),
            split_exclude: headers.get_all("X-CSTP-Split-Exclude"),
            tls_dpd: headers.get_int("X-CSTP-DPD"),
            tls_keepalive: headers.get_int("X-CSTP-Keepalive"),
            dtls_id,
            dtls_port: if no_dtls {
                String::new()
            } else {
                headers.get("X-DTLS-Port").to_string()
            },
            dtls_dpd: headers.get_int("X-DTLS-DPD"),
            dtls_keepalive: headers.get_int("X-DTLS-Keepalive"),
            dtls_cipher_suite,
            dynamic_include_domains,
            dynamic_exclude_domains,
        }
    }

    pub fn dynamic_split_tunneling(&self) -> bool {
        !self.dynamic_include_domains.is_empty() || !self.dynamic_exclude_domains.is_empty()
    }
}

/// Extract the dynamic split domain lists from the post-auth XML.
///
/// Include domains win when both lists are present.
fn parse_post_auth_domains(xml: &str) -> (Vec<String>, Vec<String>) {
    if xml.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let include = custom_attr(xml, "dynamic-split-include-domains");
    if !include.is_empty() {
        return (include, Vec::new());
    }
    (Vec::new(), custom_attr(xml, "dynamic-split-exclude-domains"))
}

fn custom_attr(xml: &str, tag: &str) -> Vec<String> {
    let pattern = format!(r"<{tag}>\s*(?:<!\[CDATA\[)?([^<\]]*)(?:\]\]>)?\s*</{tag}>");
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| {
            m.as_str()
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
