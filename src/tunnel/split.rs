//! Domain based split tunneling
//!
//! DNS responses arriving through the tunnel are inspected; A records of
//! configured domains become host routes, inside the tunnel for include
//! domains and around it for exclude domains.

use crate::protocol::constants::DNS_PORT;
use crate::routing::{RouteController, RouteRequest};
use crate::session::{lock, ConnSession, ResolvedCache};
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

const UDP_PROTOCOL: u8 = 17;
const UDP_HEADER_LEN: usize = 8;

/// UDP payload of an IPv4 packet sent from port 53, if any
fn dns_payload(packet: &[u8]) -> Option<&[u8]> {
    let first = *packet.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = ((first & 0x0f) as usize) * 4;
    if ihl < 20 || packet.len() < ihl + UDP_HEADER_LEN || packet[9] != UDP_PROTOCOL {
        return None;
    }
    let src_port = u16::from_be_bytes([packet[ihl], packet[ihl + 1]]);
    if src_port != DNS_PORT {
        return None;
    }
    Some(&packet[ihl + UDP_HEADER_LEN..])
}

/// Cheap check run on every inbound packet
pub fn is_dns_response(packet: &[u8]) -> bool {
    dns_payload(packet).is_some()
}

/// Query name (without trailing dot) and A record addresses of a DNS response
pub fn parse_dns_answers(packet: &[u8]) -> Option<(String, Vec<Ipv4Addr>)> {
    let message = Message::from_vec(dns_payload(packet)?).ok()?;
    let query = message.queries().first()?;

    let answers: Vec<Ipv4Addr> = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect();
    if answers.is_empty() {
        return None;
    }

    let name = query.name().to_utf8();
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    Some((name, answers))
}

/// `query` equals one of `domains` or is a subdomain of it
pub fn match_domain(domains: &[String], query: &str) -> bool {
    domains.iter().any(|domain| {
        let domain = domain.trim().trim_end_matches('.');
        !domain.is_empty()
            && (query.eq_ignore_ascii_case(domain)
                || query
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", domain.to_ascii_lowercase())))
    })
}

/// Record `answers` for `query` and return the addresses not seen before
pub fn merge_resolved(
    cache: &Mutex<ResolvedCache>,
    query: &str,
    answers: &[Ipv4Addr],
) -> Vec<Ipv4Addr> {
    let mut cache = lock(cache);
    let known = cache.entry(query.to_string()).or_insert_with(HashSet::new);
    answers
        .iter()
        .copied()
        .filter(|ip| known.insert(*ip))
        .collect()
}

/// Inspect one inbound packet and add routes for newly resolved addresses.
///
/// Best effort: malformed packets and routing failures are only logged.
pub async fn dynamic_split_routes(packet: &[u8], cs: &ConnSession, routes: &dyn RouteController) {
    let Some((query, answers)) = parse_dns_answers(packet) else {
        return;
    };

    let (fresh, requests): (Vec<Ipv4Addr>, Vec<RouteRequest>) =
        if match_domain(&cs.dynamic_split_include_domains, &query) {
            let fresh = merge_resolved(&cs.dynamic_split_include_resolved, &query, &answers);
            let requests = fresh.iter().map(|ip| RouteRequest::tunnel_host(*ip)).collect();
            (fresh, requests)
        } else if match_domain(&cs.dynamic_split_exclude_domains, &query) {
            let fresh = merge_resolved(&cs.dynamic_split_exclude_resolved, &query, &answers);
            let requests = fresh.iter().map(|ip| RouteRequest::gateway_host(*ip)).collect();
            (fresh, requests)
        } else {
            return;
        };

    if requests.is_empty() {
        return;
    }
    log::debug!("Dynamic split routes for {query}: {fresh:?}");
    if let Err(e) = routes.add_routes(&requests).await {
        log::warn!("Adding dynamic routes for {query} failed: {e}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, Record, RecordType};

    /// IPv4/UDP packet from 10.0.0.1:53 carrying a DNS answer
    pub(crate) fn dns_response_packet(name: &str, ips: &[Ipv4Addr]) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_message_type(MessageType::Response);
        let name = Name::from_ascii(name).unwrap();
        message.add_query(Query::query(name.clone(), RecordType::A));
        for ip in ips {
            message.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A(*ip))));
        }
        let dns = message.to_vec().unwrap();

        let udp_len = (UDP_HEADER_LEN + dns.len()) as u16;
        let total_len = 20 + udp_len;
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, UDP_PROTOCOL, 0x00, 0x00, 10, 0,
            0, 1, 10, 0, 0, 5,
        ];
        packet[2..4].copy_from_slice(&total_len.to_be_bytes());
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(&40000u16.to_be_bytes());
        packet.extend_from_slice(&udp_len.to_be_bytes());
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&dns);
        packet
    }

    #[test]
    fn test_parse_dns_answers() {
        let packet = dns_response_packet("www.example.com.", &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert!(is_dns_response(&packet));
        let (name, answers) = parse_dns_answers(&packet).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(answers, vec![Ipv4Addr::new(1, 1, 1, 1)]);

        let empty = dns_response_packet("www.example.com.", &[]);
        assert!(parse_dns_answers(&empty).is_none());
    }

    #[test]
    fn test_non_dns_packets_ignored() {
        let mut packet = dns_response_packet("example.com.", &[Ipv4Addr::new(1, 1, 1, 1)]);
        packet[20..22].copy_from_slice(&443u16.to_be_bytes());
        assert!(!is_dns_response(&packet));

        let mut tcp = dns_response_packet("example.com.", &[Ipv4Addr::new(1, 1, 1, 1)]);
        tcp[9] = 6;
        assert!(!is_dns_response(&tcp));

        assert!(!is_dns_response(&[0x60, 0, 0, 0]));
        assert!(!is_dns_response(&[]));
    }

    #[test]
    fn test_domain_suffix_match() {
        let domains = vec!["example.com".to_string(), "".to_string()];
        assert!(match_domain(&domains, "example.com"));
        assert!(match_domain(&domains, "www.Example.com"));
        assert!(!match_domain(&domains, "badexample.com"));
        assert!(!match_domain(&domains, "com"));
    }

    #[test]
    fn test_incremental_cache_update() {
        let cache = Mutex::new(ResolvedCache::new());
        let first = merge_resolved(&cache, "example.com", &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(first, vec![Ipv4Addr::new(1, 1, 1, 1)]);

        let second = merge_resolved(
            &cache,
            "example.com",
            &[Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2)],
        );
        assert_eq!(second, vec![Ipv4Addr::new(2, 2, 2, 2)]);
        assert_eq!(lock(&cache)["example.com"].len(), 2);

        let third = merge_resolved(&cache, "example.com", &[Ipv4Addr::new(2, 2, 2, 2)]);
        assert!(third.is_empty());
    }
}
