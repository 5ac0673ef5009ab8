//! Per-packet predicates used by filter table rules.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use usernet_packet::{Ipv4Header, Ipv6Header, TcpSegment, UdpHeader};

use crate::metrics::FilterMetrics;
use crate::stack::{Hook, IpFamily, PacketBuffer};
use crate::tracker::{matches_pattern, Tracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    /// The packet is malformed and must be dropped regardless of the remaining rules.
    pub hard_drop: bool,
}

impl MatchResult {
    pub const NO_MATCH: Self = Self {
        matched: false,
        hard_drop: false,
    };
    pub const MATCH: Self = Self {
        matched: true,
        hard_drop: false,
    };
    pub const HARD_DROP: Self = Self {
        matched: false,
        hard_drop: true,
    };

    pub fn from_bool(matched: bool) -> Self {
        if matched {
            Self::MATCH
        } else {
            Self::NO_MATCH
        }
    }
}

pub trait Matcher: fmt::Display + Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, hook: Hook, packet: &PacketBuffer<'_>) -> MatchResult;
}

/// Transport protocol number from the network header, or `None` when the header is too short.
pub(crate) fn transport_protocol(packet: &PacketBuffer<'_>) -> Option<u8> {
    match packet.family {
        IpFamily::V4 => Ipv4Header::parse(packet.network_header)
            .ok()
            .map(|h| h.protocol()),
        IpFamily::V6 => Ipv6Header::parse(packet.network_header)
            .ok()
            .map(|h| h.next_header()),
    }
}

pub(crate) fn destination(packet: &PacketBuffer<'_>) -> Option<IpAddr> {
    match packet.family {
        IpFamily::V4 => Ipv4Header::parse(packet.network_header)
            .ok()
            .map(|h| IpAddr::V4(h.dst())),
        IpFamily::V6 => Ipv6Header::parse(packet.network_header)
            .ok()
            .map(|h| IpAddr::V6(h.dst())),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProtocolMatcher {
    pub protocol: u8,
}

impl Matcher for ProtocolMatcher {
    fn name(&self) -> &'static str {
        "protocolMatcher"
    }

    fn matches(&self, _hook: Hook, packet: &PacketBuffer<'_>) -> MatchResult {
        match transport_protocol(packet) {
            Some(protocol) => MatchResult::from_bool(protocol == self.protocol),
            None => MatchResult::HARD_DROP,
        }
    }
}

impl fmt::Display for ProtocolMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            usernet_packet::IPPROTO_TCP => f.write_str("proto tcp"),
            usernet_packet::IPPROTO_UDP => f.write_str("proto udp"),
            usernet_packet::IPPROTO_ICMP => f.write_str("proto icmp"),
            usernet_packet::IPPROTO_ICMPV6 => f.write_str("proto icmpv6"),
            other => write!(f, "proto {other}"),
        }
    }
}

/// Destination port within an inclusive range.
#[derive(Debug, Clone, Copy)]
pub struct PortMatcher {
    pub start: u16,
    pub end: u16,
}

impl PortMatcher {
    fn destination_port(packet: &PacketBuffer<'_>) -> Option<u16> {
        let header = packet.transport_header;
        if header.len() < 4 {
            return None;
        }
        if let Ok(tcp) = TcpSegment::parse(header) {
            return Some(tcp.dst_port());
        }
        UdpHeader::parse(header).ok().map(|udp| udp.dst_port())
    }
}

impl Matcher for PortMatcher {
    fn name(&self) -> &'static str {
        "portMatcher"
    }

    fn matches(&self, _hook: Hook, packet: &PacketBuffer<'_>) -> MatchResult {
        match Self::destination_port(packet) {
            Some(port) => MatchResult::from_bool(self.start <= port && port <= self.end),
            None => MatchResult::NO_MATCH,
        }
    }
}

impl fmt::Display for PortMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "dport {}", self.start)
        } else {
            write!(f, "dport {}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone)]
pub struct IpMatcher {
    pub networks: Vec<IpNet>,
}

impl Matcher for IpMatcher {
    fn name(&self) -> &'static str {
        "ipMatcher"
    }

    fn matches(&self, _hook: Hook, packet: &PacketBuffer<'_>) -> MatchResult {
        let Some(dst) = destination(packet) else {
            return MatchResult::HARD_DROP;
        };
        MatchResult::from_bool(self.networks.iter().any(|net| net.contains(&dst)))
    }
}

impl fmt::Display for IpMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dst ")?;
        write_list(f, self.networks.iter())
    }
}

/// Destination resolves (per the tracker) to a domain matching one of the patterns.
pub struct DomainMatcher {
    pub tracker: Arc<Tracker>,
    pub patterns: Vec<String>,
}

impl Matcher for DomainMatcher {
    fn name(&self) -> &'static str {
        "domainMatcher"
    }

    fn matches(&self, _hook: Hook, packet: &PacketBuffer<'_>) -> MatchResult {
        let Some(dst) = destination(packet) else {
            return MatchResult::HARD_DROP;
        };
        let domains = self.tracker.get_domains_for_ip(dst);
        MatchResult::from_bool(domains.iter().any(|domain| {
            self.patterns
                .iter()
                .any(|pattern| matches_pattern(domain, pattern))
        }))
    }
}

impl fmt::Display for DomainMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("domain ")?;
        write_list(f, self.patterns.iter())
    }
}

/// Matches public destinations that were never seen in a DNS answer.
///
/// Paired with a drop target this closes the hole where a guest skips DNS and connects to a raw
/// address that happens to serve an allowed domain.
pub struct DnsResolvedOnlyMatcher {
    pub tracker: Arc<Tracker>,
    pub metrics: FilterMetrics,
}

impl Matcher for DnsResolvedOnlyMatcher {
    fn name(&self) -> &'static str {
        "dnsResolvedOnly"
    }

    fn matches(&self, _hook: Hook, packet: &PacketBuffer<'_>) -> MatchResult {
        let Some(dst) = destination(packet) else {
            return MatchResult::HARD_DROP;
        };
        if is_private_or_local(dst) {
            return MatchResult::NO_MATCH;
        }
        if self.tracker.get_domains_for_ip(dst).is_empty() {
            tracing::info!("Blocked direct IP access to: {dst} (not resolved via DNS)");
            self.metrics.direct_ip_blocked();
            return MatchResult::MATCH;
        }
        MatchResult::NO_MATCH
    }
}

impl fmt::Display for DnsResolvedOnlyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dns-resolved-only")
    }
}

/// Loopback, link-local (unicast or multicast) or RFC 1918 private space.
pub fn is_private_or_local(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || is_ipv4_link_local_multicast(v4)
                || v4.is_private()
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || (seg0 & 0xffc0) == 0xfe80 // fe80::/10
                || (seg0 & 0xff0f) == 0xff02 // ff02::/16 link-local multicast
        }
    }
}

fn is_ipv4_link_local_multicast(ip: std::net::Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    a == 224 && b == 0 && c == 0
}

/// Loopback or link-local unicast.
pub fn is_loopback_or_link_local(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn write_list<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
) -> fmt::Result {
    for (idx, item) in items.enumerate() {
        if idx > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;
    use usernet_packet::{Ipv4PacketBuilder, Ipv6PacketBuilder, TcpSegmentBuilder, UdpPacketBuilder};

    fn tcp_v4(dst: Ipv4Addr, dport: u16) -> Vec<u8> {
        let src = Ipv4Addr::new(192, 168, 127, 2);
        let seg = TcpSegmentBuilder::syn(40000, dport, 1)
            .build_vec(src.into(), dst.into())
            .unwrap();
        Ipv4PacketBuilder {
            src,
            dst,
            protocol: usernet_packet::IPPROTO_TCP,
            ttl: 64,
            identification: 1,
            payload: &seg,
        }
        .build_vec()
        .unwrap()
    }

    fn udp_v6(dst: Ipv6Addr, dport: u16) -> Vec<u8> {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let udp = UdpPacketBuilder {
            src_port: 5000,
            dst_port: dport,
            payload: b"x",
        }
        .build_vec(src.into(), dst.into())
        .unwrap();
        Ipv6PacketBuilder {
            src,
            dst,
            next_header: usernet_packet::IPPROTO_UDP,
            hop_limit: 64,
            payload: &udp,
        }
        .build_vec()
        .unwrap()
    }

    fn truncated() -> PacketBuffer<'static> {
        PacketBuffer {
            family: IpFamily::V4,
            network_header: &[0x45, 0, 0, 20],
            transport_header: &[],
            payload: &[],
        }
    }

    #[test]
    fn protocol_matcher() {
        let raw = tcp_v4(Ipv4Addr::new(1, 2, 3, 4), 443);
        let pkt = PacketBuffer::parse(&raw).unwrap();
        let tcp = ProtocolMatcher {
            protocol: usernet_packet::IPPROTO_TCP,
        };
        let udp = ProtocolMatcher {
            protocol: usernet_packet::IPPROTO_UDP,
        };
        assert_eq!(tcp.matches(Hook::Output, &pkt), MatchResult::MATCH);
        assert_eq!(udp.matches(Hook::Output, &pkt), MatchResult::NO_MATCH);
        assert_eq!(tcp.matches(Hook::Output, &truncated()), MatchResult::HARD_DROP);

        let raw = udp_v6("2001:db8::1".parse().unwrap(), 53);
        let pkt = PacketBuffer::parse(&raw).unwrap();
        assert_eq!(udp.matches(Hook::Output, &pkt), MatchResult::MATCH);
    }

    #[test]
    fn port_matcher_reads_tcp_and_udp() {
        let m = PortMatcher {
            start: 443,
            end: 443,
        };
        let raw = tcp_v4(Ipv4Addr::new(1, 2, 3, 4), 443);
        assert!(m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);
        let raw = tcp_v4(Ipv4Addr::new(1, 2, 3, 4), 80);
        assert!(!m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);

        let range = PortMatcher {
            start: 50,
            end: 60,
        };
        let raw = udp_v6("2001:db8::1".parse().unwrap(), 53);
        assert!(range.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);

        // No usable transport header is a plain miss, not a hard drop.
        assert_eq!(range.matches(Hook::Output, &truncated()), MatchResult::NO_MATCH);
    }

    #[test]
    fn ip_matcher_checks_cidrs() {
        let m = IpMatcher {
            networks: vec!["10.0.0.0/8".parse().unwrap(), "1.2.3.4/32".parse().unwrap()],
        };
        let raw = tcp_v4(Ipv4Addr::new(10, 20, 30, 40), 22);
        assert!(m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);
        let raw = tcp_v4(Ipv4Addr::new(1, 2, 3, 4), 22);
        assert!(m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);
        let raw = tcp_v4(Ipv4Addr::new(1, 2, 3, 5), 22);
        assert!(!m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);
        assert_eq!(m.matches(Hook::Output, &truncated()), MatchResult::HARD_DROP);
        assert_eq!(m.to_string(), "dst 10.0.0.0/8,1.2.3.4/32");
    }

    #[test]
    fn domain_matcher_uses_reverse_lookup() {
        let tracker = Arc::new(Tracker::new());
        tracker.add_record(
            "api.example.com",
            vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))],
            Duration::from_secs(300),
        );
        let m = DomainMatcher {
            tracker: tracker.clone(),
            patterns: vec!["*.example.com".into()],
        };
        let raw = tcp_v4(Ipv4Addr::new(93, 184, 216, 34), 443);
        assert!(m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);
        let raw = tcp_v4(Ipv4Addr::new(93, 184, 216, 35), 443);
        assert!(!m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);

        let exact = DomainMatcher {
            tracker,
            patterns: vec!["example.com".into()],
        };
        let raw = tcp_v4(Ipv4Addr::new(93, 184, 216, 34), 443);
        assert!(!exact.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()).matched);
    }

    #[test]
    fn dns_resolved_only_blocks_unknown_public_addresses() {
        let tracker = Arc::new(Tracker::new());
        tracker.add_record(
            "example.com",
            vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))],
            Duration::from_secs(300),
        );
        let metrics = FilterMetrics::new();
        let m = DnsResolvedOnlyMatcher {
            tracker,
            metrics: metrics.clone(),
        };

        let known = tcp_v4(Ipv4Addr::new(93, 184, 216, 34), 443);
        assert_eq!(
            m.matches(Hook::Output, &PacketBuffer::parse(&known).unwrap()),
            MatchResult::NO_MATCH
        );
        let unknown = tcp_v4(Ipv4Addr::new(8, 8, 8, 8), 443);
        assert_eq!(
            m.matches(Hook::Output, &PacketBuffer::parse(&unknown).unwrap()),
            MatchResult::MATCH
        );
        for private in [
            Ipv4Addr::new(10, 1, 1, 1),
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(169, 254, 169, 254),
        ] {
            let raw = tcp_v4(private, 443);
            assert_eq!(
                m.matches(Hook::Output, &PacketBuffer::parse(&raw).unwrap()),
                MatchResult::NO_MATCH,
                "{private} should be exempt"
            );
        }
        assert_eq!(metrics.snapshot().direct_ip_blocked_total, 1);
    }

    #[test]
    fn private_and_local_classification() {
        assert!(is_private_or_local("fe80::1".parse().unwrap()));
        assert!(is_private_or_local("ff02::1".parse().unwrap()));
        assert!(is_private_or_local("::1".parse().unwrap()));
        assert!(is_private_or_local("224.0.0.251".parse().unwrap()));
        assert!(!is_private_or_local("2001:db8::1".parse().unwrap()));
        assert!(!is_private_or_local("172.32.0.1".parse().unwrap()));

        assert!(is_loopback_or_link_local("169.254.1.1".parse().unwrap()));
        assert!(!is_loopback_or_link_local("10.0.0.1".parse().unwrap()));
    }
}
