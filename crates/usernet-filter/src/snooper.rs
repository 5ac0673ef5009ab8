//! Learns domain to address mappings from DNS responses leaving the stack.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use usernet_packet::dns::{DNS_PORT, TYPE_A, TYPE_AAAA};
use usernet_packet::DnsHeader;

use crate::matchers::{MatchResult, Matcher};
use crate::metrics::FilterMetrics;
use crate::stack::{Hook, PacketBuffer};
use crate::tracker::{Tracker, MIN_TTL};

const MAX_POINTER_JUMPS: usize = 5;

/// What a DNS response taught us: the first question name, every A/AAAA address in the answer
/// section and the smallest answer TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnoopedResponse {
    pub domain: String,
    pub ips: Vec<IpAddr>,
    pub ttl: u32,
}

/// Parses a DNS response message. Returns `None` for queries, responses without answers and
/// anything too mangled to yield a name.
pub fn parse_dns_response(data: &[u8]) -> Option<SnoopedResponse> {
    let header = DnsHeader::parse(data).ok()?;
    if !header.is_response() || header.answer_count() == 0 {
        return None;
    }

    let mut offset = DnsHeader::LEN;
    let mut domain = String::new();
    for _ in 0..header.question_count() {
        if offset >= data.len() {
            break;
        }
        let (name, next) = parse_name(data, offset);
        if domain.is_empty() {
            domain = name;
        }
        // QTYPE + QCLASS
        if next + 4 > data.len() {
            return None;
        }
        offset = next + 4;
    }

    let mut ips = Vec::new();
    let mut min_ttl: Option<u32> = None;
    for _ in 0..header.answer_count() {
        if offset >= data.len() {
            break;
        }
        let (_, next) = parse_name(data, offset);
        offset = next;
        if offset + 10 > data.len() {
            break;
        }
        let rtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let ttl = u32::from_be_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        min_ttl = Some(min_ttl.map_or(ttl, |min| min.min(ttl)));
        let rdlen = usize::from(u16::from_be_bytes([data[offset + 8], data[offset + 9]]));
        offset += 10;
        if offset + rdlen > data.len() {
            break;
        }

        let rdata = &data[offset..offset + rdlen];
        match (rtype, rdata.len()) {
            (TYPE_A, 4) => {
                let octets: [u8; 4] = rdata.try_into().ok()?;
                ips.push(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = rdata.try_into().ok()?;
                ips.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
        offset += rdlen;
    }

    if domain.is_empty() {
        return None;
    }
    Some(SnoopedResponse {
        domain,
        ips,
        ttl: min_ttl.unwrap_or(0),
    })
}

/// Reads a possibly compressed name starting at `offset`.
///
/// Returns the dotted name and the offset just past it in the original byte stream (past the
/// first pointer when compression was used). Malformed names end early with whatever was read.
fn parse_name(data: &[u8], mut offset: usize) -> (String, usize) {
    let mut name = String::new();
    let mut resume_at = None;
    let mut jumps = 0;

    while offset < data.len() {
        let len = data[offset];
        if len & 0xc0 == 0xc0 {
            if offset + 1 >= data.len() {
                break;
            }
            let pointer = usize::from(u16::from_be_bytes([len, data[offset + 1]]) & 0x3fff);
            resume_at.get_or_insert(offset + 2);
            offset = pointer;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                break;
            }
            continue;
        }
        if len == 0 {
            offset += 1;
            break;
        }

        let len = usize::from(len);
        offset += 1;
        if offset + len > data.len() {
            break;
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&data[offset..offset + len]));
        offset += len;
    }

    (name, resume_at.unwrap_or(offset))
}

/// Output chain pseudo-rule that feeds DNS answers into the tracker. Never matches.
pub struct DnsSnooper {
    pub tracker: Arc<Tracker>,
    pub metrics: FilterMetrics,
}

impl DnsSnooper {
    fn observe(&self, packet: &PacketBuffer<'_>) {
        let transport = packet.transport_header;
        if transport.len() < 8 {
            return;
        }
        if u16::from_be_bytes([transport[0], transport[1]]) != DNS_PORT {
            return;
        }

        let Some(response) = parse_dns_response(packet.payload) else {
            return;
        };
        if response.ips.is_empty() {
            return;
        }
        tracing::trace!(
            domain = %response.domain,
            ips = ?response.ips,
            ttl = response.ttl,
            "learned DNS answer"
        );
        let ttl = Duration::from_secs(u64::from(response.ttl)).max(MIN_TTL);
        self.tracker.add_record(&response.domain, response.ips, ttl);
        self.metrics.dns_response_learned();
    }
}

impl Matcher for DnsSnooper {
    fn name(&self) -> &'static str {
        "dnsSnooper"
    }

    fn matches(&self, _hook: Hook, packet: &PacketBuffer<'_>) -> MatchResult {
        self.observe(packet);
        MatchResult::NO_MATCH
    }
}

impl fmt::Display for DnsSnooper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dns-snoop")
    }
}
