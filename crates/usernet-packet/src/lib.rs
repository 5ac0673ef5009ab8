#![forbid(unsafe_code)]

//! Zero-copy header views and small builders for the packets the egress filter inspects.
//!
//! Parsers never allocate and never panic on short input: every accessor is backed by a length
//! check performed in `parse`.

pub mod checksum;
pub mod dns;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

pub use dns::{DnsHeader, DnsRecordData, DnsResponseBuilder};
pub use ipv4::{Ipv4Header, Ipv4Packet, Ipv4PacketBuilder};
pub use ipv6::{Ipv6Header, Ipv6Packet, Ipv6PacketBuilder};
pub use tcp::{TcpFlags, TcpSegment, TcpSegmentBuilder};
pub use udp::{UdpHeader, UdpPacket, UdpPacketBuilder};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("truncated packet: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),
}

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_out_buf_len(out: &[u8], needed: usize) -> Result<(), PacketError> {
    if out.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: out.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

pub(crate) fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}
