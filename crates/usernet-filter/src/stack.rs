//! Contract with the user-mode network stack the filter decorates.
//!
//! The stack owns packet delivery, NAT and socket I/O. It exposes just enough for the filter to
//! install per-family rule tables and to take over TCP/UDP connection forwarding.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use usernet_packet::{Ipv4Packet, Ipv6Packet, PacketError, TcpSegment, UdpPacket};

use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        }
    }
}

/// One packet as handed to rule matchers: headers already located, payload untouched.
#[derive(Debug, Clone, Copy)]
pub struct PacketBuffer<'a> {
    pub family: IpFamily,
    pub network_header: &'a [u8],
    pub transport_header: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> PacketBuffer<'a> {
    /// Locates the headers of a raw IPv4/IPv6 packet. Transports other than TCP and UDP get an
    /// empty transport header and the whole IP payload.
    pub fn parse(packet: &'a [u8]) -> Result<Self, PacketError> {
        let Some(first) = packet.first() else {
            return Err(PacketError::Truncated {
                needed: 1,
                actual: 0,
            });
        };
        let (family, network_header, protocol, ip_payload) = match first >> 4 {
            4 => {
                let ip = Ipv4Packet::parse(packet)?;
                (IpFamily::V4, ip.header_bytes(), ip.header().protocol(), ip.payload())
            }
            6 => {
                let ip = Ipv6Packet::parse(packet)?;
                (IpFamily::V6, ip.header_bytes(), ip.header().next_header(), ip.payload())
            }
            _ => return Err(PacketError::Unsupported("IP version")),
        };

        let (transport_header, payload) = match protocol {
            usernet_packet::IPPROTO_TCP => {
                let seg = TcpSegment::parse(ip_payload)?;
                (seg.header_bytes(), seg.payload())
            }
            usernet_packet::IPPROTO_UDP => {
                let udp = UdpPacket::parse(ip_payload)?;
                (udp.header_bytes(), udp.payload())
            }
            _ => (&ip_payload[..0], ip_payload),
        };

        Ok(Self {
            family,
            network_header,
            transport_header,
            payload,
        })
    }
}

/// Addresses of a forwarded flow as written by the guest (before NAT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportEndpointId {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait GuestStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> GuestStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Datagram endpoint towards the guest for one UDP flow.
pub trait GuestDatagram: Send + Unpin {
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>>;

    fn poll_send(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;
}

/// A pending guest TCP connection (SYN received, handshake not yet completed).
pub trait TcpForwarderRequest: Send {
    fn id(&self) -> TransportEndpointId;

    /// Completes the attempt with a reset.
    fn reject(self: Box<Self>);

    /// Completes the handshake and returns the guest side of the connection.
    fn create_endpoint(self: Box<Self>) -> Result<Box<dyn GuestStream>, EndpointError>;
}

/// The first datagram of a new guest UDP flow. Dropping the request drops the flow.
pub trait UdpForwarderRequest: Send {
    fn id(&self) -> TransportEndpointId;

    /// The returned endpoint yields the datagram that opened the flow first.
    fn create_endpoint(self: Box<Self>) -> Result<Box<dyn GuestDatagram>, EndpointError>;
}

pub trait TcpForwarderHandler: Send + Sync {
    fn handle(&self, request: Box<dyn TcpForwarderRequest>);
}

pub trait UdpForwarderHandler: Send + Sync {
    fn handle(&self, request: Box<dyn UdpForwarderRequest>);
}

pub trait NetStack: Send + Sync {
    /// Swaps the filter table for `family` in one step.
    fn replace_filter_table(&self, family: IpFamily, table: Table);

    fn set_tcp_forwarder(&self, handler: Arc<dyn TcpForwarderHandler>);

    fn set_udp_forwarder(&self, handler: Arc<dyn UdpForwarderHandler>);
}

/// A running virtual network that can hand out its packet stack.
pub trait VirtualNetwork: Send + Sync {
    fn stack(&self) -> Arc<dyn NetStack>;
}

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("invalid NAT entry {from:?} -> {to:?}: both sides must be IPv4 addresses")]
    InvalidEntry { from: String, to: String },
}

/// The slice of the virtual network configuration the filter reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Guest subnet in CIDR notation, e.g. `192.168.127.0/24`.
    pub subnet: String,
    /// Internal gateway running the DNS resolver, e.g. `192.168.127.2`.
    pub gateway_ip: String,
    /// Static address substitutions applied after the policy check.
    pub nat: BTreeMap<String, String>,
    /// Allow TCP to the link-local metadata range.
    pub ec2_metadata_access: bool,
}

impl NetworkConfig {
    pub fn gateway_ip(&self) -> Option<IpAddr> {
        self.gateway_ip.parse().ok()
    }

    pub fn network_gateway(&self) -> Option<Ipv4Addr> {
        network_gateway(&self.subnet)
    }

    pub fn nat_table(&self) -> Result<HashMap<IpAddr, IpAddr>, NatError> {
        self.nat
            .iter()
            .map(|(from, to)| {
                match (from.parse::<Ipv4Addr>(), to.parse::<Ipv4Addr>()) {
                    (Ok(src), Ok(dst)) => Ok((IpAddr::V4(src), IpAddr::V4(dst))),
                    _ => Err(NatError::InvalidEntry {
                        from: from.clone(),
                        to: to.clone(),
                    }),
                }
            })
            .collect()
    }
}

/// The `.1` address of an IPv4 subnet: first three octets of the network plus host `1`.
pub fn network_gateway(subnet: &str) -> Option<Ipv4Addr> {
    match subnet.parse::<IpNet>().ok()? {
        IpNet::V4(net) => {
            let [a, b, c, _] = net.network().octets();
            Some(Ipv4Addr::new(a, b, c, 1))
        }
        IpNet::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usernet_packet::{Ipv4PacketBuilder, UdpPacketBuilder};

    #[test]
    fn network_gateway_is_dot_one() {
        assert_eq!(
            network_gateway("192.168.127.0/24"),
            Some(Ipv4Addr::new(192, 168, 127, 1))
        );
        assert_eq!(
            network_gateway("192.168.127.77/24"),
            Some(Ipv4Addr::new(192, 168, 127, 1))
        );
        assert_eq!(network_gateway("fd00::/64"), None);
        assert_eq!(network_gateway("garbage"), None);
        assert_eq!(network_gateway(""), None);
    }

    #[test]
    fn nat_table_parses_ipv4_pairs() {
        let mut config = NetworkConfig::default();
        config
            .nat
            .insert("192.168.127.254".into(), "127.0.0.1".into());
        let nat = config.nat_table().unwrap();
        assert_eq!(
            nat.get(&IpAddr::V4(Ipv4Addr::new(192, 168, 127, 254))),
            Some(&IpAddr::V4(Ipv4Addr::LOCALHOST))
        );

        config.nat.insert("fd00::1".into(), "127.0.0.1".into());
        assert!(matches!(
            config.nat_table(),
            Err(NatError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn network_config_deserializes_with_defaults() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"subnet":"192.168.127.0/24","gateway_ip":"192.168.127.2"}"#)
                .unwrap();
        assert_eq!(config.gateway_ip(), Some("192.168.127.2".parse().unwrap()));
        assert!(config.nat.is_empty());
        assert!(!config.ec2_metadata_access);
    }

    #[test]
    fn packet_buffer_locates_udp_headers() {
        let src = Ipv4Addr::new(192, 168, 127, 2);
        let dst = Ipv4Addr::new(192, 168, 127, 1);
        let udp = UdpPacketBuilder {
            src_port: 53,
            dst_port: 40000,
            payload: b"payload",
        }
        .build_vec(src.into(), dst.into())
        .unwrap();
        let ip = Ipv4PacketBuilder {
            src,
            dst,
            protocol: usernet_packet::IPPROTO_UDP,
            ttl: 64,
            identification: 1,
            payload: &udp,
        }
        .build_vec()
        .unwrap();

        let pkt = PacketBuffer::parse(&ip).unwrap();
        assert_eq!(pkt.family, IpFamily::V4);
        assert_eq!(pkt.network_header.len(), 20);
        assert_eq!(pkt.transport_header.len(), 8);
        assert_eq!(pkt.payload, b"payload");
    }

    #[test]
    fn packet_buffer_rejects_unknown_versions() {
        assert_eq!(
            PacketBuffer::parse(&[0x10; 40]).unwrap_err(),
            PacketError::Unsupported("IP version")
        );
        assert!(PacketBuffer::parse(&[]).is_err());
    }
}
