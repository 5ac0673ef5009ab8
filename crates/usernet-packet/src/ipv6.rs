use core::net::Ipv6Addr;

use super::{ensure_len, ensure_out_buf_len, read_u16, PacketError};

/// View over the fixed 40-byte IPv6 header.
#[derive(Clone, Copy, Debug)]
pub struct Ipv6Header<'a> {
    data: &'a [u8],
}

impl<'a> Ipv6Header<'a> {
    pub const LEN: usize = 40;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::LEN)?;
        Ok(Self { data })
    }

    pub fn version(&self) -> u8 {
        self.data[0] >> 4
    }

    pub fn payload_len(&self) -> u16 {
        read_u16(self.data, 4)
    }

    /// Next header field of the fixed header. Extension headers are not walked.
    pub fn next_header(&self) -> u8 {
        self.data[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    pub fn src(&self) -> Ipv6Addr {
        addr_at(self.data, 8)
    }

    pub fn dst(&self) -> Ipv6Addr {
        addr_at(self.data, 24)
    }
}

fn addr_at(data: &[u8], off: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[off..off + 16]);
    Ipv6Addr::from(octets)
}

#[derive(Clone, Copy, Debug)]
pub struct Ipv6Packet<'a> {
    header: Ipv6Header<'a>,
    header_bytes: &'a [u8],
    payload: &'a [u8],
}

impl<'a> Ipv6Packet<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        let header = Ipv6Header::parse(buf)?;
        if header.version() != 6 {
            return Err(PacketError::Malformed("IPv6 version field != 6"));
        }
        let end = Ipv6Header::LEN + header.payload_len() as usize;
        ensure_len(buf, end)?;
        Ok(Self {
            header,
            header_bytes: &buf[..Ipv6Header::LEN],
            payload: &buf[Ipv6Header::LEN..end],
        })
    }

    pub fn header(&self) -> Ipv6Header<'a> {
        self.header
    }

    pub fn header_bytes(&self) -> &'a [u8] {
        self.header_bytes
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

pub struct Ipv6PacketBuilder<'a> {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload: &'a [u8],
}

impl<'a> Ipv6PacketBuilder<'a> {
    pub fn len(&self) -> Result<usize, PacketError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv6 payload length > 65535"));
        }
        Ok(Ipv6Header::LEN + self.payload.len())
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;
        out[0..4].copy_from_slice(&0x6000_0000u32.to_be_bytes());
        out[4..6].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out[6] = self.next_header;
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.src.octets());
        out[24..40].copy_from_slice(&self.dst.octets());
        out[Ipv6Header::LEN..len].copy_from_slice(self.payload);
        Ok(len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        self.write(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse() {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let pkt = Ipv6PacketBuilder {
            src,
            dst,
            next_header: crate::IPPROTO_UDP,
            hop_limit: 64,
            payload: &[1, 2, 3, 4],
        }
        .build_vec()
        .unwrap();

        let parsed = Ipv6Packet::parse(&pkt).unwrap();
        assert_eq!(parsed.header().src(), src);
        assert_eq!(parsed.header().dst(), dst);
        assert_eq!(parsed.header().next_header(), crate::IPPROTO_UDP);
        assert_eq!(parsed.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn payload_length_beyond_buffer_is_truncated() {
        let mut pkt = Ipv6PacketBuilder {
            src: Ipv6Addr::LOCALHOST,
            dst: Ipv6Addr::LOCALHOST,
            next_header: crate::IPPROTO_TCP,
            hop_limit: 1,
            payload: &[],
        }
        .build_vec()
        .unwrap();
        pkt[5] = 8;
        assert_eq!(
            Ipv6Packet::parse(&pkt).unwrap_err(),
            PacketError::Truncated {
                needed: 48,
                actual: 40
            }
        );
    }
}
