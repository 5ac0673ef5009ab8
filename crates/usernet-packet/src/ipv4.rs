use core::net::Ipv4Addr;

use super::{checksum, ensure_len, ensure_out_buf_len, read_u16, PacketError};

/// View over an IPv4 header.
///
/// Only the fixed 20-byte part is required; a header slice handed over by the stack may omit the
/// payload entirely.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Header<'a> {
    data: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    pub const MIN_LEN: usize = 20;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_LEN)?;
        Ok(Self { data })
    }

    pub fn version(&self) -> u8 {
        self.data[0] >> 4
    }

    pub fn header_len(&self) -> usize {
        ((self.data[0] & 0x0f) as usize) * 4
    }

    pub fn total_len(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }
}

/// A complete IPv4 datagram split into header and payload.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Packet<'a> {
    header: Ipv4Header<'a>,
    header_bytes: &'a [u8],
    payload: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        let header = Ipv4Header::parse(buf)?;
        if header.version() != 4 {
            return Err(PacketError::Malformed("IPv4 version field != 4"));
        }
        let header_len = header.header_len();
        if header_len < Ipv4Header::MIN_LEN {
            return Err(PacketError::Malformed("IPv4 IHL < 5"));
        }
        ensure_len(buf, header_len)?;
        let total_len = header.total_len() as usize;
        if total_len < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(buf, total_len)?;
        Ok(Self {
            header,
            header_bytes: &buf[..header_len],
            payload: &buf[header_len..total_len],
        })
    }

    pub fn header(&self) -> Ipv4Header<'a> {
        self.header
    }

    pub fn header_bytes(&self) -> &'a [u8] {
        self.header_bytes
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

pub struct Ipv4PacketBuilder<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub identification: u16,
    pub payload: &'a [u8],
}

impl<'a> Ipv4PacketBuilder<'a> {
    pub fn len(&self) -> Result<usize, PacketError> {
        let len = Ipv4Header::MIN_LEN + self.payload.len();
        if len > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }
        Ok(len)
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;
        out[0] = (4u8 << 4) | 5; // version + IHL
        out[1] = 0; // DSCP/ECN
        out[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&0u16.to_be_bytes());
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let csum = checksum::ipv4_header_checksum(&out[..Ipv4Header::MIN_LEN]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        out[Ipv4Header::MIN_LEN..len].copy_from_slice(self.payload);
        Ok(len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        self.write(&mut buf)?;
        Ok(buf)
    }
}
