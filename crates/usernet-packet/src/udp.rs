use core::net::IpAddr;

use super::{checksum, ensure_len, ensure_out_buf_len, read_u16, PacketError};

/// View over the 8-byte UDP header. Does not require the payload to be present.
#[derive(Clone, Copy, Debug)]
pub struct UdpHeader<'a> {
    data: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub const LEN: usize = 8;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::LEN)?;
        Ok(Self { data })
    }

    pub fn src_port(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn length(&self) -> u16 {
        read_u16(self.data, 4)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 6)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct UdpPacket<'a> {
    header: UdpHeader<'a>,
    data: &'a [u8],
    length: usize,
}

impl<'a> UdpPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        let header = UdpHeader::parse(data)?;
        let length = header.length() as usize;
        if length < UdpHeader::LEN {
            return Err(PacketError::Malformed("UDP length < header length"));
        }
        ensure_len(data, length)?;
        Ok(Self {
            header,
            data,
            length,
        })
    }

    pub fn header(&self) -> UdpHeader<'a> {
        self.header
    }

    pub fn header_bytes(&self) -> &'a [u8] {
        &self.data[..UdpHeader::LEN]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[UdpHeader::LEN..self.length]
    }
}

pub struct UdpPacketBuilder<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpPacketBuilder<'a> {
    pub fn len(&self) -> Result<usize, PacketError> {
        let len = UdpHeader::LEN + self.payload.len();
        if len > u16::MAX as usize {
            return Err(PacketError::Malformed("UDP length > 65535"));
        }
        Ok(len)
    }

    pub fn write(&self, src_ip: IpAddr, dst_ip: IpAddr, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&(len as u16).to_be_bytes());
        out[6..8].copy_from_slice(&0u16.to_be_bytes());
        out[8..len].copy_from_slice(self.payload);
        if let Some(mut csum) = checksum::transport_checksum(src_ip, dst_ip, 17, &out[..len]) {
            // A computed checksum of zero is transmitted as all ones.
            if csum == 0 {
                csum = 0xffff;
            }
            out[6..8].copy_from_slice(&csum.to_be_bytes());
        }
        Ok(len)
    }

    pub fn build_vec(&self, src_ip: IpAddr, dst_ip: IpAddr) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        self.write(src_ip, dst_ip, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;

    #[test]
    fn parse_exposes_ports_and_payload() {
        let src = IpAddr::V4(Ipv4Addr::new(192, 168, 127, 2));
        let dst = IpAddr::V4(Ipv4Addr::new(192, 168, 127, 1));
        let buf = UdpPacketBuilder {
            src_port: 5353,
            dst_port: 53,
            payload: b"hello",
        }
        .build_vec(src, dst)
        .unwrap();

        let pkt = UdpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.header().src_port(), 5353);
        assert_eq!(pkt.header().dst_port(), 53);
        assert_eq!(pkt.payload(), b"hello");
        assert_eq!(pkt.header_bytes().len(), UdpHeader::LEN);
        assert_ne!(pkt.header().checksum(), 0);
    }

    #[test]
    fn header_view_accepts_header_only_slices() {
        let hdr = [0x00, 0x35, 0x04, 0xd2, 0x00, 0x20, 0x00, 0x00];
        let udp = UdpHeader::parse(&hdr).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 1234);
        assert!(UdpPacket::parse(&hdr).is_err());
    }

    #[test]
    fn length_below_header_is_malformed() {
        let hdr = [0, 1, 0, 2, 0, 4, 0, 0];
        assert_eq!(
            UdpPacket::parse(&hdr).unwrap_err(),
            PacketError::Malformed("UDP length < header length")
        );
    }
}
