use core::net::IpAddr;

use super::{checksum, ensure_len, ensure_out_buf_len, read_u16, read_u32, PacketError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x0001);
    pub const SYN: TcpFlags = TcpFlags(0x0002);
    pub const RST: TcpFlags = TcpFlags(0x0004);
    pub const PSH: TcpFlags = TcpFlags(0x0008);
    pub const ACK: TcpFlags = TcpFlags(0x0010);

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

/// View over a TCP segment. Works on header-only slices (the payload is then empty).
#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpSegment<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;
        Ok(Self { data, header_len })
    }

    pub fn src_port(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn seq_number(&self) -> u32 {
        read_u32(self.data, 4)
    }

    pub fn ack_number(&self) -> u32 {
        read_u32(self.data, 8)
    }

    pub fn flags(&self) -> TcpFlags {
        let ns = (self.data[12] & 0x01) as u16;
        TcpFlags((ns << 8) | self.data[13] as u16)
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn header_bytes(&self) -> &'a [u8] {
        &self.data[..self.header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }
}

pub struct TcpSegmentBuilder<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub payload: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    pub fn syn(src_port: u16, dst_port: u16, seq_number: u32) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            ack_number: 0,
            flags: TcpFlags::SYN,
            window_size: 65535,
            payload: &[],
        }
    }

    pub fn len(&self) -> usize {
        TcpSegment::MIN_HEADER_LEN + self.payload.len()
    }

    pub fn write(&self, src_ip: IpAddr, dst_ip: IpAddr, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        ensure_out_buf_len(out, len)?;
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        out[12] = (5u8 << 4) | ((self.flags.0 >> 8) as u8 & 0x01);
        out[13] = self.flags.0 as u8;
        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[16..18].copy_from_slice(&0u16.to_be_bytes());
        out[18..20].copy_from_slice(&0u16.to_be_bytes());
        out[20..len].copy_from_slice(self.payload);
        if let Some(csum) = checksum::transport_checksum(src_ip, dst_ip, 6, &out[..len]) {
            out[16..18].copy_from_slice(&csum.to_be_bytes());
        }
        Ok(len)
    }

    pub fn build_vec(&self, src_ip: IpAddr, dst_ip: IpAddr) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()];
        self.write(src_ip, dst_ip, &mut buf)?;
        Ok(buf)
    }
}
