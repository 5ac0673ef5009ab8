//! DNS header view and a response builder for A/AAAA answers.
//!
//! Name decoding with compression pointers is left to callers; the header view is enough to
//! decide whether a payload is worth walking.

use core::net::{Ipv4Addr, Ipv6Addr};

use super::{ensure_len, read_u16, PacketError};

pub const DNS_PORT: u16 = 53;
pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;

#[derive(Clone, Copy, Debug)]
pub struct DnsHeader<'a> {
    data: &'a [u8],
}

impl<'a> DnsHeader<'a> {
    pub const LEN: usize = 12;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::LEN)?;
        Ok(Self { data })
    }

    pub fn id(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn flags(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn is_response(&self) -> bool {
        self.flags() & FLAG_QR != 0
    }

    pub fn question_count(&self) -> u16 {
        read_u16(self.data, 4)
    }

    pub fn answer_count(&self) -> u16 {
        read_u16(self.data, 6)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsRecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// Any other record type, carried opaquely.
    Other { rtype: u16, len: u16 },
}

impl DnsRecordData {
    fn rtype(&self) -> u16 {
        match self {
            Self::A(_) => TYPE_A,
            Self::Aaaa(_) => TYPE_AAAA,
            Self::Other { rtype, .. } => *rtype,
        }
    }

    fn rdlen(&self) -> u16 {
        match self {
            Self::A(_) => 4,
            Self::Aaaa(_) => 16,
            Self::Other { len, .. } => *len,
        }
    }
}

/// Builds a standard response with one question and any number of answers.
pub struct DnsResponseBuilder<'a> {
    pub id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    /// Answers as `(data, ttl_secs)`.
    pub answers: &'a [(DnsRecordData, u32)],
    /// When set, answer names are compression pointers to the question name.
    pub compress: bool,
}

impl<'a> DnsResponseBuilder<'a> {
    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        if self.answers.len() > u16::MAX as usize {
            return Err(PacketError::Malformed("DNS answer count > 65535"));
        }
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&(FLAG_QR | 0x0100 | 0x0080).to_be_bytes()); // QR, RD, RA
        out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes()); // ANCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

        let question_offset = out.len();
        encode_name(self.qname, &mut out)?;
        out.extend_from_slice(&self.qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());

        for (data, ttl) in self.answers {
            if self.compress {
                out.extend_from_slice(&(0xc000u16 | question_offset as u16).to_be_bytes());
            } else {
                encode_name(self.qname, &mut out)?;
            }
            out.extend_from_slice(&data.rtype().to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&ttl.to_be_bytes());
            out.extend_from_slice(&data.rdlen().to_be_bytes());
            match data {
                DnsRecordData::A(addr) => out.extend_from_slice(&addr.octets()),
                DnsRecordData::Aaaa(addr) => out.extend_from_slice(&addr.octets()),
                DnsRecordData::Other { len, .. } => out.resize(out.len() + *len as usize, 0),
            }
        }
        Ok(out)
    }
}

/// Appends `name` in uncompressed wire format.
pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<(), PacketError> {
    let trimmed = name.trim_end_matches('.');
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            let bytes = label.as_bytes();
            if bytes.is_empty() {
                return Err(PacketError::Malformed("empty DNS label"));
            }
            if bytes.len() > 63 {
                return Err(PacketError::Malformed("DNS label length > 63"));
            }
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
    }
    out.push(0);
    Ok(())
}
