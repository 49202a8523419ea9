//! DNS wire format.
//!
//! This module provides the message types (header, question, resource record,
//! message) and their conversion to and from raw datagram bytes. All integers
//! are big-endian.

use std::fmt;
use std::net::Ipv4Addr;

use crate::errors::DnsError;
use crate::name::Name;

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 12;

/// Largest message a classic (non-EDNS) UDP exchange may carry.
pub const CLASSIC_UDP_PAYLOAD: usize = 512;

/// Offset of the first question name, the target of `0xC00C` pointers.
pub const FIRST_QUESTION_OFFSET: u16 = HEADER_LEN as u16;

/// TYPE code of an IPv4 host address record.
pub const TYPE_A: u16 = 1;

/// CLASS code of the Internet.
pub const CLASS_IN: u16 = 1;

/// Response codes carried in the low four bits of the header.
pub mod rcode {
    pub const NO_ERROR: u8 = 0;
    pub const FORMAT_ERROR: u8 = 1;
    pub const SERVER_FAILURE: u8 = 2;
    pub const NAME_ERROR: u8 = 3;
    pub const NOT_IMPLEMENTED: u8 = 4;
    pub const REFUSED: u8 = 5;
}

const QR_MASK: u8 = 0b1000_0000;
const OPCODE_MASK: u8 = 0b0000_1111;
const OPCODE_SHIFT: u8 = 3;
const AA_MASK: u8 = 0b0000_0100;
const TC_MASK: u8 = 0b0000_0010;
const RD_MASK: u8 = 0b0000_0001;
const RA_MASK: u8 = 0b1000_0000;
const Z_MASK: u8 = 0b0000_0111;
const Z_SHIFT: u8 = 4;
const RCODE_MASK: u8 = 0b0000_1111;

/// Record types this relay knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    NS,
    MD,
    MF,
    CNAME,
    SOA,
    MB,
    MG,
    MR,
    NULL,
    WKS,
    PTR,
    HINFO,
    MINFO,
    MX,
    TXT,
    AAAA,
    Unknown(u16),
}

impl From<u16> for RecordType {
    fn from(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            2 => RecordType::NS,
            3 => RecordType::MD,
            4 => RecordType::MF,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            7 => RecordType::MB,
            8 => RecordType::MG,
            9 => RecordType::MR,
            10 => RecordType::NULL,
            11 => RecordType::WKS,
            12 => RecordType::PTR,
            13 => RecordType::HINFO,
            14 => RecordType::MINFO,
            15 => RecordType::MX,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            other => RecordType::Unknown(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(rtype: RecordType) -> Self {
        match rtype {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::MD => 3,
            RecordType::MF => 4,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::MB => 7,
            RecordType::MG => 8,
            RecordType::MR => 9,
            RecordType::NULL => 10,
            RecordType::WKS => 11,
            RecordType::PTR => 12,
            RecordType::HINFO => 13,
            RecordType::MINFO => 14,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::Unknown(code) => code,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Unknown(code) => write!(f, "TYPE{}", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// Record classes this relay knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordClass {
    IN,
    CS,
    CH,
    HS,
    Unknown(u16),
}

impl From<u16> for RecordClass {
    fn from(code: u16) -> Self {
        match code {
            1 => RecordClass::IN,
            2 => RecordClass::CS,
            3 => RecordClass::CH,
            4 => RecordClass::HS,
            other => RecordClass::Unknown(other),
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordClass::Unknown(code) => write!(f, "CLASS{}", code),
            known => write!(f, "{:?}", known),
        }
    }
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DnsError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| DnsError::format(format!("message truncated at offset {}", pos)))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, DnsError> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DnsError::format(format!("message truncated at offset {}", pos)))
}

/// The fixed 12-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    /// `false` for a query, `true` for a response.
    pub qr: bool,
    pub opcode: u8,
    /// Authoritative answer.
    pub aa: bool,
    /// Truncated.
    pub tc: bool,
    /// Recursion desired.
    pub rd: bool,
    /// Recursion available.
    pub ra: bool,
    /// Reserved, zero in anything this relay emits.
    pub z: u8,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self, DnsError> {
        if buf.len() < HEADER_LEN {
            return Err(DnsError::format(format!(
                "message of {} bytes is shorter than the header",
                buf.len()
            )));
        }
        let flags1 = buf[2];
        let flags2 = buf[3];
        Ok(Self {
            id: read_u16(buf, 0)?,
            qr: flags1 & QR_MASK != 0,
            opcode: (flags1 >> OPCODE_SHIFT) & OPCODE_MASK,
            aa: flags1 & AA_MASK != 0,
            tc: flags1 & TC_MASK != 0,
            rd: flags1 & RD_MASK != 0,
            ra: flags2 & RA_MASK != 0,
            z: (flags2 >> Z_SHIFT) & Z_MASK,
            rcode: flags2 & RCODE_MASK,
            qdcount: read_u16(buf, 4)?,
            ancount: read_u16(buf, 6)?,
            nscount: read_u16(buf, 8)?,
            arcount: read_u16(buf, 10)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut flags1 = (self.opcode & OPCODE_MASK) << OPCODE_SHIFT;
        if self.qr {
            flags1 |= QR_MASK;
        }
        if self.aa {
            flags1 |= AA_MASK;
        }
        if self.tc {
            flags1 |= TC_MASK;
        }
        if self.rd {
            flags1 |= RD_MASK;
        }
        let mut flags2 = ((self.z & Z_MASK) << Z_SHIFT) | (self.rcode & RCODE_MASK);
        if self.ra {
            flags2 |= RA_MASK;
        }

        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.id.to_be_bytes());
        out[2] = flags1;
        out[3] = flags2;
        out[4..6].copy_from_slice(&self.qdcount.to_be_bytes());
        out[6..8].copy_from_slice(&self.ancount.to_be_bytes());
        out[8..10].copy_from_slice(&self.nscount.to_be_bytes());
        out[10..12].copy_from_slice(&self.arcount.to_be_bytes());
        out
    }
}

/// One entry of the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: Name,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(qname: Name, qtype: u16, qclass: u16) -> Self {
        Self { qname, qtype, qclass }
    }

    /// Parse the question at `pos`; returns it with the offset just past it.
    pub fn parse(buf: &[u8], pos: usize) -> Result<(Self, usize), DnsError> {
        let (qname, consumed) = Name::parse(buf, pos)?;
        let pos = pos + consumed;
        let qtype = read_u16(buf, pos)?;
        let qclass = read_u16(buf, pos + 2)?;
        Ok((Self { qname, qtype, qclass }, pos + 4))
    }

    pub fn record_type(&self) -> RecordType {
        RecordType::from(self.qtype)
    }

    pub fn record_class(&self) -> RecordClass {
        RecordClass::from(self.qclass)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.qname.wire());
        out.extend_from_slice(&self.qtype.to_be_bytes());
        out.extend_from_slice(&self.qclass.to_be_bytes());
    }
}

/// One entry of the answer, authority or additional section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    /// Seconds the record may be cached; zero means "do not cache".
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    /// An Internet-class address record.
    pub fn a(name: Name, ttl: u32, addr: Ipv4Addr) -> Self {
        Self {
            name,
            rtype: TYPE_A,
            class: CLASS_IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    /// Parse the record at `pos`; returns it with the offset just past it.
    pub fn parse(buf: &[u8], pos: usize) -> Result<(Self, usize), DnsError> {
        let (name, consumed) = Name::parse(buf, pos)?;
        let pos = pos + consumed;
        let rtype = read_u16(buf, pos)?;
        let class = read_u16(buf, pos + 2)?;
        let ttl = read_u32(buf, pos + 4)?;
        let rdlength = read_u16(buf, pos + 8)? as usize;
        let start = pos + 10;
        let rdata = buf.get(start..start + rdlength).ok_or_else(|| {
            DnsError::format(format!(
                "RDATA of {} bytes at offset {} runs past end of message",
                rdlength, start
            ))
        })?;
        Ok((
            Self {
                name,
                rtype,
                class,
                ttl,
                rdata: rdata.to_vec(),
            },
            start + rdlength,
        ))
    }

    pub fn record_type(&self) -> RecordType {
        RecordType::from(self.rtype)
    }

    pub fn rdlength(&self) -> usize {
        self.rdata.len()
    }

    /// The address carried by an A record with well-formed RDATA.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != TYPE_A {
            return None;
        }
        let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), DnsError> {
        let rdlength = u16::try_from(self.rdata.len()).map_err(|_| {
            DnsError::format(format!("RDATA of {} bytes does not fit", self.rdata.len()))
        })?;
        out.extend_from_slice(self.name.wire());
        out.extend_from_slice(&self.rtype.to_be_bytes());
        out.extend_from_slice(&self.class.to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        out.extend_from_slice(&rdlength.to_be_bytes());
        out.extend_from_slice(&self.rdata);
        Ok(())
    }
}

/// A whole DNS message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    /// Build a standard recursion-desired query for one name.
    pub fn query(id: u16, name: &str, qtype: u16) -> Result<Self, DnsError> {
        Ok(Self {
            header: Header {
                id,
                rd: true,
                qdcount: 1,
                ..Header::default()
            },
            questions: vec![Question::new(Name::from_text(name)?, qtype, CLASS_IN)],
            ..Self::default()
        })
    }

    /// Parse a datagram.
    ///
    /// Sections are read in wire order using the header counts. A message
    /// that holds fewer entries than its counts claim is a format error;
    /// bytes after the last counted entry are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, DnsError> {
        let header = Header::parse(buf)?;
        let mut pos = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (question, next) = Question::parse(buf, pos)?;
            questions.push(question);
            pos = next;
        }

        let mut sections = [
            Vec::with_capacity(header.ancount as usize),
            Vec::with_capacity(header.nscount as usize),
            Vec::with_capacity(header.arcount as usize),
        ];
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, count) in sections.iter_mut().zip(counts) {
            for _ in 0..count {
                let (record, next) = ResourceRecord::parse(buf, pos)?;
                section.push(record);
                pos = next;
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serialize the message.
    ///
    /// The emitted counts always equal the section lengths, whatever the
    /// in-memory header says.
    pub fn serialize(&self) -> Result<Vec<u8>, DnsError> {
        let count = |len: usize, section: &str| {
            u16::try_from(len)
                .map_err(|_| DnsError::format(format!("too many {} entries: {}", section, len)))
        };
        let header = Header {
            qdcount: count(self.questions.len(), "question")?,
            ancount: count(self.answers.len(), "answer")?,
            nscount: count(self.authorities.len(), "authority")?,
            arcount: count(self.additionals.len(), "additional")?,
            ..self.header
        };

        let mut out = Vec::with_capacity(CLASSIC_UDP_PAYLOAD);
        out.extend_from_slice(&header.to_bytes());
        for question in &self.questions {
            question.write_to(&mut out);
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.write_to(&mut out)?;
        }
        Ok(out)
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }
}
