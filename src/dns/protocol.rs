//! implements the DNS protocol in a transport agnostic fashion

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};

/// Largest message representable on any transport the relay speaks
pub const MAX_MESSAGE_SIZE: usize = 0xFFFF;

/// The IN class, the only class whose RDATA is decoded
pub const CLASS_IN: u16 = 1;

/// Opcode of a standard query
pub const OPCODE_QUERY: u8 = 0;

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    #[display(
        fmt = "rdata of type {} declared {} bytes but {} were decoded",
        qtype,
        expected,
        actual
    )]
    #[from(ignore)]
    RdataLength {
        qtype: u16,
        expected: u16,
        actual: usize,
    },
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown that an integer parameter in order to retain the
/// id of an unknown query when compiling the reply. An integer can be converted
/// to a querytype using the `from_num` function, and back to an integer using
/// the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy)]
pub enum QueryType {
    Unknown(u16),
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Ptr,   // 12
    Hinfo, // 13
    Mx,    // 15
    Txt,   // 16
    Aaaa,  // 28
    Srv,   // 33
    Opt,   // 41
    Ixfr,  // 251
    Axfr,  // 252
    Any,   // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Ptr => 12,
            QueryType::Hinfo => 13,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
            QueryType::Ixfr => 251,
            QueryType::Axfr => 252,
            QueryType::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            12 => QueryType::Ptr,
            13 => QueryType::Hinfo,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            251 => QueryType::Ixfr,
            252 => QueryType::Axfr,
            255 => QueryType::Any,
            _ => QueryType::Unknown(num),
        }
    }
}

/// A record TTL that is ignored when comparing records, so that the same
/// record observed at different times compares equal.
#[derive(Copy, Clone, Debug, Eq)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // purposely left empty
    }
}

/// `DnsRecord` is the primary representation of a DNS record
///
/// Types whose RDATA can hold compressed names are decoded so that they can
/// be written back out after decompression. Everything else, including any
/// record outside the IN class, is carried as raw RDATA in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        class: u16,
        data: Vec<u8>,
        ttl: TransientTtl,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    }, // 6
    Ptr {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 12
    Hinfo {
        domain: String,
        cpu: String,
        os: String,
        ttl: TransientTtl,
    }, // 13
    Mx {
        domain: String,
        priority: u16,
        host: String,
        ttl: TransientTtl,
    }, // 15
    Txt {
        domain: String,
        data: Vec<String>,
        ttl: TransientTtl,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    }, // 28
    Srv {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: TransientTtl,
    }, // 33
    Opt {
        packet_len: u16,
        flags: u32,
        data: Vec<u8>,
    }, // 41
}

/// Splits RDATA into its character-strings. Returns None if the lengths do
/// not add up or a string is not valid UTF-8.
fn read_character_strings(data: &[u8]) -> Option<Vec<String>> {
    let mut strings = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let len = data[pos] as usize;
        let chunk = data.get(pos + 1..pos + 1 + len)?;
        strings.push(String::from_utf8(chunk.to_vec()).ok()?);
        pos += 1 + len;
    }

    Some(strings)
}

fn write_character_string<T: PacketBuffer>(buffer: &mut T, data: &str) -> Result<()> {
    // longer strings are cut at the 255 octet limit of a character-string
    let bytes = &data.as_bytes()[..data.len().min(255)];
    buffer.write_u8(bytes.len() as u8)?;
    buffer.write_bytes(bytes)?;

    Ok(())
}

/// Writes owner name, type, class, ttl and a placeholder RDLENGTH. Returns
/// the position of the placeholder for `finish_rdata`.
fn write_preamble<T: PacketBuffer>(
    buffer: &mut T,
    domain: &str,
    qtype: u16,
    class: u16,
    ttl: u32,
) -> Result<usize> {
    buffer.write_qname(domain)?;
    buffer.write_u16(qtype)?;
    buffer.write_u16(class)?;
    buffer.write_u32(ttl)?;

    let pos = buffer.pos();
    buffer.write_u16(0)?;

    Ok(pos)
}

fn finish_rdata<T: PacketBuffer>(buffer: &mut T, len_pos: usize) -> Result<()> {
    let size = buffer.pos() - (len_pos + 2);
    buffer.set_u16(len_pos, size as u16)?;

    Ok(())
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        let rdata_start = buffer.pos();
        let raw = buffer.get_range(rdata_start, data_len as usize)?.to_vec();

        let unknown = |domain: String, data: Vec<u8>| DnsRecord::Unknown {
            domain,
            qtype: qtype_num,
            class,
            data,
            ttl: TransientTtl(ttl),
        };

        if qtype == QueryType::Opt {
            buffer.step(data_len as usize)?;

            return Ok(DnsRecord::Opt {
                packet_len: class,
                flags: ttl,
                data: raw,
            });
        }

        if class != CLASS_IN {
            buffer.step(data_len as usize)?;
            return Ok(unknown(domain, raw));
        }

        let record = match qtype {
            QueryType::A => {
                let raw_addr = buffer.read_u32()?;
                let addr = Ipv4Addr::new(
                    ((raw_addr >> 24) & 0xFF) as u8,
                    ((raw_addr >> 16) & 0xFF) as u8,
                    ((raw_addr >> 8) & 0xFF) as u8,
                    (raw_addr & 0xFF) as u8,
                );

                DnsRecord::A {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Aaaa => {
                let raw_addr1 = buffer.read_u32()?;
                let raw_addr2 = buffer.read_u32()?;
                let raw_addr3 = buffer.read_u32()?;
                let raw_addr4 = buffer.read_u32()?;
                let addr = Ipv6Addr::new(
                    ((raw_addr1 >> 16) & 0xFFFF) as u16,
                    (raw_addr1 & 0xFFFF) as u16,
                    ((raw_addr2 >> 16) & 0xFFFF) as u16,
                    (raw_addr2 & 0xFFFF) as u16,
                    ((raw_addr3 >> 16) & 0xFFFF) as u16,
                    (raw_addr3 & 0xFFFF) as u16,
                    ((raw_addr4 >> 16) & 0xFFFF) as u16,
                    (raw_addr4 & 0xFFFF) as u16,
                );

                DnsRecord::Aaaa {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ns => {
                let mut ns = String::new();
                buffer.read_qname(&mut ns)?;

                DnsRecord::Ns {
                    domain,
                    host: ns,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Cname => {
                let mut cname = String::new();
                buffer.read_qname(&mut cname)?;

                DnsRecord::Cname {
                    domain,
                    host: cname,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ptr => {
                let mut ptr = String::new();
                buffer.read_qname(&mut ptr)?;

                DnsRecord::Ptr {
                    domain,
                    host: ptr,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;

                let mut srv = String::new();
                buffer.read_qname(&mut srv)?;

                DnsRecord::Srv {
                    domain,
                    priority,
                    weight,
                    port,
                    host: srv,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Mx => {
                let priority = buffer.read_u16()?;
                let mut mx = String::new();
                buffer.read_qname(&mut mx)?;

                DnsRecord::Mx {
                    domain,
                    priority,
                    host: mx,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;

                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                let serial = buffer.read_u32()?;
                let refresh = buffer.read_u32()?;
                let retry = buffer.read_u32()?;
                let expire = buffer.read_u32()?;
                let minimum = buffer.read_u32()?;

                DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Txt => {
                buffer.step(data_len as usize)?;

                match read_character_strings(&raw) {
                    Some(data) => DnsRecord::Txt {
                        domain,
                        data,
                        ttl: TransientTtl(ttl),
                    },
                    None => unknown(domain, raw),
                }
            }
            QueryType::Hinfo => {
                buffer.step(data_len as usize)?;

                match read_character_strings(&raw).as_deref() {
                    Some([cpu, os]) => DnsRecord::Hinfo {
                        domain,
                        cpu: cpu.clone(),
                        os: os.clone(),
                        ttl: TransientTtl(ttl),
                    },
                    _ => unknown(domain, raw),
                }
            }
            QueryType::Opt
            | QueryType::Ixfr
            | QueryType::Axfr
            | QueryType::Any
            | QueryType::Unknown(_) => {
                buffer.step(data_len as usize)?;
                unknown(domain, raw)
            }
        };

        let consumed = buffer.pos() - rdata_start;
        if consumed != data_len as usize {
            return Err(ProtocolError::RdataLength {
                qtype: qtype_num,
                expected: data_len,
                actual: consumed,
            });
        }

        Ok(record)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::A.to_num(), CLASS_IN, ttl)?;
                buffer.write_bytes(&addr.octets())?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::Aaaa.to_num(), CLASS_IN, ttl)?;
                for octet in &addr.segments() {
                    buffer.write_u16(*octet)?;
                }
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Ns {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::Ns.to_num(), CLASS_IN, ttl)?;
                buffer.write_qname(host)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Cname {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos =
                    write_preamble(buffer, domain, QueryType::Cname.to_num(), CLASS_IN, ttl)?;
                buffer.write_qname(host)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Ptr {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::Ptr.to_num(), CLASS_IN, ttl)?;
                buffer.write_qname(host)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Srv {
                ref domain,
                priority,
                weight,
                port,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::Srv.to_num(), CLASS_IN, ttl)?;
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                // RFC 2782 forbids compression of the target
                buffer.write_qname_uncompressed(host)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Mx {
                ref domain,
                priority,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::Mx.to_num(), CLASS_IN, ttl)?;
                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Soa {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::Soa.to_num(), CLASS_IN, ttl)?;
                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Hinfo {
                ref domain,
                ref cpu,
                ref os,
                ttl: TransientTtl(ttl),
            } => {
                let pos =
                    write_preamble(buffer, domain, QueryType::Hinfo.to_num(), CLASS_IN, ttl)?;
                write_character_string(buffer, cpu)?;
                write_character_string(buffer, os)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Txt {
                ref domain,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, QueryType::Txt.to_num(), CLASS_IN, ttl)?;
                for s in data {
                    write_character_string(buffer, s)?;
                }
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Opt {
                packet_len,
                flags,
                ref data,
            } => {
                let pos = write_preamble(buffer, "", QueryType::Opt.to_num(), packet_len, flags)?;
                buffer.write_bytes(data)?;
                finish_rdata(buffer, pos)?;
            }
            DnsRecord::Unknown {
                ref domain,
                qtype,
                class,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                let pos = write_preamble(buffer, domain, qtype, class, ttl)?;
                buffer.write_bytes(data)?;
                finish_rdata(buffer, pos)?;
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Ptr { .. } => QueryType::Ptr,
            DnsRecord::Hinfo { .. } => QueryType::Hinfo,
            DnsRecord::Srv { .. } => QueryType::Srv,
            DnsRecord::Mx { .. } => QueryType::Mx,
            DnsRecord::Unknown { qtype, .. } => QueryType::from_num(qtype),
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Opt { .. } => QueryType::Opt,
        }
    }

    fn ttl_slot(&mut self) -> Option<&mut TransientTtl> {
        match *self {
            DnsRecord::A { ref mut ttl, .. }
            | DnsRecord::Aaaa { ref mut ttl, .. }
            | DnsRecord::Ns { ref mut ttl, .. }
            | DnsRecord::Cname { ref mut ttl, .. }
            | DnsRecord::Ptr { ref mut ttl, .. }
            | DnsRecord::Hinfo { ref mut ttl, .. }
            | DnsRecord::Srv { ref mut ttl, .. }
            | DnsRecord::Mx { ref mut ttl, .. }
            | DnsRecord::Unknown { ref mut ttl, .. }
            | DnsRecord::Soa { ref mut ttl, .. }
            | DnsRecord::Txt { ref mut ttl, .. } => Some(ttl),
            DnsRecord::Opt { .. } => None,
        }
    }

    /// TTL of the record. EDNS pseudo-records reuse the field for flags and
    /// have none.
    pub fn get_ttl(&self) -> Option<u32> {
        match *self {
            DnsRecord::A {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Aaaa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ns {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Cname {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ptr {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Hinfo {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Srv {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Mx {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Unknown {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Soa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Txt {
                ttl: TransientTtl(ttl),
                ..
            } => Some(ttl),
            DnsRecord::Opt { .. } => None,
        }
    }

    /// Sets the TTL, leaving EDNS pseudo-records untouched.
    pub fn set_ttl(&mut self, value: u32) {
        if let Some(ttl) = self.ttl_slot() {
            *ttl = TransientTtl(value);
        }
    }
}

/// The result code for a DNS query, as described in the specification
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    NOERROR,
    FORMERR,
    SERVFAIL,
    NXDOMAIN,
    NOTIMP,
    REFUSED,
    YXDOMAIN,
    YXRRSET,
    NXRRSET,
    NOTAUTH,
    NOTZONE,
    Unassigned(u8),
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            6 => ResultCode::YXDOMAIN,
            7 => ResultCode::YXRRSET,
            8 => ResultCode::NXRRSET,
            9 => ResultCode::NOTAUTH,
            10 => ResultCode::NOTZONE,
            x => ResultCode::Unassigned(x),
        }
    }

    pub fn to_num(&self) -> u8 {
        match *self {
            ResultCode::NOERROR => 0,
            ResultCode::FORMERR => 1,
            ResultCode::SERVFAIL => 2,
            ResultCode::NXDOMAIN => 3,
            ResultCode::NOTIMP => 4,
            ResultCode::REFUSED => 5,
            ResultCode::YXDOMAIN => 6,
            ResultCode::YXRRSET => 7,
            ResultCode::NXRRSET => 8,
            ResultCode::NOTAUTH => 9,
            ResultCode::NOTZONE => 10,
            ResultCode::Unassigned(x) => x & 0x0F,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | ((self.opcode & 0x0F) << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            self.rescode.to_num()
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DnsHeader:")?;
        writeln!(f, "\tid: {0}", self.id)?;

        writeln!(f, "\trecursion_desired: {0}", self.recursion_desired)?;
        writeln!(f, "\ttruncated_message: {0}", self.truncated_message)?;
        writeln!(
            f,
            "\tauthoritative_answer: {0}",
            self.authoritative_answer
        )?;
        writeln!(f, "\topcode: {0}", self.opcode)?;
        writeln!(f, "\tresponse: {0}", self.response)?;

        writeln!(f, "\trescode: {:?}", self.rescode)?;
        writeln!(f, "\tchecking_disabled: {0}", self.checking_disabled)?;
        writeln!(f, "\tauthed_data: {0}", self.authed_data)?;
        writeln!(f, "\tz: {0}", self.z)?;
        writeln!(f, "\trecursion_available: {0}", self.recursion_available)?;

        writeln!(f, "\tquestions: {0}", self.questions)?;
        writeln!(f, "\tanswers: {0}", self.answers)?;
        writeln!(
            f,
            "\tauthoritative_entries: {0}",
            self.authoritative_entries
        )?;
        writeln!(f, "\tresource_entries: {0}", self.resource_entries)?;

        Ok(())
    }
}

/// Fully qualified form of a name as stored in a packet: a trailing dot is
/// appended, and the root name becomes ".".
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn fqdn(&self) -> String {
        fqdn(&self.name)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;

        let typenum = self.qtype.to_num();
        buffer.write_u16(typenum)?;
        buffer.write_u16(self.qclass)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.qclass = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DnsQuestion:")?;
        writeln!(f, "\tname: {0}", self.name)?;
        writeln!(f, "\trecord type: {:?}", self.qtype)?;
        writeln!(f, "\tclass: {0}", self.qclass)?;

        Ok(())
    }
}

/// Representation of a complete DNS packet
///
/// A DNS packet can be read and written in a single operation, and is what
/// travels between the HTTP front end, the relay and the upstreams.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    /// Builds an empty response to `request`: same id and opcode, the RD and
    /// CD bits copied for standard queries, and the first question echoed.
    pub fn reply_to(request: &DnsPacket) -> DnsPacket {
        let mut reply = DnsPacket::new();
        reply.header.id = request.header.id;
        reply.header.response = true;
        reply.header.opcode = request.header.opcode;
        reply.header.rescode = ResultCode::NOERROR;

        if request.header.opcode == OPCODE_QUERY {
            reply.header.recursion_desired = request.header.recursion_desired;
            reply.header.checking_disabled = request.header.checking_disabled;
        }

        if let Some(question) = request.questions.first() {
            reply.questions.push(question.clone());
        }

        reply
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    /// Parses a complete wire format message.
    pub fn from_bytes(data: &[u8]) -> Result<DnsPacket> {
        let mut buffer = BytePacketBuffer::from_bytes(data);
        DnsPacket::from_buffer(&mut buffer)
    }

    /// Serializes the packet, truncating it if it would not fit in a single
    /// message.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer, MAX_MESSAGE_SIZE)?;

        Ok(buffer.into_bytes())
    }

    /// Answer, authority and additional records in wire order.
    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut DnsRecord> {
        self.answers
            .iter_mut()
            .chain(self.authorities.iter_mut())
            .chain(self.resources.iter_mut())
    }

    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();

        self.header.questions = self.questions.len() as u16;
        self.header.answers = 0;
        self.header.authoritative_entries = 0;
        self.header.resource_entries = 0;

        self.header.write(&mut test_buffer)?;
        for question in &self.questions {
            question.write(&mut test_buffer)?;
        }
        let mut size = test_buffer.pos();

        let mut record_count = self.answers.len() + self.authorities.len() + self.resources.len();

        for (i, rec) in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                record_count = i;
                self.header.truncated_message = true;
                break;
            } else if i < self.answers.len() {
                self.header.answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                self.header.authoritative_entries += 1;
            } else {
                self.header.resource_entries += 1;
            }
        }

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}
