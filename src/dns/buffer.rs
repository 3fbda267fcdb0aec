//! buffers for use when writing and reading dns packets

use std::collections::BTreeMap;

use derive_more::{Display, Error, From};

/// Maximum number of compression pointers followed while reading a single name
const MAX_JUMPS: usize = 16;

/// Maximum length of an encoded domain name, RFC 1035 section 2.3.4
const MAX_NAME_LEN: usize = 255;

/// Maximum length of a single label
const MAX_LABEL_LEN: usize = 63;

/// Compression pointers carry a 14 bit offset
const MAX_POINTER_OFFSET: usize = 0x3FFF;

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    #[display(fmt = "end of buffer")]
    EndOfBuffer,
    #[display(fmt = "limit of {} name compression jumps exceeded", MAX_JUMPS)]
    TooManyJumps,
    #[display(fmt = "unsupported label type {:#04x}", label)]
    #[from(ignore)]
    UnsupportedLabel { label: u8 },
    #[display(fmt = "label exceeds {} octets", MAX_LABEL_LEN)]
    LabelTooLong,
    #[display(fmt = "name exceeds {} octets", MAX_NAME_LEN)]
    NameTooLong,
    #[display(fmt = "empty label in name {:?}", name)]
    #[from(ignore)]
    EmptyLabel { name: String },
    #[display(fmt = "invalid escape sequence in name {:?}", name)]
    #[from(ignore)]
    InvalidEscape { name: String },
}

type Result<T> = std::result::Result<T, BufferError>;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        for b in data {
            self.write(*b)?;
        }

        Ok(())
    }

    /// Writes a name, pointing back at an earlier occurrence of any suffix
    /// already present in the buffer.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let labels = parse_labels(qname)?;

        for i in 0..labels.len() {
            let suffix = labels_key(&labels[i..]);
            if let Some(prev_pos) = self.find_label(&suffix) {
                let jump_inst = (prev_pos as u16) | 0xC000;
                self.write_u16(jump_inst)?;
                return Ok(());
            }

            let pos = self.pos();
            if pos <= MAX_POINTER_OFFSET {
                self.save_label(&suffix, pos);
            }

            self.write_u8(labels[i].len() as u8)?;
            self.write_bytes(&labels[i])?;
        }

        self.write_u8(0)?;

        Ok(())
    }

    /// Writes a name without compression, for RDATA where pointers are not
    /// permitted.
    fn write_qname_uncompressed(&mut self, qname: &str) -> Result<()> {
        for label in parse_labels(qname)? {
            self.write_u8(label.len() as u8)?;
            self.write_bytes(&label)?;
        }

        self.write_u8(0)?;

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    /// Reads a possibly compressed name into `outstr`, in presentation form
    /// without the trailing dot. Label case is preserved.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps = 0;
        let mut wire_len = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            if (len & 0xC0) == 0xC0 {
                if jumps >= MAX_JUMPS {
                    return Err(BufferError::TooManyJumps);
                }

                let b2 = self.get(pos + 1)? as u16;
                if !jumped {
                    self.seek(pos + 2)?;
                }

                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                jumps += 1;
                continue;
            }

            if (len & 0xC0) != 0 {
                return Err(BufferError::UnsupportedLabel { label: len });
            }

            pos += 1;
            wire_len += len as usize + 1;
            if wire_len > MAX_NAME_LEN {
                return Err(BufferError::NameTooLong);
            }

            if len == 0 {
                break;
            }

            outstr.push_str(delim);
            escape_label(self.get_range(pos, len as usize)?, outstr);

            delim = ".";
            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

fn escape_label(label: &[u8], outstr: &mut String) {
    for &b in label {
        match b {
            b'.' => outstr.push_str("\\."),
            b'\\' => outstr.push_str("\\\\"),
            0x21..=0x7E => outstr.push(b as char),
            _ => outstr.push_str(&format!("\\{:03}", b)),
        }
    }
}

/// Splits a presentation-form name into raw labels, undoing the escaping
/// applied by `read_qname`. A single trailing dot is accepted; the root name
/// is either "" or ".".
fn parse_labels(qname: &str) -> Result<Vec<Vec<u8>>> {
    let name = qname.strip_suffix('.').unwrap_or(qname);
    if name.is_empty() {
        return Ok(Vec::new());
    }

    let mut labels = Vec::new();
    let mut current = Vec::new();
    let mut wire_len = 1;

    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                if current.is_empty() {
                    return Err(BufferError::EmptyLabel {
                        name: qname.to_string(),
                    });
                }
                wire_len += current.len() + 1;
                labels.push(std::mem::take(&mut current));
                i += 1;
            }
            b'\\' => {
                let rest = &bytes[i + 1..];
                if rest.len() >= 3 && rest[..3].iter().all(u8::is_ascii_digit) {
                    let value = (rest[0] - b'0') as u16 * 100
                        + (rest[1] - b'0') as u16 * 10
                        + (rest[2] - b'0') as u16;
                    if value > 255 {
                        return Err(BufferError::InvalidEscape {
                            name: qname.to_string(),
                        });
                    }
                    current.push(value as u8);
                    i += 4;
                } else if let Some(&escaped) = rest.first() {
                    current.push(escaped);
                    i += 2;
                } else {
                    return Err(BufferError::InvalidEscape {
                        name: qname.to_string(),
                    });
                }
            }
            b => {
                current.push(b);
                i += 1;
            }
        }

        if current.len() > MAX_LABEL_LEN {
            return Err(BufferError::LabelTooLong);
        }
    }

    if current.is_empty() {
        return Err(BufferError::EmptyLabel {
            name: qname.to_string(),
        });
    }
    wire_len += current.len() + 1;
    labels.push(current);

    if wire_len > MAX_NAME_LEN {
        return Err(BufferError::NameTooLong);
    }

    Ok(labels)
}

fn labels_key(labels: &[Vec<u8>]) -> String {
    let mut key = String::new();
    let mut delim = "";
    for label in labels {
        key.push_str(delim);
        escape_label(label, &mut key);
        delim = ".";
    }
    key
}

/// Growable buffer used when serializing packets. Keeps track of the names
/// written so far so that later occurrences can be compressed.
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).cloned().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or(BufferError::EndOfBuffer)?;
        self.buffer.get(start..end).ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            self.buffer.push(val);
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        let slot = self.buffer.get_mut(pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}

/// Read-side buffer over a received message. Reads past the end of the
/// message fail instead of yielding zeroes.
pub struct BytePacketBuffer {
    pub buf: Vec<u8>,
    pub pos: usize,
}

impl BytePacketBuffer {
    pub fn from_bytes(data: &[u8]) -> BytePacketBuffer {
        BytePacketBuffer {
            buf: data.to_vec(),
            pos: 0,
        }
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}

    fn read(&mut self) -> Result<u8> {
        let res = *self.buf.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buf.get(pos).cloned().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or(BufferError::EndOfBuffer)?;
        self.buf.get(start..end).ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        let slot = self.buf.get_mut(self.pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        let slot = self.buf.get_mut(pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}
