//! Domain name encoding.
//!
//! A name on the wire is a run of length-prefixed labels that ends either in
//! the zero-length root label or in a two-byte compression pointer back into
//! the message. This module knows how to skip such a name, how to resolve it
//! into dotted text, and how to emit the uncompressed form.

use std::fmt::{self, Write};

use crate::errors::DnsError;

/// Longest label allowed between two dots.
pub const MAX_LABEL_LEN: usize = 63;

/// Longest name allowed on the wire, length bytes and terminator included.
pub const MAX_NAME_LEN: usize = 255;

/// Upper bound on pointer hops while resolving one name.
const MAX_POINTER_HOPS: usize = 64;

const LABEL_TYPE_MASK: u8 = 0b1100_0000;
const POINTER_TAG: u8 = 0b1100_0000;

/// A domain name as it appeared at one position of a message.
///
/// `wire` holds exactly the bytes the name occupies at that position, so a
/// compressed name keeps its pointer and re-serializes byte for byte. `text`
/// is the fully resolved dotted form, with pointers followed and label bytes
/// escaped in master-file style (`\.`, `\\`, `\DDD`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name {
    wire: Vec<u8>,
    text: String,
}

impl Name {
    /// Build the uncompressed form of a dotted name.
    ///
    /// The stored text is the canonical form, so `"\\065bc"` becomes `"Abc"`.
    pub fn from_text(text: &str) -> Result<Self, DnsError> {
        let wire = encode_name(text)?;
        let (text, _) = decode_to_text(&wire, 0)?;
        Ok(Self { wire, text })
    }

    /// A name that is nothing but a pointer to `offset`, which the caller
    /// guarantees holds `text`.
    pub fn pointer(offset: u16, text: impl Into<String>) -> Self {
        let offset = offset & 0x3FFF;
        Self {
            wire: vec![POINTER_TAG | (offset >> 8) as u8, offset as u8],
            text: text.into(),
        }
    }

    /// Read the name starting at `start` in the whole message `buf`.
    ///
    /// Returns the name and the number of bytes it occupies at `start`.
    pub fn parse(buf: &[u8], start: usize) -> Result<(Self, usize), DnsError> {
        let (text, consumed) = decode_to_text(buf, start)?;
        let wire = buf[start..start + consumed].to_vec();
        Ok((Self { wire, text }, consumed))
    }

    /// Dotted form without a trailing dot; the root is the empty string.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The bytes this name occupies on the wire.
    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    /// Whether the wire form ends in a compression pointer.
    pub fn is_compressed(&self) -> bool {
        let mut pos = 0;
        while let Some(&len) = self.wire.get(pos) {
            if len & LABEL_TYPE_MASK == POINTER_TAG {
                return true;
            }
            if len == 0 {
                return false;
            }
            pos += 1 + len as usize;
        }
        false
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            f.write_str(".")
        } else {
            f.write_str(&self.text)
        }
    }
}

/// Number of bytes the name at `start` occupies, without following pointers.
///
/// A pointer ends the name, so a name is either a literal run plus the root
/// terminator, a literal run plus a pointer, or a lone pointer.
pub fn name_length(buf: &[u8], start: usize) -> Result<usize, DnsError> {
    let mut pos = start;
    loop {
        let len = *buf.get(pos).ok_or_else(|| past_end(start))?;
        match len & LABEL_TYPE_MASK {
            POINTER_TAG => {
                if pos + 2 > buf.len() {
                    return Err(DnsError::format(format!("truncated pointer at offset {}", pos)));
                }
                return Ok(pos + 2 - start);
            }
            0 if len == 0 => return Ok(pos + 1 - start),
            0 => {
                pos += 1 + len as usize;
                if pos - start > MAX_NAME_LEN {
                    return Err(too_long(start));
                }
            }
            _ => {
                return Err(DnsError::format(format!(
                    "reserved label type {:#04x} at offset {}",
                    len, pos
                )))
            }
        }
    }
}

/// Resolve the name at `start` into dotted text, following pointers.
///
/// Returns the text and the number of bytes the name occupies at `start`
/// (the same value [`name_length`] reports). Each pointer must land strictly
/// before the label run it was found in, which guarantees termination on
/// hostile input; the hop count and total length are capped as well.
///
/// Label bytes are never rejected: `.` and `\` are backslash-escaped and
/// anything outside printable ASCII becomes `\DDD`, so distinct wire names
/// always yield distinct text.
pub fn decode_to_text(buf: &[u8], start: usize) -> Result<(String, usize), DnsError> {
    let consumed = name_length(buf, start)?;
    let mut text = String::new();
    let mut pos = start;
    let mut run_start = start;
    let mut hops = 0;
    let mut wire_len = 0;

    loop {
        let len = *buf.get(pos).ok_or_else(|| past_end(start))?;
        match len & LABEL_TYPE_MASK {
            POINTER_TAG => {
                let low = *buf.get(pos + 1).ok_or_else(|| {
                    DnsError::format(format!("truncated pointer at offset {}", pos))
                })?;
                let target = (((len & !LABEL_TYPE_MASK) as usize) << 8) | low as usize;
                if target >= run_start {
                    return Err(DnsError::format(format!(
                        "pointer at offset {} does not point backwards (target {})",
                        pos, target
                    )));
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DnsError::format("too many compression pointers"));
                }
                pos = target;
                run_start = target;
            }
            0 if len == 0 => {
                wire_len += 1;
                if wire_len > MAX_NAME_LEN {
                    return Err(too_long(start));
                }
                return Ok((text, consumed));
            }
            0 => {
                let end = pos + 1 + len as usize;
                let label = buf.get(pos + 1..end).ok_or_else(|| {
                    DnsError::format(format!("label at offset {} runs past end of message", pos))
                })?;
                wire_len += 1 + len as usize;
                if wire_len > MAX_NAME_LEN {
                    return Err(too_long(start));
                }
                if !text.is_empty() {
                    text.push('.');
                }
                push_escaped(&mut text, label);
                pos = end;
            }
            _ => {
                return Err(DnsError::format(format!(
                    "reserved label type {:#04x} at offset {}",
                    len, pos
                )))
            }
        }
    }
}

fn past_end(start: usize) -> DnsError {
    DnsError::format(format!("name at offset {} runs past end of message", start))
}

fn too_long(start: usize) -> DnsError {
    DnsError::format(format!("name at offset {} is too long", start))
}

fn push_escaped(text: &mut String, label: &[u8]) {
    for &byte in label {
        match byte {
            b'.' | b'\\' => {
                text.push('\\');
                text.push(byte as char);
            }
            0x21..=0x7E => text.push(byte as char),
            _ => {
                let _ = write!(text, "\\{:03}", byte);
            }
        }
    }
}

/// Split presentation-form text into raw labels, undoing `\X` and `\DDD`
/// escapes. An unescaped trailing dot is dropped.
fn text_labels(name: &str) -> Result<Vec<Vec<u8>>, DnsError> {
    if name.is_empty() || name == "." {
        return Ok(Vec::new());
    }
    let bytes = name.as_bytes();
    let mut labels = Vec::new();
    let mut label = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                labels.push(std::mem::take(&mut label));
                i += 1;
            }
            b'\\' => {
                let digits = bytes
                    .get(i + 1..i + 4)
                    .filter(|d| d.iter().all(u8::is_ascii_digit));
                if let Some(digits) = digits {
                    let value = digits
                        .iter()
                        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
                    let byte = u8::try_from(value).map_err(|_| {
                        DnsError::format(format!("escape \\{} out of range in {:?}", value, name))
                    })?;
                    label.push(byte);
                    i += 4;
                } else {
                    let escaped = *bytes.get(i + 1).ok_or_else(|| {
                        DnsError::format(format!("dangling backslash in {:?}", name))
                    })?;
                    label.push(escaped);
                    i += 2;
                }
            }
            other => {
                label.push(other);
                i += 1;
            }
        }
    }
    if !label.is_empty() {
        labels.push(label);
    }
    Ok(labels)
}

/// Encode a dotted name as an uncompressed label sequence.
///
/// A single trailing dot is accepted; `""` and `"."` both encode the root.
/// Escapes produced by [`decode_to_text`] are understood, so decoded text
/// encodes back to the same wire bytes.
pub fn encode_name(name: &str) -> Result<Vec<u8>, DnsError> {
    let labels = text_labels(name)?;
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in &labels {
        if label.is_empty() {
            return Err(DnsError::format(format!("empty label in {:?}", name)));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::format(format!(
                "label in {:?} is longer than {} bytes",
                name, MAX_LABEL_LEN
            )));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
    if out.len() > MAX_NAME_LEN {
        return Err(DnsError::format(format!(
            "name {:?} is longer than {} bytes",
            name, MAX_NAME_LEN
        )));
    }
    Ok(out)
}
