//! Multi-message frame codec
//!
//! Packs an ordered batch of key/value messages into a single physical record
//! payload, and unpacks it again before dispatch. The layout is:
//!
//! ```text
//! MAGIC (16 bytes) || { KEY_LEN (u32 BE) || KEY || VALUE_LEN (u32 BE) || VALUE }*
//! ```
//!
//! The format carries no version; it is identified only by the magic prefix.

use thiserror::Error;

/// Raw bytes of UUID `a8c79db6-75e1-4c4c-bf1e-b77d0d6d0f00`.
pub const MAGIC: [u8; 16] = [
    0xa8, 0xc7, 0x9d, 0xb6, 0x75, 0xe1, 0x4c, 0x4c, 0xbf, 0x1e, 0xb7, 0x7d, 0x0d, 0x6d, 0x0f, 0x00,
];

const LEN_PREFIX: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad magic: payload is not a multi-message batch")]
    BadMagic,
    #[error("truncated frame: needed {needed} bytes, {remaining} remaining")]
    TruncatedFrame { needed: usize, remaining: usize },
    #[error("frame {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// A logical message carried inside a multi-message batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Returns true when the payload starts with the multi-message magic prefix.
pub fn is_multi_message(payload: &[u8]) -> bool {
    payload.starts_with(&MAGIC)
}

/// Exact size of the buffer `encode` produces for these messages.
pub fn encoded_len(messages: &[KeyValue]) -> usize {
    messages.iter().fold(MAGIC.len(), |acc, message| {
        acc + 2 * LEN_PREFIX + message.key.len() + message.value.len()
    })
}

/// Pack `messages` into one payload, preserving their order.
///
/// # Panics
///
/// If a key or value is longer than `u32::MAX` bytes.
pub fn encode(messages: &[KeyValue]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(messages));
    buf.extend_from_slice(&MAGIC);

    for message in messages {
        write_field(&mut buf, message.key.as_bytes());
        write_field(&mut buf, message.value.as_bytes());
    }

    buf
}

pub fn decode(payload: &[u8]) -> Result<Vec<KeyValue>, FormatError> {
    if !is_multi_message(payload) {
        return Err(FormatError::BadMagic);
    }

    let mut reader = FrameReader {
        buf: &payload[MAGIC.len()..],
    };
    let mut messages = Vec::new();

    while !reader.is_empty() {
        let key = reader.read_field("key")?;
        let value = reader.read_field("value")?;
        messages.push(KeyValue { key, value });
    }

    Ok(messages)
}

fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    // u32 framing is part of the wire format; oversized fields cannot be represented
    let len = u32::try_from(bytes.len()).expect("frame field larger than u32::MAX bytes");
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
}

struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], FormatError> {
        if needed > self.buf.len() {
            return Err(FormatError::TruncatedFrame {
                needed,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(needed);
        self.buf = tail;
        Ok(head)
    }

    fn read_field(&mut self, field: &'static str) -> Result<String, FormatError> {
        let mut len = [0u8; LEN_PREFIX];
        len.copy_from_slice(self.take(LEN_PREFIX)?);
        let len = u32::from_be_bytes(len) as usize;

        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8 { field })
    }
}
