//! Message records and the block object codec.
//!
//! A block object is a fixed header followed by its records, each record a
//! fixed little-endian header plus source and payload bytes:
//!
//! ```text
//! block:  magic u32 | version u32 | block_id u64 | count u32 | reserved u32
//! record: id u64 | external_id u64 | external_ts u64 | created_at u64
//!         | segment i64 | source_len u32 | payload_len u32 | crc32 u32
//!         | reserved u32 | source | payload
//! ```

use std::sync::Arc;

use crate::core::{Error, Result};

pub const BLOCK_MAGIC: u32 = 0x424C_4B51; // 'BLKQ'
pub const BLOCK_VERSION: u32 = 1;
pub const BLOCK_HEADER_SIZE: usize = 24;
pub const RECORD_HEADER_SIZE: usize = 56;
pub const MAX_SOURCE_LEN: usize = u16::MAX as usize;

/// A stored message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub external_id: u64,
    pub external_timestamp: u64,
    pub created_at: u64,
    pub payload: Vec<u8>,
    pub source: String,
    pub segment: i64,
}

impl Message {
    pub fn crc32(payload: &[u8]) -> u32 {
        use crc32fast::Hasher;
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }

    fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.source.len() + self.payload.len()
    }
}

/// Caller-side description of a message to append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewMessage {
    pub payload: Vec<u8>,
    /// Dedup key; 0 means "use the assigned id".
    pub external_id: u64,
    /// Unix nanoseconds; 0 means "now".
    pub external_timestamp: u64,
    pub source: String,
    pub segment: i64,
}

impl NewMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn external_id(mut self, external_id: u64) -> Self {
        self.external_id = external_id;
        self
    }

    pub fn external_timestamp(mut self, external_timestamp: u64) -> Self {
        self.external_timestamp = external_timestamp;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn segment(mut self, segment: i64) -> Self {
        self.segment = segment;
        self
    }

    pub(crate) fn into_message(self, id: u64, created_at: u64) -> Message {
        Message {
            id,
            external_id: if self.external_id == 0 { id } else { self.external_id },
            external_timestamp: if self.external_timestamp == 0 {
                created_at
            } else {
                self.external_timestamp
            },
            created_at,
            payload: self.payload,
            source: self.source,
            segment: self.segment,
        }
    }
}

/// A record returned from a read, with its durability at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWithMeta {
    pub message: Arc<Message>,
    /// True when the record's id is covered by its block's persisted version.
    pub is_saved: bool,
}

impl MessageWithMeta {
    pub fn id(&self) -> u64 {
        self.message.id
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or(Error::Corrupt("truncated u32"))?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(slice);
    Ok(u32::from_le_bytes(raw))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64> {
    let slice = bytes
        .get(at..at + 8)
        .ok_or(Error::Corrupt("truncated u64"))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(slice);
    Ok(u64::from_le_bytes(raw))
}

/// Serializes a block's records.
pub fn encode_block(block_id: u64, records: &[Arc<Message>]) -> Result<Vec<u8>> {
    let body: usize = records.iter().map(|m| m.encoded_len()).sum();
    let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE + body);
    put_u32(&mut buf, BLOCK_MAGIC);
    put_u32(&mut buf, BLOCK_VERSION);
    put_u64(&mut buf, block_id);
    let count = u32::try_from(records.len()).map_err(|_| Error::Corrupt("too many records"))?;
    put_u32(&mut buf, count);
    put_u32(&mut buf, 0);

    for message in records {
        if message.source.len() > MAX_SOURCE_LEN {
            return Err(Error::Corrupt("source too long"));
        }
        let payload_len =
            u32::try_from(message.payload.len()).map_err(|_| Error::Corrupt("payload too large"))?;
        put_u64(&mut buf, message.id);
        put_u64(&mut buf, message.external_id);
        put_u64(&mut buf, message.external_timestamp);
        put_u64(&mut buf, message.created_at);
        put_u64(&mut buf, message.segment as u64);
        put_u32(&mut buf, message.source.len() as u32);
        put_u32(&mut buf, payload_len);
        put_u32(&mut buf, Message::crc32(&message.payload));
        put_u32(&mut buf, 0);
        buf.extend_from_slice(message.source.as_bytes());
        buf.extend_from_slice(&message.payload);
    }
    Ok(buf)
}

/// Parses a block object, validating magic, version, ordering and checksums.
pub fn decode_block(expected_id: u64, bytes: &[u8]) -> Result<Vec<Arc<Message>>> {
    if bytes.len() < BLOCK_HEADER_SIZE {
        return Err(Error::Corrupt("block object too small"));
    }
    if read_u32(bytes, 0)? != BLOCK_MAGIC {
        return Err(Error::Corrupt("block magic mismatch"));
    }
    let version = read_u32(bytes, 4)?;
    if version != BLOCK_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    if read_u64(bytes, 8)? != expected_id {
        return Err(Error::Corrupt("block id mismatch"));
    }
    let count = read_u32(bytes, 16)? as usize;

    let mut records = Vec::with_capacity(count);
    let mut offset = BLOCK_HEADER_SIZE;
    let mut last_id = 0u64;
    for _ in 0..count {
        let id = read_u64(bytes, offset)?;
        let external_id = read_u64(bytes, offset + 8)?;
        let external_timestamp = read_u64(bytes, offset + 16)?;
        let created_at = read_u64(bytes, offset + 24)?;
        let segment = read_u64(bytes, offset + 32)? as i64;
        let source_len = read_u32(bytes, offset + 40)? as usize;
        let payload_len = read_u32(bytes, offset + 44)? as usize;
        let crc = read_u32(bytes, offset + 48)?;
        offset += RECORD_HEADER_SIZE;

        let source = bytes
            .get(offset..offset + source_len)
            .ok_or(Error::Corrupt("truncated source"))?;
        let source = std::str::from_utf8(source)
            .map_err(|_| Error::Corrupt("source is not utf-8"))?
            .to_owned();
        offset += source_len;

        let payload = bytes
            .get(offset..offset + payload_len)
            .ok_or(Error::Corrupt("truncated payload"))?
            .to_vec();
        offset += payload_len;
        if Message::crc32(&payload) != crc {
            return Err(Error::Corrupt("crc mismatch"));
        }
        if id <= last_id {
            return Err(Error::Corrupt("record ids out of order"));
        }
        last_id = id;

        records.push(Arc::new(Message {
            id,
            external_id,
            external_timestamp,
            created_at,
            payload,
            source,
            segment,
        }));
    }
    if offset != bytes.len() {
        return Err(Error::Corrupt("trailing bytes after records"));
    }
    Ok(records)
}
