//! Decoder for the manifest's binary encoding
//!
//! The coordinator writes an Avro array of records with the fixed schema
//! `{path: string, hash: string, size: long}`. Only that shape is supported,
//! so this is a direct reader rather than a schema-driven one:
//!
//! - `long` is a zig-zag varint
//! - `string` is a `long` length followed by UTF-8 bytes
//! - an array is a series of blocks, each a `long` item count followed by
//!   the items; a negative count is followed by the block's byte size; a
//!   zero count ends the array

use super::ManifestEntry;
use crate::error::NodeError;

/// Longest varint a 64-bit value can take
const MAX_VARINT_BYTES: usize = 10;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, NodeError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| NodeError::Manifest(format!("Unexpected end of data at byte {}", self.pos)))?;
        self.pos += 1;
        Ok(b)
    }

    fn long(&mut self) -> Result<i64, NodeError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let b = self.byte()?;
            value |= u64::from(b & 0x7f) << (7 * i);
            if b & 0x80 == 0 {
                // zig-zag
                return Ok((value >> 1) as i64 ^ -((value & 1) as i64));
            }
        }
        Err(NodeError::Manifest(format!("Varint too long at byte {}", self.pos)))
    }

    fn string(&mut self) -> Result<String, NodeError> {
        let len = self.long()?;
        let len = usize::try_from(len)
            .map_err(|_| NodeError::Manifest(format!("Negative string length {}", len)))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| NodeError::Manifest(format!("String of {} bytes overruns data", len)))?;
        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|e| NodeError::Manifest(format!("Invalid UTF-8 in string: {}", e)))?
            .to_string();
        self.pos = end;
        Ok(s)
    }

    fn entry(&mut self) -> Result<ManifestEntry, NodeError> {
        let path = self.string()?;
        let hash = self.string()?;
        let size = self.long()?;
        let size = u64::try_from(size)
            .map_err(|_| NodeError::Manifest(format!("Negative size {} for {}", size, path)))?;
        Ok(ManifestEntry { path, hash, size })
    }
}

/// Decode a manifest, preserving entry order
pub fn decode_manifest(data: &[u8]) -> Result<Vec<ManifestEntry>, NodeError> {
    let mut reader = Reader::new(data);
    let mut entries = Vec::new();

    loop {
        let count = reader.long()?;
        if count == 0 {
            break;
        }
        if count < 0 {
            // Block byte size, only useful for skipping
            reader.long()?;
        }
        for _ in 0..count.unsigned_abs() {
            entries.push(reader.entry()?);
        }
    }

    Ok(entries)
}
