//! Byte-level reader/writer used by every on-disk structure.
//!
//! All multi-byte integers are big-endian. Variable-length data travels in
//! "slots": a 4-byte length prefix followed by the payload. An absent slot
//! encodes as length 0.

use crate::{error::KvError, types::KvResult};

pub struct SmallReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SmallReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_exact(&mut self, count: usize) -> KvResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(KvError::corruption(format!(
                "short read, want {} bytes at offset {}, {} left",
                count,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> KvResult<u8> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_u32(&mut self) -> KvResult<u32> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> KvResult<u64> {
        let bytes = self.read_exact(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    /// Read one length-prefixed slot and return its payload.
    pub fn read_slot(&mut self) -> KvResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_exact(len)
    }
}

pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write one length-prefixed slot.
    pub fn write_slot(&mut self, payload: &[u8]) {
        self.write_u32(payload.len() as u32);
        self.write_bytes(payload);
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Byte encoding of a key or value. The round trip through
/// `encode`/`decode` must be exact.
pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;

    fn encoded_size(&self) -> usize {
        self.encode().len()
    }
}

pub trait Decodeable: Sized {
    fn decode(bytes: &[u8]) -> KvResult<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_round_trip() {
        let mut writer = SmallWriter::new();
        writer.write_u8(7);
        writer.write_slot(b"hello");
        writer.write_slot(b"");
        writer.write_u64(42);

        let bytes = writer.to_bytes();
        let mut reader = SmallReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_slot().unwrap(), b"hello");
        assert_eq!(reader.read_slot().unwrap(), b"");
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_short_read_is_corruption() {
        let bytes = [0u8, 0, 0, 9, 1, 2];
        let mut reader = SmallReader::new(&bytes);
        match reader.read_slot() {
            Err(KvError::Corruption(_)) => {}
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }
}
