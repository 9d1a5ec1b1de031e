//! Little-endian cursor helpers for the header tables

use op_core::error::FormatError;

/// Bounds-checked little-endian reader over a byte slice
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reader positioned at `offset`
    pub fn at(data: &'a [u8], offset: usize) -> Result<Self, FormatError> {
        if offset > data.len() {
            return Err(FormatError::Truncated {
                offset,
                needed: 0,
                available: data.len(),
            });
        }
        Ok(Self { data, pos: offset })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < len {
            return Err(FormatError::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, FormatError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        self.array()
    }

    /// Length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, FormatError> {
        let start = self.pos;
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8(start))
    }
}

/// Little-endian writer used by the package builder
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Overwrite a previously written u32
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mut w = ByteWriter::new();
        w.write_u32(0xAABBCCDD);
        w.write_i32(-5);
        w.write_u64(1 << 40);
        w.write_string("Foo");
        w.write_u8(7);
        let data = w.into_inner();

        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u32().unwrap(), 0xAABBCCDD);
        assert_eq!(r.read_i32().unwrap(), -5);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_string().unwrap(), "Foo");
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_truncated() {
        let data = [1u8, 2, 3];
        let mut r = ByteReader::new(&data);
        let err = r.read_u32().unwrap_err();
        assert_eq!(
            err,
            FormatError::Truncated {
                offset: 0,
                needed: 4,
                available: 3
            }
        );
    }

    #[test]
    fn test_string_length_past_end() {
        let mut w = ByteWriter::new();
        w.write_u32(100);
        w.write_bytes(b"abc");
        let data = w.into_inner();
        assert!(matches!(
            ByteReader::new(&data).read_string(),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut w = ByteWriter::new();
        w.write_u32(2);
        w.write_bytes(&[0xFF, 0xFE]);
        let data = w.into_inner();
        assert_eq!(
            ByteReader::new(&data).read_string(),
            Err(FormatError::InvalidUtf8(0))
        );
    }
}
