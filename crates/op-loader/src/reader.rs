//! Bounded reader handed to [`ObjectData::deserialize`](crate::object::ObjectData)

use crate::object::ObjectRef;
use op_core::error::{FormatError, PakError};
use op_format::PackageIndex;
use op_io::PrecacheArchive;

/// Maps object references of the package being loaded to live objects
pub trait ObjectResolver {
    fn resolve(&self, index: PackageIndex) -> Option<ObjectRef>;
}

/// Reader limited to one export's serialized range
pub struct ExportReader<'a> {
    archive: &'a mut PrecacheArchive,
    resolver: &'a dyn ObjectResolver,
    start: u64,
    size: u64,
    consumed: u64,
}

impl<'a> ExportReader<'a> {
    /// Position `archive` at `start` and limit reads to `size` bytes
    pub fn new(
        archive: &'a mut PrecacheArchive,
        resolver: &'a dyn ObjectResolver,
        start: u64,
        size: u64,
    ) -> Self {
        archive.seek(start);
        Self {
            archive,
            resolver,
            start,
            size,
            consumed: 0,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.consumed
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), PakError> {
        let len = dst.len() as u64;
        if len > self.remaining() {
            return Err(FormatError::Truncated {
                offset: (self.start + self.consumed) as usize,
                needed: dst.len(),
                available: self.remaining() as usize,
            }
            .into());
        }
        self.archive.serialize(dst)?;
        self.consumed += len;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, PakError> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, PakError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32, PakError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64, PakError> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, PakError> {
        let offset = (self.start + self.consumed) as usize;
        let len = self.read_u32()? as u64;
        if len > self.remaining() {
            return Err(FormatError::Truncated {
                offset,
                needed: len as usize,
                available: self.remaining() as usize,
            }
            .into());
        }
        let mut buf = vec![0u8; len as usize];
        self.read_bytes(&mut buf)?;
        String::from_utf8(buf).map_err(|_| FormatError::InvalidUtf8(offset).into())
    }

    /// Object reference, resolved through the package's tables
    pub fn read_object(&mut self) -> Result<Option<ObjectRef>, PakError> {
        let index = PackageIndex::from_raw(self.read_i32()?);
        Ok(self.resolver.resolve(index))
    }

    /// Everything left in the export
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, PakError> {
        let mut buf = vec![0u8; self.remaining() as usize];
        self.read_bytes(&mut buf)?;
        Ok(buf)
    }
}
