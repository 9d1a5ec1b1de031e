//! Package summary (the fixed leading part of every header)

use crate::bytes::{ByteReader, ByteWriter};
use bitflags::bitflags;
use op_core::error::FormatError;
use serde::Serialize;
use std::fmt;

/// Package magic ("OPAK" little-endian)
pub const PACKAGE_MAGIC: u32 = 0x4B41_504F;

/// Version written by this build
pub const FILE_VERSION_CURRENT: u32 = 3;

/// Oldest version this build can load
pub const FILE_VERSION_MIN: u32 = 2;

/// Bytes needed to learn the total header size
pub const SUMMARY_PEEK_SIZE: usize = 12;

bitflags! {
    /// Package-wide flags stored in the summary
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct PackageFlags: u32 {
        /// Bodies live in a separate file
        const SPLIT_BODY         = 0b0000_0001;
        /// The summary GUID is meaningful
        const HAS_GUID           = 0b0000_0010;
        /// Editor-only data was stripped when saving
        const FILTER_EDITOR_ONLY = 0b0000_0100;
        /// Package contains a map
        const CONTAINS_MAP       = 0b0000_1000;
        /// Every export is safe to postload on the loading thread
        const POSTLOAD_THREADSAFE = 0b0001_0000;
    }
}

/// 128-bit package identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackageGuid(pub [u8; 16]);

impl PackageGuid {
    /// Parse from 32 hex characters
    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = hex::decode(text).ok()?;
        let array: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PackageGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageGuid({})", self.to_hex())
    }
}

impl fmt::Display for PackageGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PackageGuid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Custom version entry (key, version)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CustomVersion {
    pub key: u32,
    pub version: u32,
}

/// Table location inside the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TableRange {
    pub count: u32,
    pub offset: u32,
}

/// Package summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSummary {
    pub file_version: u32,
    pub total_header_size: u32,
    pub flags: PackageFlags,
    pub guid: Option<PackageGuid>,
    pub custom_versions: Vec<CustomVersion>,
    pub saved_name: String,
    pub imports: TableRange,
    pub exports: TableRange,
    pub depends: TableRange,
}

impl PackageSummary {
    /// Read the self-reported header size from the first bytes of a file.
    ///
    /// Returns `Ok(None)` when fewer than [`SUMMARY_PEEK_SIZE`] bytes are available.
    pub fn peek_header_size(data: &[u8]) -> Result<Option<u32>, FormatError> {
        if data.len() < SUMMARY_PEEK_SIZE {
            return Ok(None);
        }
        let mut r = ByteReader::new(data);
        let magic = r.read_u32()?;
        if magic != PACKAGE_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let version = r.read_u32()?;
        check_version(version)?;
        let size = r.read_u32()?;
        if (size as usize) < SUMMARY_PEEK_SIZE {
            return Err(FormatError::CorruptSummary(format!(
                "header size {} smaller than summary",
                size
            )));
        }
        Ok(Some(size))
    }

    /// Parse the summary from the start of a header buffer
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        let mut r = ByteReader::new(data);
        let magic = r.read_u32()?;
        if magic != PACKAGE_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let file_version = r.read_u32()?;
        check_version(file_version)?;

        let total_header_size = r.read_u32()?;
        let flags = PackageFlags::from_bits_truncate(r.read_u32()?);
        let guid_bytes: [u8; 16] = r.read_bytes()?;
        let guid = flags
            .contains(PackageFlags::HAS_GUID)
            .then_some(PackageGuid(guid_bytes));

        let version_count = r.read_u32()? as usize;
        if version_count > r.remaining() / 8 {
            return Err(FormatError::CorruptSummary(format!(
                "custom version count {} exceeds header",
                version_count
            )));
        }
        let mut custom_versions = Vec::with_capacity(version_count);
        for _ in 0..version_count {
            custom_versions.push(CustomVersion {
                key: r.read_u32()?,
                version: r.read_u32()?,
            });
        }

        let saved_name = r.read_string()?;
        let imports = read_range(&mut r)?;
        let exports = read_range(&mut r)?;
        let depends = read_range(&mut r)?;

        let summary = Self {
            file_version,
            total_header_size,
            flags,
            guid,
            custom_versions,
            saved_name,
            imports,
            exports,
            depends,
        };
        summary.validate(data.len(), r.position())?;
        Ok(summary)
    }

    fn validate(&self, available: usize, summary_end: usize) -> Result<(), FormatError> {
        let header = self.total_header_size as usize;
        if header > available {
            return Err(FormatError::CorruptSummary(format!(
                "header size {} exceeds {} available bytes",
                header, available
            )));
        }
        for (what, range) in [("import", self.imports), ("export", self.exports)] {
            let offset = range.offset as usize;
            if range.count > 0 && (offset < summary_end || offset > header) {
                return Err(FormatError::CorruptSummary(format!(
                    "{} table offset {} outside header",
                    what, range.offset
                )));
            }
        }
        let depends_end = self.depends.offset as u64 + self.depends.count as u64 * 4;
        if self.depends.count > 0 && depends_end > header as u64 {
            return Err(FormatError::CorruptSummary(format!(
                "dependency array ends at {} past header size {}",
                depends_end, header
            )));
        }
        Ok(())
    }

    /// Serialize the summary. Table ranges must already be final.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u32(PACKAGE_MAGIC);
        w.write_u32(self.file_version);
        w.write_u32(self.total_header_size);
        let mut flags = self.flags;
        flags.set(PackageFlags::HAS_GUID, self.guid.is_some());
        w.write_u32(flags.bits());
        w.write_bytes(&self.guid.unwrap_or_default().0);
        w.write_u32(self.custom_versions.len() as u32);
        for v in &self.custom_versions {
            w.write_u32(v.key);
            w.write_u32(v.version);
        }
        w.write_string(&self.saved_name);
        for range in [self.imports, self.exports, self.depends] {
            w.write_u32(range.count);
            w.write_u32(range.offset);
        }
    }

    pub fn is_split(&self) -> bool {
        self.flags.contains(PackageFlags::SPLIT_BODY)
    }
}

fn check_version(version: u32) -> Result<(), FormatError> {
    if version < FILE_VERSION_MIN {
        return Err(FormatError::VersionTooOld {
            found: version,
            minimum: FILE_VERSION_MIN,
        });
    }
    if version > FILE_VERSION_CURRENT {
        return Err(FormatError::VersionTooNew {
            found: version,
            current: FILE_VERSION_CURRENT,
        });
    }
    Ok(())
}

fn read_range(r: &mut ByteReader<'_>) -> Result<TableRange, FormatError> {
    Ok(TableRange {
        count: r.read_u32()?,
        offset: r.read_u32()?,
    })
}
