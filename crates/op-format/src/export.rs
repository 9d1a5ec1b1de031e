//! Export table entries and preload dependencies

use crate::bytes::{ByteReader, ByteWriter};
use crate::index::PackageIndex;
use bitflags::bitflags;
use op_core::error::FormatError;
use serde::Serialize;

bitflags! {
    /// Per-export flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct ExportFlags: u32 {
        /// Visible to other packages
        const PUBLIC     = 0b0000_0001;
        /// Kept alive independent of references
        const STANDALONE = 0b0000_0010;
        /// Primary asset of the package
        const ASSET      = 0b0000_0100;
        /// Export is a type (has a super reference)
        const TYPE       = 0b0000_1000;
        /// Export belongs to a deprecated class
        const DEPRECATED = 0b0001_0000;
        /// Not needed when loading for a client
        const NOT_FOR_CLIENT = 0b0010_0000;
    }
}

/// The four preload dependency buckets, in on-disk order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DependencyKind {
    SerializeBeforeSerialize,
    CreateBeforeSerialize,
    SerializeBeforeCreate,
    CreateBeforeCreate,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 4] = [
        DependencyKind::SerializeBeforeSerialize,
        DependencyKind::CreateBeforeSerialize,
        DependencyKind::SerializeBeforeCreate,
        DependencyKind::CreateBeforeCreate,
    ];

    /// The prerequisite must be serialized (otherwise just created)
    pub fn needs_serialized(&self) -> bool {
        matches!(
            self,
            Self::SerializeBeforeSerialize | Self::SerializeBeforeCreate
        )
    }

    /// The dependent phase gated is serialization (otherwise creation)
    pub fn gates_serialize(&self) -> bool {
        matches!(
            self,
            Self::SerializeBeforeSerialize | Self::CreateBeforeSerialize
        )
    }
}

/// One tagged preload edge: `from` must reach a phase before export `to_slot` may
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub kind: DependencyKind,
    pub from: PackageIndex,
    pub to_slot: u32,
}

/// An object defined within this package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportEntry {
    pub class: PackageIndex,
    pub super_ref: PackageIndex,
    pub template: PackageIndex,
    pub outer: PackageIndex,
    pub object_name: String,
    pub flags: ExportFlags,
    pub serial_offset: u64,
    pub serial_size: u64,
    pub first_dependency: i32,
    /// Counts per bucket, indexed in [`DependencyKind::ALL`] order
    pub dependency_counts: [i32; 4],
}

impl ExportEntry {
    pub fn new(class: PackageIndex, outer: PackageIndex, name: &str) -> Self {
        Self {
            class,
            super_ref: PackageIndex::NULL,
            template: PackageIndex::NULL,
            outer,
            object_name: name.to_string(),
            flags: ExportFlags::PUBLIC,
            serial_offset: 0,
            serial_size: 0,
            first_dependency: -1,
            dependency_counts: [0; 4],
        }
    }

    pub fn total_dependencies(&self) -> usize {
        self.dependency_counts.iter().map(|c| (*c).max(0) as usize).sum()
    }

    pub(crate) fn read(r: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let class = PackageIndex::from_raw(r.read_i32()?);
        let super_ref = PackageIndex::from_raw(r.read_i32()?);
        let template = PackageIndex::from_raw(r.read_i32()?);
        let outer = PackageIndex::from_raw(r.read_i32()?);
        let object_name = r.read_string()?;
        let flags = ExportFlags::from_bits_truncate(r.read_u32()?);
        let serial_offset = r.read_u64()?;
        let serial_size = r.read_u64()?;
        let first_dependency = r.read_i32()?;
        let mut dependency_counts = [0i32; 4];
        for count in dependency_counts.iter_mut() {
            *count = r.read_i32()?;
        }
        Ok(Self {
            class,
            super_ref,
            template,
            outer,
            object_name,
            flags,
            serial_offset,
            serial_size,
            first_dependency,
            dependency_counts,
        })
    }

    pub(crate) fn write(&self, w: &mut ByteWriter) {
        w.write_i32(self.class.raw());
        w.write_i32(self.super_ref.raw());
        w.write_i32(self.template.raw());
        w.write_i32(self.outer.raw());
        w.write_string(&self.object_name);
        w.write_u32(self.flags.bits());
        w.write_u64(self.serial_offset);
        w.write_u64(self.serial_size);
        w.write_i32(self.first_dependency);
        for count in self.dependency_counts {
            w.write_i32(count);
        }
    }
}
