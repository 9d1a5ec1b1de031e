//! Full package header: summary plus import, export and dependency tables

use crate::bytes::ByteReader;
use crate::export::{DependencyEdge, DependencyKind, ExportEntry};
use crate::import::ImportEntry;
use crate::index::{ObjectSlot, PackageIndex};
use crate::summary::PackageSummary;
use op_core::error::FormatError;
use serde::Serialize;
use tracing::debug;

/// Parsed package header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageHeader {
    pub summary: PackageSummary,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
    /// Flattened preload dependency array
    pub dependencies: Vec<PackageIndex>,
}

impl PackageHeader {
    /// Parse a complete header buffer (at least `total_header_size` bytes)
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        let summary = PackageSummary::parse(data)?;
        let header = &data[..summary.total_header_size as usize];

        let imports = read_table(header, summary.imports.offset, summary.imports.count, ImportEntry::read)?;
        let exports = read_table(header, summary.exports.offset, summary.exports.count, ExportEntry::read)?;

        let mut dependencies = Vec::with_capacity(summary.depends.count as usize);
        if summary.depends.count > 0 {
            let mut r = ByteReader::at(header, summary.depends.offset as usize)?;
            for _ in 0..summary.depends.count {
                dependencies.push(PackageIndex::from_raw(r.read_i32()?));
            }
        }

        let parsed = Self {
            summary,
            imports,
            exports,
            dependencies,
        };
        parsed.validate()?;

        debug!(
            "Parsed header of {}: {} imports, {} exports, {} dependencies",
            parsed.summary.saved_name,
            parsed.imports.len(),
            parsed.exports.len(),
            parsed.dependencies.len()
        );
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), FormatError> {
        for import in &self.imports {
            self.check_index(import.outer)?;
        }

        let header_size = self.summary.total_header_size as u64;
        for (slot, export) in self.exports.iter().enumerate() {
            for index in [export.class, export.super_ref, export.template, export.outer] {
                self.check_index(index)?;
            }
            if export.outer == PackageIndex::export(slot as u32) {
                return Err(FormatError::CorruptSummary(format!(
                    "export {} is its own outer",
                    export.object_name
                )));
            }
            if export.serial_size > 0 && export.serial_offset < header_size {
                return Err(FormatError::CorruptSummary(format!(
                    "export {} body at {} overlaps the header",
                    export.object_name, export.serial_offset
                )));
            }
            if export.dependency_counts.iter().any(|c| *c < 0) {
                return Err(FormatError::CorruptSummary(format!(
                    "export {} has a negative dependency count",
                    export.object_name
                )));
            }
            let total = export.total_dependencies();
            if total > 0 {
                let first = export.first_dependency;
                if first < 0 || first as usize + total > self.dependencies.len() {
                    return Err(FormatError::CorruptSummary(format!(
                        "export {} dependencies [{}, +{}) outside array of {}",
                        export.object_name,
                        first,
                        total,
                        self.dependencies.len()
                    )));
                }
            }
        }

        for index in &self.dependencies {
            self.check_index(*index)?;
        }
        Ok(())
    }

    fn check_index(&self, index: PackageIndex) -> Result<(), FormatError> {
        let valid = match index.resolve() {
            ObjectSlot::Null => true,
            ObjectSlot::Import(i) => (i as usize) < self.imports.len(),
            ObjectSlot::Export(e) => (e as usize) < self.exports.len(),
        };
        if valid {
            Ok(())
        } else {
            Err(FormatError::InvalidIndex {
                index: index.raw(),
                imports: self.imports.len(),
                exports: self.exports.len(),
            })
        }
    }

    /// Tagged preload edges of one export
    pub fn dependency_edges(&self, slot: u32) -> Vec<DependencyEdge> {
        let export = &self.exports[slot as usize];
        let mut edges = Vec::with_capacity(export.total_dependencies());
        if export.first_dependency < 0 {
            return edges;
        }
        let mut cursor = export.first_dependency as usize;
        for (kind, count) in DependencyKind::ALL.iter().zip(export.dependency_counts) {
            for _ in 0..count.max(0) {
                if let Some(from) = self.dependencies.get(cursor) {
                    if !from.is_null() {
                        edges.push(DependencyEdge {
                            kind: *kind,
                            from: *from,
                            to_slot: slot,
                        });
                    }
                }
                cursor += 1;
            }
        }
        edges
    }

    /// Tagged preload edges of every export
    pub fn all_dependency_edges(&self) -> Vec<DependencyEdge> {
        (0..self.exports.len() as u32)
            .flat_map(|slot| self.dependency_edges(slot))
            .collect()
    }

    /// Largest logical offset touched by any export body
    pub fn body_end(&self) -> u64 {
        self.exports
            .iter()
            .map(|e| e.serial_offset + e.serial_size)
            .max()
            .unwrap_or(self.summary.total_header_size as u64)
            .max(self.summary.total_header_size as u64)
    }
}

fn read_table<T>(
    header: &[u8],
    offset: u32,
    count: u32,
    read: fn(&mut ByteReader<'_>) -> Result<T, FormatError>,
) -> Result<Vec<T>, FormatError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut r = ByteReader::at(header, offset as usize)?;
    // Every entry takes at least a few bytes; reject counts the header can't hold.
    if count as usize > r.remaining() {
        return Err(FormatError::CorruptSummary(format!(
            "table of {} entries at {} exceeds header",
            count, offset
        )));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(read(&mut r)?);
    }
    Ok(entries)
}
