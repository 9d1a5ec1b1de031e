//! Package writer
//!
//! Builds a complete package (header tables plus export bodies) either as one
//! combined file or as a header file plus a body file sharing one logical
//! offset space.

use crate::bytes::ByteWriter;
use crate::export::{DependencyKind, ExportEntry, ExportFlags};
use crate::import::ImportEntry;
use crate::index::PackageIndex;
use crate::summary::{
    CustomVersion, PackageFlags, PackageGuid, PackageSummary, TableRange, FILE_VERSION_CURRENT,
};
use tracing::warn;

/// On-disk layout of a built package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Header and bodies in one file
    Combined,
    /// Header file plus a separate body file
    Split,
}

/// Output of [`PackageBuilder::build`]
#[derive(Debug, Clone)]
pub struct BuiltPackage {
    pub header: Vec<u8>,
    /// Present for [`Layout::Split`]; combined packages carry bodies in `header`
    pub body: Option<Vec<u8>>,
}

impl BuiltPackage {
    /// Header and bodies concatenated into the logical offset space
    pub fn logical_bytes(&self) -> Vec<u8> {
        let mut out = self.header.clone();
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

#[derive(Debug, Clone)]
struct ExportDef {
    entry: ExportEntry,
    payload: Vec<u8>,
    dependencies: [Vec<PackageIndex>; 4],
}

/// Incremental builder for a package
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    name: String,
    file_version: u32,
    flags: PackageFlags,
    guid: Option<PackageGuid>,
    custom_versions: Vec<CustomVersion>,
    imports: Vec<ImportEntry>,
    exports: Vec<ExportDef>,
}

impl PackageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            file_version: FILE_VERSION_CURRENT,
            flags: PackageFlags::empty(),
            guid: None,
            custom_versions: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.file_version = version;
        self
    }

    pub fn with_guid(mut self, guid: PackageGuid) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn with_flags(mut self, flags: PackageFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_custom_version(mut self, key: u32, version: u32) -> Self {
        self.custom_versions.push(CustomVersion { key, version });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a raw import entry
    pub fn add_import(&mut self, entry: ImportEntry) -> PackageIndex {
        if let Some(pos) = self.imports.iter().position(|i| *i == entry) {
            return PackageIndex::import(pos as u32);
        }
        self.imports.push(entry);
        PackageIndex::import(self.imports.len() as u32 - 1)
    }

    /// Import of a whole package
    pub fn import_package(&mut self, package: &str) -> PackageIndex {
        self.add_import(ImportEntry::package(package))
    }

    /// Import of class `class` from script package `script_package`
    pub fn import_class(&mut self, script_package: &str, class: &str) -> PackageIndex {
        let outer = self.import_package(script_package);
        self.add_import(ImportEntry::class(outer, class))
    }

    /// Import of a top-level object of `package`
    pub fn import_object(
        &mut self,
        package: &str,
        class_package: &str,
        class_name: &str,
        object_name: &str,
    ) -> PackageIndex {
        let outer = self.import_package(package);
        self.add_import(ImportEntry::object(outer, class_package, class_name, object_name))
    }

    /// Import of an object nested under another import
    pub fn import_nested(
        &mut self,
        outer: PackageIndex,
        class_package: &str,
        class_name: &str,
        object_name: &str,
    ) -> PackageIndex {
        self.add_import(ImportEntry::object(outer, class_package, class_name, object_name))
    }

    /// Append an export with its serialized body
    pub fn add_export(
        &mut self,
        name: &str,
        class: PackageIndex,
        outer: PackageIndex,
        payload: Vec<u8>,
    ) -> PackageIndex {
        self.exports.push(ExportDef {
            entry: ExportEntry::new(class, outer, name),
            payload,
            dependencies: Default::default(),
        });
        PackageIndex::export(self.exports.len() as u32 - 1)
    }

    fn export_mut(&mut self, export: PackageIndex) -> Option<&mut ExportDef> {
        let def = export
            .as_export()
            .and_then(|slot| self.exports.get_mut(slot as usize));
        if def.is_none() {
            warn!("PackageBuilder: {} is not an export of {}", export, self.name);
        }
        def
    }

    pub fn set_template(&mut self, export: PackageIndex, template: PackageIndex) {
        if let Some(def) = self.export_mut(export) {
            def.entry.template = template;
        }
    }

    pub fn set_super(&mut self, export: PackageIndex, super_ref: PackageIndex) {
        if let Some(def) = self.export_mut(export) {
            def.entry.super_ref = super_ref;
            def.entry.flags |= ExportFlags::TYPE;
        }
    }

    pub fn set_export_flags(&mut self, export: PackageIndex, flags: ExportFlags) {
        if let Some(def) = self.export_mut(export) {
            def.entry.flags = flags;
        }
    }

    /// Record a preload dependency of `export` on `from`
    pub fn add_dependency(&mut self, export: PackageIndex, kind: DependencyKind, from: PackageIndex) {
        let bucket = DependencyKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(0);
        if let Some(def) = self.export_mut(export) {
            def.dependencies[bucket].push(from);
        }
    }

    /// Serialize the package
    pub fn build(&self, layout: Layout) -> BuiltPackage {
        let mut flags = self.flags;
        flags.set(PackageFlags::SPLIT_BODY, layout == Layout::Split);

        let mut summary = PackageSummary {
            file_version: self.file_version,
            total_header_size: 0,
            flags,
            guid: self.guid,
            custom_versions: self.custom_versions.clone(),
            saved_name: self.name.clone(),
            imports: TableRange::default(),
            exports: TableRange::default(),
            depends: TableRange::default(),
        };

        let mut exports: Vec<ExportEntry> = self.exports.iter().map(|d| d.entry.clone()).collect();
        let mut dependencies = Vec::new();
        for (entry, def) in exports.iter_mut().zip(&self.exports) {
            let total: usize = def.dependencies.iter().map(Vec::len).sum();
            entry.first_dependency = if total > 0 { dependencies.len() as i32 } else { -1 };
            for (count, bucket) in entry.dependency_counts.iter_mut().zip(&def.dependencies) {
                *count = bucket.len() as i32;
                dependencies.extend_from_slice(bucket);
            }
        }

        // All header fields are fixed width, so a first pass fixes every offset.
        let layout_pass = self.write_header(&summary, &exports, &dependencies);
        summary.total_header_size = layout_pass.total as u32;
        summary.imports = layout_pass.imports;
        summary.exports = layout_pass.exports;
        summary.depends = layout_pass.depends;

        let mut cursor = summary.total_header_size as u64;
        for (entry, def) in exports.iter_mut().zip(&self.exports) {
            entry.serial_offset = cursor;
            entry.serial_size = def.payload.len() as u64;
            cursor += entry.serial_size;
        }

        let mut header = self.write_header(&summary, &exports, &dependencies).bytes;
        let mut body = Vec::with_capacity((cursor - summary.total_header_size as u64) as usize);
        for def in &self.exports {
            body.extend_from_slice(&def.payload);
        }

        match layout {
            Layout::Combined => {
                header.extend_from_slice(&body);
                BuiltPackage { header, body: None }
            }
            Layout::Split => BuiltPackage {
                header,
                body: Some(body),
            },
        }
    }

    fn write_header(
        &self,
        summary: &PackageSummary,
        exports: &[ExportEntry],
        dependencies: &[PackageIndex],
    ) -> HeaderPass {
        let mut w = ByteWriter::new();
        summary.write(&mut w);

        let imports = TableRange {
            count: self.imports.len() as u32,
            offset: w.len() as u32,
        };
        for import in &self.imports {
            import.write(&mut w);
        }

        let export_range = TableRange {
            count: exports.len() as u32,
            offset: w.len() as u32,
        };
        for export in exports {
            export.write(&mut w);
        }

        let depends = TableRange {
            count: dependencies.len() as u32,
            offset: w.len() as u32,
        };
        for dep in dependencies {
            w.write_i32(dep.raw());
        }

        HeaderPass {
            total: w.len(),
            imports,
            exports: export_range,
            depends,
            bytes: w.into_inner(),
        }
    }
}

struct HeaderPass {
    total: usize,
    imports: TableRange,
    exports: TableRange,
    depends: TableRange,
    bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PackageHeader;

    #[test]
    fn test_build_empty_package() {
        let built = PackageBuilder::new("/Game/Empty").build(Layout::Combined);
        let header = PackageHeader::parse(&built.header).unwrap();
        assert_eq!(header.summary.saved_name, "/Game/Empty");
        assert!(header.imports.is_empty());
        assert!(header.exports.is_empty());
        assert_eq!(header.summary.total_header_size as usize, built.header.len());
    }

    #[test]
    fn test_imports_deduplicate() {
        let mut b = PackageBuilder::new("/Game/A");
        let c1 = b.import_class("/Script/Core", "Blob");
        let c2 = b.import_class("/Script/Core", "Blob");
        assert_eq!(c1, c2);
        let p = b.import_package("/Script/Core");
        assert_eq!(p, PackageIndex::import(0));
    }

    #[test]
    fn test_split_layout_offsets() {
        let mut b = PackageBuilder::new("/Game/Split");
        let class = b.import_class("/Script/Core", "Blob");
        b.add_export("One", class, PackageIndex::NULL, vec![1; 10]);
        b.add_export("Two", class, PackageIndex::NULL, vec![2; 20]);
        let built = b.build(Layout::Split);
        let header = PackageHeader::parse(&built.header).unwrap();
        assert!(header.summary.is_split());
        let base = header.summary.total_header_size as u64;
        assert_eq!(header.exports[0].serial_offset, base);
        assert_eq!(header.exports[1].serial_offset, base + 10);
        assert_eq!(built.body.as_ref().unwrap().len(), 30);
        assert_eq!(header.body_end(), base + 30);
    }

    #[test]
    fn test_dependency_buckets() {
        let mut b = PackageBuilder::new("/Game/Deps");
        let class = b.import_class("/Script/Core", "Blob");
        let first = b.add_export("First", class, PackageIndex::NULL, vec![0; 4]);
        let second = b.add_export("Second", class, PackageIndex::NULL, vec![0; 4]);
        b.add_dependency(second, DependencyKind::CreateBeforeCreate, first);
        b.add_dependency(second, DependencyKind::SerializeBeforeSerialize, first);
        b.add_dependency(second, DependencyKind::SerializeBeforeSerialize, class);
        let built = b.build(Layout::Combined);
        let header = PackageHeader::parse(&built.header).unwrap();

        assert_eq!(header.exports[1].dependency_counts, [2, 0, 0, 1]);
        let edges = header.dependency_edges(1);
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0].kind, DependencyKind::SerializeBeforeSerialize);
        assert_eq!(edges[2].kind, DependencyKind::CreateBeforeCreate);
        assert!(edges.iter().all(|e| e.to_slot == 1));
        assert!(header.dependency_edges(0).is_empty());
    }
}
