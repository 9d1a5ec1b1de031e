//! Draining a package's ready lists: link, create, read, serialize

use super::imports::unresolved;
use super::LoaderState;
use crate::graph::NodePhase;
use crate::object::{ConstructArgs, Object, ObjectFlags};
use crate::package::{AsyncPackage, ReadBlock, TableResolver};
use crate::reader::ExportReader;
use crate::stats::LoadStats;
use op_core::error::{ArchiveError, LoadError, PakError};
use op_io::{coalesce, ExportRange, ReadId};
use tracing::{debug, error, trace, warn};

impl LoaderState {
    /// Work through everything that fired for `package`
    pub(super) fn process_package(&mut self, package: &mut AsyncPackage) {
        package.process_queued = false;
        loop {
            let mut progressed = self.link_ready_imports(package);
            progressed |= self.create_ready_exports(package);
            progressed |= self.start_export_io(package);
            progressed |= self.serialize_ready_exports(package);
            self.pump_fired(Some(&mut *package));
            if !progressed {
                break;
            }
        }
    }

    fn link_ready_imports(&mut self, package: &mut AsyncPackage) -> bool {
        let created = std::mem::take(&mut package.ready.imports_to_link);
        let serialized = std::mem::take(&mut package.ready.imports_serialized);
        if created.is_empty() && serialized.is_empty() {
            return false;
        }
        for slot in created {
            self.refresh_import(package, slot);
            if let Some(node) = package.import_node(slot, NodePhase::ImportCreate) {
                self.graph.remove_node(node);
            }
        }
        for slot in serialized {
            self.refresh_import(package, slot);
            if let Some(node) = package.import_node(slot, NodePhase::ImportSerialize) {
                self.graph.remove_node(node);
            }
        }
        true
    }

    /// Pick up the object a linked export produced
    fn refresh_import(&mut self, package: &mut AsyncPackage, slot: u32) {
        let record = &package.imports[slot as usize];
        if record.object.is_some() || record.failed || package.aborted {
            return;
        }
        let Some((owner, export)) = record.link else {
            return;
        };
        let object = if owner == package.handle {
            package.exports.get(export as usize).and_then(|e| e.object.clone())
        } else {
            self.table
                .get(owner)
                .and_then(|d| d.exports.get(export as usize))
                .and_then(|e| e.object.clone())
        }
        .or_else(|| self.ctx.store.find(&record.path));

        match object {
            Some(object) => {
                package.imports[slot as usize].object = Some(object);
                LoadStats::bump(&self.ctx.stats.imports_resolved);
            }
            None => {
                let owner = package.imports[slot as usize].package.clone();
                self.fail_import(package, slot, &owner);
            }
        }
    }

    fn create_ready_exports(&mut self, package: &mut AsyncPackage) -> bool {
        let ready = std::mem::take(&mut package.ready.exports_to_create);
        if ready.is_empty() {
            return false;
        }
        for slot in ready {
            let record = &package.exports[slot as usize];
            if !package.aborted && !record.preloaded && record.object.is_none() && !record.failed {
                self.create_export(package, slot);
            }
            if let Some(node) = package.export_node(slot, NodePhase::ExportCreate) {
                self.graph.remove_node(node);
            }
        }
        true
    }

    fn create_export(&mut self, package: &mut AsyncPackage, slot: u32) {
        let Some(header) = package.header.clone() else {
            return;
        };
        let entry = &header.exports[slot as usize];
        let Some(class) = package.object_for_index(entry.class) else {
            let error = unresolved(package, slot, "class", entry.class);
            self.fail_export(package, slot, error);
            return;
        };
        let outer = if entry.outer.is_null() {
            package.package_object.clone()
        } else {
            package.object_for_index(entry.outer)
        };
        let Some(outer) = outer else {
            let error = unresolved(package, slot, "outer", entry.outer);
            self.fail_export(package, slot, error);
            return;
        };
        let template = package.object_for_index(entry.template);

        let args = ConstructArgs {
            class: &class,
            outer: &outer,
            name: &entry.object_name,
            template: template.as_ref(),
        };
        match self.ctx.factory.construct(&args) {
            Ok(data) => {
                let record = &package.exports[slot as usize];
                let object = self.ctx.store.replace(Object::new(
                    &record.path,
                    &record.name,
                    class.path(),
                    &package.name,
                    Some(outer.path()),
                    ObjectFlags::NEED_LOAD,
                    Some(data),
                ));
                trace!("{}: created {}", package.name, object.path());
                package.exports[slot as usize].object = Some(object);
                LoadStats::bump(&self.ctx.stats.exports_created);
            }
            Err(message) => {
                let error = LoadError::ConstructionFailed {
                    object: package.exports[slot as usize].path.clone(),
                    message,
                };
                self.fail_export(package, slot, error.into());
            }
        }
    }

    /// Isolate a failure to one export; the package still surfaces it
    fn fail_export(&mut self, package: &mut AsyncPackage, slot: u32, error: PakError) {
        let record = &mut package.exports[slot as usize];
        record.failed = true;
        if let Some(object) = &record.object {
            object.set_flags(ObjectFlags::LOAD_FAILED);
        }
        package.note_error(error);
    }

    /// Issue coalesced reads for every export whose IO node fired
    fn start_export_io(&mut self, package: &mut AsyncPackage) -> bool {
        if package.throttled {
            return false;
        }
        let ready = std::mem::take(&mut package.ready.exports_for_io);
        if ready.is_empty() {
            return false;
        }
        let Some(header) = package.header.clone() else {
            return false;
        };

        let mut ranges = Vec::new();
        for slot in ready {
            let entry = &header.exports[slot as usize];
            let record = &package.exports[slot as usize];
            if package.aborted || record.preloaded || record.failed || entry.serial_size == 0 {
                self.finish_io(package, slot);
            } else {
                ranges.push(ExportRange {
                    slot,
                    offset: entry.serial_offset,
                    len: entry.serial_size,
                });
            }
        }
        if ranges.is_empty() {
            return true;
        }

        let Some(archive) = package.archive.as_mut() else {
            let error = PakError::Archive(ArchiveError::NotOpen(package.name.clone()));
            self.abort_package(package, error);
            return true;
        };
        if let Err(e) = archive.first_export_starting() {
            self.abort_package(package, e.into());
            return true;
        }

        let mut deferred = Vec::new();
        for read in coalesce(&ranges, &self.ctx.config.precache) {
            if !deferred.is_empty() || !self.ctx.handler.has_budget(read.len) {
                deferred.extend(read.slots.iter().copied());
                continue;
            }
            let Some(archive) = package.archive.as_ref() else {
                break;
            };
            match self.ctx.handler.submit(package.handle, archive, read.clone()) {
                Ok(id) => {
                    LoadStats::bump(&self.ctx.stats.reads_issued);
                    LoadStats::add(&self.ctx.stats.exports_per_read, read.slots.len() as u64);
                    for slot in &read.slots {
                        package.exports[*slot as usize].read = Some(id);
                    }
                    package.reads.insert(
                        id,
                        ReadBlock {
                            offset: read.offset,
                            len: read.len,
                            remaining: read.slots.len(),
                            resident: false,
                        },
                    );
                }
                Err(e) => {
                    self.abort_package(package, e.into());
                    return true;
                }
            }
        }
        if !deferred.is_empty() {
            debug!("{}: {} export reads wait for memory budget", package.name, deferred.len());
            package.ready.exports_for_io.extend(deferred);
            package.throttled = true;
            if !self.throttled.contains(&package.handle) {
                self.throttled.push(package.handle);
            }
        }
        true
    }

    /// The export's bytes are resident (or not needed); let it serialize
    fn finish_io(&mut self, package: &AsyncPackage, slot: u32) {
        if let Some(node) = package.export_node(slot, NodePhase::ExportStartIo) {
            self.graph.remove_node(node);
        }
    }

    /// A coalesced read finished on an I/O thread
    pub(super) fn complete_read(&mut self, id: ReadId) {
        let Some(done) = self.ctx.handler.complete(id) else {
            return;
        };
        let len = done.read.len;
        let Some(package) = self.table.get_mut(done.key) else {
            self.ctx.handler.release_resident(len);
            return;
        };
        match done.result {
            Ok(bytes) => {
                LoadStats::add(&self.ctx.stats.bytes_read, len);
                if let Some(archive) = package.archive.as_mut() {
                    archive.add_block(done.read.offset, bytes);
                }
                if let Some(block) = package.reads.get_mut(&id) {
                    block.resident = true;
                }
                for slot in &done.read.slots {
                    if let Some(node) = package.export_node(*slot, NodePhase::ExportStartIo) {
                        self.graph.remove_node(node);
                    }
                }
            }
            Err(e) => {
                warn!("{}: read of {} bytes failed: {}", package.name, len, e);
                package.reads.remove(&id);
                let handle = done.key;
                if let Some(mut package) = self.table.checkout(handle) {
                    self.abort_package(&mut package, e.into());
                    self.pump_fired(Some(&mut *package));
                    self.table.checkin(handle, package);
                }
            }
        }
    }

    fn serialize_ready_exports(&mut self, package: &mut AsyncPackage) -> bool {
        let ready = std::mem::take(&mut package.ready.exports_to_serialize);
        if ready.is_empty() {
            return false;
        }
        for slot in ready {
            let record = &package.exports[slot as usize];
            if !package.aborted && !record.preloaded && !record.failed && record.object.is_some() {
                self.serialize_export(package, slot);
            }
            self.release_read(package, slot);
            let record = &mut package.exports[slot as usize];
            if !record.serialized {
                record.serialized = true;
                package.exports_serialized += 1;
            }
            if let Some(node) = package.export_node(slot, NodePhase::ExportSerialize) {
                self.graph.remove_node(node);
            }
        }
        true
    }

    fn serialize_export(&mut self, package: &mut AsyncPackage, slot: u32) {
        let Some(header) = package.header.clone() else {
            return;
        };
        let entry = &header.exports[slot as usize];
        let AsyncPackage {
            archive,
            imports,
            exports,
            ..
        } = package;
        let Some(object) = exports[slot as usize].object.clone() else {
            return;
        };
        let Some(archive) = archive.as_mut() else {
            return;
        };
        let resolver = TableResolver {
            imports: imports.as_slice(),
            exports: exports.as_slice(),
        };
        let mut reader = ExportReader::new(archive, &resolver, entry.serial_offset, entry.serial_size);
        let outcome = object.with_data(|data| (data.deserialize(&mut reader), data.is_deprecated()));
        let consumed = reader.consumed();

        let (result, deprecated) = outcome.unwrap_or((Ok(()), false));
        if let Err(e) = result {
            let error = LoadError::ConstructionFailed {
                object: object.path().to_string(),
                message: e.to_string(),
            };
            self.fail_export(package, slot, error.into());
            return;
        }
        if consumed != entry.serial_size {
            if deprecated {
                warn!(
                    "{}: deprecated {} read {} of {} bytes",
                    package.name,
                    object.path(),
                    consumed,
                    entry.serial_size
                );
            } else {
                error!(
                    "{}: {} read {} bytes but {} were serialized",
                    package.name,
                    object.path(),
                    consumed,
                    entry.serial_size
                );
                let error = LoadError::SizeMismatch {
                    object: object.path().to_string(),
                    expected: entry.serial_size,
                    consumed,
                };
                self.fail_export(package, slot, error.into());
                return;
            }
        }

        object.clear_flags(ObjectFlags::NEED_LOAD);
        object.set_flags(ObjectFlags::LOADED | ObjectFlags::NEED_POSTLOAD);
        LoadStats::bump(&self.ctx.stats.exports_serialized);
        trace!("{}: serialized {}", package.name, object.path());
    }

    /// Drop the export's read block once its last export is serialized
    fn release_read(&mut self, package: &mut AsyncPackage, slot: u32) {
        let Some(id) = package.exports[slot as usize].read.take() else {
            return;
        };
        let Some(block) = package.reads.get_mut(&id) else {
            return;
        };
        block.remaining = block.remaining.saturating_sub(1);
        if block.remaining > 0 {
            return;
        }
        let block = *block;
        package.reads.remove(&id);
        if let Some(archive) = package.archive.as_mut() {
            archive.release_block(block.offset);
        }
        if block.resident {
            self.ctx.handler.release_resident(block.len);
        }
    }
}
