//! Import linking and export arc construction

use super::LoaderState;
use crate::graph::{NodeId, NodePhase};
use crate::object::ObjectFlags;
use crate::package::{AsyncPackage, PackageState};
use crate::stats::LoadStats;
use op_core::error::{LoadError, PakError};
use op_format::{ObjectSlot, PackageIndex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl LoaderState {
    /// Every imported package has parsed its header; link the imports
    pub(super) fn setup_imports(&mut self, package: &mut AsyncPackage) {
        if package.state >= PackageState::SetupImports {
            return;
        }
        package.set_state(PackageState::SetupImports);
        if !package.aborted {
            for slot in 0..package.imports.len() as u32 {
                self.resolve_import(package, slot);
            }
        }
        for slot in 0..package.imports.len() as u32 {
            for phase in [NodePhase::ImportCreate, NodePhase::ImportSerialize] {
                if let Some(node) = package.import_node(slot, phase) {
                    self.graph.done_adding_prerequisites(node);
                }
            }
        }
        self.setup_exports(package);
    }

    fn resolve_import(&mut self, package: &mut AsyncPackage, slot: u32) {
        let record = &package.imports[slot as usize];
        let path = record.path.clone();
        let owner = record.package.clone();

        // Whole packages and anything not loaded by this loader come from the store
        let in_flight = self.table.find(&owner).filter(|_| !record.is_package);
        if owner == package.name {
            match package.lookup.get(&path) {
                Some(export) => self.link_import(package, slot, package.handle, export),
                None => self.fail_import(package, slot, &owner),
            }
            return;
        }
        let Some(dependency) = in_flight else {
            match self.ctx.store.find(&path) {
                Some(object) if !object.has_flags(ObjectFlags::LOAD_FAILED) => {
                    trace!("{}: import {} found in memory", package.name, path);
                    package.imports[slot as usize].object = Some(object);
                    LoadStats::bump(&self.ctx.stats.imports_resolved);
                }
                _ => self.fail_import(package, slot, &owner),
            }
            return;
        };

        let matched = self.table.get(dependency).and_then(|d| {
            if d.aborted {
                return None;
            }
            let header = d.header.as_ref()?;
            d.lookup.find_import(header, &package_import_identity(package, slot))
        });
        match matched {
            Some(export) => self.link_import(package, slot, dependency, export),
            None => {
                // Exports already serialized and handed off resolve through the store
                match self.ctx.store.find(&path) {
                    Some(object) if object.is_loaded() => {
                        package.imports[slot as usize].object = Some(object);
                        LoadStats::bump(&self.ctx.stats.imports_resolved);
                    }
                    _ => self.fail_import(package, slot, &owner),
                }
            }
        }
    }

    /// Make import `slot` wait on `export` of `owner`
    fn link_import(
        &mut self,
        package: &mut AsyncPackage,
        slot: u32,
        owner: crate::handle::PackageHandle,
        export: u32,
    ) {
        let (create, serialize, object) = if owner == package.handle {
            (
                package.export_node(export, NodePhase::ExportCreate),
                package.export_node(export, NodePhase::ExportSerialize),
                package.exports[export as usize].object.clone(),
            )
        } else {
            let Some(dependency) = self.table.get(owner) else {
                self.fail_import(package, slot, "");
                return;
            };
            dependency.keep_alive.fetch_add(1, Ordering::AcqRel);
            package.held.push(Arc::clone(&dependency.keep_alive));
            (
                dependency.export_node(export, NodePhase::ExportCreate),
                dependency.export_node(export, NodePhase::ExportSerialize),
                dependency.exports[export as usize].object.clone(),
            )
        };
        if let (Some(from), Some(to)) = (create, package.import_node(slot, NodePhase::ImportCreate)) {
            self.graph.add_arc(from, to);
        }
        if let (Some(from), Some(to)) = (serialize, package.import_node(slot, NodePhase::ImportSerialize)) {
            self.graph.add_arc(from, to);
        }
        let record = &mut package.imports[slot as usize];
        record.link = Some((owner, export));
        record.object = object;
        trace!("{}: import {} linked to export {}", package.name, record.path, export);
    }

    pub(super) fn fail_import(&mut self, package: &mut AsyncPackage, slot: u32, owner: &str) {
        let record = &mut package.imports[slot as usize];
        if record.failed {
            return;
        }
        record.failed = true;
        let path = record.path.clone();
        LoadStats::bump(&self.ctx.stats.imports_failed);
        let error = if !owner.is_empty() && self.ctx.missing.contains(owner) {
            LoadError::MissingPackage(owner.to_string())
        } else {
            LoadError::ImportFailed {
                package: package.name.clone(),
                import: path,
            }
        };
        package.note_error(error.into());
    }

    /// Wire every export's nodes and release their holds
    pub(super) fn setup_exports(&mut self, package: &mut AsyncPackage) {
        package.set_state(PackageState::SetupExports);
        let header = package.header.clone();
        if let (Some(header), false) = (header, package.aborted) {
            for slot in 0..package.exports.len() as u32 {
                if self.try_preload(package, slot) {
                    continue;
                }
                let entry = &header.exports[slot as usize];
                let create = package.export_node(slot, NodePhase::ExportCreate);
                let serialize = package.export_node(slot, NodePhase::ExportSerialize);
                let start_io = package.export_node(slot, NodePhase::ExportStartIo);

                self.arc(create, serialize);
                self.arc(start_io, serialize);
                self.arc(package.node_for_index(entry.outer, false), create);
                for reference in [entry.class, entry.super_ref, entry.template] {
                    if reference != PackageIndex::export(slot) {
                        self.arc(package.node_for_index(reference, true), create);
                    }
                }
                for edge in header.dependency_edges(slot) {
                    if edge.from == PackageIndex::export(slot) {
                        continue;
                    }
                    let to = if edge.kind.gates_serialize() { serialize } else { create };
                    self.arc(package.node_for_index(edge.from, edge.kind.needs_serialized()), to);
                }
                self.arc(serialize, package.exports_serialized_node());
            }
        }

        for slot in 0..package.exports.len() as u32 {
            for phase in [
                NodePhase::ExportStartIo,
                NodePhase::ExportCreate,
                NodePhase::ExportSerialize,
            ] {
                if let Some(node) = package.export_node(slot, phase) {
                    self.graph.done_adding_prerequisites(node);
                }
            }
        }
        if let Some(node) = package.exports_serialized_node() {
            self.graph.done_adding_prerequisites(node);
        }
        package.set_state(PackageState::ProcessNewImportsAndExports);
        if !package.ready.is_empty() {
            if let Some(kind) = package.request_process() {
                self.events.push(package.handle, kind, package.priority, package.serial);
            }
        }
    }

    fn arc(&mut self, from: Option<NodeId>, to: Option<NodeId>) {
        if let (Some(from), Some(to)) = (from, to) {
            self.graph.add_arc(from, to);
        }
    }

    /// Treat an export already live in memory as satisfied
    fn try_preload(&mut self, package: &mut AsyncPackage, slot: u32) -> bool {
        let record = &package.exports[slot as usize];
        let Some(object) = self.ctx.store.find(&record.path) else {
            return false;
        };
        if !object.has_flags(ObjectFlags::FULLY_LOADED) || object.has_flags(ObjectFlags::NEED_LOAD) {
            return false;
        }
        debug!("{}: export {} already in memory", package.name, record.path);
        let record = &mut package.exports[slot as usize];
        record.object = Some(object);
        record.preloaded = true;
        record.serialized = true;
        LoadStats::bump(&self.ctx.stats.exports_preloaded);
        true
    }
}

fn package_import_identity(package: &AsyncPackage, slot: u32) -> crate::resolve::ImportIdentity {
    let record = &package.imports[slot as usize];
    crate::resolve::ImportIdentity {
        path: record.path.clone(),
        package: record.package.clone(),
        class_name: record.class_name.clone(),
        is_package: record.is_package,
    }
}

/// Human-readable form of `index` within `package`, for diagnostics
pub(super) fn describe_index(package: &AsyncPackage, index: PackageIndex) -> String {
    match index.resolve() {
        ObjectSlot::Null => "null".to_string(),
        ObjectSlot::Import(i) => package
            .imports
            .get(i as usize)
            .map_or_else(|| format!("import {}", i), |r| r.path.clone()),
        ObjectSlot::Export(e) => package
            .exports
            .get(e as usize)
            .map_or_else(|| format!("export {}", e), |r| r.path.clone()),
    }
}

/// Error for an export whose construction prerequisites are missing
pub(super) fn unresolved(package: &AsyncPackage, slot: u32, what: &str, index: PackageIndex) -> PakError {
    let path = package.exports[slot as usize].path.clone();
    warn!("{}: {} {} of {} is unresolved", package.name, what, describe_index(package, index), path);
    LoadError::ConstructionFailed {
        object: path,
        message: format!("{} {} not resolved", what, describe_index(package, index)),
    }
    .into()
}
