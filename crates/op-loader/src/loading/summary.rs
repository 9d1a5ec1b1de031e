//! Opening the archive, parsing the header and discovering imported packages

use super::LoaderState;
use crate::graph::{NodePhase, NodeSpec};
use crate::handle::PackageHandle;
use crate::object::{child_path, Object, ObjectFlags};
use crate::package::{AsyncPackage, ExportRecord, ImportRecord, PackageState};
use crate::request::LoadFlags;
use crate::resolve::{export_paths, import_identities, ExportLookup};
use op_core::error::{FormatError, LoadError};
use op_format::{PackageHeader, CORE_SCRIPT_PACKAGE, PACKAGE_CLASS};
use op_io::PrecacheArchive;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

impl LoaderState {
    /// Open the package's archive and issue the summary read
    pub(super) fn start_read(&mut self, package: &mut AsyncPackage) {
        if package.state != PackageState::NewPackage {
            return;
        }
        package.set_state(PackageState::WaitingForSummary);

        let Some(paths) = self.ctx.paths.resolve(&package.source) else {
            let error = LoadError::MissingPackage(package.source.clone());
            self.abort_package(package, error.into());
            return;
        };
        let notify = self.ctx.handler.archive_notifier(package.handle);
        let opened = PrecacheArchive::open(
            &package.name,
            Arc::clone(&self.ctx.fs),
            &paths,
            self.ctx.config.precache.min_read_size,
            notify,
        );
        match opened {
            Ok(archive) => {
                package.archive = Some(archive);
                self.process_summary(package);
            }
            Err(e) => {
                debug!("Cannot open {}: {}", package.source, e);
                if !package.flags.contains(LoadFlags::NO_MISSING_CACHE) {
                    self.ctx.missing.insert(&package.source);
                }
                let error = LoadError::MissingPackage(package.source.clone());
                self.abort_package(package, error.into());
            }
        }
    }

    /// Parse the header once it is resident
    pub(super) fn process_summary(&mut self, package: &mut AsyncPackage) {
        if package.state != PackageState::WaitingForSummary || package.aborted {
            return;
        }
        let Some(archive) = package.archive.as_mut() else {
            return;
        };
        match archive.poll() {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                self.abort_package(package, e);
                return;
            }
        }

        let Some(block) = archive.header_block() else {
            let error = FormatError::CorruptSummary(format!("{} has no header block", package.name));
            self.abort_package(package, error.into());
            return;
        };
        archive.start_reading_header();
        let parsed = PackageHeader::parse(&block);
        let split = archive.is_split();
        archive.end_reading_header();

        let header = match parsed {
            Ok(header) => header,
            Err(e) => {
                self.abort_package(package, e.into());
                return;
            }
        };
        if header.summary.is_split() != split {
            let error = FormatError::CorruptSummary(format!(
                "{} header says split={} but the files say split={}",
                package.name,
                header.summary.is_split(),
                split
            ));
            self.abort_package(package, error.into());
            return;
        }
        if let Some(requested) = package.guid {
            if header.summary.guid != Some(requested) {
                let error = LoadError::GuidMismatch {
                    package: package.name.clone(),
                    requested: requested.to_hex(),
                    found: header
                        .summary
                        .guid
                        .map_or_else(|| "none".to_string(), |g| g.to_hex()),
                };
                self.abort_package(package, error.into());
                return;
            }
        }
        if header.summary.saved_name != package.source {
            debug!(
                "{} was saved as {}",
                package.source, header.summary.saved_name
            );
        }

        self.setup_tables(package, header);
        if let Some(summary) = package.summary_node() {
            self.graph.release_implicit(summary);
        }
        package.set_state(PackageState::StartImportPackages);
        self.start_import_packages(package);
    }

    /// Build the records and reserve the import/export nodes
    fn setup_tables(&mut self, package: &mut AsyncPackage, header: PackageHeader) {
        let identities = import_identities(&header);
        let paths = export_paths(&package.name, &header, &identities);

        package.imports = identities
            .into_iter()
            .map(|identity| ImportRecord {
                path: identity.path,
                package: identity.package,
                class_name: identity.class_name,
                is_package: identity.is_package,
                object: None,
                link: None,
                failed: false,
            })
            .collect();
        package.exports = header
            .exports
            .iter()
            .zip(&paths)
            .map(|(entry, path)| ExportRecord {
                path: path.clone(),
                name: entry.object_name.clone(),
                object: None,
                preloaded: false,
                failed: false,
                serialized: false,
                read: None,
            })
            .collect();
        package.lookup = ExportLookup::new(&paths);

        let spec = |phase, slot| NodeSpec {
            owner: package.handle,
            slot: Some(slot),
            phase,
            hold: true,
            implicit: 0,
        };
        let mut specs = Vec::with_capacity(package.imports.len() * 2 + package.exports.len() * 3);
        for slot in 0..package.imports.len() as u32 {
            specs.push(spec(NodePhase::ImportCreate, slot));
            specs.push(spec(NodePhase::ImportSerialize, slot));
        }
        for slot in 0..package.exports.len() as u32 {
            specs.push(spec(NodePhase::ExportStartIo, slot));
            specs.push(spec(NodePhase::ExportCreate, slot));
            specs.push(spec(NodePhase::ExportSerialize, slot));
        }
        package.object_nodes = Some(self.graph.add_nodes(&specs));

        let package_class = child_path(CORE_SCRIPT_PACKAGE, PACKAGE_CLASS);
        package.package_object = Some(self.ctx.store.insert(Object::new(
            &package.name,
            &package.name,
            &package_class,
            &package.name,
            None,
            ObjectFlags::NEED_LOAD,
            None,
        )));

        debug!(
            "{}: {} imports, {} exports",
            package.name,
            package.imports.len(),
            package.exports.len()
        );
        package.header = Some(Arc::new(header));
    }

    /// Discover every package the imports reference
    fn start_import_packages(&mut self, package: &mut AsyncPackage) {
        let mut seen = HashSet::new();
        let names: Vec<String> = package
            .imports
            .iter()
            .filter(|i| !i.package.is_empty() && !i.package.starts_with(op_format::SCRIPT_PREFIX))
            .filter(|i| i.package != package.name)
            .filter(|i| seen.insert(i.package.clone()))
            .map(|i| i.package.clone())
            .collect();

        let setup = package.setup_imports_node();
        for name in names {
            let Some(dependency) = self.find_or_create_dependency(&name, package.priority) else {
                continue;
            };
            if let (Some(summary), Some(setup)) = (
                self.table.get(dependency).and_then(|d| d.summary_node()),
                setup,
            ) {
                self.graph.add_arc(summary, setup);
            }
            package.imported_packages.push(dependency);
        }

        package.set_state(PackageState::WaitingForImportPackages);
        if let Some(setup) = setup {
            self.graph.done_adding_prerequisites(setup);
        }
    }

    /// In-flight package named `name`, created if it exists on disk
    fn find_or_create_dependency(&mut self, name: &str, priority: i32) -> Option<PackageHandle> {
        if let Some(handle) = self.table.find(name) {
            self.raise_priority(handle, priority);
            return Some(handle);
        }
        if self.ctx.store.find(name).is_some() {
            return None;
        }
        if self.ctx.missing.contains(name) {
            return None;
        }
        let exists = self
            .ctx
            .paths
            .resolve(name)
            .map_or(false, |paths| self.ctx.fs.exists(&paths.header));
        if !exists {
            warn!("Imported package {} does not exist", name);
            self.ctx.missing.insert(name);
            return None;
        }
        Some(self.create_package(name, name, None, priority, LoadFlags::empty()))
    }
}
