//! Per-package load state
//!
//! An [`AsyncPackage`] owns its archive, its import/export records and two
//! node ranges of the shared graph:
//!
//! ```text
//! package range:  [Summary, SetupImports, ExportsSerialized]
//! object range:   [ImportCreate, ImportSerialize] * imports
//!                 [ExportStartIo, ExportCreate, ExportSerialize] * exports
//! ```
//!
//! The object range is reserved when the summary is parsed, so importers can
//! arc into this package's export nodes before it reaches SetupExports.

use crate::event_queue::EventKind;
use crate::graph::{FiredNode, NodeId, NodePhase, NodeRange};
use crate::handle::PackageHandle;
use crate::object::ObjectRef;
use crate::reader::ObjectResolver;
use crate::request::{LoadFlags, PendingCallback};
use crate::resolve::ExportLookup;
use op_core::error::PakError;
use op_format::{ObjectSlot, PackageGuid, PackageHeader, PackageIndex};
use op_io::{PrecacheArchive, ReadId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

const SUMMARY_NODE: u32 = 0;
const SETUP_IMPORTS_NODE: u32 = 1;
const EXPORTS_SERIALIZED_NODE: u32 = 2;

/// Nodes reserved per import
pub(crate) const NODES_PER_IMPORT: u32 = 2;
/// Nodes reserved per export
pub(crate) const NODES_PER_EXPORT: u32 = 3;

/// Load state of one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackageState {
    NewPackage,
    WaitingForSummary,
    StartImportPackages,
    WaitingForImportPackages,
    SetupImports,
    SetupExports,
    ProcessNewImportsAndExports,
    WaitingForPostLoad,
    ReadyForPostLoad,
    PostLoadEtc,
    PackageComplete,
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One import of the package
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub path: String,
    pub package: String,
    pub class_name: String,
    pub is_package: bool,
    /// Linked object once resolved
    pub object: Option<ObjectRef>,
    /// Export of an in-flight package this import waits on
    pub link: Option<(PackageHandle, u32)>,
    pub failed: bool,
}

/// One export of the package
#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub path: String,
    pub name: String,
    pub object: Option<ObjectRef>,
    /// Identity resolved to a live object before loading
    pub preloaded: bool,
    pub failed: bool,
    pub serialized: bool,
    /// Read carrying this export's bytes
    pub read: Option<ReadId>,
}

/// A merged read and how many of its exports still need it
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadBlock {
    pub offset: u64,
    pub len: u64,
    pub remaining: usize,
    pub resident: bool,
}

/// Slots whose nodes fired and await processing
#[derive(Debug, Default)]
pub struct ReadyLists {
    pub imports_to_link: Vec<u32>,
    pub imports_serialized: Vec<u32>,
    pub exports_to_create: Vec<u32>,
    pub exports_for_io: Vec<u32>,
    pub exports_to_serialize: Vec<u32>,
}

impl ReadyLists {
    pub fn is_empty(&self) -> bool {
        self.imports_to_link.is_empty()
            && self.imports_serialized.is_empty()
            && self.exports_to_create.is_empty()
            && self.exports_for_io.is_empty()
            && self.exports_to_serialize.is_empty()
    }
}

/// A package being loaded
pub struct AsyncPackage {
    pub(crate) handle: PackageHandle,
    pub(crate) name: String,
    /// Name whose files are read
    pub(crate) source: String,
    pub(crate) guid: Option<PackageGuid>,
    pub(crate) priority: i32,
    /// Creation order, the queue's breadth-first tie breaker
    pub(crate) serial: u64,
    pub(crate) flags: LoadFlags,
    pub(crate) state: PackageState,
    pub(crate) archive: Option<PrecacheArchive>,
    pub(crate) header: Option<Arc<PackageHeader>>,
    pub(crate) package_object: Option<ObjectRef>,
    pub(crate) imports: Vec<ImportRecord>,
    pub(crate) exports: Vec<ExportRecord>,
    pub(crate) lookup: ExportLookup,
    pub(crate) package_nodes: NodeRange,
    pub(crate) object_nodes: Option<NodeRange>,
    /// In-flight packages this one imports from
    pub(crate) imported_packages: Vec<PackageHandle>,
    /// Packages that must be serialized before this one may postload
    pub(crate) postload_wait: HashSet<PackageHandle>,
    pub(crate) ready: ReadyLists,
    pub(crate) process_queued: bool,
    pub(crate) reads: HashMap<ReadId, ReadBlock>,
    /// Export IO deferred by the memory budget
    pub(crate) throttled: bool,
    /// Hard failure: remaining work is skipped
    pub(crate) aborted: bool,
    /// First error seen; the package surfaces Failed at finalize
    pub(crate) error: Option<Arc<PakError>>,
    pub(crate) callbacks: Vec<PendingCallback>,
    pub(crate) keep_alive: Arc<AtomicI32>,
    /// Keep-alive counts taken on packages this one links against
    pub(crate) held: Vec<Arc<AtomicI32>>,
    pub(crate) exports_serialized: usize,
}

impl AsyncPackage {
    pub(crate) fn new(
        handle: PackageHandle,
        name: &str,
        source: &str,
        guid: Option<PackageGuid>,
        priority: i32,
        serial: u64,
        flags: LoadFlags,
    ) -> Self {
        Self {
            handle,
            name: name.to_string(),
            source: source.to_string(),
            guid,
            priority,
            serial,
            flags,
            state: PackageState::NewPackage,
            archive: None,
            header: None,
            package_object: None,
            imports: Vec::new(),
            exports: Vec::new(),
            lookup: ExportLookup::default(),
            package_nodes: NodeRange::default(),
            object_nodes: None,
            imported_packages: Vec::new(),
            postload_wait: HashSet::new(),
            ready: ReadyLists::default(),
            process_queued: false,
            reads: HashMap::new(),
            throttled: false,
            aborted: false,
            error: None,
            callbacks: Vec::new(),
            keep_alive: Arc::new(AtomicI32::new(0)),
            held: Vec::new(),
            exports_serialized: 0,
        }
    }

    pub fn handle(&self) -> PackageHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PackageState {
        self.state
    }

    pub fn error(&self) -> Option<&Arc<PakError>> {
        self.error.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Number of other packages still holding this one
    pub fn keep_alive_count(&self) -> i32 {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&mut self, state: PackageState) {
        if self.state != state {
            trace!("{}: {} -> {}", self.name, self.state, state);
            self.state = state;
        }
    }

    /// Record `error` as the package's result unless one is already set
    pub(crate) fn note_error(&mut self, error: PakError) {
        if self.error.is_none() {
            warn!("{} failed: {}", self.name, error);
            self.error = Some(Arc::new(error));
        }
    }

    pub(crate) fn summary_node(&self) -> Option<NodeId> {
        self.package_nodes.node(SUMMARY_NODE)
    }

    pub(crate) fn setup_imports_node(&self) -> Option<NodeId> {
        self.package_nodes.node(SETUP_IMPORTS_NODE)
    }

    pub(crate) fn exports_serialized_node(&self) -> Option<NodeId> {
        self.package_nodes.node(EXPORTS_SERIALIZED_NODE)
    }

    pub(crate) fn import_node(&self, slot: u32, phase: NodePhase) -> Option<NodeId> {
        let offset = match phase {
            NodePhase::ImportCreate => 0,
            NodePhase::ImportSerialize => 1,
            _ => return None,
        };
        if slot as usize >= self.imports.len() {
            return None;
        }
        self.object_nodes?.node(slot * NODES_PER_IMPORT + offset)
    }

    pub(crate) fn export_node(&self, slot: u32, phase: NodePhase) -> Option<NodeId> {
        let offset = match phase {
            NodePhase::ExportStartIo => 0,
            NodePhase::ExportCreate => 1,
            NodePhase::ExportSerialize => 2,
            _ => return None,
        };
        if slot as usize >= self.exports.len() {
            return None;
        }
        let base = self.imports.len() as u32 * NODES_PER_IMPORT;
        self.object_nodes?.node(base + slot * NODES_PER_EXPORT + offset)
    }

    /// Node gating the creation (or serialization) of whatever `index` names
    pub(crate) fn node_for_index(&self, index: PackageIndex, serialized: bool) -> Option<NodeId> {
        match index.resolve() {
            ObjectSlot::Null => None,
            ObjectSlot::Import(i) => self.import_node(
                i,
                if serialized {
                    NodePhase::ImportSerialize
                } else {
                    NodePhase::ImportCreate
                },
            ),
            ObjectSlot::Export(e) => self.export_node(
                e,
                if serialized {
                    NodePhase::ExportSerialize
                } else {
                    NodePhase::ExportCreate
                },
            ),
        }
    }

    /// Object referenced by `index`, if linked or created
    pub(crate) fn object_for_index(&self, index: PackageIndex) -> Option<ObjectRef> {
        match index.resolve() {
            ObjectSlot::Null => None,
            ObjectSlot::Import(i) => self.imports.get(i as usize)?.object.clone(),
            ObjectSlot::Export(e) => self.exports.get(e as usize)?.object.clone(),
        }
    }

    /// Absorb a fired node of this package.
    ///
    /// Object nodes land on a ready list; the returned event, if any, must be
    /// queued by the caller.
    pub(crate) fn on_node_fired(&mut self, node: &FiredNode<PackageHandle>) -> Option<EventKind> {
        let slot = node.slot.unwrap_or(0);
        match node.phase {
            NodePhase::PackageSummary => None,
            NodePhase::PackageSetupImports => Some(EventKind::SetupImports),
            NodePhase::PackageExportsSerialized => Some(EventKind::ExportsSerialized),
            NodePhase::ImportCreate => {
                self.ready.imports_to_link.push(slot);
                self.request_process()
            }
            NodePhase::ImportSerialize => {
                self.ready.imports_serialized.push(slot);
                self.request_process()
            }
            NodePhase::ExportCreate => {
                self.ready.exports_to_create.push(slot);
                self.request_process()
            }
            NodePhase::ExportStartIo => {
                self.ready.exports_for_io.push(slot);
                self.request_process()
            }
            NodePhase::ExportSerialize => {
                self.ready.exports_to_serialize.push(slot);
                self.request_process()
            }
        }
    }

    /// Ask for one coalesced process event
    pub(crate) fn request_process(&mut self) -> Option<EventKind> {
        if self.process_queued || self.state < PackageState::SetupImports {
            return None;
        }
        self.process_queued = true;
        Some(EventKind::ProcessPackage)
    }

    /// Drop the keep-alive counts taken on linked packages
    pub(crate) fn release_held(&mut self) {
        for counter in self.held.drain(..) {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Every created export object
    pub(crate) fn export_objects(&self) -> impl Iterator<Item = &ObjectRef> {
        self.exports.iter().filter_map(|e| e.object.as_ref())
    }
}

impl fmt::Debug for AsyncPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPackage")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .field("error", &self.error)
            .finish()
    }
}

impl Drop for AsyncPackage {
    fn drop(&mut self) {
        self.release_held();
    }
}

/// Resolves references of an export being serialized through its package's tables
pub(crate) struct TableResolver<'a> {
    pub imports: &'a [ImportRecord],
    pub exports: &'a [ExportRecord],
}

impl ObjectResolver for TableResolver<'_> {
    fn resolve(&self, index: PackageIndex) -> Option<ObjectRef> {
        match index.resolve() {
            ObjectSlot::Null => None,
            ObjectSlot::Import(i) => self.imports.get(i as usize)?.object.clone(),
            ObjectSlot::Export(e) => self.exports.get(e as usize)?.object.clone(),
        }
    }
}
