//! The loading thread
//!
//! [`LoaderState`] owns the package table, the dependency graph and the event
//! queue. One tick:
//!
//! 1. drains a pending cancel;
//! 2. drains the I/O inbox into ready lists;
//! 3. turns queued requests into packages, deduplicating by name;
//! 4. runs one event, repeating from 2 until the budget runs out or nothing
//!    is runnable;
//! 5. when idle with no I/O outstanding but packages still in the table,
//!    diagnoses the stall and fails the stuck packages.
//!
//! Packages leave the table once serialized and are handed to the owning
//! thread through the finalize queue.

mod cancel;
mod exports;
mod imports;
mod postload;
mod summary;

use crate::event_queue::{Event, EventKind, EventQueue};
use crate::graph::{DependencyGraph, FiredNode, NodePhase, NodeSpec};
use crate::handle::{PackageHandle, PackageTable, RequestId};
use crate::missing::MissingPackageCache;
use crate::object::{ObjectFactory, ObjectFlags, ObjectRef, ObjectStore};
use crate::package::AsyncPackage;
use crate::request::{LoadFlags, LoadRequest, LoadResult, PendingCallback};
use crate::signal::{CancelSignal, SuspendSignal};
use crate::stats::LoadStats;
use op_core::config::Config;
use op_core::error::{LoadError, PakError};
use op_core::instrumentation::{CrashContext, MemoryScopeTracker, TrackedScope};
use op_format::PackageGuid;
use op_io::{ContentPaths, FileSystem, IoNotice, PrecacheHandler, Wakeup};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Work handed from the loading thread to the owning thread
pub(crate) enum FinalizeItem {
    /// A package that finished serializing (or failed)
    Package(Box<AsyncPackage>),
    /// Callbacks resolved without loading anything
    Immediate {
        name: String,
        object: Option<ObjectRef>,
        result: LoadResult,
        callbacks: Vec<PendingCallback>,
    },
}

impl FinalizeItem {
    pub(crate) fn name(&self) -> &str {
        match self {
            FinalizeItem::Package(package) => &package.name,
            FinalizeItem::Immediate { name, .. } => name,
        }
    }

    fn attach(&mut self, callback: PendingCallback) {
        match self {
            FinalizeItem::Package(package) => package.callbacks.push(callback),
            FinalizeItem::Immediate { callbacks, .. } => callbacks.push(callback),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// Nothing runnable is left; waiting on I/O or new requests
    Complete,
    /// The time budget ran out with work remaining
    TimedOut,
}

/// Services and queues shared between the owning and loading threads
pub(crate) struct LoaderContext {
    pub config: Config,
    pub paths: ContentPaths,
    pub fs: Arc<dyn FileSystem>,
    pub store: Arc<ObjectStore>,
    pub factory: Arc<dyn ObjectFactory>,
    pub tracker: Arc<dyn MemoryScopeTracker>,
    pub crash: Arc<dyn CrashContext>,
    pub missing: Arc<MissingPackageCache>,
    pub stats: Arc<LoadStats>,
    pub handler: Arc<PrecacheHandler<PackageHandle>>,
    pub requests: Mutex<VecDeque<LoadRequest>>,
    pub finalize: Mutex<VecDeque<FinalizeItem>>,
    /// Requests whose callbacks have not fired yet
    pub pending: Mutex<HashSet<RequestId>>,
    /// Signaled whenever the finalize queue grows
    pub completed: Wakeup,
    pub cancel: CancelSignal,
    pub suspend: SuspendSignal,
    pub shutdown: AtomicBool,
    /// Last stall diagnosis, reported by `flush`
    pub stall: Mutex<Option<LoadError>>,
}

impl LoaderContext {
    pub(crate) fn wake_loader(&self) {
        self.handler.wakeup().signal();
    }

    pub(crate) fn push_finalize(&self, item: FinalizeItem) {
        self.finalize.lock().push_back(item);
        self.completed.signal();
    }
}

/// Everything the loading thread mutates
pub(crate) struct LoaderState {
    pub ctx: Arc<LoaderContext>,
    pub graph: DependencyGraph<PackageHandle>,
    pub events: EventQueue,
    pub table: PackageTable<AsyncPackage>,
    /// Packages whose export IO waits for the memory budget
    pub throttled: Vec<PackageHandle>,
    /// Serialized packages waiting for their dependencies to serialize
    pub waiting_postload: Vec<PackageHandle>,
    next_serial: u64,
}

impl LoaderState {
    pub(crate) fn new(ctx: Arc<LoaderContext>) -> Self {
        Self {
            ctx,
            graph: DependencyGraph::new(),
            events: EventQueue::new(),
            table: PackageTable::new(),
            throttled: Vec::new(),
            waiting_postload: Vec::new(),
            next_serial: 0,
        }
    }

    /// Number of packages between creation and hand-off
    pub(crate) fn package_count(&self) -> usize {
        self.table.len()
    }

    /// Run until `budget` elapses or nothing is runnable
    pub(crate) fn tick(&mut self, budget: Duration) -> TickResult {
        let start = Instant::now();
        self.drain_cancel();

        loop {
            let mut progressed = self.drain_inbox();
            progressed |= self.admit_requests();
            if let Some(event) = self.events.pop() {
                self.run_event(event);
                LoadStats::bump(&self.ctx.stats.events_processed);
                progressed = true;
            }
            if !progressed {
                break;
            }
            if start.elapsed() >= budget {
                return TickResult::TimedOut;
            }
        }

        if self.is_stalled() {
            self.handle_stall();
        }
        TickResult::Complete
    }

    /// Handle a pending cancel request, if any
    pub(crate) fn drain_cancel(&mut self) -> bool {
        let Some(epoch) = self.ctx.cancel.pending() else {
            return false;
        };
        self.cancel_all();
        self.ctx.cancel.acknowledge(epoch);
        true
    }

    /// Drain I/O completions
    fn drain_inbox(&mut self) -> bool {
        let notices = self.ctx.handler.drain();
        if notices.is_empty() {
            return false;
        }
        for notice in notices {
            match notice {
                IoNotice::Archive(handle) => {
                    if let Some(package) = self.table.get(handle) {
                        if package.state == crate::package::PackageState::WaitingForSummary {
                            self.events.push(
                                handle,
                                EventKind::ProcessSummary,
                                package.priority,
                                package.serial,
                            );
                        }
                    }
                }
                IoNotice::Block(id) => self.complete_read(id),
            }
        }
        self.requeue_throttled();
        self.pump_fired(None);
        true
    }

    /// Turn queued requests into packages
    fn admit_requests(&mut self) -> bool {
        let requests: Vec<LoadRequest> = self.ctx.requests.lock().drain(..).collect();
        if requests.is_empty() {
            return false;
        }
        for request in requests {
            self.admit(request);
        }
        true
    }

    fn admit(&mut self, mut request: LoadRequest) {
        LoadStats::bump(&self.ctx.stats.requests);
        let callback = PendingCallback {
            request: request.id,
            callback: request.callback.take(),
        };

        if let Some(handle) = self.table.find(&request.name) {
            if let Some(package) = self.table.get_mut(handle) {
                debug!("Request {} joins in-flight {}", request.id, request.name);
                package.callbacks.push(callback);
                self.raise_priority(handle, request.priority);
                return;
            }
        }

        {
            let mut finalize = self.ctx.finalize.lock();
            if let Some(item) = finalize.iter_mut().find(|i| i.name() == request.name) {
                debug!("Request {} joins finishing {}", request.id, request.name);
                item.attach(callback);
                return;
            }
        }

        if let Some(object) = self.ctx.store.find(&request.name) {
            if object.has_flags(ObjectFlags::LOADED) && !object.has_flags(ObjectFlags::LOAD_FAILED) {
                debug!("{} is already loaded", request.name);
                self.ctx.push_finalize(FinalizeItem::Immediate {
                    name: request.name.clone(),
                    object: Some(object),
                    result: LoadResult::Succeeded,
                    callbacks: vec![callback],
                });
                return;
            }
        }

        if self.ctx.missing.contains(request.source_name()) {
            debug!("{} is known to be missing", request.source_name());
            let error = LoadError::MissingPackage(request.source_name().to_string());
            self.ctx.push_finalize(FinalizeItem::Immediate {
                name: request.name.clone(),
                object: None,
                result: LoadResult::Failed(Arc::new(error.into())),
                callbacks: vec![callback],
            });
            return;
        }

        let source = request.source_name().to_string();
        let handle = self.create_package(
            &request.name,
            &source,
            request.guid,
            request.priority,
            request.flags,
        );
        if let Some(package) = self.table.get_mut(handle) {
            package.callbacks.push(callback);
        }
    }

    /// Raise `handle` and everything it imports to at least `priority`,
    /// re-keying their queued events
    pub(crate) fn raise_priority(&mut self, handle: PackageHandle, priority: i32) {
        let mut visited = HashSet::new();
        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(package) = self.table.get_mut(current) else {
                continue;
            };
            if package.priority >= priority {
                continue;
            }
            package.priority = priority;
            stack.extend(package.imported_packages.iter().copied());
            let raised = self.events.raise_priority(current, priority);
            trace!("{} raised to priority {} ({} events)", package.name, priority, raised);
        }
    }

    /// Insert a new package and queue its first read
    pub(crate) fn create_package(
        &mut self,
        name: &str,
        source: &str,
        guid: Option<PackageGuid>,
        priority: i32,
        flags: LoadFlags,
    ) -> PackageHandle {
        let serial = self.next_serial;
        self.next_serial += 1;
        let handle = self.table.insert_with(name, |handle| {
            AsyncPackage::new(handle, name, source, guid, priority, serial, flags)
        });
        let spec = |phase, implicit| NodeSpec {
            owner: handle,
            slot: None,
            phase,
            hold: implicit == 0,
            implicit,
        };
        let nodes = self.graph.add_nodes(&[
            spec(NodePhase::PackageSummary, 1),
            spec(NodePhase::PackageSetupImports, 0),
            spec(NodePhase::PackageExportsSerialized, 0),
        ]);
        if let Some(package) = self.table.get_mut(handle) {
            package.package_nodes = nodes;
        }
        self.events.push(handle, EventKind::StartRead, priority, serial);
        LoadStats::bump(&self.ctx.stats.packages_created);
        info!("Loading {} (priority {})", name, priority);
        handle
    }

    fn run_event(&mut self, event: Event) {
        let Some(mut package) = self.table.checkout(event.package) else {
            trace!("Dropping {:?} for stale {:?}", event.kind, event.package);
            return;
        };
        let ctx = Arc::clone(&self.ctx);
        let _scope = TrackedScope::new(ctx.tracker.as_ref(), "AsyncLoading");
        ctx.crash.set("AsyncLoadingPackage", &package.name);
        trace!("{}: {:?} in {}", package.name, event.kind, package.state);

        match event.kind {
            EventKind::StartRead => self.start_read(&mut package),
            EventKind::ProcessSummary => self.process_summary(&mut package),
            EventKind::SetupImports => self.setup_imports(&mut package),
            EventKind::ProcessPackage => self.process_package(&mut package),
            EventKind::ExportsSerialized => self.exports_serialized(&mut package),
        }
        self.pump_fired(Some(&mut *package));

        let reached_postload =
            package.state == crate::package::PackageState::WaitingForPostLoad;
        let handle = package.handle;
        self.table.checkin(handle, package);
        self.pump_fired(None);
        if reached_postload {
            self.update_postload_waits();
        }
    }

    /// Dispatch every fired node to its owner.
    ///
    /// Nodes of `current` (the checked-out package) are absorbed inline.
    pub(crate) fn pump_fired(&mut self, mut current: Option<&mut AsyncPackage>) {
        while let Some(node) = self.graph.pop_fired() {
            match current.as_deref_mut() {
                Some(package) if package.handle == node.owner => {
                    dispatch_fired(&mut self.graph, &mut self.events, package, &node);
                }
                _ => match self.table.get_mut(node.owner) {
                    Some(package) => {
                        dispatch_fired(&mut self.graph, &mut self.events, package, &node)
                    }
                    None => trace!("Fired node of gone package {:?}", node.owner),
                },
            }
        }
    }

    /// Fail `package` outright: cancel its reads and flush its nodes
    pub(crate) fn abort_package(&mut self, package: &mut AsyncPackage, error: PakError) {
        package.note_error(error);
        if package.aborted {
            return;
        }
        package.aborted = true;
        if let Some(archive) = package.archive.as_mut() {
            archive.cancel();
        }
        self.ctx.handler.cancel_for(package.handle);
        for (_, read) in package.reads.drain() {
            if read.resident {
                self.ctx.handler.release_resident(read.len);
            }
        }
        self.throttled.retain(|h| *h != package.handle);
        self.graph.force_fire_range(package.package_nodes);
        if let Some(range) = package.object_nodes {
            self.graph.force_fire_range(range);
        }
    }

    fn requeue_throttled(&mut self) {
        for handle in std::mem::take(&mut self.throttled) {
            if let Some(package) = self.table.get_mut(handle) {
                package.throttled = false;
                if let Some(kind) = package.request_process() {
                    self.events.push(handle, kind, package.priority, package.serial);
                }
            }
        }
    }

    fn io_outstanding(&self) -> bool {
        if self.ctx.handler.outstanding() > 0 || self.ctx.handler.has_notices() {
            return true;
        }
        self.table.handles().into_iter().any(|h| {
            self.table
                .get(h)
                .and_then(|p| p.archive.as_ref())
                .map_or(false, |a| a.is_waiting())
        })
    }

    /// Idle with packages left but nothing in flight
    fn is_stalled(&mut self) -> bool {
        if self.table.is_empty() || !self.events.is_empty() || self.graph.has_fired() {
            return false;
        }
        if !self.ctx.requests.lock().is_empty() {
            return false;
        }
        if self.io_outstanding() {
            return false;
        }
        if !self.throttled.is_empty() {
            self.requeue_throttled();
            return false;
        }
        true
    }

    fn handle_stall(&mut self) {
        let chain = self.describe_stall();
        error!("Async loading stalled: {}", chain);
        self.ctx.crash.set("AsyncLoadingStall", &chain);
        LoadStats::bump(&self.ctx.stats.stalls);

        for handle in self.table.handles() {
            if let Some(mut package) = self.table.checkout(handle) {
                self.abort_package(&mut package, LoadError::GraphCycle(chain.clone()).into());
                self.pump_fired(Some(&mut *package));
                self.table.checkin(handle, package);
            }
        }
        self.pump_fired(None);
        *self.ctx.stall.lock() = Some(LoadError::GraphCycle(chain));
    }

    fn describe_stall(&self) -> String {
        let name = |h: PackageHandle| {
            self.table
                .get(h)
                .map_or_else(|| format!("{:?}", h), |p| p.name.clone())
        };
        if !self.ctx.config.scheduler.diagnose_stalls {
            return format!("{} packages stuck", self.table.len());
        }
        match self.graph.diagnose_stall() {
            Some(report) => {
                let steps: Vec<String> = report
                    .chain
                    .iter()
                    .map(|n| match n.slot {
                        Some(slot) => format!("{}:{:?}[{}]", name(n.owner), n.phase, slot),
                        None => format!("{}:{:?}", name(n.owner), n.phase),
                    })
                    .collect();
                let suffix = if report.cycle { " (cycle)" } else { "" };
                format!("{}{}", steps.join(" -> "), suffix)
            }
            None => {
                let stuck: Vec<String> = self
                    .table
                    .handles()
                    .into_iter()
                    .filter_map(|h| self.table.get(h))
                    .map(|p| format!("{} in {}", p.name, p.state))
                    .collect();
                format!("no blocked nodes; {}", stuck.join(", "))
            }
        }
    }
}

/// Hand a fired node to `package` and queue any resulting event
fn dispatch_fired(
    graph: &mut DependencyGraph<PackageHandle>,
    events: &mut EventQueue,
    package: &mut AsyncPackage,
    node: &FiredNode<PackageHandle>,
) {
    let event = package.on_node_fired(node);
    if matches!(
        node.phase,
        NodePhase::PackageSummary | NodePhase::PackageSetupImports | NodePhase::PackageExportsSerialized
    ) {
        graph.remove_node(node.id);
    }
    if let Some(kind) = event {
        events.push(package.handle, kind, package.priority, package.serial);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::object::ClassRegistry;
    use op_core::instrumentation::{InMemoryCrashContext, NullTracker};
    use op_io::{IoDispatcher, MemoryFileSystem};

    pub(crate) fn context(fs: Arc<dyn FileSystem>) -> Arc<LoaderContext> {
        let config = Config::default();
        Arc::new(LoaderContext {
            paths: ContentPaths::new(&config.paths).with_root("/content"),
            handler: Arc::new(PrecacheHandler::new(
                config.precache.memory_budget_bytes,
                Arc::new(Wakeup::new()),
            )),
            config,
            fs,
            store: Arc::new(ObjectStore::new()),
            factory: Arc::new(ClassRegistry::with_raw_fallback()),
            tracker: Arc::new(NullTracker),
            crash: Arc::new(InMemoryCrashContext::new()),
            missing: Arc::new(MissingPackageCache::new()),
            stats: Arc::new(LoadStats::new()),
            requests: Mutex::new(VecDeque::new()),
            finalize: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashSet::new()),
            completed: Wakeup::new(),
            cancel: CancelSignal::new(),
            suspend: SuspendSignal::new(),
            shutdown: AtomicBool::new(false),
            stall: Mutex::new(None),
        })
    }

    fn empty_state() -> LoaderState {
        let fs = Arc::new(MemoryFileSystem::new(Arc::new(IoDispatcher::new(0))));
        LoaderState::new(context(fs))
    }

    #[test]
    fn test_higher_priority_package_starts_first() {
        let mut state = empty_state();
        let low = state.create_package("/Game/Low", "/Game/Low", None, 0, LoadFlags::empty());
        let other = state.create_package("/Game/Other", "/Game/Other", None, 0, LoadFlags::empty());
        let high = state.create_package("/Game/High", "/Game/High", None, 10, LoadFlags::empty());

        let first = state.events.pop().unwrap();
        assert_eq!(first.package, high);
        assert_eq!(first.kind, EventKind::StartRead);
        assert_eq!(state.events.pop().unwrap().package, low);
        assert_eq!(state.events.pop().unwrap().package, other);
    }

    fn request(id: u64, name: &str, priority: i32) -> LoadRequest {
        LoadRequest {
            id: RequestId(id),
            name: name.to_string(),
            load_from: None,
            guid: None,
            priority,
            flags: LoadFlags::empty(),
            callback: None,
        }
    }

    #[test]
    fn test_duplicate_request_joins_package() {
        let mut state = empty_state();
        for (id, name, priority) in [(1, "/Game/A", 0), (2, "/Game/B", 5)] {
            state.ctx.requests.lock().push_back(request(id, name, priority));
        }
        assert!(state.admit_requests());
        state.ctx.requests.lock().push_back(request(3, "/Game/A", 10));
        assert!(state.admit_requests());

        assert_eq!(state.table.len(), 2);
        let a = state.table.find("/Game/A").unwrap();
        let package = state.table.get(a).unwrap();
        assert_eq!(package.callbacks.len(), 2);
        assert_eq!(package.priority, 10);

        let first = state.events.pop().unwrap();
        assert_eq!(first.package, a);
        assert_eq!(first.user_priority, 10);
        assert_eq!(state.events.pop().unwrap().package, state.table.find("/Game/B").unwrap());
    }

    #[test]
    fn test_raise_priority_reaches_imported_packages() {
        let mut state = empty_state();
        let a = state.create_package("/Game/A", "/Game/A", None, 0, LoadFlags::empty());
        let dep = state.create_package("/Game/Dep", "/Game/Dep", None, 0, LoadFlags::empty());
        let b = state.create_package("/Game/B", "/Game/B", None, 5, LoadFlags::empty());
        state.table.get_mut(a).unwrap().imported_packages.push(dep);
        state.table.get_mut(dep).unwrap().imported_packages.push(a);

        state.raise_priority(a, 10);
        assert_eq!(state.table.get(dep).unwrap().priority, 10);
        let order: Vec<_> = std::iter::from_fn(|| state.events.pop()).map(|e| e.package).collect();
        assert_eq!(order, vec![a, dep, b]);

        state.raise_priority(b, 1);
        assert_eq!(state.table.get(b).unwrap().priority, 5);
    }

    #[test]
    fn test_known_missing_request_fails_immediately() {
        let mut state = empty_state();
        state.ctx.missing.insert("/Game/Gone");
        state.ctx.requests.lock().push_back(request(1, "/Game/Gone", 0));
        state.admit_requests();
        assert!(state.table.is_empty());
        let finalize = state.ctx.finalize.lock();
        assert!(matches!(
            finalize.front(),
            Some(FinalizeItem::Immediate { result: LoadResult::Failed(_), .. })
        ));
    }
}
