//! The public request API
//!
//! [`AsyncLoader`] runs the loading thread (or ticks it cooperatively from the
//! owning thread when multithreading is off) and finalizes completed packages
//! whenever the owning thread calls [`AsyncLoader::flush`] or
//! [`AsyncLoader::process_completed`].

use crate::finalize::Finalizer;
use crate::handle::RequestId;
use crate::loading::{LoaderContext, LoaderState, TickResult};
use crate::missing::MissingPackageCache;
use crate::object::{ClassRegistry, ObjectFactory, ObjectStore};
use crate::request::{CompletionCallback, LoadFlags, LoadRequest};
use crate::signal::{CancelSignal, SuspendSignal};
use crate::stats::{LoadStats, LoadStatsSnapshot};
use op_core::config::Config;
use op_core::error::PakError;
use op_core::instrumentation::{CrashContext, InMemoryCrashContext, MemoryScopeTracker, NullTracker};
use op_format::PackageGuid;
use op_io::{ContentPaths, FileSystem, PrecacheHandler, Wakeup};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Collaborators injected into the loader
#[derive(Clone)]
pub struct LoaderServices {
    pub fs: Arc<dyn FileSystem>,
    pub store: Arc<ObjectStore>,
    pub factory: Arc<dyn ObjectFactory>,
    pub tracker: Arc<dyn MemoryScopeTracker>,
    pub crash: Arc<dyn CrashContext>,
    pub missing: Arc<MissingPackageCache>,
}

impl LoaderServices {
    /// Services over `fs` with a fresh store and a raw-data class registry
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            store: Arc::new(ObjectStore::new()),
            factory: Arc::new(ClassRegistry::with_raw_fallback()),
            tracker: Arc::new(NullTracker),
            crash: Arc::new(InMemoryCrashContext::new()),
            missing: Arc::new(MissingPackageCache::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<ObjectStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn ObjectFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn MemoryScopeTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_crash_context(mut self, crash: Arc<dyn CrashContext>) -> Self {
        self.crash = crash;
        self
    }

    pub fn with_missing_cache(mut self, missing: Arc<MissingPackageCache>) -> Self {
        self.missing = missing;
        self
    }
}

/// Asynchronous package loader
pub struct AsyncLoader {
    ctx: Arc<LoaderContext>,
    state: Arc<Mutex<LoaderState>>,
    finalizer: Finalizer,
    thread: Option<JoinHandle<()>>,
    next_request: AtomicU64,
    multithreaded: bool,
}

impl AsyncLoader {
    /// Create a loader, spawning the loading thread in multithreaded mode
    pub fn new(config: Config, services: LoaderServices) -> Result<Self, PakError> {
        let paths = ContentPaths::new(&config.paths);
        let handler = Arc::new(PrecacheHandler::new(
            config.precache.memory_budget_bytes,
            Arc::new(Wakeup::new()),
        ));
        let multithreaded = config.general.multithreaded;
        services.missing.init();

        let ctx = Arc::new(LoaderContext {
            config,
            paths,
            fs: services.fs,
            store: services.store,
            factory: services.factory,
            tracker: services.tracker,
            crash: services.crash,
            missing: services.missing,
            stats: Arc::new(LoadStats::new()),
            handler,
            requests: Mutex::new(VecDeque::new()),
            finalize: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashSet::new()),
            completed: Wakeup::new(),
            cancel: CancelSignal::new(),
            suspend: SuspendSignal::new(),
            shutdown: AtomicBool::new(false),
            stall: Mutex::new(None),
        });
        let state = Arc::new(Mutex::new(LoaderState::new(Arc::clone(&ctx))));

        let thread = if multithreaded {
            let ctx = Arc::clone(&ctx);
            let state = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name("pak-loading".to_string())
                .spawn(move || loading_thread(ctx, state))?;
            Some(handle)
        } else {
            None
        };
        info!(
            "Async loader started ({})",
            if multithreaded { "threaded" } else { "cooperative" }
        );

        Ok(Self {
            finalizer: Finalizer::new(Arc::clone(&ctx)),
            ctx,
            state,
            thread,
            next_request: AtomicU64::new(1),
            multithreaded,
        })
    }

    /// Queue a load of `name`, read from `load_from` if given
    pub fn enqueue(
        &self,
        name: &str,
        load_from: Option<&str>,
        guid: Option<PackageGuid>,
        priority: i32,
        flags: LoadFlags,
        callback: Option<CompletionCallback>,
    ) -> RequestId {
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        self.ctx.pending.lock().insert(id);
        self.ctx.requests.lock().push_back(LoadRequest {
            id,
            name: name.to_string(),
            load_from: load_from.map(str::to_string),
            guid,
            priority,
            flags,
            callback,
        });
        debug!("Enqueued {} as {}", name, id);
        self.ctx.wake_loader();
        id
    }

    /// Block until `request` (or every request) has fired its callback.
    ///
    /// Returns the stall diagnosis if loading deadlocked along the way.
    pub fn flush(&self, request: Option<RequestId>) -> Result<(), PakError> {
        let done = || {
            let pending = self.ctx.pending.lock();
            match request {
                Some(id) => !pending.contains(&id),
                None => pending.is_empty(),
            }
        };
        let scheduler = &self.ctx.config.scheduler;
        let mut stall = None;

        while !done() {
            if self.ctx.suspend.is_requested() {
                warn!("flush while suspended; returning with {} requests pending", self.pending_request_count());
                break;
            }
            let mut idle = true;
            if !self.multithreaded {
                let result = self.state.lock().tick(scheduler.tick_budget());
                idle = result == TickResult::Complete;
            }
            let finalized = self.finalizer.process(scheduler.finalize_budget());
            if let Some(error) = self.ctx.stall.lock().take() {
                stall = Some(error);
            }
            if finalized > 0 || !idle || done() {
                continue;
            }
            if self.multithreaded {
                self.ctx.completed.wait_timeout(scheduler.idle_wait());
            } else {
                self.ctx.handler.wakeup().wait_timeout(scheduler.idle_wait());
            }
        }

        match stall {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Cancel every queued and in-flight request.
    ///
    /// Outstanding callbacks fire with `Canceled` before this returns.
    pub fn cancel(&self) {
        let epoch = self.ctx.cancel.request();
        let parked = self.ctx.suspend.is_requested();
        if self.multithreaded && !parked {
            self.ctx.wake_loader();
            self.ctx.cancel.wait(epoch, &self.ctx.shutdown);
        }
        // Cooperative, parked or shutting down: drain it here
        self.state.lock().drain_cancel();
        let canceled = self.finalizer.cancel_queued();
        debug!("Cancel drained {} finalize items", canceled);
    }

    /// Park the loading thread at its next checkpoint
    pub fn suspend(&self) {
        self.ctx.suspend.request();
        if self.multithreaded {
            self.ctx.wake_loader();
            self.ctx.suspend.wait_acknowledged(&self.ctx.shutdown);
        }
        debug!("Loading suspended");
    }

    pub fn resume(&self) {
        self.ctx.suspend.resume();
        self.ctx.wake_loader();
        debug!("Loading resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.ctx.suspend.is_requested()
    }

    /// Run the loading thread's work for up to `budget` on the calling thread.
    ///
    /// Meant for cooperative mode; nothing is finalized.
    pub fn tick(&self, budget: Duration) -> TickResult {
        if self.ctx.suspend.is_requested() {
            return TickResult::Complete;
        }
        self.state.lock().tick(budget)
    }

    /// Finalize completed packages on the calling thread within `budget`
    pub fn process_completed(&self, budget: Duration) -> usize {
        if !self.multithreaded && !self.ctx.suspend.is_requested() {
            self.state.lock().tick(self.ctx.config.scheduler.tick_budget());
        }
        self.finalizer.process(budget)
    }

    /// Whether any request has not fired its callback yet
    pub fn is_loading(&self) -> bool {
        !self.ctx.pending.lock().is_empty()
    }

    pub fn pending_request_count(&self) -> usize {
        self.ctx.pending.lock().len()
    }

    /// Packages currently owned by the loading thread
    pub fn in_flight_package_count(&self) -> usize {
        self.state.lock().package_count()
    }

    /// Completed packages whose deletion waits on importers
    pub fn deferred_package_count(&self) -> usize {
        self.finalizer.deferred_count()
    }

    pub fn stats(&self) -> LoadStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.ctx.store
    }

    pub fn missing_cache(&self) -> &Arc<MissingPackageCache> {
        &self.ctx.missing
    }

    pub fn is_multithreaded(&self) -> bool {
        self.multithreaded
    }

    /// Cancel everything, stop the loading thread and reset the injected caches
    pub fn shutdown(&mut self) {
        if self.ctx.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.cancel();
        self.ctx.shutdown.store(true, Ordering::Release);
        self.ctx.suspend.resume();
        self.ctx.wake_loader();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Loading thread panicked");
            }
        }
        self.finalizer.clear_deferred();
        self.ctx.missing.clear();
        self.ctx.stats.reset();
        info!("Async loader shut down");
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn loading_thread(ctx: Arc<LoaderContext>, state: Arc<Mutex<LoaderState>>) {
    debug!("Loading thread running");
    let budget = ctx.config.scheduler.tick_budget();
    let idle = ctx.config.scheduler.idle_wait();
    while !ctx.shutdown.load(Ordering::Acquire) {
        if ctx.suspend.checkpoint(&ctx.shutdown) {
            continue;
        }
        let result = state.lock().tick(budget);
        if result == TickResult::Complete {
            ctx.handler.wakeup().wait_timeout(idle);
        }
    }
    debug!("Loading thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use op_io::{IoDispatcher, MemoryFileSystem};

    fn loader(multithreaded: bool) -> AsyncLoader {
        let fs = Arc::new(MemoryFileSystem::new(Arc::new(IoDispatcher::new(0))));
        let mut config = Config::default();
        config.general.multithreaded = multithreaded;
        config.paths.content_root = "/content".into();
        AsyncLoader::new(config, LoaderServices::new(fs)).unwrap()
    }

    #[test]
    fn test_missing_package_completes_failed() {
        let loader = loader(false);
        let result = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&result);
        let id = loader.enqueue(
            "/Game/Nope",
            None,
            None,
            0,
            LoadFlags::empty(),
            Some(Box::new(move |c| *seen.lock() = Some(c.result.clone()))),
        );
        assert!(loader.is_loading());
        loader.flush(Some(id)).unwrap();
        assert!(!loader.is_loading());
        assert!(matches!(*result.lock(), Some(crate::LoadResult::Failed(_))));
        assert!(loader.missing_cache().contains("/Game/Nope"));
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let mut loader = loader(true);
        loader.enqueue("/Game/Nope", None, None, 0, LoadFlags::empty(), None);
        loader.flush(None).unwrap();
        loader.shutdown();
        assert!(loader.thread.is_none());
        assert!(loader.missing_cache().is_empty());
        assert_eq!(loader.stats().requests, 0);
    }

    #[test]
    fn test_suspend_blocks_flush() {
        let loader = loader(true);
        loader.suspend();
        assert!(loader.is_suspended());
        loader.enqueue("/Game/Nope", None, None, 0, LoadFlags::empty(), None);
        loader.flush(None).unwrap();
        assert!(loader.is_loading());
        loader.resume();
        loader.flush(None).unwrap();
        assert!(!loader.is_loading());
    }
}
