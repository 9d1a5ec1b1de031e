//! Owning-thread completion: remaining postloads, clusters, callbacks

use crate::loading::{FinalizeItem, LoaderContext};
use crate::object::{ObjectFlags, ObjectRef};
use crate::package::{AsyncPackage, PackageState};
use crate::request::{LoadFlags, LoadResult, PendingCallback};
use crate::stats::LoadStats;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Drains the finalize queue on the owning thread
pub(crate) struct Finalizer {
    ctx: Arc<LoaderContext>,
    /// Completed packages still referenced by a loading importer
    deferred: Mutex<Vec<Box<AsyncPackage>>>,
}

impl Finalizer {
    pub(crate) fn new(ctx: Arc<LoaderContext>) -> Self {
        Self {
            ctx,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Finalize queued items until `budget` runs out; returns how many ran.
    ///
    /// At least one item is processed per call.
    pub(crate) fn process(&self, budget: Duration) -> usize {
        let start = Instant::now();
        let mut processed = 0;
        loop {
            let item = self.ctx.finalize.lock().pop_front();
            let Some(item) = item else {
                break;
            };
            match item {
                FinalizeItem::Package(package) => self.finish_package(package),
                FinalizeItem::Immediate {
                    name,
                    object,
                    result,
                    callbacks,
                } => self.fire(&name, object, &result, callbacks),
            }
            processed += 1;
            if start.elapsed() >= budget {
                break;
            }
        }
        self.reap_deferred();
        processed
    }

    fn finish_package(&self, mut package: Box<AsyncPackage>) {
        let result = match &package.error {
            Some(error) => LoadResult::Failed(Arc::clone(error)),
            None => LoadResult::Succeeded,
        };

        if result.is_success() {
            let mut members: Vec<ObjectRef> = Vec::new();
            for record in package.exports.iter().filter(|r| !r.preloaded && !r.failed) {
                let Some(object) = &record.object else {
                    continue;
                };
                if object.has_flags(ObjectFlags::NEED_POSTLOAD) {
                    object.with_data(|data| data.post_load());
                    object.clear_flags(ObjectFlags::NEED_POSTLOAD);
                }
                object.set_flags(ObjectFlags::FULLY_LOADED);
                members.push(Arc::clone(object));
            }
            if let Some(object) = &package.package_object {
                object.set_flags(ObjectFlags::LOADED | ObjectFlags::FULLY_LOADED);
            }
            if self.ctx.config.general.create_clusters
                && !package.flags.contains(LoadFlags::NO_CLUSTERS)
                && !members.is_empty()
            {
                let id = self.ctx.store.create_cluster(&package.name, &members);
                trace!("{}: cluster {} with {} objects", package.name, id, members.len());
            }
            LoadStats::bump(&self.ctx.stats.packages_completed);
            info!("Loaded {}", package.name);
        } else {
            if let Some(object) = &package.package_object {
                object.set_flags(ObjectFlags::LOAD_FAILED);
            }
            for object in package.export_objects() {
                if !object.has_flags(ObjectFlags::FULLY_LOADED) {
                    object.set_flags(ObjectFlags::LOAD_FAILED);
                }
            }
            self.ctx.store.remove_unfinished(&package.name);
            LoadStats::bump(&self.ctx.stats.packages_failed);
            warn!("{}: {}", package.name, result);
        }
        package.set_state(PackageState::PackageComplete);

        let object = if result.is_success() {
            package.package_object.clone()
        } else {
            None
        };
        let callbacks = std::mem::take(&mut package.callbacks);
        let name = package.name.clone();
        self.fire(&name, object, &result, callbacks);

        if package.keep_alive_count() > 0 {
            debug!(
                "{} kept alive by {} importers",
                package.name,
                package.keep_alive_count()
            );
            self.deferred.lock().push(package);
        }
    }

    fn fire(
        &self,
        name: &str,
        object: Option<ObjectRef>,
        result: &LoadResult,
        callbacks: Vec<PendingCallback>,
    ) {
        for callback in callbacks {
            let request = callback.request;
            callback.fire(name, object.clone(), result);
            self.ctx.pending.lock().remove(&request);
        }
    }

    /// Fail everything queued for finalize with `Canceled`
    pub(crate) fn cancel_queued(&self) -> usize {
        let items: Vec<FinalizeItem> = self.ctx.finalize.lock().drain(..).collect();
        let count = items.len();
        for item in items {
            match item {
                FinalizeItem::Package(mut package) => {
                    self.ctx.store.remove_unfinished(&package.name);
                    LoadStats::bump(&self.ctx.stats.packages_canceled);
                    let callbacks = std::mem::take(&mut package.callbacks);
                    let name = package.name.clone();
                    self.fire(&name, None, &LoadResult::Canceled, callbacks);
                }
                FinalizeItem::Immediate { name, callbacks, .. } => {
                    self.fire(&name, None, &LoadResult::Canceled, callbacks);
                }
            }
        }
        count
    }

    /// Delete deferred packages nobody holds any more
    fn reap_deferred(&self) {
        let mut deferred = self.deferred.lock();
        let before = deferred.len();
        deferred.retain(|p| p.keep_alive_count() > 0);
        if deferred.len() != before {
            trace!("Deleted {} deferred packages", before - deferred.len());
        }
    }

    pub(crate) fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub(crate) fn clear_deferred(&self) {
        self.deferred.lock().clear();
    }
}
