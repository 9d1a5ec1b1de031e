//! Dropping every in-flight request

use super::{FinalizeItem, LoaderState};
use crate::request::{LoadResult, PendingCallback};
use crate::stats::LoadStats;
use tracing::info;

impl LoaderState {
    /// Abandon every queued and in-flight package.
    ///
    /// Callbacks are not fired here; they reach the owning thread as
    /// `Canceled` through the finalize queue.
    pub(super) fn cancel_all(&mut self) {
        self.ctx.handler.cancel_all();

        let requests: Vec<_> = self.ctx.requests.lock().drain(..).collect();
        for mut request in requests {
            let callback = PendingCallback {
                request: request.id,
                callback: request.callback.take(),
            };
            self.ctx.push_finalize(FinalizeItem::Immediate {
                name: request.name,
                object: None,
                result: LoadResult::Canceled,
                callbacks: vec![callback],
            });
        }

        let handles = self.table.handles();
        let count = handles.len();
        for handle in handles {
            let Some(mut package) = self.table.remove(handle) else {
                continue;
            };
            if let Some(archive) = package.archive.as_mut() {
                archive.cancel();
            }
            package.archive = None;
            package.reads.clear();
            package.release_held();
            self.ctx.store.remove_unfinished(&package.name);
            LoadStats::bump(&self.ctx.stats.packages_canceled);
            let callbacks = std::mem::take(&mut package.callbacks);
            self.ctx.push_finalize(FinalizeItem::Immediate {
                name: package.name.clone(),
                object: None,
                result: LoadResult::Canceled,
                callbacks,
            });
        }

        self.graph.clear();
        self.events.clear();
        self.throttled.clear();
        self.waiting_postload.clear();
        if count > 0 {
            info!("Canceled {} in-flight packages", count);
        }
    }
}
