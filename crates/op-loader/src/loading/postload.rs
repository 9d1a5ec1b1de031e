//! Waiting for dependencies to serialize, then handing packages to the owning thread

use super::{FinalizeItem, LoaderState};
use crate::handle::PackageHandle;
use crate::object::ObjectFlags;
use crate::package::{AsyncPackage, PackageState};
use std::collections::HashSet;
use tracing::{debug, trace};

impl LoaderState {
    /// Every export is serialized (or the package failed)
    pub(super) fn exports_serialized(&mut self, package: &mut AsyncPackage) {
        if package.state >= PackageState::WaitingForPostLoad {
            return;
        }
        // Anything still on the ready lists must be retired before hand-off
        self.process_package(package);

        if let Some(archive) = package.archive.take() {
            trace!("{}: closing archive ({} bytes resident)", package.name, archive.resident_bytes());
        }
        for (_, read) in package.reads.drain() {
            if read.resident {
                self.ctx.handler.release_resident(read.len);
            }
        }
        package.release_held();

        if let Some(object) = &package.package_object {
            if package.error.is_none() {
                object.clear_flags(ObjectFlags::NEED_LOAD);
                object.set_flags(ObjectFlags::LOADED);
            }
        }
        debug!(
            "{}: {} of {} exports serialized",
            package.name,
            package.exports_serialized,
            package.exports.len()
        );

        package.postload_wait = package
            .imported_packages
            .iter()
            .copied()
            .filter(|h| *h != package.handle)
            .collect();
        package.set_state(PackageState::WaitingForPostLoad);
        self.waiting_postload.push(package.handle);
    }

    /// Hand off every waiting package whose wait-set has drained
    pub(super) fn update_postload_waits(&mut self) {
        loop {
            let mut ready = Vec::new();
            for handle in self.waiting_postload.clone() {
                let remaining = self.flatten_wait(handle);
                let empty = remaining.is_empty();
                if let Some(package) = self.table.get_mut(handle) {
                    package.postload_wait = remaining;
                }
                if empty {
                    ready.push(handle);
                }
            }
            if ready.is_empty() {
                return;
            }
            self.waiting_postload.retain(|h| !ready.contains(h));
            for handle in ready {
                self.hand_off(handle);
            }
        }
    }

    /// Remaining packages `handle` waits on.
    ///
    /// A dependency that is itself serialized contributes its own remaining
    /// wait-set instead, so cycles of serialized packages drain together.
    fn flatten_wait(&self, handle: PackageHandle) -> HashSet<PackageHandle> {
        let mut remaining = HashSet::new();
        let Some(package) = self.table.get(handle) else {
            return remaining;
        };
        let mut visited = HashSet::from([handle]);
        let mut stack: Vec<PackageHandle> = package.postload_wait.iter().copied().collect();
        while let Some(dependency) = stack.pop() {
            if !visited.insert(dependency) {
                continue;
            }
            match self.table.get(dependency) {
                // Handed off or never loaded here
                None => {}
                Some(d) if d.state >= PackageState::WaitingForPostLoad => {
                    stack.extend(d.postload_wait.iter().copied());
                }
                Some(_) => {
                    remaining.insert(dependency);
                }
            }
        }
        remaining
    }

    /// Remove a package from the table and queue it for finalize
    fn hand_off(&mut self, handle: PackageHandle) {
        let Some(mut package) = self.table.remove(handle) else {
            return;
        };
        package.set_state(PackageState::ReadyForPostLoad);

        self.graph.retire_range(package.package_nodes);
        if let Some(range) = package.object_nodes.take() {
            self.graph.retire_range(range);
        }
        self.events.remove_package(handle);
        self.throttled.retain(|h| *h != handle);
        self.pump_fired(None);

        package.set_state(PackageState::PostLoadEtc);
        if package.error.is_none() {
            let mut ran = 0;
            for record in package.exports.iter().filter(|r| !r.preloaded) {
                let Some(object) = &record.object else {
                    continue;
                };
                if !object.has_flags(ObjectFlags::NEED_POSTLOAD) {
                    continue;
                }
                let safe = object
                    .with_data(|data| data.postload_on_loading_thread())
                    .unwrap_or(true);
                if safe {
                    object.with_data(|data| data.post_load());
                    object.clear_flags(ObjectFlags::NEED_POSTLOAD);
                    ran += 1;
                }
            }
            trace!("{}: {} postloads ran on the loading thread", package.name, ran);
        }

        debug!("{}: ready for finalize", package.name);
        self.ctx.push_finalize(FinalizeItem::Package(package));
    }
}
