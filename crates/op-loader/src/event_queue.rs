//! Priority queue of ready package work
//!
//! Ordering: higher user priority first, then the package inserted earlier
//! (approximating breadth-first discovery), then higher system priority, then
//! insertion order.

use crate::handle::PackageHandle;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Work a package can be asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Open the archive and issue the summary read
    StartRead,
    /// Poll the archive and parse the header once resident
    ProcessSummary,
    /// Resolve imports against dependency packages
    SetupImports,
    /// Drain the package's ready lists
    ProcessPackage,
    /// Every export is serialized
    ExportsSerialized,
}

impl EventKind {
    /// Within one package, later phases run first
    pub fn system_priority(&self) -> u8 {
        match self {
            EventKind::StartRead => 0,
            EventKind::ProcessSummary => 1,
            EventKind::SetupImports => 2,
            EventKind::ProcessPackage => 3,
            EventKind::ExportsSerialized => 4,
        }
    }
}

/// A queued unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub package: PackageHandle,
    pub kind: EventKind,
    pub user_priority: i32,
    pub package_serial: u64,
    serial: u64,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: "greater" pops first
        self.user_priority
            .cmp(&other.user_priority)
            .then_with(|| other.package_serial.cmp(&self.package_serial))
            .then_with(|| self.kind.system_priority().cmp(&other.kind.system_priority()))
            .then_with(|| other.serial.cmp(&self.serial))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ready events ordered for dispatch
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    next_serial: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        package: PackageHandle,
        kind: EventKind,
        user_priority: i32,
        package_serial: u64,
    ) {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.heap.push(Event {
            package,
            kind,
            user_priority,
            package_serial,
            serial,
        });
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&Event> {
        self.heap.peek()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every event of `package`
    pub fn remove_package(&mut self, package: PackageHandle) {
        self.heap.retain(|e| e.package != package);
    }

    /// Re-key every queued event of `package` below `priority` to it.
    ///
    /// Returns the number of events raised.
    pub fn raise_priority(&mut self, package: PackageHandle, priority: i32) -> usize {
        let mut events = std::mem::take(&mut self.heap).into_vec();
        let mut raised = 0;
        for event in events.iter_mut() {
            if event.package == package && event.user_priority < priority {
                event.user_priority = priority;
                raised += 1;
            }
        }
        self.heap = BinaryHeap::from(events);
        raised
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(i: u32) -> PackageHandle {
        PackageHandle::new(i, 0)
    }

    #[test]
    fn test_user_priority_wins() {
        let mut queue = EventQueue::new();
        queue.push(handle(0), EventKind::ExportsSerialized, 0, 0);
        queue.push(handle(1), EventKind::StartRead, 5, 1);
        assert_eq!(queue.pop().unwrap().package, handle(1));
    }

    #[test]
    fn test_earlier_package_then_system_priority() {
        let mut queue = EventQueue::new();
        queue.push(handle(1), EventKind::ExportsSerialized, 0, 2);
        queue.push(handle(0), EventKind::StartRead, 0, 1);
        queue.push(handle(0), EventKind::ProcessPackage, 0, 1);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|e| (e.package, e.kind)).collect();
        assert_eq!(
            order,
            vec![
                (handle(0), EventKind::ProcessPackage),
                (handle(0), EventKind::StartRead),
                (handle(1), EventKind::ExportsSerialized),
            ]
        );
    }

    #[test]
    fn test_fifo_among_equals() {
        let mut queue = EventQueue::new();
        for _ in 0..3 {
            queue.push(handle(0), EventKind::ProcessPackage, 0, 0);
        }
        let serials: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|e| e.serial).collect();
        assert_eq!(serials, vec![0, 1, 2]);
    }

    #[test]
    fn test_remove_package() {
        let mut queue = EventQueue::new();
        queue.push(handle(0), EventKind::StartRead, 0, 0);
        queue.push(handle(1), EventKind::StartRead, 0, 1);
        queue.remove_package(handle(0));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().package, handle(1));
    }

    #[test]
    fn test_raise_priority_rekeys_queued_events() {
        let mut queue = EventQueue::new();
        queue.push(handle(0), EventKind::StartRead, 0, 0);
        queue.push(handle(1), EventKind::StartRead, 5, 1);
        queue.push(handle(0), EventKind::ProcessSummary, 7, 0);

        assert_eq!(queue.raise_priority(handle(0), 10), 2);
        assert_eq!(queue.raise_priority(handle(0), 3), 0);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|e| (e.package, e.kind, e.user_priority))
            .collect();
        assert_eq!(
            order,
            vec![
                (handle(0), EventKind::ProcessSummary, 10),
                (handle(0), EventKind::StartRead, 10),
                (handle(1), EventKind::StartRead, 5),
            ]
        );
    }
}
