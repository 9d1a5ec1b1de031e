//! Completion inbox and read throttling for the loading thread
//!
//! I/O workers never touch loader state. Their callbacks post an
//! [`IoNotice`] to the inbox and wake the loading thread, which drains the
//! inbox at the start of every tick.

use crate::archive::{ArchiveNotify, PrecacheArchive};
use crate::coalesce::MergedRead;
use crate::request::IoRequest;
use op_core::error::ArchiveError;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Identifier of one coalesced export read
pub type ReadId = u64;

/// Message posted by an I/O completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoNotice<K> {
    /// A header-phase read of the package's archive finished
    Archive(K),
    /// A coalesced export read finished
    Block(ReadId),
}

/// Auto-reset wake flag
#[derive(Debug, Default)]
pub struct Wakeup {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        *self.flag.lock() = true;
        self.cond.notify_all();
    }

    /// Wait for a signal, consuming it. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if !*flag {
            self.cond.wait_for(&mut flag, timeout);
        }
        std::mem::replace(&mut *flag, false)
    }
}

struct InflightRead<K> {
    key: K,
    read: MergedRead,
    request: Arc<IoRequest>,
}

/// A finished export read handed back to the loader
#[derive(Debug)]
pub struct CompletedRead<K> {
    pub key: K,
    pub read: MergedRead,
    pub result: Result<Arc<[u8]>, ArchiveError>,
}

/// Inbox plus in-flight bookkeeping, shared between I/O callbacks and the loader
pub struct PrecacheHandler<K> {
    inbox: Mutex<VecDeque<IoNotice<K>>>,
    wakeup: Arc<Wakeup>,
    inflight: Mutex<HashMap<ReadId, InflightRead<K>>>,
    next_id: AtomicU64,
    bytes_in_flight: AtomicU64,
    resident_bytes: AtomicU64,
    memory_budget: u64,
    reads_issued: AtomicU64,
}

impl<K: Copy + Eq + Send + Sync + 'static> PrecacheHandler<K> {
    pub fn new(memory_budget: u64, wakeup: Arc<Wakeup>) -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            wakeup,
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            bytes_in_flight: AtomicU64::new(0),
            resident_bytes: AtomicU64::new(0),
            memory_budget,
            reads_issued: AtomicU64::new(0),
        }
    }

    pub fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    /// Enqueue a notice and wake the loading thread
    pub fn post(&self, notice: IoNotice<K>) {
        self.inbox.lock().push_back(notice);
        self.wakeup.signal();
    }

    /// Take every pending notice
    pub fn drain(&self) -> Vec<IoNotice<K>> {
        self.inbox.lock().drain(..).collect()
    }

    pub fn has_notices(&self) -> bool {
        !self.inbox.lock().is_empty()
    }

    /// Callback for a package archive's header-phase reads
    pub fn archive_notifier(self: &Arc<Self>, key: K) -> ArchiveNotify {
        let handler = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(handler) = handler.upgrade() {
                handler.post(IoNotice::Archive(key));
            }
        })
    }

    /// Whether a read of `len` bytes fits the memory budget.
    ///
    /// A read is always allowed when nothing is in flight.
    pub fn has_budget(&self, len: u64) -> bool {
        let in_flight = self.bytes_in_flight.load(Ordering::Acquire);
        if in_flight == 0 {
            return true;
        }
        in_flight + self.resident_bytes.load(Ordering::Acquire) + len <= self.memory_budget
    }

    /// Issue `read` on `archive`, completing through the inbox
    pub fn submit(
        self: &Arc<Self>,
        key: K,
        archive: &PrecacheArchive,
        read: MergedRead,
    ) -> Result<ReadId, ArchiveError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::downgrade(self);
        let request = archive.issue_read(
            read.offset,
            read.len,
            Some(Box::new(move |_| {
                if let Some(handler) = handler.upgrade() {
                    handler.post(IoNotice::Block(id));
                }
            })),
        )?;
        trace!("Read {} issued: {} bytes at {}", id, read.len, read.offset);
        self.bytes_in_flight.fetch_add(read.len, Ordering::AcqRel);
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().insert(id, InflightRead { key, read, request });
        Ok(id)
    }

    /// Retire read `id`. `None` for reads that were canceled or already retired.
    pub fn complete(&self, id: ReadId) -> Option<CompletedRead<K>> {
        let entry = self.inflight.lock().remove(&id)?;
        self.bytes_in_flight.fetch_sub(entry.read.len, Ordering::AcqRel);
        let result = entry
            .request
            .bytes()
            .unwrap_or(Err(ArchiveError::Canceled));
        if result.is_ok() {
            self.resident_bytes.fetch_add(entry.read.len, Ordering::AcqRel);
        }
        Some(CompletedRead {
            key: entry.key,
            read: entry.read,
            result,
        })
    }

    /// A resident block of `len` bytes was consumed and dropped
    pub fn release_resident(&self, len: u64) {
        let _ = self
            .resident_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(len)));
    }

    /// Cancel every in-flight read belonging to `key`
    pub fn cancel_for(&self, key: K) -> usize {
        let mut inflight = self.inflight.lock();
        let ids: Vec<ReadId> = inflight
            .iter()
            .filter(|(_, e)| e.key == key)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = inflight.remove(id) {
                entry.request.cancel();
                self.bytes_in_flight.fetch_sub(entry.read.len, Ordering::AcqRel);
            }
        }
        ids.len()
    }

    /// Cancel everything and forget all notices
    pub fn cancel_all(&self) {
        for (_, entry) in self.inflight.lock().drain() {
            entry.request.cancel();
        }
        self.bytes_in_flight.store(0, Ordering::Release);
        self.resident_bytes.store(0, Ordering::Release);
        self.inbox.lock().clear();
    }

    /// Number of export reads in flight
    pub fn outstanding(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight.load(Ordering::Acquire)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Acquire)
    }

    pub fn reads_issued(&self) -> u64 {
        self.reads_issued.load(Ordering::Relaxed)
    }
}
