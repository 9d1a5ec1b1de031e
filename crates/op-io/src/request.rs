//! Completion state shared between an I/O worker and the code awaiting it

use op_core::error::ArchiveError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Completion callback, invoked exactly once on the thread that finished the request
pub type IoCallback = Box<dyn FnOnce(&IoRequest) + Send>;

/// What a finished request produced
#[derive(Debug, Clone)]
pub enum IoData {
    Size(u64),
    Bytes(Arc<[u8]>),
}

/// An asynchronous size or range read
#[derive(Debug)]
pub struct IoRequest {
    offset: u64,
    len: u64,
    result: Mutex<Option<Result<IoData, ArchiveError>>>,
    done: Condvar,
    canceled: AtomicBool,
}

impl IoRequest {
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            result: Mutex::new(None),
            done: Condvar::new(),
            canceled: AtomicBool::new(false),
        }
    }

    /// Request that has already failed
    pub fn failed(offset: u64, len: u64, error: ArchiveError) -> Self {
        let request = Self::new(offset, len);
        *request.result.lock() = Some(Err(error));
        request
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record the outcome. Later completions are ignored.
    pub fn complete(&self, outcome: Result<IoData, ArchiveError>) -> bool {
        let mut result = self.result.lock();
        if result.is_some() {
            return false;
        }
        *result = Some(outcome);
        self.done.notify_all();
        true
    }

    pub fn is_complete(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Ask the worker to skip or discard this request
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Block until the request completes
    pub fn wait(&self) {
        let mut result = self.result.lock();
        while result.is_none() {
            self.done.wait(&mut result);
        }
    }

    /// Block up to `timeout`; returns whether the request completed
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut result = self.result.lock();
        if result.is_none() {
            self.done.wait_for(&mut result, timeout);
        }
        result.is_some()
    }

    /// Outcome, if complete
    pub fn result(&self) -> Option<Result<IoData, ArchiveError>> {
        self.result.lock().clone()
    }

    /// Bytes of a completed range read
    pub fn bytes(&self) -> Option<Result<Arc<[u8]>, ArchiveError>> {
        self.result().map(|r| match r {
            Ok(IoData::Bytes(bytes)) => Ok(bytes),
            Ok(IoData::Size(_)) => Err(ArchiveError::ReadFailed {
                path: String::new(),
                message: "size request has no bytes".to_string(),
            }),
            Err(e) => Err(e),
        })
    }

    /// Size reported by a completed size request
    pub fn size(&self) -> Option<Result<u64, ArchiveError>> {
        self.result().map(|r| match r {
            Ok(IoData::Size(size)) => Ok(size),
            Ok(IoData::Bytes(_)) => Err(ArchiveError::ReadFailed {
                path: String::new(),
                message: "range read has no size".to_string(),
            }),
            Err(e) => Err(e),
        })
    }
}
