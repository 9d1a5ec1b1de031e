//! Worker pool executing blocking reads for the async file layer

use crate::file::BlockSource;
use crate::request::{IoCallback, IoData, IoRequest};
use crossbeam::channel::{unbounded, Receiver, Sender};
use op_core::error::ArchiveError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

enum JobKind {
    Size,
    Read,
}

struct IoJob {
    source: Arc<dyn BlockSource>,
    kind: JobKind,
    request: Arc<IoRequest>,
    callback: Option<IoCallback>,
}

/// Counters shared by all workers
#[derive(Debug, Default)]
pub struct IoStats {
    pub reads_completed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub reads_failed: AtomicU64,
    pub reads_canceled: AtomicU64,
}

/// Fixed pool of I/O worker threads
pub struct IoDispatcher {
    sender: Option<Sender<IoJob>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<IoStats>,
}

impl IoDispatcher {
    /// Create a dispatcher with `worker_count` threads (at least one)
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = unbounded::<IoJob>();
        let stats = Arc::new(IoStats::default());

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let rx = receiver.clone();
            let stats = Arc::clone(&stats);
            let spawned = thread::Builder::new()
                .name(format!("pak-io-{}", index))
                .spawn(move || worker_loop(rx, stats));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("Failed to spawn I/O worker {}: {}", index, e),
            }
        }
        debug!("I/O dispatcher started with {} workers", workers.len());

        Self {
            sender: Some(sender),
            workers,
            stats,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Queue a size query against `source`
    pub fn submit_size(
        &self,
        source: Arc<dyn BlockSource>,
        callback: Option<IoCallback>,
    ) -> Arc<IoRequest> {
        let request = Arc::new(IoRequest::new(0, 0));
        self.submit(IoJob {
            source,
            kind: JobKind::Size,
            request: Arc::clone(&request),
            callback,
        });
        request
    }

    /// Queue a range read against `source`
    pub fn submit_read(
        &self,
        source: Arc<dyn BlockSource>,
        offset: u64,
        len: u64,
        callback: Option<IoCallback>,
    ) -> Arc<IoRequest> {
        let request = Arc::new(IoRequest::new(offset, len));
        self.submit(IoJob {
            source,
            kind: JobKind::Read,
            request: Arc::clone(&request),
            callback,
        });
        request
    }

    fn submit(&self, job: IoJob) {
        let sent = match (&self.sender, self.workers.is_empty()) {
            (Some(sender), false) => sender.send(job).map_err(|e| e.into_inner()),
            _ => Err(job),
        };
        // No worker to run it: execute inline so the callback still fires
        if let Err(job) = sent {
            run_job(job, &self.stats);
        }
    }
}

impl Drop for IoDispatcher {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("I/O worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(receiver: Receiver<IoJob>, stats: Arc<IoStats>) {
    while let Ok(job) = receiver.recv() {
        run_job(job, &stats);
    }
}

fn run_job(job: IoJob, stats: &IoStats) {
    let IoJob {
        source,
        kind,
        request,
        callback,
    } = job;

    let outcome = if request.is_canceled() {
        stats.reads_canceled.fetch_add(1, Ordering::Relaxed);
        Err(ArchiveError::Canceled)
    } else {
        match kind {
            JobKind::Size => source.size().map(IoData::Size),
            JobKind::Read => read_range(source.as_ref(), &request).map(IoData::Bytes),
        }
    };

    match &outcome {
        Ok(IoData::Bytes(bytes)) => {
            stats.reads_completed.fetch_add(1, Ordering::Relaxed);
            stats.bytes_read.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            trace!(
                "Read {} bytes at {} from {}",
                bytes.len(),
                request.offset(),
                source.describe()
            );
        }
        Ok(IoData::Size(_)) => {}
        Err(ArchiveError::Canceled) => {}
        Err(e) => {
            stats.reads_failed.fetch_add(1, Ordering::Relaxed);
            warn!("I/O request on {} failed: {}", source.describe(), e);
        }
    }

    request.complete(outcome);
    if let Some(callback) = callback {
        callback(&request);
    }
}

fn read_range(source: &dyn BlockSource, request: &IoRequest) -> Result<Arc<[u8]>, ArchiveError> {
    let size = source.size()?;
    let end = request.offset().checked_add(request.len());
    if end.map_or(true, |end| end > size) {
        return Err(ArchiveError::OutOfBounds {
            offset: request.offset(),
            len: request.len(),
            size,
        });
    }
    let mut buf = vec![0u8; request.len() as usize];
    source.read_at(request.offset(), &mut buf)?;
    if request.is_canceled() {
        return Err(ArchiveError::Canceled);
    }
    Ok(Arc::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryBlob;
    use std::sync::atomic::AtomicUsize;

    fn blob(len: usize) -> Arc<dyn BlockSource> {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        Arc::new(MemoryBlob::new("blob", Arc::from(data)))
    }

    #[test]
    fn test_read_and_callback() {
        let dispatcher = IoDispatcher::new(2);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let request = dispatcher.submit_read(
            blob(64),
            8,
            4,
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        request.wait();
        assert_eq!(&*request.bytes().unwrap().unwrap(), &[8, 9, 10, 11]);
        drop(dispatcher);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_size_request() {
        let dispatcher = IoDispatcher::new(1);
        let request = dispatcher.submit_size(blob(100), None);
        request.wait();
        assert_eq!(request.size().unwrap().unwrap(), 100);
    }

    #[test]
    fn test_out_of_bounds() {
        let dispatcher = IoDispatcher::new(1);
        let request = dispatcher.submit_read(blob(10), 8, 4, None);
        request.wait();
        assert!(matches!(
            request.bytes().unwrap(),
            Err(ArchiveError::OutOfBounds { .. })
        ));
        assert_eq!(dispatcher.stats().reads_failed.load(Ordering::Relaxed), 1);
    }
}
