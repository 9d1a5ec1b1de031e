//! Paired request/acknowledge signals between the owning and loading threads

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct SuspendFlags {
    requested: bool,
    acknowledged: bool,
}

/// Cooperative suspension checkpoint.
///
/// The owning thread requests a suspension and waits for the loading thread
/// to park at its next checkpoint; resuming releases it.
#[derive(Debug, Default)]
pub struct SuspendSignal {
    flags: Mutex<SuspendFlags>,
    cond: Condvar,
}

impl SuspendSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flags.lock().requested = true;
        self.cond.notify_all();
    }

    pub fn resume(&self) {
        let mut flags = self.flags.lock();
        flags.requested = false;
        self.cond.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.flags.lock().requested
    }

    pub fn is_acknowledged(&self) -> bool {
        self.flags.lock().acknowledged
    }

    /// Block until the loading thread has parked or `abort` is raised
    pub fn wait_acknowledged(&self, abort: &AtomicBool) -> bool {
        let mut flags = self.flags.lock();
        while flags.requested && !flags.acknowledged {
            if abort.load(Ordering::Acquire) {
                return false;
            }
            self.cond.wait_for(&mut flags, POLL);
        }
        flags.acknowledged
    }

    /// Park here while a suspension is requested. Returns true if parked.
    pub fn checkpoint(&self, abort: &AtomicBool) -> bool {
        let mut flags = self.flags.lock();
        if !flags.requested {
            return false;
        }
        flags.acknowledged = true;
        self.cond.notify_all();
        while flags.requested && !abort.load(Ordering::Acquire) {
            self.cond.wait_for(&mut flags, POLL);
        }
        flags.acknowledged = false;
        true
    }
}

/// Numbered cancel requests, each acknowledged once drained
#[derive(Debug, Default)]
pub struct CancelSignal {
    // (requested, handled)
    epochs: Mutex<(u64, u64)>,
    cond: Condvar,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cancel, returning its epoch
    pub fn request(&self) -> u64 {
        let mut epochs = self.epochs.lock();
        epochs.0 += 1;
        epochs.0
    }

    /// Newest unhandled epoch
    pub fn pending(&self) -> Option<u64> {
        let epochs = self.epochs.lock();
        (epochs.0 > epochs.1).then_some(epochs.0)
    }

    pub fn acknowledge(&self, epoch: u64) {
        let mut epochs = self.epochs.lock();
        epochs.1 = epochs.1.max(epoch);
        self.cond.notify_all();
    }

    /// Block until `epoch` is handled or `abort` is raised
    pub fn wait(&self, epoch: u64, abort: &AtomicBool) -> bool {
        let mut epochs = self.epochs.lock();
        while epochs.1 < epoch {
            if abort.load(Ordering::Acquire) {
                return false;
            }
            self.cond.wait_for(&mut epochs, POLL);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_suspend_checkpoint() {
        let signal = Arc::new(SuspendSignal::new());
        let abort = Arc::new(AtomicBool::new(false));
        assert!(!signal.checkpoint(&abort));

        signal.request();
        let worker = {
            let signal = Arc::clone(&signal);
            let abort = Arc::clone(&abort);
            thread::spawn(move || signal.checkpoint(&abort))
        };
        assert!(signal.wait_acknowledged(&abort));
        signal.resume();
        assert!(worker.join().unwrap());
        assert!(!signal.is_acknowledged());
    }

    #[test]
    fn test_suspend_abort() {
        let signal = SuspendSignal::new();
        let abort = AtomicBool::new(true);
        signal.request();
        assert!(!signal.wait_acknowledged(&abort));
        assert!(signal.checkpoint(&abort));
    }

    #[test]
    fn test_cancel_epochs() {
        let signal = Arc::new(CancelSignal::new());
        let abort = AtomicBool::new(false);
        assert_eq!(signal.pending(), None);
        let first = signal.request();
        let second = signal.request();
        assert_eq!(signal.pending(), Some(second));

        let handler = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                let epoch = signal.pending().unwrap();
                signal.acknowledge(epoch);
            })
        };
        assert!(signal.wait(first, &abort));
        handler.join().unwrap();
        assert_eq!(signal.pending(), None);
    }
}
