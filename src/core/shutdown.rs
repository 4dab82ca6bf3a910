// src/core/shutdown.rs
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::lock::lock_mutex;

/// One-shot stop signal shared by a worker and its owner.
///
/// Triggering drops the only sender, which disconnects every listener at once.
/// Triggering twice is a no-op.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    /// Returns `true` only for the call that actually fired the signal.
    pub fn trigger(&self) -> bool {
        lock_mutex(&self.tx, "StopSignal::trigger").take().is_some()
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes ready (disconnected) once the signal fires.
    /// Meant for `crossbeam::select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Returns `true` if the signal fired within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_trigger_is_one_shot() {
        let stop = StopSignal::new();
        assert!(!stop.is_triggered());
        assert!(stop.trigger());
        assert!(!stop.trigger());
        assert!(stop.is_triggered());
    }

    #[test]
    fn test_clones_observe_trigger() {
        let stop = StopSignal::new();
        let listener = stop.clone();

        let handle = std::thread::spawn(move || {
            listener.wait();
            true
        });

        std::thread::sleep(Duration::from_millis(20));
        stop.trigger();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_timeout_without_trigger() {
        let stop = StopSignal::new();
        let started = Instant::now();
        assert!(!stop.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
