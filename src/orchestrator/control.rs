use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// What a worker should do after a poll point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Stop,
}

/// Point-in-time view of the run flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus {
    pub is_processing: bool,
    pub is_paused: bool,
    pub should_stop: bool,
}

#[derive(Debug)]
struct ControlInner {
    processing: AtomicBool,
    pause_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
}

/// Pause/stop flags of one orchestrator.
///
/// Cheap to clone; every clone controls the same run. Flags live in watch
/// channels so waiting workers are woken as soon as they change.
#[derive(Debug, Clone)]
pub struct RunControl {
    inner: Arc<ControlInner>,
}

impl RunControl {
    pub fn new() -> Self {
        let (pause_tx, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControlInner {
                processing: AtomicBool::new(false),
                pause_tx,
                stop_tx,
            }),
        }
    }

    pub fn pause(&self) {
        if !self.inner.pause_tx.send_replace(true) {
            tracing::info!("Batch paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.pause_tx.send_replace(false) {
            tracing::info!("Batch resumed");
        }
    }

    /// Ask the run to stop. Admitted items finish their current call and
    /// abort at the next poll point; queued items are never started.
    pub fn stop(&self) {
        if !self.inner.stop_tx.send_replace(true) {
            tracing::info!("Stop requested");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.pause_tx.borrow()
    }

    pub fn should_stop(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            is_processing: self.is_processing(),
            is_paused: self.is_paused(),
            should_stop: self.should_stop(),
        }
    }

    /// Mark a run as started and clear stale flags. Returns false if a run
    /// is already active.
    pub(crate) fn begin(&self) -> bool {
        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.inner.pause_tx.send_replace(false);
        self.inner.stop_tx.send_replace(false);
        true
    }

    pub(crate) fn finish(&self) {
        self.inner.processing.store(false, Ordering::SeqCst);
    }

    /// Resolve once stop has been requested
    pub async fn stopped(&self) {
        let mut rx = self.inner.stop_tx.subscribe();
        // The sender lives as long as `self`, so this only returns on stop
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Poll point: returns at once unless paused. While paused, waits for a
    /// pause/stop change, re-checking every `poll_interval` regardless.
    pub async fn checkpoint(&self, poll_interval: Duration) -> Checkpoint {
        let mut pause_rx = self.inner.pause_tx.subscribe();
        let mut stop_rx = self.inner.stop_tx.subscribe();

        loop {
            if self.should_stop() {
                return Checkpoint::Stop;
            }
            if !self.is_paused() {
                return Checkpoint::Continue;
            }

            tokio::select! {
                _ = pause_rx.changed() => {}
                _ = stop_rx.changed() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}
