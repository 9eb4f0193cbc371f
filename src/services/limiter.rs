use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("concurrency capacity must be at least 1")]
    ZeroCapacity,

    #[error("concurrency limiter has been closed")]
    Closed,
}

#[derive(Debug)]
struct LimiterInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounded-parallelism admission gate.
///
/// Backed by a tokio [`Semaphore`], which hands permits out in FIFO order,
/// so waiters are admitted in the order they called [`acquire`](Self::acquire).
/// Cloning shares the same capacity.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    /// Create a limiter admitting at most `capacity` holders at once.
    ///
    /// A capacity of 0 would never admit anything and is rejected.
    pub fn new(capacity: usize) -> Result<Self, LimiterError> {
        if capacity == 0 {
            return Err(LimiterError::ZeroCapacity);
        }

        Ok(Self {
            inner: Arc::new(LimiterInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        })
    }

    /// Wait for a free slot. The slot is released when the guard is dropped.
    pub async fn acquire(&self) -> Result<ConcurrencySlot, LimiterError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;

        let running = self.inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(running, Ordering::SeqCst);

        Ok(ConcurrencySlot {
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Run `task` inside a slot
    pub async fn execute<F, T>(&self, task: F) -> Result<T, LimiterError>
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire().await?;
        Ok(task.await)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently held
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Highest number of slots ever held at the same time
    pub fn peak_running(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Fail every current and future waiter with [`LimiterError::Closed`].
    /// Slots already held stay valid until dropped.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

/// One unit of admission capacity, released exactly once on drop
#[derive(Debug)]
pub struct ConcurrencySlot {
    inner: Arc<LimiterInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        // The permit field drops after this, so `running` never exceeds held permits
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
    }
}
