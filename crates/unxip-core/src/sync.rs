//! Blocking synchronization primitives shared by the pipeline stages.
//!
//! Everything here is a `Mutex` + `Condvar` pair: stages run on dedicated
//! threads and suspend by waiting on a predicate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::{Result, XipError};

/// Lock a mutex, ignoring poisoning.
///
/// A panicking stage is reported through its join handle; the state behind
/// these locks stays consistent because every critical section is a few
/// plain field updates.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Signal
// ============================================================================

/// One-shot completion flag that any number of threads can wait on.
#[derive(Debug, Default)]
pub struct Signal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A signal that is already raised.
    pub fn raised() -> Arc<Self> {
        let signal = Self::new();
        signal.raise();
        signal
    }

    pub fn raise(&self) {
        let mut raised = lock(&self.raised);
        *raised = true;
        self.condvar.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *lock(&self.raised)
    }

    /// Block until the signal is raised.
    pub fn wait(&self) {
        let mut raised = lock(&self.raised);
        while !*raised {
            raised = wait(&self.condvar, raised);
        }
    }
}

/// Raises a signal when dropped, including during unwinding.
pub(crate) struct RaiseOnDrop(pub Arc<Signal>);

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        self.0.raise();
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag shared by all stages of one extraction.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fail with [`XipError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(XipError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Memory Semaphore
// ============================================================================

/// Counting semaphore for a byte budget.
///
/// Permits are owned so they can travel with the work they account for.
#[derive(Debug)]
pub struct MemorySemaphore {
    budget: usize,
    available: Mutex<usize>,
    condvar: Condvar,
}

impl MemorySemaphore {
    pub fn new(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            budget,
            available: Mutex::new(budget),
            condvar: Condvar::new(),
        })
    }

    /// Acquire `amount` bytes, blocking while the budget is exhausted.
    ///
    /// Requests larger than the whole budget are clamped to it, so a single
    /// oversized file waits for everything else to drain instead of
    /// deadlocking.
    pub fn acquire(self: &Arc<Self>, amount: usize) -> MemoryPermit {
        let amount = amount.min(self.budget);
        let mut available = lock(&self.available);
        while *available < amount {
            available = wait(&self.condvar, available);
        }
        *available -= amount;
        MemoryPermit {
            semaphore: Arc::clone(self),
            amount,
        }
    }

    pub fn available(&self) -> usize {
        *lock(&self.available)
    }
}

#[derive(Debug)]
pub struct MemoryPermit {
    semaphore: Arc<MemorySemaphore>,
    amount: usize,
}

impl Drop for MemoryPermit {
    fn drop(&mut self) {
        let mut available = lock(&self.semaphore.available);
        *available += self.amount;
        self.semaphore.condvar.notify_all();
    }
}
