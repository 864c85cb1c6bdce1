//! Bounded single-producer/single-consumer channel with pluggable
//! backpressure.
//!
//! The writer suspends after a push that leaves the channel "loaded" and is
//! resumed by the pop that brings the load back under the ceiling. What
//! "load" means is decided by a [`LoadPolicy`]: element count between the
//! chunk splitter and the entry parser, referenced bytes between the parser
//! and the materializer.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;

use crate::sync::{lock, wait};
use crate::{Result, XipError};

// ============================================================================
// Policies
// ============================================================================

/// Backpressure accounting for a [`bounded`] channel.
pub trait LoadPolicy<T>: Send {
    /// Account for an element entering the channel.
    fn add(&mut self, item: &T);

    /// Account for an element leaving the channel.
    fn remove(&mut self, item: &T);

    /// Current load, in policy units.
    fn load(&self) -> usize;

    /// Whether the writer should wait before pushing more.
    fn is_loaded(&self) -> bool;
}

/// Ceiling on the number of buffered elements.
#[derive(Debug, Clone)]
pub struct CountPolicy {
    count: usize,
    limit: usize,
}

impl CountPolicy {
    pub fn new(limit: usize) -> Self {
        Self {
            count: 0,
            limit: limit.max(1),
        }
    }
}

impl<T> LoadPolicy<T> for CountPolicy {
    fn add(&mut self, _item: &T) {
        self.count += 1;
    }

    fn remove(&mut self, _item: &T) {
        self.count = self.count.saturating_sub(1);
    }

    fn load(&self) -> usize {
        self.count
    }

    fn is_loaded(&self) -> bool {
        self.count >= self.limit
    }
}

/// Elements that carry a byte weight for [`SizePolicy`].
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for Bytes {
    fn weight(&self) -> usize {
        self.len()
    }
}

/// Ceiling on the summed weight of buffered elements.
#[derive(Debug, Clone)]
pub struct SizePolicy {
    total: usize,
    limit: usize,
}

impl SizePolicy {
    pub fn new(limit: usize) -> Self {
        Self {
            total: 0,
            limit: limit.max(1),
        }
    }
}

impl<T: Weighted> LoadPolicy<T> for SizePolicy {
    fn add(&mut self, item: &T) {
        self.total += item.weight();
    }

    fn remove(&mut self, item: &T) {
        self.total = self.total.saturating_sub(item.weight());
    }

    fn load(&self) -> usize {
        self.total
    }

    fn is_loaded(&self) -> bool {
        self.total >= self.limit
    }
}

// ============================================================================
// Channel
// ============================================================================

struct State<T, P> {
    queue: VecDeque<T>,
    policy: P,
    finished: bool,
    error: Option<XipError>,
    receiver_alive: bool,
    peak: usize,
}

struct Shared<T, P> {
    state: Mutex<State<T, P>>,
    readable: Condvar,
    writable: Condvar,
}

/// Create a bounded channel governed by `policy`.
pub fn bounded<T, P: LoadPolicy<T>>(policy: P) -> (Sender<T, P>, Receiver<T, P>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            policy,
            finished: false,
            error: None,
            receiver_alive: true,
            peak: 0,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

/// Writing half. Dropping it finishes the channel.
pub struct Sender<T, P> {
    shared: Arc<Shared<T, P>>,
}

impl<T, P: LoadPolicy<T>> Sender<T, P> {
    /// Append an element, then wait while the policy reports loaded.
    ///
    /// Fails with [`XipError::ChannelClosed`] if the channel was finished or
    /// the receiver went away.
    pub fn push(&self, item: T) -> Result<()> {
        let mut state = lock(&self.shared.state);
        if state.finished || !state.receiver_alive {
            return Err(XipError::ChannelClosed);
        }

        state.policy.add(&item);
        state.queue.push_back(item);
        state.peak = state.peak.max(state.policy.load());
        self.shared.readable.notify_one();

        while state.policy.is_loaded() {
            if !state.receiver_alive || state.error.is_some() {
                return Err(XipError::ChannelClosed);
            }
            if state.finished {
                break;
            }
            state = wait(&self.shared.writable, state);
        }
        Ok(())
    }

    /// Mark the end of the stream. Idempotent.
    pub fn finish(&self) {
        let mut state = lock(&self.shared.state);
        if !state.finished {
            state.finished = true;
            self.shared.readable.notify_all();
            self.shared.writable.notify_all();
        }
    }

    /// Mark the stream as failed. Only the first terminal transition counts.
    pub fn finish_with_error(&self, error: XipError) {
        let mut state = lock(&self.shared.state);
        if !state.finished {
            state.finished = true;
            state.error = Some(error);
            self.shared.readable.notify_all();
            self.shared.writable.notify_all();
        }
    }

    /// Whether the reading half is still around.
    pub fn is_receiver_alive(&self) -> bool {
        lock(&self.shared.state).receiver_alive
    }
}

impl<T, P> Drop for Sender<T, P> {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        state.finished = true;
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }
}

/// Reading half. Dropping it makes pending and future pushes fail.
pub struct Receiver<T, P> {
    shared: Arc<Shared<T, P>>,
}

impl<T, P: LoadPolicy<T>> Receiver<T, P> {
    /// Take the next element.
    ///
    /// Returns `Ok(None)` once the channel is finished and drained. Elements
    /// pushed before `finish_with_error` are still delivered; every call after
    /// that returns the error.
    pub fn pop(&self) -> Result<Option<T>> {
        let mut state = lock(&self.shared.state);
        loop {
            if let Some(item) = state.queue.pop_front() {
                let was_loaded = state.policy.is_loaded();
                state.policy.remove(&item);
                if was_loaded && !state.policy.is_loaded() {
                    self.shared.writable.notify_one();
                }
                return Ok(Some(item));
            }
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.finished {
                return Ok(None);
            }
            state = wait(&self.shared.readable, state);
        }
    }

    /// Highest load observed since the channel was created.
    pub fn peak_load(&self) -> usize {
        lock(&self.shared.state).peak
    }

    /// Number of elements currently buffered.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, P> Drop for Receiver<T, P> {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        state.receiver_alive = false;
        self.shared.writable.notify_all();
    }
}
