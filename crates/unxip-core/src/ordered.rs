//! Fixed-width concurrent scheduler that emits results in submission order.
//!
//! Two chains of one-shot signals do the bookkeeping:
//!
//! ```text
//! admission:  submit(i) waits for  completed[i - W]
//! emission:   job(i)    waits for  emitted[i - 1]   then pushes its result
//! ```
//!
//! Work runs in parallel on `W` workers and finishes in any order, but a
//! result only enters the output channel after its predecessor's did. At
//! most `W` results are ever held outside the channel.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::channel::{LoadPolicy, Sender};
use crate::sync::{CancelToken, RaiseOnDrop, Signal};
use crate::worker::WorkerPool;
use crate::{Result, XipError};

pub struct OrderedTaskPool<T, P> {
    width: usize,
    workers: WorkerPool,
    output: Arc<Sender<T, P>>,
    /// Completion signals of the most recent `width` submissions.
    in_flight: VecDeque<Arc<Signal>>,
    /// Emission signal of the most recent submission.
    last_emitted: Arc<Signal>,
    next_index: u64,
    cancel: CancelToken,
}

impl<T, P> OrderedTaskPool<T, P>
where
    T: Send + 'static,
    P: LoadPolicy<T> + 'static,
{
    /// Create a pool running at most `width` units at once and delivering
    /// their results, in order, to `output`.
    pub fn new(width: usize, output: Sender<T, P>, cancel: CancelToken) -> Result<Self> {
        let width = width.max(1);
        Ok(Self {
            width,
            workers: WorkerPool::new("decode", width, width)?,
            output: Arc::new(output),
            in_flight: VecDeque::with_capacity(width),
            last_emitted: Signal::raised(),
            next_index: 0,
            cancel,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of submissions so far.
    pub fn submitted(&self) -> u64 {
        self.next_index
    }

    /// Submit a unit of work and return its sequence index.
    ///
    /// Blocks until the submission `width` places earlier has completed.
    pub fn submit<F>(&mut self, work: F) -> Result<u64>
    where
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        self.cancel.check()?;

        if self.in_flight.len() >= self.width {
            if let Some(oldest) = self.in_flight.pop_front() {
                oldest.wait();
            }
        }

        let index = self.next_index;
        self.next_index += 1;

        let completed = Signal::new();
        let emitted = Signal::new();
        let predecessor = std::mem::replace(&mut self.last_emitted, emitted.clone());
        self.in_flight.push_back(completed.clone());

        let output = self.output.clone();
        let cancel = self.cancel.clone();
        self.workers.execute(move || {
            // Dropped in reverse order: emitted first, then completed.
            let _completed = RaiseOnDrop(completed);
            let _emitted = RaiseOnDrop(emitted);

            let result = cancel.check().and_then(|()| work(&cancel));
            predecessor.wait();

            match result {
                Ok(value) => {
                    if output.push(value).is_err() {
                        cancel.cancel();
                    }
                }
                Err(error) => {
                    tracing::debug!(index, %error, "ordered task failed");
                    cancel.cancel();
                    output.finish_with_error(error);
                }
            }
        })?;

        Ok(index)
    }

    /// Wait for every submission to be emitted, then finish the output.
    pub fn finish(self) -> Result<()> {
        self.last_emitted.wait();
        self.output.finish();
        self.workers.join();
        if self.cancel.is_cancelled() && self.output.is_receiver_alive() {
            // A unit failed; its error already sits in the output channel.
            return Err(XipError::Cancelled);
        }
        Ok(())
    }

    /// Cancel outstanding work and fail the output with `error`.
    pub fn abort(self, error: XipError) {
        self.cancel.cancel();
        self.output.finish_with_error(error);
        self.workers.join();
    }
}
