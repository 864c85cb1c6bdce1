//! Fixed-size FIFO worker pool.
//!
//! Jobs are dequeued in exactly the order they were submitted. Stages that
//! let a job block on an *earlier* job (ordered emission, parent directories,
//! hardlink originals) rely on this: by the time a job runs, every job it can
//! wait on has already been picked up by some worker, so waits always
//! terminate.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};

use crate::{Result, XipError};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: &'static str,
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `unxip-{name}-{i}`.
    ///
    /// `queue_capacity` bounds how many jobs may wait for a worker; further
    /// submissions block.
    pub fn new(name: &'static str, threads: usize, queue_capacity: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity.max(1));

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("unxip-{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!(pool = name, "worker job panicked");
                        }
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            name,
            tx: Some(tx),
            handles,
        })
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queue a job, blocking while the queue is full.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(XipError::ChannelClosed)?;
        tx.send(Box::new(job)).map_err(|_| XipError::ChannelClosed)
    }

    /// Stop accepting jobs and wait for every queued job to finish.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.tx.take());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!(pool = self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
