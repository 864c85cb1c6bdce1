//! Dependency-ordered filesystem writes.
//!
//! Each record becomes one job on a FIFO [`WorkerPool`]. A job first waits
//! for the jobs it depends on:
//!
//! - the job that created its parent directory,
//! - for a hardlink, the job that wrote the original file.
//!
//! Both are always submitted earlier, so by the time a job waits on them
//! they have been dequeued by some worker and will finish.
//!
//! Per-file OS errors are logged and counted; they never stop the run.
//! Only an entry type that cannot be represented is fatal.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::instrument;

use crate::channel::{LoadPolicy, Receiver};
use crate::cpio::{FileRecord, FileType};
use crate::decmpfs;
use crate::sync::{MemoryPermit, MemorySemaphore, RaiseOnDrop, Signal};
use crate::worker::WorkerPool;
use crate::{Result, XipError};

/// Default ceiling on file data queued for writing.
pub const DEFAULT_WRITE_BUDGET: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    /// Writer threads.
    pub threads: usize,
    /// Bytes of file data allowed to wait for a writer.
    pub write_budget: usize,
    /// Store regular files with transparent compression where supported.
    pub compress: bool,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            write_budget: DEFAULT_WRITE_BUDGET,
            compress: false,
        }
    }
}

/// What was written. Failures are entries that were skipped after an OS
/// error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub failures: u64,
    pub bytes_written: u64,
    pub compressed_files: u64,
}

#[derive(Debug, Default)]
struct Counters {
    directories: AtomicU64,
    files: AtomicU64,
    symlinks: AtomicU64,
    hardlinks: AtomicU64,
    failures: AtomicU64,
    bytes_written: AtomicU64,
    compressed_files: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MaterializeStats {
        MaterializeStats {
            directories: self.directories.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            symlinks: self.symlinks.load(Ordering::Relaxed),
            hardlinks: self.hardlinks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            compressed_files: self.compressed_files.load(Ordering::Relaxed),
        }
    }
}

enum Operation {
    Directory,
    Regular { compress: bool },
    Symlink,
    Hardlink { original: PathBuf },
}

/// One pending filesystem operation.
struct Task {
    path: PathBuf,
    record: FileRecord,
    operation: Operation,
    dependencies: Vec<Arc<Signal>>,
}

impl Task {
    fn run(&self, counters: &Counters) -> io::Result<()> {
        for dependency in &self.dependencies {
            dependency.wait();
        }

        let mode = self.record.permissions();
        match &self.operation {
            Operation::Directory => {
                match DirBuilder::new().mode(mode).create(&self.path) {
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists && self.path.is_dir() => {}
                    result => result?,
                }
                fs::set_permissions(&self.path, Permissions::from_mode(mode))?;
                Counters::bump(&counters.directories, 1);
            }
            Operation::Regular { compress } => {
                let contents = self.record.contents();
                let compressed = decmpfs::write_file(&self.path, &contents, *compress)?;
                // Exact bits, regardless of the umask applied at creation.
                fs::set_permissions(&self.path, Permissions::from_mode(mode))?;
                Counters::bump(&counters.files, 1);
                Counters::bump(&counters.bytes_written, contents.len() as u64);
                Counters::bump(&counters.compressed_files, u64::from(compressed));
            }
            Operation::Symlink => {
                let target = self.record.contents();
                std::os::unix::fs::symlink(OsStr::from_bytes(&target), &self.path)?;
                Counters::bump(&counters.symlinks, 1);
            }
            Operation::Hardlink { original } => {
                fs::hard_link(original, &self.path)?;
                Counters::bump(&counters.hardlinks, 1);
            }
        }

        if self.record.is_sticky() && !matches!(self.operation, Operation::Symlink) {
            fs::set_permissions(&self.path, Permissions::from_mode(self.record.mode & 0o7777))?;
        }
        Ok(())
    }
}

pub struct Materializer {
    root: PathBuf,
    compress: bool,
    workers: WorkerPool,
    budget: Arc<MemorySemaphore>,
    /// Creation signal of every directory seen, by archive path.
    directories: HashMap<String, Arc<Signal>>,
    /// First entry seen for each `(dev, ino)`, with its write signal.
    originals: HashMap<(u64, u64), (PathBuf, Arc<Signal>)>,
    counters: Arc<Counters>,
}

impl Materializer {
    /// Materialize records under `root`, which must already exist.
    pub fn new(root: impl Into<PathBuf>, options: MaterializeOptions) -> Result<Self> {
        let threads = options.threads.max(1);
        Ok(Self {
            root: root.into(),
            compress: options.compress,
            workers: WorkerPool::new("write", threads, threads * 4)?,
            budget: MemorySemaphore::new(options.write_budget.max(1)),
            directories: HashMap::new(),
            originals: HashMap::new(),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Schedule the filesystem operation for one record.
    pub fn materialize(&mut self, record: FileRecord) -> Result<()> {
        if record.name == "." {
            return Ok(());
        }
        let file_type = record.file_type().ok_or_else(|| XipError::UnknownFileType {
            name: record.name.clone(),
            mode: record.mode,
        })?;

        let path = self.root.join(&record.name);
        let done = Signal::new();
        let mut dependencies = Vec::with_capacity(2);
        if let Some(parent) = record.parent().and_then(|p| self.directories.get(p)) {
            dependencies.push(parent.clone());
        }

        let operation = match file_type {
            FileType::Directory => {
                self.directories.insert(record.name.clone(), done.clone());
                Operation::Directory
            }
            _ => match self.originals.get(&record.identifier()) {
                Some((original, written)) => {
                    dependencies.push(written.clone());
                    Operation::Hardlink {
                        original: original.clone(),
                    }
                }
                None => {
                    self.originals
                        .insert(record.identifier(), (path.clone(), done.clone()));
                    match file_type {
                        FileType::Symlink => Operation::Symlink,
                        _ => Operation::Regular {
                            compress: self.compress,
                        },
                    }
                }
            },
        };

        let permit: Option<MemoryPermit> = match operation {
            Operation::Regular { .. } => Some(self.budget.acquire(record.size())),
            _ => None,
        };
        let task = Task {
            path,
            record,
            operation,
            dependencies,
        };
        let counters = self.counters.clone();

        self.workers.execute(move || {
            let _done = RaiseOnDrop(done);
            let _permit = permit;
            if let Err(e) = task.run(&counters) {
                tracing::warn!(
                    path = %task.path.display(),
                    errno = e.raw_os_error().unwrap_or(0),
                    error = %e,
                    "failed to materialize entry"
                );
                Counters::bump(&counters.failures, 1);
            }
        })
    }

    /// Materialize every record from `records`, then wait for the writers.
    #[instrument(skip_all, fields(root = %self.root.display()), level = "debug")]
    pub fn run<P: LoadPolicy<FileRecord>>(
        mut self,
        records: &Receiver<FileRecord, P>,
    ) -> Result<MaterializeStats> {
        let result = self.consume(records);
        let stats = self.finish();
        result.map(|()| stats)
    }

    fn consume<P: LoadPolicy<FileRecord>>(&mut self, records: &Receiver<FileRecord, P>) -> Result<()> {
        while let Some(record) = records.pop()? {
            self.materialize(record)?;
        }
        Ok(())
    }

    /// Wait for every scheduled operation and report what was written.
    pub fn finish(self) -> MaterializeStats {
        self.workers.join();
        let stats = self.counters.snapshot();
        tracing::debug!(
            directories = stats.directories,
            files = stats.files,
            symlinks = stats.symlinks,
            hardlinks = stats.hardlinks,
            failures = stats.failures,
            "materialization finished"
        );
        stats
    }
}
