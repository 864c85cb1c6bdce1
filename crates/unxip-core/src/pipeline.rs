//! End-to-end extraction.
//!
//! ```text
//! caller thread    locate Content ─┐                 ┌─► Materializer (unxip-write-N)
//!                                  ▼                 │
//! unxip-pbzx       ChunkSplitter (unxip-decode-N) ─► chunks ─► unxip-cpio EntryParser ─► records
//! ```
//!
//! Each stage owns one end of a bounded channel. A failing stage finishes its
//! output with the error and cancels the shared token; downstream stages see
//! the error, upstream stages see a closed channel.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::instrument;

use crate::channel::{bounded, CountPolicy, SizePolicy};
use crate::cpio::EntryParser;
use crate::cursor::{ByteCursor, ReaderSource, DEFAULT_READ_SIZE};
use crate::materialize::{MaterializeOptions, MaterializeStats, Materializer};
use crate::pbzx::{ChunkSplitter, SplitStats};
use crate::sync::CancelToken;
use crate::xar::{self, ContentRange};
use crate::{Result, XipError};

// ============================================================================
// Configuration
// ============================================================================

/// Extraction configuration
#[derive(Clone, Debug)]
pub struct UnxipOptions {
    /// Decoder and writer threads (default: num_cpus)
    pub threads: usize,
    /// Decoded chunks buffered ahead of the parser (default: 16)
    pub chunk_buffer: usize,
    /// Bytes of parsed file data buffered ahead of the writers (default: 1GB)
    pub record_budget: usize,
    /// Store files with transparent compression where supported (default: off)
    pub compress: bool,
    /// Size of each read from the input (default: 4MB)
    pub read_size: usize,
}

impl Default for UnxipOptions {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            chunk_buffer: 16,
            record_budget: 1024 * 1024 * 1024,
            compress: false,
            read_size: DEFAULT_READ_SIZE,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Extraction statistics
#[derive(Debug, Clone)]
pub struct UnxipStats {
    pub content: ContentRange,
    pub chunks: SplitStats,
    pub records: u64,
    pub files: MaterializeStats,
    pub duration: Duration,
}

impl UnxipStats {
    /// Decompressed payload throughput in MiB/s.
    pub fn throughput_mib(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.chunks.decompressed_bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Unxip {
    options: UnxipOptions,
}

impl Unxip {
    pub fn new(options: UnxipOptions) -> Self {
        Self { options }
    }

    pub fn with_default_options() -> Self {
        Self::new(UnxipOptions::default())
    }

    pub fn options(&self) -> &UnxipOptions {
        &self.options
    }

    /// Extract the archive read from `input` into `destination` (blocking).
    #[instrument(skip(self, input), fields(destination = %destination.display()))]
    pub fn run<R: Read + Send + 'static>(&self, input: R, destination: &Path) -> Result<UnxipStats> {
        let start = Instant::now();
        let threads = self.options.threads.max(1);
        fs::create_dir_all(destination)?;

        if self.options.compress && !cfg!(target_os = "macos") {
            tracing::warn!("transparent compression is only available on macOS; writing plain files");
        }

        let mut cursor = ByteCursor::new(ReaderSource::with_read_size(input, self.options.read_size));
        let content = xar::locate_content(&mut cursor)?;

        let cancel = CancelToken::new();
        let (chunk_tx, chunk_rx) = bounded(CountPolicy::new(self.options.chunk_buffer));
        let (record_tx, record_rx) = bounded(SizePolicy::new(self.options.record_budget));

        let splitter = ChunkSplitter::new(threads, chunk_tx, cancel.clone())?;
        let split_handle: JoinHandle<Result<SplitStats>> = thread::Builder::new()
            .name("unxip-pbzx".into())
            .spawn(move || splitter.run(&mut cursor))?;

        let parse_handle: JoinHandle<Result<u64>> = thread::Builder::new()
            .name("unxip-cpio".into())
            .spawn(move || EntryParser::new(ByteCursor::new(chunk_rx)).run(&record_tx))?;

        let materialized = Materializer::new(
            destination,
            MaterializeOptions {
                threads,
                write_budget: self.options.record_budget,
                compress: self.options.compress,
            },
        )
        .and_then(|materializer| materializer.run(&record_rx));
        if materialized.is_err() {
            cancel.cancel();
        }
        // Unblocks a parser waiting on a full record channel.
        drop(record_rx);

        let records = join_stage(parse_handle, "cpio");
        let split = join_stage(split_handle, "pbzx");

        let (chunks, records, files) = match (split, records, materialized) {
            (Ok(chunks), Ok(records), Ok(files)) => (chunks, records, files),
            (split, records, files) => {
                let errors = [split.err(), records.err(), files.err()];
                return Err(root_cause(errors));
            }
        };

        let stats = UnxipStats {
            content,
            chunks,
            records,
            files,
            duration: start.elapsed(),
        };

        tracing::info!(
            "Extraction complete: {} files, {} directories, {} symlinks, {} hardlinks, {} failures, {} bytes, {} chunks, {:.2}s",
            stats.files.files,
            stats.files.directories,
            stats.files.symlinks,
            stats.files.hardlinks,
            stats.files.failures,
            stats.files.bytes_written,
            stats.chunks.blocks,
            stats.duration.as_secs_f64()
        );

        Ok(stats)
    }
}

fn join_stage<T>(handle: JoinHandle<Result<T>>, stage: &'static str) -> Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(XipError::StagePanicked(stage)))
}

/// Pick the error to report, upstream first: the first one that is not a
/// mere consequence of another stage failing.
fn root_cause(errors: [Option<XipError>; 3]) -> XipError {
    let mut fallback = None;
    for error in errors.into_iter().flatten() {
        if !error.is_secondary() {
            return error;
        }
        if fallback.is_none() {
            fallback = Some(error);
        }
    }
    fallback.unwrap_or(XipError::Cancelled)
}
