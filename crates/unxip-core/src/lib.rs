//! # unxip-core
//!
//! Streaming extraction of XIP software archives.
//!
//! A XIP is a XAR container whose `Content` member is a pbzx stream: a
//! sequence of independently XZ-compressed blocks which, once decoded and
//! concatenated, form an odc-cpio listing of the files to install.
//!
//! ## Pipeline
//!
//! ```text
//! input ─► ByteCursor ─► xar (locate Content, set cap)
//!                          │
//!                          ▼
//!          pbzx blocks ─► OrderedTaskPool (W decoders) ─► chunk channel (≤16)
//!                                                            │
//!                                                            ▼
//!          cpio headers ─► FileRecord ─► record channel (≤1 GiB) ─► Materializer
//! ```
//!
//! Every hop is a bounded handoff, so memory stays bounded no matter how
//! large the archive is. Decompression runs in parallel while chunks and
//! records are still delivered in archive order.

pub mod channel;
pub mod cpio;
pub mod cursor;
pub mod decmpfs;
pub mod materialize;
pub mod ordered;
pub mod pbzx;
pub mod pipeline;
pub mod sync;
pub mod testing;
pub mod worker;
pub mod xar;

pub use channel::{bounded, CountPolicy, LoadPolicy, Receiver, Sender, SizePolicy, Weighted};
pub use cpio::{EntryParser, FileRecord, FileType};
pub use cursor::{ByteCursor, ChunkSource, ReaderSource};
pub use materialize::{MaterializeOptions, Materializer};
pub use ordered::OrderedTaskPool;
pub use pipeline::{Unxip, UnxipOptions, UnxipStats};
pub use sync::CancelToken;
pub use xar::{ContentRange, TableOfContents, TocEntry};

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while extracting an archive.
///
/// The type is `Clone` so a failed pipeline stage can hand the same error to
/// every later reader of its output channel.
#[derive(Error, Debug, Clone)]
pub enum XipError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("truncated input at offset {offset}: wanted {wanted} bytes, {available} available")]
    TruncatedInput {
        offset: u64,
        wanted: u64,
        available: u64,
    },

    #[error("read of {len} bytes at offset {offset} crosses content boundary {cap}")]
    CapExceeded { offset: u64, len: u64, cap: u64 },

    #[error("bad {format} magic at offset {offset}: found {found:?}")]
    BadMagic {
        format: &'static str,
        offset: u64,
        found: String,
    },

    #[error("unsupported XAR version {0}")]
    UnsupportedVersion(u16),

    #[error("table of contents has no Content entry")]
    MissingContentEntry,

    #[error("malformed table of contents: {0}")]
    MalformedToc(String),

    #[error("corrupt pbzx chunk {index} at offset {offset}: {reason}")]
    CorruptChunk {
        index: u64,
        offset: u64,
        reason: String,
    },

    #[error("corrupt cpio entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("refusing to extract unsafe path {0:?}")]
    UnsafePath(String),

    #[error("unknown file type {mode:#o} for entry {name:?}")]
    UnknownFileType { name: String, mode: u32 },

    #[error("channel closed")]
    ChannelClosed,

    #[error("extraction cancelled")]
    Cancelled,

    #[error("{0} stage panicked")]
    StagePanicked(&'static str),
}

impl From<io::Error> for XipError {
    fn from(err: io::Error) -> Self {
        XipError::Io(Arc::new(err))
    }
}

impl XipError {
    /// Whether this error is only a consequence of another stage failing.
    ///
    /// The pipeline prefers reporting the root cause over these.
    pub fn is_secondary(&self) -> bool {
        matches!(self, XipError::ChannelClosed | XipError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, XipError>;
