//! Synthetic archive construction.
//!
//! Writes the three layers the extractor reads (odc cpio, pbzx, XAR) from a
//! list of entries, so tests and benches can produce archives of any shape
//! without shipping binary fixtures.
//!
//! # Usage
//!
//! ```ignore
//! use unxip_core::testing::ArchiveBuilder;
//!
//! let archive = ArchiveBuilder::new()
//!     .directory("a", 0o755)
//!     .file("a/b.txt", 0o644, "hello")
//!     .symlink("a/c", "b.txt")
//!     .hardlink("a/d", "a/b.txt")
//!     .chunk_size(4096)
//!     .build()?;
//! ```

use std::io::{self, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use xz2::write::XzEncoder;

use crate::cpio::{CPIO_MAGIC, S_IFDIR, S_IFLNK, S_IFREG, TRAILER};
use crate::pbzx::PBZX_MAGIC;
use crate::xar::{XAR_HEADER_LEN, XAR_MAGIC, XAR_VERSION};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// Size of the SHA-1 checksum slot at the start of the heap.
const CHECKSUM_LEN: usize = 20;
const METADATA: &[u8] = b"<metadata/>";

/// One cpio entry to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub mode: u32,
    pub dev: u64,
    pub ino: u64,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    pub fn directory(name: &str, perm: u32) -> Self {
        Self::new(name, S_IFDIR | perm, Vec::new())
    }

    pub fn file(name: &str, perm: u32, data: impl Into<Vec<u8>>) -> Self {
        Self::new(name, S_IFREG | perm, data.into())
    }

    pub fn symlink(name: &str, target: &str) -> Self {
        Self::new(name, S_IFLNK | 0o755, target.as_bytes().to_vec())
    }

    pub fn new(name: &str, mode: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            mode,
            dev: 1,
            ino: 0,
            data,
        }
    }

    pub fn with_ino(mut self, ino: u64) -> Self {
        self.ino = ino;
        self
    }
}

fn octal(out: &mut Vec<u8>, value: u64, width: usize) {
    let digits = format!("{:0width$o}", value, width = width);
    out.extend_from_slice(&digits.as_bytes()[digits.len() - width..]);
}

fn cpio_header(out: &mut Vec<u8>, entry: &ArchiveEntry) {
    out.extend_from_slice(CPIO_MAGIC);
    octal(out, entry.dev, 6);
    octal(out, entry.ino, 6);
    octal(out, u64::from(entry.mode), 6);
    octal(out, 0, 6); // uid
    octal(out, 0, 6); // gid
    octal(out, 1, 6); // nlink
    octal(out, 0, 6); // rdev
    octal(out, 0, 11); // mtime
    octal(out, entry.name.len() as u64 + 1, 6);
    octal(out, entry.data.len() as u64, 11);
    out.extend_from_slice(entry.name.as_bytes());
    out.push(0);
}

/// An odc cpio listing of `entries`, trailer included.
pub fn cpio_bytes(entries: &[ArchiveEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        cpio_header(&mut out, entry);
        out.extend_from_slice(&entry.data);
    }
    cpio_header(&mut out, &ArchiveEntry::new(TRAILER, 0, Vec::new()));
    out
}

pub fn xz_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data)?;
    encoder.finish()
}

/// Frame `payload` as pbzx with `chunk_size` blocks.
///
/// Full blocks are stored raw when `compress` is off or XZ does not shrink
/// them. The last partial block is always XZ, since a stored block must be
/// exactly `chunk_size` bytes.
pub fn pbzx_stream(payload: &[u8], chunk_size: usize, compress: bool) -> io::Result<Vec<u8>> {
    let chunk_size = chunk_size.max(1);
    let mut out = PBZX_MAGIC.to_vec();
    out.extend_from_slice(&(chunk_size as u64).to_be_bytes());

    let mut blocks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
    if blocks.is_empty() {
        blocks.push(&[]);
    }
    for block in blocks {
        let full = block.len() == chunk_size;
        let xz = if full && !compress {
            None
        } else {
            Some(xz_compress(block)?)
        };
        let encoded = match xz {
            Some(xz) if xz.len() < chunk_size || (!full && xz.len() != chunk_size) => xz,
            Some(_) if !full => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "compressed block would read as stored; pick another chunk size",
                ))
            }
            _ => block.to_vec(),
        };
        out.extend_from_slice(&(block.len() as u64).to_be_bytes());
        out.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
        out.extend_from_slice(&encoded);
    }
    Ok(out)
}

/// A XAR archive with the given TOC document and heap.
pub fn xar_bytes_with_toc(toc: &str, heap: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(toc.as_bytes())?;
    let compressed = encoder.finish()?;

    let mut out = XAR_MAGIC.to_vec();
    out.extend_from_slice(&XAR_HEADER_LEN.to_be_bytes());
    out.extend_from_slice(&XAR_VERSION.to_be_bytes());
    out.extend_from_slice(&(compressed.len() as u64).to_be_bytes());
    out.extend_from_slice(&(toc.len() as u64).to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes()); // sha1
    out.extend_from_slice(&compressed);
    out.extend_from_slice(heap);
    Ok(out)
}

/// A XAR archive whose `Content` member is `content`, laid out like a real
/// XIP: checksum slot first, then `Content`, then `Metadata`.
pub fn xar_bytes(content: &[u8]) -> io::Result<Vec<u8>> {
    let content_offset = CHECKSUM_LEN;
    let metadata_offset = content_offset + content.len();
    let toc = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<xar>
 <toc>
  <checksum style="sha1"><offset>0</offset><size>{checksum}</size></checksum>
  <file id="1">
   <name>Content</name>
   <type>file</type>
   <data>
    <length>{content_len}</length>
    <offset>{content_offset}</offset>
    <size>{content_len}</size>
    <encoding style="application/octet-stream"/>
   </data>
  </file>
  <file id="2">
   <name>Metadata</name>
   <type>file</type>
   <data>
    <length>{metadata_len}</length>
    <offset>{metadata_offset}</offset>
    <size>{metadata_len}</size>
   </data>
  </file>
 </toc>
</xar>
"#,
        checksum = CHECKSUM_LEN,
        content_len = content.len(),
        content_offset = content_offset,
        metadata_len = METADATA.len(),
        metadata_offset = metadata_offset,
    );

    let mut heap = vec![0u8; CHECKSUM_LEN];
    heap.extend_from_slice(content);
    heap.extend_from_slice(METADATA);
    xar_bytes_with_toc(&toc, &heap)
}

/// Builds a complete XIP from a list of entries.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    entries: Vec<ArchiveEntry>,
    next_ino: u64,
    chunk_size: usize,
    compress: bool,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            entries: vec![ArchiveEntry::directory(".", 0o755).with_ino(1)],
            next_ino: 2,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: true,
        }
    }

    /// Append an entry, giving it a fresh inode unless it already has one.
    pub fn entry(mut self, mut entry: ArchiveEntry) -> Self {
        if entry.ino == 0 {
            entry.ino = self.next_ino;
            self.next_ino += 1;
        }
        self.entries.push(entry);
        self
    }

    pub fn directory(self, name: &str, perm: u32) -> Self {
        self.entry(ArchiveEntry::directory(name, perm))
    }

    pub fn file(self, name: &str, perm: u32, data: impl Into<Vec<u8>>) -> Self {
        self.entry(ArchiveEntry::file(name, perm, data))
    }

    pub fn symlink(self, name: &str, target: &str) -> Self {
        self.entry(ArchiveEntry::symlink(name, target))
    }

    /// Another name for the earlier entry `original`. An unknown original
    /// yields an ordinary empty file.
    pub fn hardlink(self, name: &str, original: &str) -> Self {
        let link = match self.entries.iter().find(|e| e.name == original) {
            Some(original) => ArchiveEntry {
                name: name.to_string(),
                data: Vec::new(),
                ..original.clone()
            },
            None => ArchiveEntry::file(name, 0o644, Vec::new()),
        };
        self.entry(link)
    }

    /// Decompressed pbzx block size.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn cpio(&self) -> Vec<u8> {
        cpio_bytes(&self.entries)
    }

    /// The pbzx stream stored as the `Content` member.
    pub fn payload(&self) -> io::Result<Vec<u8>> {
        pbzx_stream(&self.cpio(), self.chunk_size, self.compress)
    }

    pub fn build(&self) -> io::Result<Vec<u8>> {
        xar_bytes(&self.payload()?)
    }
}
