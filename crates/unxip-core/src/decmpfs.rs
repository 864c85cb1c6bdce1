//! HFS+ transparent compression (decmpfs type 4).
//!
//! A compressed file is an empty data fork plus two extended attributes:
//!
//! - `com.apple.decmpfs`: 16-byte header (`fpmc`, type, uncompressed size),
//! - `com.apple.ResourceFork`: the zlib-compressed 64 KiB blocks, wrapped in
//!   a classic resource fork with a single `cmpf` resource.
//!
//! ```text
//! 0x000  resource header (data offset, map offset, data len, map len)
//! 0x100  u32 BE resource length
//! 0x104  u32 LE block count, then (u32 LE offset, u32 LE size) per block
//!        blocks; offsets are relative to 0x104
//!  ...   50-byte resource map
//! ```
//!
//! Only the encoder and the write path live here; macOS reads the result.
//! zlib blocks are used rather than LZFSE (types 11/12) because `flate2`
//! covers them; compression stays optional, so any failure just means a
//! plain file.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Uncompressed bytes per block.
pub const BLOCK_SIZE: usize = 64 * 1024;
pub const DECMPFS_XATTR: &str = "com.apple.decmpfs";
pub const RESOURCE_FORK_XATTR: &str = "com.apple.ResourceFork";
/// `fpmc` read as a little-endian u32.
pub const DECMPFS_MAGIC: u32 = 0x636d_7066;
/// zlib blocks stored in the resource fork.
pub const CMP_RESOURCE_FORK_ZLIB: u32 = 4;

const RESOURCE_DATA_OFFSET: usize = 0x100;
const RESOURCE_MAP_LEN: usize = 50;
/// Marker byte for a block kept uncompressed.
const RAW_BLOCK: u8 = 0xff;

/// Resource map declaring one `cmpf` resource with id 1.
fn resource_map() -> [u8; RESOURCE_MAP_LEN] {
    let mut map = [0u8; RESOURCE_MAP_LEN];
    // Offsets of the type list and (empty) name list.
    map[24..26].copy_from_slice(&0x1cu16.to_be_bytes());
    map[26..28].copy_from_slice(&(RESOURCE_MAP_LEN as u16).to_be_bytes());
    // One type, 'cmpf', with one reference at +10 from the type list.
    map[30..34].copy_from_slice(b"cmpf");
    map[36..38].copy_from_slice(&0x0au16.to_be_bytes());
    // Reference: id 1, no name, data at offset 0.
    map[38..40].copy_from_slice(&1u16.to_be_bytes());
    map[40..42].copy_from_slice(&0xffffu16.to_be_bytes());
    map
}

fn compress_block(block: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(block.len()), Compression::default());
    encoder.write_all(block)?;
    let compressed = encoder.finish()?;
    if compressed.len() < block.len() {
        return Ok(compressed);
    }
    let mut raw = Vec::with_capacity(block.len() + 1);
    raw.push(RAW_BLOCK);
    raw.extend_from_slice(block);
    Ok(raw)
}

/// Encode `data` as a complete resource fork.
pub fn encode_resource_fork(data: &[u8]) -> io::Result<Vec<u8>> {
    let blocks = data
        .chunks(BLOCK_SIZE)
        .map(compress_block)
        .collect::<io::Result<Vec<_>>>()?;

    let table_len = 4 + 8 * blocks.len();
    let payload_len: usize = blocks.iter().map(Vec::len).sum();
    // Resource data: its own length word, the block table and the blocks.
    let data_len = 4 + table_len + payload_len;
    let map_offset = RESOURCE_DATA_OFFSET + data_len;

    let too_large = || io::Error::new(io::ErrorKind::InvalidInput, "resource fork exceeds 4 GiB");
    let word = |n: usize| u32::try_from(n).map_err(|_| too_large());

    let mut fork = Vec::with_capacity(map_offset + RESOURCE_MAP_LEN);
    fork.extend_from_slice(&word(RESOURCE_DATA_OFFSET)?.to_be_bytes());
    fork.extend_from_slice(&word(map_offset)?.to_be_bytes());
    fork.extend_from_slice(&word(data_len)?.to_be_bytes());
    fork.extend_from_slice(&word(RESOURCE_MAP_LEN)?.to_be_bytes());
    fork.resize(RESOURCE_DATA_OFFSET, 0);

    fork.extend_from_slice(&word(data_len - 4)?.to_be_bytes());
    fork.extend_from_slice(&word(blocks.len())?.to_le_bytes());
    let mut offset = table_len;
    for block in &blocks {
        fork.extend_from_slice(&word(offset)?.to_le_bytes());
        fork.extend_from_slice(&word(block.len())?.to_le_bytes());
        offset += block.len();
    }
    for block in &blocks {
        fork.extend_from_slice(block);
    }
    fork.extend_from_slice(&resource_map());
    Ok(fork)
}

/// Encode `data`, or `None` when the fork would not be smaller than the data.
pub fn compress_if_smaller(data: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let fork = encode_resource_fork(data)?;
    Ok((fork.len() < data.len()).then_some(fork))
}

/// The 16-byte `com.apple.decmpfs` value for a file of `size` bytes.
pub fn decmpfs_header(size: u64) -> [u8; 16] {
    let mut header = [0u8; 16];
    header[0..4].copy_from_slice(&DECMPFS_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&CMP_RESOURCE_FORK_ZLIB.to_le_bytes());
    header[8..16].copy_from_slice(&size.to_le_bytes());
    header
}

/// Inverse of [`encode_resource_fork`].
pub fn decode_resource_fork(fork: &[u8]) -> io::Result<Vec<u8>> {
    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, what.to_string());
    let be = |at: usize| -> io::Result<usize> {
        let bytes = fork.get(at..at + 4).ok_or_else(|| invalid("fork is truncated"))?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    };
    let le = |at: usize| -> io::Result<usize> {
        let bytes = fork.get(at..at + 4).ok_or_else(|| invalid("fork is truncated"))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    };

    if be(0)? != RESOURCE_DATA_OFFSET {
        return Err(invalid("unexpected resource data offset"));
    }
    let base = RESOURCE_DATA_OFFSET + 4;
    let count = le(base)?;

    let mut data = Vec::new();
    for i in 0..count {
        let offset = le(base + 4 + 8 * i)?;
        let size = le(base + 8 + 8 * i)?;
        let block = fork
            .get(base + offset..base + offset + size)
            .ok_or_else(|| invalid("block lies outside the fork"))?;
        match block.split_first() {
            Some((&RAW_BLOCK, raw)) => data.extend_from_slice(raw),
            Some(_) => {
                ZlibDecoder::new(block).read_to_end(&mut data)?;
            }
            None => return Err(invalid("empty block")),
        }
    }
    Ok(data)
}

/// Write `data` to `path` as a transparently compressed file.
///
/// Returns `false` when compression does not pay off or anything along the
/// way fails; `path` then does not exist and the caller writes it plainly.
/// A compressed file is read back and compared before it is kept.
pub fn write_compressed(path: &Path, data: &[u8]) -> bool {
    fall_back_on_error(path, try_write_compressed(path, data))
}

/// Turn a failed compressed write into a plain-write fallback, removing any
/// partial file left at `path`.
fn fall_back_on_error(path: &Path, result: io::Result<bool>) -> bool {
    match result {
        Ok(kept) => kept,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "transparent compression failed");
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "cannot remove partial file");
                }
            }
            false
        }
    }
}

#[cfg(target_os = "macos")]
fn try_write_compressed(path: &Path, data: &[u8]) -> io::Result<bool> {
    use std::fs;
    use std::os::unix::io::AsRawFd;
    use xattr::FileExt;

    let Some(fork) = compress_if_smaller(data)? else {
        return Ok(false);
    };

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_xattr(RESOURCE_FORK_XATTR, &fork)?;
    file.set_xattr(DECMPFS_XATTR, &decmpfs_header(data.len() as u64))?;
    let ret = unsafe { libc::fchflags(file.as_raw_fd(), libc::UF_COMPRESSED) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    drop(file);

    if fs::read(path)? != data {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "compressed file reads back differently",
        ));
    }
    Ok(true)
}

#[cfg(not(target_os = "macos"))]
fn try_write_compressed(_path: &Path, _data: &[u8]) -> io::Result<bool> {
    Ok(false)
}

/// Write `data` to `path`, compressing it first when asked to and possible.
/// Returns whether the file ended up compressed.
pub fn write_file(path: &Path, data: &[u8], compress: bool) -> io::Result<bool> {
    if compress && write_compressed(path, data) {
        return Ok(true);
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    Ok(false)
}
