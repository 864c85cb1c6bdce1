//! pbzx framing and parallel block decoding.
//!
//! ```text
//! "pbzx" u64 reference
//! repeat:
//!     u64 decompressed   u64 compressed   [compressed bytes]
//! ```
//!
//! A block whose compressed size equals the reference size is stored as is;
//! every other block is a complete XZ stream. The block whose decompressed
//! size differs from the reference is the last one.

use bytes::Bytes;
use tracing::instrument;
use xz2::stream::{Action, Status, Stream};

use crate::channel::{LoadPolicy, Sender};
use crate::cursor::{ByteCursor, ChunkSource};
use crate::ordered::OrderedTaskPool;
use crate::sync::CancelToken;
use crate::{Result, XipError};

pub const PBZX_MAGIC: &[u8; 4] = b"pbzx";
pub const XZ_HEADER_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
pub const XZ_FOOTER_MAGIC: [u8; 2] = [0x59, 0x5a];

/// Compressed input handed to liblzma between cancellation checks.
const DECODE_STEP: usize = 1024 * 1024;

/// Counters reported by [`ChunkSplitter::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitStats {
    pub blocks: u64,
    pub stored_blocks: u64,
    pub compressed_bytes: u64,
    pub decompressed_bytes: u64,
}

/// Decode one block to exactly `decompressed` bytes.
pub fn decode_block(
    index: u64,
    offset: u64,
    block: Bytes,
    decompressed: u64,
    stored: bool,
    cancel: &CancelToken,
) -> Result<Bytes> {
    let corrupt = |reason: String| XipError::CorruptChunk {
        index,
        offset,
        reason,
    };

    if stored {
        if block.len() as u64 != decompressed {
            return Err(corrupt(format!(
                "stored block holds {} bytes, header says {}",
                block.len(),
                decompressed
            )));
        }
        return Ok(block);
    }

    if !block.starts_with(&XZ_HEADER_MAGIC) {
        return Err(corrupt("missing xz header magic".into()));
    }
    if !block.ends_with(&XZ_FOOTER_MAGIC) {
        return Err(corrupt("missing xz footer magic".into()));
    }

    let expected = usize::try_from(decompressed)
        .map_err(|_| corrupt(format!("decompressed size {} overflows", decompressed)))?;
    let mut stream = Stream::new_stream_decoder(u64::MAX, 0)
        .map_err(|e| corrupt(format!("cannot start xz decoder: {}", e)))?;
    // Grown step by step: the declared size is untrusted until decoded.
    let mut output = Vec::new();
    let mut input = &block[..];

    loop {
        cancel.check()?;

        output.reserve(DECODE_STEP.min(expected.saturating_sub(output.len()).saturating_add(1)));
        let step = input.len().min(DECODE_STEP);
        let action = if step == input.len() {
            Action::Finish
        } else {
            Action::Run
        };
        let (in_before, out_before) = (stream.total_in(), stream.total_out());
        let status = stream
            .process_vec(&input[..step], &mut output, action)
            .map_err(|e| corrupt(format!("xz: {}", e)))?;
        input = &input[(stream.total_in() - in_before) as usize..];

        if output.len() > expected {
            break;
        }
        if status == Status::StreamEnd {
            break;
        }
        let stalled = stream.total_in() == in_before && stream.total_out() == out_before;
        if stalled {
            let reason = if output.len() == expected {
                "decodes to more than the declared size".to_string()
            } else {
                "xz stream ends early".to_string()
            };
            return Err(corrupt(reason));
        }
    }

    if output.len() != expected {
        return Err(corrupt(format!(
            "decoded {} bytes, header says {}",
            output.len(),
            expected
        )));
    }
    Ok(Bytes::from(output))
}

/// Reads pbzx blocks off a capped cursor and decodes them on an
/// [`OrderedTaskPool`], so decoded chunks reach the output in archive order.
pub struct ChunkSplitter<P> {
    pool: OrderedTaskPool<Bytes, P>,
}

impl<P: LoadPolicy<Bytes> + 'static> ChunkSplitter<P> {
    pub fn new(width: usize, output: Sender<Bytes, P>, cancel: CancelToken) -> Result<Self> {
        Ok(Self {
            pool: OrderedTaskPool::new(width, output, cancel)?,
        })
    }

    /// Split the whole payload. The output channel is finished on success
    /// and fails with the same error otherwise.
    #[instrument(skip_all, level = "debug")]
    pub fn run<S: ChunkSource>(mut self, cursor: &mut ByteCursor<S>) -> Result<SplitStats> {
        match self.split(cursor) {
            Ok(stats) => {
                self.pool.finish()?;
                tracing::debug!(
                    blocks = stats.blocks,
                    stored = stats.stored_blocks,
                    bytes = stats.decompressed_bytes,
                    "pbzx stream split"
                );
                Ok(stats)
            }
            Err(error) => {
                self.pool.abort(error.clone());
                Err(error)
            }
        }
    }

    fn split<S: ChunkSource>(&mut self, cursor: &mut ByteCursor<S>) -> Result<SplitStats> {
        let start = cursor.position();
        let magic = cursor.read(4)?;
        if &magic[..] != PBZX_MAGIC {
            return Err(XipError::BadMagic {
                format: "pbzx",
                offset: start,
                found: String::from_utf8_lossy(&magic).into_owned(),
            });
        }
        let reference = cursor.read_integer::<u64>()?;

        let mut stats = SplitStats::default();
        // A payload whose last block is exactly reference-sized ends at the cap.
        while !cursor.is_at_end()? {
            let offset = cursor.position();
            let decompressed = cursor.read_integer::<u64>()?;
            let compressed = cursor.read_integer::<u64>()?;
            let len = usize::try_from(compressed).map_err(|_| XipError::CorruptChunk {
                index: stats.blocks,
                offset,
                reason: format!("compressed size {} overflows", compressed),
            })?;
            let index = stats.blocks;
            if decompressed > reference {
                return Err(XipError::CorruptChunk {
                    index,
                    offset,
                    reason: format!(
                        "decompressed size {} exceeds chunk size {}",
                        decompressed, reference
                    ),
                });
            }
            let block = cursor.read(len)?;
            let stored = compressed == reference;

            self.pool.submit(move |cancel| {
                decode_block(index, offset, block, decompressed, stored, cancel)
            })?;

            stats.blocks += 1;
            stats.stored_blocks += u64::from(stored);
            stats.compressed_bytes += compressed;
            stats.decompressed_bytes += decompressed;

            if decompressed != reference {
                break;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{bounded, CountPolicy, Receiver};
    use crate::cursor::ReaderSource;
    use crate::testing::{pbzx_stream, xz_compress};

    fn cursor(data: Vec<u8>) -> ByteCursor<ReaderSource<std::io::Cursor<Vec<u8>>>> {
        ByteCursor::new(ReaderSource::with_read_size(std::io::Cursor::new(data), 7))
    }

    fn collect(rx: &Receiver<Bytes, CountPolicy>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.pop()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 97) as u8).collect()
    }

    #[test]
    fn test_split_compressed_blocks() {
        let data = payload(10_000);
        let stream = pbzx_stream(&data, 1024, true).unwrap();

        let (tx, rx) = bounded(CountPolicy::new(16));
        let splitter = ChunkSplitter::new(3, tx, CancelToken::new()).unwrap();
        let stats = splitter.run(&mut cursor(stream)).unwrap();

        assert_eq!(stats.blocks, 10);
        assert_eq!(stats.decompressed_bytes, 10_000);
        assert_eq!(collect(&rx).unwrap(), data);
    }

    #[test]
    fn test_split_stored_blocks() {
        let data = payload(4096);
        let stream = pbzx_stream(&data, 1024, false).unwrap();

        let (tx, rx) = bounded(CountPolicy::new(2));
        let splitter = ChunkSplitter::new(2, tx, CancelToken::new()).unwrap();
        let consumer = std::thread::spawn(move || collect(&rx));
        let stats = splitter.run(&mut cursor(stream)).unwrap();

        // Every block is full-size, so the stream ends at the input's end.
        assert_eq!(stats.stored_blocks, 4);
        assert_eq!(consumer.join().unwrap().unwrap(), data);
    }

    #[test]
    fn test_bad_magic() {
        let (tx, rx) = bounded(CountPolicy::new(4));
        let splitter = ChunkSplitter::new(1, tx, CancelToken::new()).unwrap();
        let err = splitter.run(&mut cursor(b"pbzz\0\0\0\0\0\0\0\x10".to_vec()));

        assert!(matches!(err, Err(XipError::BadMagic { format: "pbzx", .. })));
        assert!(matches!(rx.pop(), Err(XipError::BadMagic { .. })));
    }

    #[test]
    fn test_size_mismatch_is_corrupt_chunk() {
        let block = xz_compress(b"short block").unwrap();
        let mut stream = b"pbzx".to_vec();
        stream.extend_from_slice(&1024u64.to_be_bytes());
        stream.extend_from_slice(&20u64.to_be_bytes());
        stream.extend_from_slice(&(block.len() as u64).to_be_bytes());
        stream.extend_from_slice(&block);

        let (tx, rx) = bounded(CountPolicy::new(4));
        let cancel = CancelToken::new();
        let splitter = ChunkSplitter::new(2, tx, cancel.clone()).unwrap();
        let _ = splitter.run(&mut cursor(stream));

        assert!(matches!(
            rx.pop(),
            Err(XipError::CorruptChunk {
                index: 0,
                offset: 12,
                ..
            })
        ));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_block_without_xz_magic() {
        let err = decode_block(
            3,
            99,
            Bytes::from_static(b"not xz at all, YZ"),
            10,
            false,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, XipError::CorruptChunk { index: 3, offset: 99, .. }));
    }

    #[test]
    fn test_decode_larger_than_declared() {
        let block = Bytes::from(xz_compress(&payload(5000)).unwrap());
        let err = decode_block(0, 0, block, 4000, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, XipError::CorruptChunk { .. }));
    }

    #[test]
    fn test_huge_declared_size_is_corrupt_chunk() {
        let block = Bytes::from(xz_compress(b"tiny").unwrap());
        let err = decode_block(0, 0, block, 1u64 << 46, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, XipError::CorruptChunk { index: 0, offset: 0, .. }));
    }

    #[test]
    fn test_decode_spans_several_steps() {
        let data: Vec<u8> = (0..3 * DECODE_STEP as u64 + 17)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let block = Bytes::from(xz_compress(&data).unwrap());
        let out = decode_block(0, 0, block, data.len() as u64, false, &CancelToken::new()).unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn test_block_larger_than_chunk_size() {
        let block = xz_compress(b"short block").unwrap();
        let mut stream = b"pbzx".to_vec();
        stream.extend_from_slice(&1024u64.to_be_bytes());
        stream.extend_from_slice(&(1u64 << 46).to_be_bytes());
        stream.extend_from_slice(&(block.len() as u64).to_be_bytes());
        stream.extend_from_slice(&block);

        let (tx, rx) = bounded(CountPolicy::new(4));
        let splitter = ChunkSplitter::new(2, tx, CancelToken::new()).unwrap();
        let err = splitter.run(&mut cursor(stream)).unwrap_err();

        assert!(matches!(err, XipError::CorruptChunk { index: 0, offset: 12, .. }));
        assert!(matches!(rx.pop(), Err(XipError::CorruptChunk { .. })));
    }

    #[test]
    fn test_decode_stops_when_cancelled() {
        let block = Bytes::from(xz_compress(&payload(4096)).unwrap());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = decode_block(0, 0, block, 4096, false, &cancel).unwrap_err();
        assert!(matches!(err, XipError::Cancelled));
    }

    #[test]
    fn test_truncated_block() {
        let stream = pbzx_stream(&payload(3000), 1024, true).unwrap();
        let cut = stream[..stream.len() - 5].to_vec();

        let (tx, rx) = bounded(CountPolicy::new(16));
        let splitter = ChunkSplitter::new(2, tx, CancelToken::new()).unwrap();
        let err = splitter.run(&mut cursor(cut)).unwrap_err();

        assert!(matches!(err, XipError::TruncatedInput { .. }));
        assert!(collect(&rx).is_err());
    }
}
