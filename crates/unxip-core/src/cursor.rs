//! Sequential reader over a pull-based stream of byte chunks.
//!
//! The same cursor type reads the raw archive (chunks come from a
//! [`ReaderSource`]) and the decompressed payload (chunks come from the
//! chunk channel). Reads that fit inside one chunk are zero-copy slices.

use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};

use crate::channel::{LoadPolicy, Receiver};
use crate::{Result, XipError};

/// Default size of the reads issued against the raw input.
pub const DEFAULT_READ_SIZE: usize = 4 * 1024 * 1024;

/// A source of byte chunks. `Ok(None)` marks the end of the stream.
pub trait ChunkSource {
    fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

impl<P: LoadPolicy<Bytes>> ChunkSource for Receiver<Bytes, P> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.pop()
    }
}

/// Adapts any [`Read`] into fixed-size chunks.
pub struct ReaderSource<R> {
    reader: R,
    read_size: usize,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_read_size(reader, DEFAULT_READ_SIZE)
    }

    pub fn with_read_size(reader: R, read_size: usize) -> Self {
        Self {
            reader,
            read_size: read_size.max(1),
        }
    }
}

impl<R: Read> ChunkSource for ReaderSource<R> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(self.read_size);
        let mut filled = 0;
        // Fill the whole buffer unless the input ends; pipes return short reads.
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf.freeze()))
    }
}

/// Unsigned integers decodable from big-endian bytes.
pub trait BigEndian: Sized {
    const SIZE: usize;
    fn fold(bytes: &[u8]) -> Self;
}

macro_rules! impl_big_endian {
    ($($t:ty),*) => {
        $(
            impl BigEndian for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn fold(bytes: &[u8]) -> Self {
                    bytes.iter().fold(0, |acc, &b| (acc << 8) | <$t>::from(b))
                }
            }
        )*
    };
}

impl_big_endian!(u16, u32, u64);

impl BigEndian for u8 {
    const SIZE: usize = 1;

    fn fold(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

pub struct ByteCursor<S> {
    source: S,
    current: Bytes,
    position: u64,
    cap: Option<u64>,
    exhausted: bool,
}

impl<S: ChunkSource> ByteCursor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            current: Bytes::new(),
            position: 0,
            cap: None,
            exhausted: false,
        }
    }

    /// Absolute number of bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Forbid reads past the absolute offset `limit`.
    pub fn set_cap(&mut self, limit: u64) {
        self.cap = Some(limit);
    }

    /// Bytes left before the cap, if one is set.
    pub fn remaining(&self) -> Option<u64> {
        self.cap.map(|cap| cap.saturating_sub(self.position))
    }

    /// Read exactly `n` bytes as one contiguous buffer.
    pub fn read(&mut self, n: usize) -> Result<Bytes> {
        self.check_cap(n)?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        if !self.fill()? {
            return Err(self.truncated(n, 0));
        }
        if self.current.len() >= n {
            return Ok(self.take(n));
        }

        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            if !self.fill()? {
                return Err(self.truncated(n, buf.len()));
            }
            let want = (n - buf.len()).min(self.current.len());
            buf.extend_from_slice(&self.take(want));
        }
        Ok(buf.freeze())
    }

    /// Read up to `n` bytes, stopping early at the end of input or the cap.
    pub fn read_up_to(&mut self, n: usize) -> Result<Bytes> {
        let n = match self.remaining() {
            Some(left) => n.min(usize::try_from(left).unwrap_or(usize::MAX)),
            None => n,
        };
        let mut buf = BytesMut::new();
        while buf.len() < n && self.fill()? {
            let want = (n - buf.len()).min(self.current.len());
            if buf.is_empty() && want == n {
                return Ok(self.take(want));
            }
            buf.extend_from_slice(&self.take(want));
        }
        Ok(buf.freeze())
    }

    /// Read exactly `n` bytes as zero-copy slices of the underlying chunks.
    pub fn read_slices(&mut self, n: usize) -> Result<Vec<Bytes>> {
        self.check_cap(n)?;
        let mut slices = Vec::new();
        let mut left = n;
        while left > 0 {
            if !self.fill()? {
                return Err(self.truncated(n, n - left));
            }
            let want = left.min(self.current.len());
            slices.push(self.take(want));
            left -= want;
        }
        Ok(slices)
    }

    /// Read a big-endian unsigned integer.
    pub fn read_integer<T: BigEndian>(&mut self) -> Result<T> {
        let bytes = self.read(T::SIZE)?;
        Ok(T::fold(&bytes))
    }

    /// Discard `n` bytes.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        let mut left = n;
        while left > 0 {
            let step = usize::try_from(left).unwrap_or(usize::MAX);
            self.check_cap(step)?;
            if !self.fill()? {
                return Err(self.truncated_u64(n, n - left));
            }
            let want = step.min(self.current.len());
            let _ = self.take(want);
            left -= want as u64;
        }
        Ok(())
    }

    /// Advance to the absolute offset `target`. Seeking backwards is refused.
    pub fn skip_to(&mut self, target: u64) -> Result<()> {
        if target < self.position {
            return Err(XipError::MalformedToc(format!(
                "offset {} lies before current position {}",
                target, self.position
            )));
        }
        self.skip(target - self.position)
    }

    /// Whether no further byte can be read, either because the cap was
    /// reached or because the source is exhausted.
    pub fn is_at_end(&mut self) -> Result<bool> {
        if self.remaining() == Some(0) {
            return Ok(true);
        }
        Ok(!self.fill()?)
    }

    fn check_cap(&self, n: usize) -> Result<()> {
        match self.cap {
            Some(cap) if self.position + n as u64 > cap => Err(XipError::CapExceeded {
                offset: self.position,
                len: n as u64,
                cap,
            }),
            _ => Ok(()),
        }
    }

    /// Ensure `current` is non-empty. Returns `false` at end of input.
    fn fill(&mut self) -> Result<bool> {
        while self.current.is_empty() {
            if self.exhausted {
                return Ok(false);
            }
            match self.source.next_chunk()? {
                Some(chunk) => self.current = chunk,
                None => self.exhausted = true,
            }
        }
        Ok(true)
    }

    fn take(&mut self, n: usize) -> Bytes {
        self.position += n as u64;
        self.current.split_to(n)
    }

    fn truncated(&self, wanted: usize, available: usize) -> XipError {
        self.truncated_u64(wanted as u64, available as u64)
    }

    fn truncated_u64(&self, wanted: u64, available: u64) -> XipError {
        XipError::TruncatedInput {
            offset: self.position - available,
            wanted,
            available,
        }
    }
}
