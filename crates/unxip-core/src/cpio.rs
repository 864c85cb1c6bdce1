//! Portable ASCII ("odc") cpio listing.
//!
//! Every entry is a 76-byte header of fixed-width octal fields, the
//! NUL-terminated name, then the file data:
//!
//! ```text
//! magic  dev  ino  mode  uid  gid  nlink  rdev  mtime  namesize  filesize
//!   6     6    6    6     6    6     6     6     11       6        11
//! ```
//!
//! The listing ends with an entry named `TRAILER!!!`.

use bytes::Bytes;
use tracing::instrument;

use crate::channel::{LoadPolicy, Sender, Weighted};
use crate::cursor::{ByteCursor, ChunkSource};
use crate::{Result, XipError};

pub const CPIO_MAGIC: &[u8; 6] = b"070707";
pub const TRAILER: &str = "TRAILER!!!";
/// Header length after the magic.
const HEADER_FIELDS_LEN: usize = 70;
const DRAIN_STEP: usize = 1024 * 1024;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_ISVTX: u32 = 0o001000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
}

/// One entry of the listing. Data slices borrow the decoded chunks they were
/// cut from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub name: String,
    pub data: Vec<Bytes>,
}

impl FileRecord {
    /// Content identity shared by every hardlink of the same file.
    pub fn identifier(&self) -> (u64, u64) {
        (self.dev, self.ino)
    }

    pub fn size(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }

    /// Contiguous copy of the data; free when it already is one slice.
    pub fn contents(&self) -> Bytes {
        match self.data.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            slices => {
                let mut buf = Vec::with_capacity(self.size());
                for slice in slices {
                    buf.extend_from_slice(slice);
                }
                Bytes::from(buf)
            }
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        match self.mode & S_IFMT {
            S_IFDIR => Some(FileType::Directory),
            S_IFREG => Some(FileType::Regular),
            S_IFLNK => Some(FileType::Symlink),
            _ => None,
        }
    }

    /// Text before the rightmost `/`, if any.
    pub fn parent(&self) -> Option<&str> {
        self.name.rfind('/').map(|i| &self.name[..i])
    }

    pub fn is_sticky(&self) -> bool {
        self.mode & S_ISVTX != 0
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o777
    }
}

impl Weighted for FileRecord {
    fn weight(&self) -> usize {
        self.size() + self.name.len()
    }
}

/// Absolute names or names with a `..` component would land outside the
/// destination.
fn check_path(name: &str) -> Result<()> {
    if name.starts_with('/') || name.split('/').any(|component| component == "..") {
        return Err(XipError::UnsafePath(name.to_owned()));
    }
    Ok(())
}

fn parse_octal(field: &[u8], what: &str, offset: u64) -> Result<u64> {
    field.iter().try_fold(0u64, |acc, &digit| match digit {
        b'0'..=b'7' => Ok((acc << 3) | u64::from(digit - b'0')),
        _ => Err(XipError::CorruptEntry {
            offset,
            reason: format!(
                "{} field {:?} is not octal",
                what,
                String::from_utf8_lossy(field)
            ),
        }),
    })
}

pub struct EntryParser<S> {
    cursor: ByteCursor<S>,
    finished: bool,
}

impl<S: ChunkSource> EntryParser<S> {
    pub fn new(cursor: ByteCursor<S>) -> Self {
        Self {
            cursor,
            finished: false,
        }
    }

    /// Decode the next entry. Returns `Ok(None)` after the trailer.
    pub fn next_record(&mut self) -> Result<Option<FileRecord>> {
        if self.finished {
            return Ok(None);
        }

        let offset = self.cursor.position();
        let magic = self.cursor.read(CPIO_MAGIC.len())?;
        if &magic[..] != CPIO_MAGIC {
            return Err(XipError::CorruptEntry {
                offset,
                reason: format!("bad magic {:?}", String::from_utf8_lossy(&magic)),
            });
        }

        let header = self.cursor.read(HEADER_FIELDS_LEN)?;
        let field = |start: usize, len: usize, what: &str| {
            parse_octal(&header[start..start + len], what, offset)
        };
        let dev = field(0, 6, "dev")?;
        let ino = field(6, 6, "ino")?;
        let mode = field(12, 6, "mode")?;
        // uid, gid, nlink, rdev and mtime are validated but not kept.
        field(18, 6, "uid")?;
        field(24, 6, "gid")?;
        field(30, 6, "nlink")?;
        field(36, 6, "rdev")?;
        field(42, 11, "mtime")?;
        let name_len = field(53, 6, "namesize")?;
        let file_size = field(59, 11, "filesize")?;

        let corrupt = |reason: String| XipError::CorruptEntry { offset, reason };

        // 6 octal digits cap the name at 256 KiB.
        let raw_name = self.cursor.read(name_len as usize)?;
        let name = match raw_name.split_last() {
            Some((&0, name)) => std::str::from_utf8(name)
                .map_err(|_| corrupt("name is not UTF-8".into()))?
                .to_owned(),
            _ => return Err(corrupt("name is not NUL-terminated".into())),
        };

        if name == TRAILER {
            self.finished = true;
            return Ok(None);
        }
        check_path(&name)?;

        let size = usize::try_from(file_size)
            .map_err(|_| corrupt(format!("file size {} overflows", file_size)))?;
        let data = self.cursor.read_slices(size)?;

        Ok(Some(FileRecord {
            dev,
            ino,
            // Six octal digits always fit.
            mode: mode as u32,
            name,
            data,
        }))
    }

    /// Consume whatever follows the trailer so upstream stages run to
    /// completion and report their own errors.
    pub fn drain(&mut self) -> Result<u64> {
        let mut skipped = 0;
        loop {
            let rest = self.cursor.read_up_to(DRAIN_STEP)?;
            if rest.is_empty() {
                return Ok(skipped);
            }
            skipped += rest.len() as u64;
        }
    }

    /// Parse every entry into `output`, then finish it. On failure the
    /// channel is failed with the same error.
    #[instrument(skip_all, level = "debug")]
    pub fn run<P: LoadPolicy<FileRecord>>(mut self, output: &Sender<FileRecord, P>) -> Result<u64> {
        let result = self.parse_into(output);
        match &result {
            Ok(records) => {
                tracing::debug!(records, "cpio listing parsed");
                output.finish();
            }
            Err(error) => output.finish_with_error(error.clone()),
        }
        result
    }

    fn parse_into<P: LoadPolicy<FileRecord>>(
        &mut self,
        output: &Sender<FileRecord, P>,
    ) -> Result<u64> {
        let mut records = 0;
        while let Some(record) = self.next_record()? {
            output.push(record)?;
            records += 1;
        }
        let trailing = self.drain()?;
        if trailing > 0 {
            tracing::debug!(trailing, "skipped bytes after cpio trailer");
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{bounded, SizePolicy};
    use crate::cursor::ReaderSource;
    use crate::testing::{cpio_bytes, ArchiveEntry};

    fn parser(data: Vec<u8>, read_size: usize) -> EntryParser<ReaderSource<std::io::Cursor<Vec<u8>>>> {
        EntryParser::new(ByteCursor::new(ReaderSource::with_read_size(
            std::io::Cursor::new(data),
            read_size,
        )))
    }

    fn parse_all(data: Vec<u8>, read_size: usize) -> Result<Vec<FileRecord>> {
        let mut parser = parser(data, read_size);
        let mut records = Vec::new();
        while let Some(record) = parser.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn sample() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::directory(".", 0o755),
            ArchiveEntry::directory("a", 0o755),
            ArchiveEntry::file("a/b.txt", 0o644, b"hello world".to_vec()),
            ArchiveEntry::symlink("a/c", "b.txt"),
            ArchiveEntry::file("a/big", 0o600, vec![0x5a; 1000]),
        ]
    }

    #[test]
    fn test_parse_entries_across_chunks() {
        // Tiny reads make headers, names and data straddle chunk boundaries.
        for read_size in [1, 3, 13, 64, 4096] {
            let records = parse_all(cpio_bytes(&sample()), read_size).unwrap();
            assert_eq!(records.len(), 5, "read_size={}", read_size);

            let file = &records[2];
            assert_eq!(file.name, "a/b.txt");
            assert_eq!(file.file_type(), Some(FileType::Regular));
            assert_eq!(file.permissions(), 0o644);
            assert_eq!(&file.contents()[..], b"hello world");
            assert_eq!(file.parent(), Some("a"));

            let link = &records[3];
            assert_eq!(link.file_type(), Some(FileType::Symlink));
            assert_eq!(&link.contents()[..], b"b.txt");

            assert_eq!(records[4].size(), 1000);
            assert_eq!(records[0].parent(), None);
        }
    }

    #[test]
    fn test_parse_is_idempotent() {
        let bytes = cpio_bytes(&sample());
        assert_eq!(
            parse_all(bytes.clone(), 7).unwrap(),
            parse_all(bytes, 7).unwrap()
        );
    }

    #[test]
    fn test_trailer_ends_listing() {
        let mut bytes = cpio_bytes(&sample());
        bytes.extend_from_slice(&[0u8; 300]);

        let mut parser = parser(bytes, 50);
        let mut count = 0;
        while parser.next_record().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
        assert!(parser.next_record().unwrap().is_none());
        assert_eq!(parser.drain().unwrap(), 300);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = cpio_bytes(&sample());
        bytes[0] = b'9';
        let err = parse_all(bytes, 16).unwrap_err();
        assert!(matches!(err, XipError::CorruptEntry { offset: 0, .. }));
    }

    #[test]
    fn test_non_octal_field() {
        let mut bytes = cpio_bytes(&sample());
        // First digit of the mode field.
        bytes[18] = b'8';
        let err = parse_all(bytes, 16).unwrap_err();
        assert!(matches!(err, XipError::CorruptEntry { offset: 0, .. }));
    }

    #[test]
    fn test_missing_trailer_is_truncation() {
        let mut bytes = cpio_bytes(&sample());
        bytes.truncate(bytes.len() - 90);
        assert!(matches!(
            parse_all(bytes, 16),
            Err(XipError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        for name in ["/etc/passwd", "a/../../x", ".."] {
            let bytes = cpio_bytes(&[ArchiveEntry::file(name, 0o644, b"x".to_vec())]);
            let err = parse_all(bytes, 16).unwrap_err();
            assert!(matches!(err, XipError::UnsafePath(ref n) if n == name));
        }
    }

    #[test]
    fn test_run_feeds_record_channel() {
        let (tx, rx) = bounded(SizePolicy::new(1 << 20));
        let records = parser(cpio_bytes(&sample()), 9).run(&tx).unwrap();
        assert_eq!(records, 5);

        let mut names = Vec::new();
        while let Some(record) = rx.pop().unwrap() {
            names.push(record.name);
        }
        assert_eq!(names, vec![".", "a", "a/b.txt", "a/c", "a/big"]);
    }
}
