//! XAR container: header and table of contents.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "xar!"
//! 4       2     header size
//! 6       2     version (1)
//! 8       8     compressed TOC length
//! 16      8     uncompressed TOC length
//! 24      4     checksum algorithm
//! ...           (header padding up to header size)
//! hs      n     zlib-compressed XML table of contents
//! hs + n        heap; member offsets are relative to here
//! ```

use std::io::Read;

use flate2::read::ZlibDecoder;
use tracing::instrument;

use crate::cursor::{ByteCursor, ChunkSource};
use crate::{Result, XipError};

pub const XAR_MAGIC: &[u8; 4] = b"xar!";
pub const XAR_VERSION: u16 = 1;
/// Size of the fixed header fields.
pub const XAR_HEADER_LEN: u16 = 28;
/// Name of the member holding the pbzx payload.
pub const CONTENT_ENTRY: &str = "Content";

/// Upper bound on an inflated TOC; real ones are a few kilobytes.
const MAX_TOC_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XarHeader {
    pub header_size: u16,
    pub version: u16,
    pub toc_compressed: u64,
    pub toc_uncompressed: u64,
    pub checksum_algorithm: u32,
}

/// One `<file>` element of the table of contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub name: String,
    /// Offset of the member data, relative to the heap.
    pub offset: u64,
    /// Stored length in the heap.
    pub length: u64,
    /// Extracted size, when the TOC records one.
    pub size: Option<u64>,
    /// `style` attribute of `<encoding>`, if any.
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOfContents {
    pub entries: Vec<TocEntry>,
}

impl TableOfContents {
    /// Parse the inflated XML document.
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| XipError::MalformedToc(e.to_string()))?;

        let mut entries = Vec::new();
        for file in doc.descendants().filter(|n| n.has_tag_name("file")) {
            let Some(name) = child_text(file, "name") else {
                continue;
            };
            // Directories and other data-less members have no <data>.
            let Some(data) = file.children().find(|n| n.has_tag_name("data")) else {
                continue;
            };

            let offset = child_number(data, "offset")?
                .ok_or_else(|| XipError::MalformedToc(format!("{} has no offset", name)))?;
            let length = child_number(data, "length")?
                .ok_or_else(|| XipError::MalformedToc(format!("{} has no length", name)))?;
            let size = child_number(data, "size")?;
            let encoding = data
                .children()
                .find(|n| n.has_tag_name("encoding"))
                .and_then(|n| n.attribute("style"))
                .map(str::to_owned);

            entries.push(TocEntry {
                name: name.to_owned(),
                offset,
                length,
                size,
                encoding,
            });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&TocEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, tag: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(str::trim)
}

fn child_number(node: roxmltree::Node<'_, '_>, tag: &str) -> Result<Option<u64>> {
    match child_text(node, tag) {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| XipError::MalformedToc(format!("<{}> is not a number: {:?}", tag, text))),
        None => Ok(None),
    }
}

/// Absolute byte range of the `Content` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub offset: u64,
    pub length: u64,
}

impl ContentRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Read the fixed XAR header.
pub fn read_header<S: ChunkSource>(cursor: &mut ByteCursor<S>) -> Result<XarHeader> {
    let start = cursor.position();
    let magic = cursor.read(4)?;
    if &magic[..] != XAR_MAGIC {
        return Err(XipError::BadMagic {
            format: "xar",
            offset: start,
            found: String::from_utf8_lossy(&magic).into_owned(),
        });
    }

    let header_size = cursor.read_integer::<u16>()?;
    let version = cursor.read_integer::<u16>()?;
    if version != XAR_VERSION {
        return Err(XipError::UnsupportedVersion(version));
    }
    let toc_compressed = cursor.read_integer::<u64>()?;
    let toc_uncompressed = cursor.read_integer::<u64>()?;
    let checksum_algorithm = cursor.read_integer::<u32>()?;

    if header_size < XAR_HEADER_LEN {
        return Err(XipError::MalformedToc(format!(
            "header size {} is smaller than {}",
            header_size, XAR_HEADER_LEN
        )));
    }
    cursor.skip_to(start + u64::from(header_size))?;

    Ok(XarHeader {
        header_size,
        version,
        toc_compressed,
        toc_uncompressed,
        checksum_algorithm,
    })
}

/// Read and inflate the table of contents that follows the header.
pub fn read_toc<S: ChunkSource>(
    cursor: &mut ByteCursor<S>,
    header: &XarHeader,
) -> Result<TableOfContents> {
    if header.toc_uncompressed > MAX_TOC_LEN {
        return Err(XipError::MalformedToc(format!(
            "table of contents claims {} bytes",
            header.toc_uncompressed
        )));
    }
    if header.toc_compressed > MAX_TOC_LEN {
        return Err(XipError::MalformedToc(format!(
            "compressed table of contents claims {} bytes",
            header.toc_compressed
        )));
    }
    let compressed_len = usize::try_from(header.toc_compressed)
        .map_err(|_| XipError::MalformedToc("compressed length overflows".into()))?;
    let compressed = cursor.read(compressed_len)?;

    let mut xml = String::with_capacity(header.toc_uncompressed as usize);
    ZlibDecoder::new(&compressed[..])
        .take(header.toc_uncompressed)
        .read_to_string(&mut xml)
        .map_err(|e| XipError::MalformedToc(format!("cannot inflate: {}", e)))?;
    if xml.len() as u64 != header.toc_uncompressed {
        return Err(XipError::MalformedToc(format!(
            "inflated to {} bytes, header says {}",
            xml.len(),
            header.toc_uncompressed
        )));
    }

    TableOfContents::parse(&xml)
}

/// Position `cursor` at the start of the `Content` member and cap it at the
/// member's end, so nothing downstream can read past the payload.
#[instrument(skip(cursor), level = "debug")]
pub fn locate_content<S: ChunkSource>(cursor: &mut ByteCursor<S>) -> Result<ContentRange> {
    let start = cursor.position();
    let header = read_header(cursor)?;
    let toc = read_toc(cursor, &header)?;
    let entry = toc.get(CONTENT_ENTRY).ok_or(XipError::MissingContentEntry)?;

    let heap = start + u64::from(header.header_size) + header.toc_compressed;
    let range = ContentRange {
        offset: heap + entry.offset,
        length: entry.length,
    };
    tracing::debug!(
        members = toc.entries.len(),
        offset = range.offset,
        length = range.length,
        encoding = entry.encoding.as_deref().unwrap_or("none"),
        "located Content member"
    );

    cursor.skip_to(range.offset)?;
    cursor.set_cap(range.end());
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::ReaderSource;
    use crate::testing::{xar_bytes, xar_bytes_with_toc};

    fn cursor(data: Vec<u8>) -> ByteCursor<ReaderSource<std::io::Cursor<Vec<u8>>>> {
        ByteCursor::new(ReaderSource::with_read_size(std::io::Cursor::new(data), 5))
    }

    #[test]
    fn test_locate_content() {
        let archive = xar_bytes(b"PAYLOAD!").unwrap();
        let mut cursor = cursor(archive);

        let range = locate_content(&mut cursor).unwrap();
        assert_eq!(range.length, 8);
        assert_eq!(cursor.position(), range.offset);
        assert_eq!(&cursor.read(8).unwrap()[..], b"PAYLOAD!");
        // Trailing members are beyond the cap.
        assert!(cursor.is_at_end().unwrap());
        assert!(matches!(cursor.read(1), Err(XipError::CapExceeded { .. })));
    }

    #[test]
    fn test_unsupported_version() {
        let mut archive = xar_bytes(b"x").unwrap();
        archive[6..8].copy_from_slice(&2u16.to_be_bytes());
        let err = locate_content(&mut cursor(archive)).unwrap_err();
        assert!(matches!(err, XipError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_bad_magic() {
        let mut archive = xar_bytes(b"x").unwrap();
        archive[0] = b'z';
        let err = locate_content(&mut cursor(archive)).unwrap_err();
        assert!(matches!(err, XipError::BadMagic { format: "xar", offset: 0, .. }));
    }

    #[test]
    fn test_oversized_compressed_toc() {
        let mut archive = xar_bytes(b"PAYLOAD").unwrap();
        archive[8..16].copy_from_slice(&(1u64 << 46).to_be_bytes());
        let err = locate_content(&mut cursor(archive)).unwrap_err();
        assert!(matches!(err, XipError::MalformedToc(_)));
    }

    #[test]
    fn test_missing_content_entry() {
        let toc = r#"<?xml version="1.0" encoding="UTF-8"?>
<xar><toc><file id="1"><name>Metadata</name>
<data><offset>0</offset><length>1</length><size>1</size></data></file></toc></xar>"#;
        let archive = xar_bytes_with_toc(toc, b"m").unwrap();
        let err = locate_content(&mut cursor(archive)).unwrap_err();
        assert!(matches!(err, XipError::MissingContentEntry));
    }

    #[test]
    fn test_parse_toc_entries() {
        let toc = TableOfContents::parse(
            r#"<xar><toc>
                <file id="1"><name>Content</name><data>
                    <offset>20</offset><length>100</length><size>100</size>
                    <encoding style="application/octet-stream"/>
                </data></file>
                <file id="2"><name>Metadata</name><data>
                    <offset>120</offset><length>7</length>
                </data></file>
                <file id="3"><name>dir</name><type>directory</type></file>
            </toc></xar>"#,
        )
        .unwrap();

        assert_eq!(toc.entries.len(), 2);
        let content = toc.get("Content").unwrap();
        assert_eq!(content.offset, 20);
        assert_eq!(content.length, 100);
        assert_eq!(content.size, Some(100));
        assert_eq!(
            content.encoding.as_deref(),
            Some("application/octet-stream")
        );
        assert_eq!(toc.get("Metadata").unwrap().size, None);
    }

    #[test]
    fn test_non_numeric_offset() {
        let err = TableOfContents::parse(
            "<xar><toc><file><name>Content</name><data><offset>x</offset>\
             <length>1</length></data></file></toc></xar>",
        )
        .unwrap_err();
        assert!(matches!(err, XipError::MalformedToc(_)));
    }
}
