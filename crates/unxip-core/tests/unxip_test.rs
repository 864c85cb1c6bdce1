use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tempfile::TempDir;
use unxip_core::testing::{ArchiveBuilder, ArchiveEntry};
use unxip_core::{Unxip, UnxipOptions, XipError};

#[derive(Debug, PartialEq, Eq)]
enum Node {
    Dir(u32),
    File(u32, Vec<u8>),
    Link(String),
}

fn options() -> UnxipOptions {
    UnxipOptions {
        threads: 4,
        chunk_buffer: 4,
        record_budget: 64 * 1024,
        compress: false,
        read_size: 4096,
    }
}

fn extract(archive: Vec<u8>, options: UnxipOptions) -> (TempDir, unxip_core::Result<unxip_core::UnxipStats>) {
    let temp = TempDir::new().unwrap();
    let result = Unxip::new(options).run(Cursor::new(archive), temp.path());
    (temp, result)
}

/// Snapshot of everything under `root`, keyed by relative path.
fn snapshot(root: &Path) -> BTreeMap<String, Node> {
    let mut tree = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.unwrap();
        let name = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let meta = entry.path().symlink_metadata().unwrap();
        let node = if meta.file_type().is_symlink() {
            Node::Link(fs::read_link(entry.path()).unwrap().to_string_lossy().into_owned())
        } else if meta.is_dir() {
            Node::Dir(meta.mode() & 0o7777)
        } else {
            Node::File(meta.mode() & 0o7777, fs::read(entry.path()).unwrap())
        };
        tree.insert(name, node);
    }
    tree
}

/// Expected tree for the entries of `builder`, resolving hardlinks to their
/// original's contents.
fn expected(builder: &ArchiveBuilder) -> BTreeMap<String, Node> {
    let mut by_inode: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
    let mut tree = BTreeMap::new();
    for entry in builder.entries() {
        if entry.name == "." {
            continue;
        }
        let perm = entry.mode & 0o7777;
        let node = match entry.mode & 0o170000 {
            0o040000 => Node::Dir(perm),
            0o120000 => Node::Link(String::from_utf8(entry.data.clone()).unwrap()),
            _ => {
                let data = by_inode.entry(entry.ino).or_insert_with(|| entry.data.clone());
                Node::File(perm, data.clone())
            }
        };
        tree.insert(entry.name.clone(), node);
    }
    tree
}

fn content(seed: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| b"abcdefghijklmnopqrstuvwxyz0123456789\n"[(i * 7 + seed) % 37])
        .collect()
}

fn sample_tree() -> ArchiveBuilder {
    let mut builder = ArchiveBuilder::new()
        .directory("Xcode.app", 0o755)
        .directory("Xcode.app/Contents", 0o755)
        .directory("Xcode.app/Contents/MacOS", 0o755)
        .file("Xcode.app/Contents/Info.plist", 0o644, content(1, 900))
        .file("Xcode.app/Contents/MacOS/Xcode", 0o755, content(2, 70_000))
        .file("Xcode.app/Contents/empty", 0o600, Vec::new())
        .symlink("Xcode.app/Contents/Current", "MacOS")
        .hardlink("Xcode.app/Contents/MacOS/xcodebuild", "Xcode.app/Contents/MacOS/Xcode")
        .directory("Xcode.app/Contents/Developer", 0o755);
    for i in 0..40 {
        builder = builder.file(
            &format!("Xcode.app/Contents/Developer/tool{}", i),
            if i % 3 == 0 { 0o755 } else { 0o644 },
            content(i, i * 137),
        );
    }
    builder
}

#[test]
fn test_tree_round_trip() {
    let builder = sample_tree().chunk_size(4096);
    let (temp, result) = extract(builder.build().unwrap(), options());
    let stats = result.unwrap();

    assert_eq!(snapshot(temp.path()), expected(&builder));
    assert_eq!(stats.files.failures, 0);
    assert_eq!(stats.records, builder.entries().len() as u64);
    assert!(stats.chunks.blocks > 1);
}

#[test]
fn test_round_trip_with_compression_requested() {
    let builder = sample_tree().chunk_size(8192);
    let mut options = options();
    options.compress = true;
    let (temp, result) = extract(builder.build().unwrap(), options);

    result.unwrap();
    assert_eq!(snapshot(temp.path()), expected(&builder));
}

#[test]
fn test_hardlinks_share_inode() {
    let builder = sample_tree();
    let (temp, result) = extract(builder.build().unwrap(), options());
    assert_eq!(result.unwrap().files.hardlinks, 1);

    let macos = temp.path().join("Xcode.app/Contents/MacOS");
    let original = fs::metadata(macos.join("Xcode")).unwrap();
    let link = fs::metadata(macos.join("xcodebuild")).unwrap();
    assert_eq!(original.ino(), link.ino());
    assert_eq!(original.nlink(), 2);
}

#[test]
fn test_content_ending_on_chunk_boundary() {
    for compress in [false, true] {
        let builder = sample_tree().compress(compress);
        let len = builder.cpio().len();

        // One block of exactly the reference size: the stream ends at the cap.
        let on_boundary = builder.clone().chunk_size(len);
        let (temp, result) = extract(on_boundary.build().unwrap(), options());
        let stats = result.unwrap();
        assert_eq!(stats.chunks.blocks, 1);
        assert_eq!(snapshot(temp.path()), expected(&on_boundary));

        // Ends mid-block: the short final block terminates the stream.
        let mid_block = builder.chunk_size(len + 1);
        let (temp, result) = extract(mid_block.build().unwrap(), options());
        assert_eq!(result.unwrap().chunks.blocks, 1);
        assert_eq!(snapshot(temp.path()), expected(&mid_block));
    }
}

#[test]
fn test_tiny_reads_and_channels() {
    let builder = sample_tree().chunk_size(333);
    let options = UnxipOptions {
        threads: 2,
        chunk_buffer: 1,
        record_budget: 1,
        compress: false,
        read_size: 7,
    };
    let (temp, result) = extract(builder.build().unwrap(), options);
    result.unwrap();
    assert_eq!(snapshot(temp.path()), expected(&builder));
}

#[test]
fn test_concrete_scenario() {
    let builder = ArchiveBuilder::new()
        .directory("a", 0o755)
        .file("a/b.txt", 0o644, "hello world\n")
        .symlink("a/c", "b.txt")
        .hardlink("a/d", "a/b.txt");
    let (temp, result) = extract(builder.build().unwrap(), options());
    let stats = result.unwrap();

    let root = temp.path();
    assert!(root.join("a").is_dir());
    let original = fs::metadata(root.join("a/b.txt")).unwrap();
    assert!(original.is_file());
    assert_eq!(original.len(), 12);
    assert_eq!(fs::read(root.join("a/b.txt")).unwrap(), b"hello world\n");
    assert_eq!(fs::read_link(root.join("a/c")).unwrap(), Path::new("b.txt"));
    assert_eq!(fs::read(root.join("a/d")).unwrap(), b"hello world\n");
    assert_eq!(fs::metadata(root.join("a/d")).unwrap().ino(), original.ino());
    assert_eq!(
        fs::metadata(root.join("a/b.txt")).unwrap().mode() & 0o777,
        0o644
    );
    assert_eq!(stats.files.directories, 1);
    assert_eq!(stats.files.files, 1);
    assert_eq!(stats.files.symlinks, 1);
    assert_eq!(stats.files.hardlinks, 1);
}

#[test]
fn test_truncated_archive() {
    let archive = sample_tree().chunk_size(4096).build().unwrap();
    // Cut inside the Content member, well past the table of contents.
    let cut = archive[..archive.len() * 2 / 3].to_vec();
    let (_temp, result) = extract(cut, options());

    assert!(matches!(result, Err(XipError::TruncatedInput { .. })));
}

#[test]
fn test_corrupt_chunk_aborts() {
    let mut archive = sample_tree().chunk_size(4096).build().unwrap();
    let magic = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
    let start = archive
        .windows(magic.len())
        .position(|w| w == magic)
        .unwrap();
    archive[start + 40] ^= 0xff;

    let (_temp, result) = extract(archive, options());
    assert!(matches!(result, Err(XipError::CorruptChunk { .. })));
}

#[test]
fn test_unknown_file_type_is_fatal() {
    let builder = ArchiveBuilder::new()
        .directory("a", 0o755)
        .entry(ArchiveEntry::new("a/fifo", 0o010644, Vec::new()));
    let (_temp, result) = extract(builder.build().unwrap(), options());

    assert!(matches!(
        result,
        Err(XipError::UnknownFileType { ref name, .. }) if name == "a/fifo"
    ));
}

#[test]
fn test_unsafe_path_is_fatal() {
    let builder = ArchiveBuilder::new().file("../escape", 0o644, "x");
    let (temp, result) = extract(builder.build().unwrap(), options());

    assert!(matches!(result, Err(XipError::UnsafePath(_))));
    assert!(!temp.path().parent().unwrap().join("escape").exists());
}

#[test]
fn test_file_failure_is_not_fatal() {
    let builder = ArchiveBuilder::new()
        .file("unlisted/orphan", 0o644, "lost")
        .file("kept", 0o644, "kept");
    let (temp, result) = extract(builder.build().unwrap(), options());
    let stats = result.unwrap();

    assert_eq!(stats.files.failures, 1);
    assert_eq!(fs::read(temp.path().join("kept")).unwrap(), b"kept");
}
