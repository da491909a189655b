//! Build an index snapshot from a local directory walk.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::model::{normalize_path, Index, IndexEntry};
use crate::IndexError;

/// Walk `root` and produce one entry per regular file: length, mtime, and
/// whole-file MD5. Chunk lists are empty — a scan describes local content,
/// not where it is stored remotely.
pub fn build_for_directory(root: &Path) -> Result<Index, IndexError> {
    let mut index = Index::new();
    walk(root, root, &mut index)?;
    debug!(root = %root.display(), files = index.len(), "directory scan complete");
    Ok(index)
}

fn walk(root: &Path, dir: &Path, index: &mut Index) -> Result<(), IndexError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            walk(root, &path, index)?;
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();

            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            index.upsert(IndexEntry {
                relative_path: normalize_path(&rel),
                length: meta.len(),
                mtime,
                hash: hash_file(&path)?,
                chunks: Vec::new(),
            });
        }
    }
    Ok(())
}

/// Streaming whole-file MD5; one hasher per file.
fn hash_file(path: &Path) -> Result<Vec<u8>, IndexError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_finds_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub/deeper")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"top content").unwrap();
        std::fs::write(tmp.path().join("sub/mid.txt"), b"mid").unwrap();
        std::fs::write(tmp.path().join("sub/deeper/leaf.bin"), vec![0u8; 1000]).unwrap();

        let index = build_for_directory(tmp.path()).unwrap();

        assert_eq!(index.len(), 3);
        assert!(index.file_exists("top.txt"));
        assert!(index.file_exists("sub/mid.txt"));
        assert!(index.file_exists("sub/deeper/leaf.bin"));

        let leaf = index.get_file("sub/deeper/leaf.bin").unwrap();
        assert_eq!(leaf.length, 1000);
        assert!(leaf.mtime > 0);
        assert!(leaf.chunks.is_empty());
    }

    #[test]
    fn test_scan_hashes_content() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"known content").unwrap();

        let index = build_for_directory(tmp.path()).unwrap();
        let entry = index.get_file("a.txt").unwrap();

        let expected = Md5::digest(b"known content").to_vec();
        assert_eq!(entry.hash, expected);
    }

    #[test]
    fn test_scan_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let index = build_for_directory(tmp.path()).unwrap();
        assert!(index.is_empty());
    }
}
