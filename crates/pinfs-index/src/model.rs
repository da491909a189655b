use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// One stored chunk of a file: where it lives and how many bytes the
/// attachment holds (the on-wire size, not the plaintext size).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFileChunk {
    pub url: String,
    pub size: u32,
}

/// One file in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Forward slashes, no leading slash, original case preserved
    pub relative_path: String,
    /// Plaintext file size in bytes
    pub length: u64,
    /// Last modified time, Unix seconds
    pub mtime: u64,
    /// Whole-file content hash (MD5)
    pub hash: Vec<u8>,
    /// Ordered by chunk index; the stored sizes need not sum to `length`
    pub chunks: Vec<IndexFileChunk>,
}

/// A directory snapshot: all known files keyed by normalized path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u8,
    /// When this snapshot was built, Unix seconds
    pub built_at: u64,
    pub(crate) entries: BTreeMap<String, IndexEntry>,
}

/// Difference between two snapshots, in terms of the left-hand side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    /// Present in `local`, absent in `remote`
    pub added: Vec<IndexEntry>,
    /// Present in `remote`, absent in `local`
    pub deleted: Vec<IndexEntry>,
    /// Present in both with differing hash or length
    pub modified: Vec<IndexEntry>,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }
}

/// Normalize a relative path: forward slashes, no leading slash.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Comparison key: normalized and lowercased.
fn path_key(path: &str) -> String {
    normalize_path(path).to_lowercase()
}

impl Index {
    /// An empty snapshot stamped with the current time.
    pub fn new() -> Self {
        let built_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Index {
            version: crate::wire::INDEX_VERSION,
            built_at,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the entry for its path.
    pub fn upsert(&mut self, entry: IndexEntry) {
        self.entries.insert(path_key(&entry.relative_path), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<IndexEntry> {
        self.entries.remove(&path_key(path))
    }

    pub fn get_file(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(&path_key(path))
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.entries.contains_key(&path_key(path))
    }

    /// Entries in normalized-path order.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare two snapshots.
///
/// `added` is what `local` has that `remote` lacks, `deleted` the reverse,
/// and `modified` the paths present in both whose hash or length differ.
pub fn diff(local: &Index, remote: &Index) -> IndexDiff {
    let mut out = IndexDiff::default();

    for (key, entry) in &local.entries {
        match remote.entries.get(key) {
            None => out.added.push(entry.clone()),
            Some(other) => {
                if entry.hash != other.hash || entry.length != other.length {
                    out.modified.push(other.clone());
                }
            }
        }
    }

    for (key, entry) in &remote.entries {
        if !local.entries.contains_key(key) {
            out.deleted.push(entry.clone());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, length: u64, hash: &[u8]) -> IndexEntry {
        IndexEntry {
            relative_path: path.into(),
            length,
            mtime: 1_700_000_000,
            hash: hash.to_vec(),
            chunks: Vec::new(),
        }
    }

    fn index_of(entries: Vec<IndexEntry>) -> Index {
        let mut idx = Index::new();
        for e in entries {
            idx.upsert(e);
        }
        idx
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let idx = index_of(vec![entry("Docs/Readme.MD", 10, b"h1")]);

        assert!(idx.file_exists("docs/readme.md"));
        assert!(idx.file_exists("DOCS/README.MD"));
        assert_eq!(
            idx.get_file("docs/readme.md").unwrap().relative_path,
            "Docs/Readme.MD",
            "original spelling is preserved"
        );
    }

    #[test]
    fn test_lookup_normalizes_separators() {
        let idx = index_of(vec![entry("a/b/c.txt", 1, b"h")]);
        assert!(idx.file_exists("a\\b\\c.txt"));
        assert!(idx.file_exists("/a/b/c.txt"));
    }

    #[test]
    fn test_diff_added_deleted_modified() {
        let local = index_of(vec![entry("a", 10, b"H1"), entry("b", 20, b"H2")]);
        let remote = index_of(vec![entry("a", 10, b"H1"), entry("c", 30, b"H3")]);

        let d = diff(&local, &remote);
        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].relative_path, "b");
        assert_eq!(d.deleted.len(), 1);
        assert_eq!(d.deleted[0].relative_path, "c");
        assert!(d.modified.is_empty());
    }

    #[test]
    fn test_diff_detects_hash_and_length_changes() {
        let local = index_of(vec![entry("a", 10, b"H1"), entry("b", 20, b"H2")]);
        let remote = index_of(vec![entry("a", 10, b"XX"), entry("b", 25, b"H2")]);

        let d = diff(&local, &remote);
        assert!(d.added.is_empty());
        assert!(d.deleted.is_empty());
        assert_eq!(d.modified.len(), 2);
    }

    #[test]
    fn test_diff_is_symmetric() {
        let x = index_of(vec![entry("a", 1, b"1"), entry("b", 2, b"2")]);
        let y = index_of(vec![entry("b", 2, b"2"), entry("c", 3, b"3")]);

        let xy = diff(&x, &y);
        let yx = diff(&y, &x);
        assert_eq!(xy.added, yx.deleted);
        assert_eq!(xy.deleted, yx.added);
    }

    #[test]
    fn test_diff_self_is_empty() {
        let x = index_of(vec![entry("a", 1, b"1"), entry("b", 2, b"2")]);
        assert!(diff(&x, &x).is_empty());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = index_of(vec![entry("a", 1, b"1")]);
        let snapshot = original.clone();
        original.remove("a");

        assert!(original.is_empty());
        assert!(snapshot.file_exists("a"));
    }
}
