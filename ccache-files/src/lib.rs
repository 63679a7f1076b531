//! Client-side file-identity cache: lets the chunker skip re-reading and
//! re-chunking a file whose `(size, inode, mtime_ns)` triple has not
//! changed since the last time it was cached.

mod record;

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use ccache_types::{ChunkId, PathHash};

use record::Record;

/// An entry is aged out (dropped at commit) once `age` reaches this.
const MAX_AGE: u32 = 10;

#[derive(Clone)]
pub struct FileEntry {
    pub age: u32,
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i64,
    pub chunk_ids: Vec<ChunkId>,
}

/// Mapping from `PathHash` to `FileEntry`, lazily loaded from `path` on
/// first `lookup`. Disabled instances ("check files by content" turned
/// off) are no-ops throughout.
pub struct FilesCache {
    path: PathBuf,
    enabled: bool,
    loaded: bool,
    entries: HashMap<PathHash, FileEntry>,
    /// Only set once the cache has actually been loaded from disk. This
    /// mirrors a quirk of the source cache: the "newest mtime observed
    /// this run" tracker is only initialized by the load path, so a
    /// session that only ever calls `memorize` without an intervening
    /// `lookup` has nothing to compare against. We surface that as an
    /// error here (see DESIGN.md) rather than silently defaulting it,
    /// since `memorize` without a prior `lookup` never happens on any
    /// real call path (the chunker always probes before it stores).
    newest_mtime_ns: Option<i64>,
}

impl FilesCache {
    /// `path` is the on-disk `files` file (inside the cache root, or
    /// inside `txn.active` while a transaction is open).
    pub fn new(path: PathBuf, enabled: bool) -> Self {
        FilesCache {
            path,
            enabled,
            loaded: false,
            entries: HashMap::new(),
            newest_mtime_ns: None,
        }
    }

    fn ensure_loaded(&mut self) -> Result<(), Error> {
        if self.loaded {
            return Ok(());
        }
        self.entries = if self.path.exists() {
            read_records(&self.path)?
        } else {
            HashMap::new()
        };
        self.newest_mtime_ns = Some(0);
        self.loaded = true;
        Ok(())
    }

    /// Returns the recorded chunk id list iff size, inode and mtime all
    /// match, and as a side effect resets the entry's age to 0.
    pub fn lookup(
        &mut self,
        path_hash: &PathHash,
        size: u64,
        inode: u64,
        mtime_ns: i64,
    ) -> Result<Option<Vec<ChunkId>>, Error> {
        if !self.enabled {
            return Ok(None);
        }
        self.ensure_loaded()?;

        match self.entries.get_mut(path_hash) {
            Some(entry) if entry.size == size && entry.inode == inode && entry.mtime_ns == mtime_ns => {
                entry.age = 0;
                Ok(Some(entry.chunk_ids.clone()))
            }
            _ => Ok(None),
        }
    }

    /// Stores a fresh entry with `age = 0` and folds `mtime_ns` into the
    /// run's newest-mtime tracker.
    pub fn memorize(
        &mut self,
        path_hash: PathHash,
        size: u64,
        inode: u64,
        mtime_ns: i64,
        chunk_ids: Vec<ChunkId>,
    ) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }
        let newest = match self.newest_mtime_ns.as_mut() {
            Some(newest) => newest,
            None => bail!(
                "files cache memorized an entry before it was loaded (no prior lookup this session)"
            ),
        };
        *newest = (*newest).max(mtime_ns);

        self.entries.insert(
            path_hash,
            FileEntry {
                age: 0,
                inode,
                size,
                mtime_ns,
                chunk_ids,
            },
        );
        Ok(())
    }

    /// Entries kept across a commit: `age < 10` and `mtime_ns` strictly
    /// less than the newest mtime observed this session.
    fn commit_survivors(&self) -> Vec<(&PathHash, &FileEntry)> {
        let newest = self.newest_mtime_ns.unwrap_or(0);
        self.entries
            .iter()
            .filter(|(_, entry)| entry.age < MAX_AGE && entry.mtime_ns < newest)
            .collect()
    }

    /// Applies the commit filter and writes the result to `path`
    /// (typically the final `files` path, inside a still-open
    /// transaction). Does not mutate `self`; the transaction manager
    /// reopens a fresh `FilesCache` for the next session.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let mut buffer = Vec::new();
        for (path_hash, entry) in self.commit_survivors() {
            let record = Record {
                path_hash: *path_hash.as_bytes(),
                age: entry.age,
                inode: entry.inode,
                size: entry.size,
                mtime_ns: entry.mtime_ns,
                chunk_ids: entry.chunk_ids.iter().map(|id| *id.as_bytes()).collect(),
            };
            let mut serializer = rmp_serde::Serializer::new(&mut buffer);
            serde::Serialize::serialize(&record, &mut serializer)?;
        }
        proxmox_sys::fs::replace_file(path, &buffer, proxmox_sys::fs::CreateOptions::new(), true)
    }
}

fn read_records(path: &Path) -> Result<HashMap<PathHash, FileEntry>, Error> {
    let mut file = std::fs::File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut entries = HashMap::new();
    let mut cursor = std::io::Cursor::new(&data[..]);
    while (cursor.position() as usize) < data.len() {
        let mut deserializer = rmp_serde::Deserializer::new(&mut cursor);
        let record: Record = match serde::Deserialize::deserialize(&mut deserializer) {
            Ok(record) => record,
            Err(_) => break,
        };
        entries.insert(
            PathHash::from_bytes(record.path_hash),
            FileEntry {
                age: record.age + 1,
                inode: record.inode,
                size: record.size,
                mtime_ns: record.mtime_ns,
                chunk_ids: record.chunk_ids.into_iter().map(ChunkId::from_bytes).collect(),
            },
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ccache-files-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_lookup_miss_before_any_memorize() {
        let path = scratch_path("miss");
        let mut cache = FilesCache::new(path.clone(), true);
        let hash = PathHash::from_bytes([1u8; 32]);
        assert!(cache.lookup(&hash, 10, 1, 100).unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_memorize_then_lookup_hit() {
        let path = scratch_path("hit");
        let mut cache = FilesCache::new(path.clone(), true);
        let hash = PathHash::from_bytes([2u8; 32]);

        // touch the lazy-load path first, as a real caller always does
        // (lookup precedes memorize on every call path).
        assert!(cache.lookup(&hash, 10, 1, 100).unwrap().is_none());

        let ids = vec![ChunkId::from_bytes([9u8; 32])];
        cache.memorize(hash, 10, 1, 100, ids.clone()).unwrap();

        let found = cache.lookup(&hash, 10, 1, 100).unwrap();
        assert_eq!(found, Some(ids));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_memorize_before_load_fails() {
        let path = scratch_path("premature");
        let mut cache = FilesCache::new(path.clone(), true);
        let hash = PathHash::from_bytes([3u8; 32]);
        let err = cache.memorize(hash, 1, 1, 1, vec![]);
        assert!(err.is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_disabled_cache_is_a_noop() {
        let path = scratch_path("disabled");
        let mut cache = FilesCache::new(path.clone(), false);
        let hash = PathHash::from_bytes([4u8; 32]);
        assert!(cache.lookup(&hash, 1, 1, 1).unwrap().is_none());
        cache.memorize(hash, 1, 1, 1, vec![]).unwrap();
        assert!(cache.lookup(&hash, 1, 1, 1).unwrap().is_none());
    }

    #[test]
    fn test_commit_filter_drops_aged_and_newest_mtime_entries() {
        let path = scratch_path("commit");
        let mut cache = FilesCache::new(path.clone(), true);

        let kept_hash = PathHash::from_bytes([5u8; 32]);
        let dropped_hash = PathHash::from_bytes([6u8; 32]);

        // trigger load
        let _ = cache.lookup(&kept_hash, 0, 0, 0).unwrap();

        cache
            .memorize(kept_hash, 10, 1, 50, vec![ChunkId::from_bytes([1u8; 32])])
            .unwrap();
        // this becomes the run's newest mtime, so it is dropped at commit
        cache
            .memorize(dropped_hash, 10, 1, 999, vec![ChunkId::from_bytes([2u8; 32])])
            .unwrap();

        let out_path = scratch_path("commit-out");
        cache.write(&out_path).unwrap();

        let reloaded = read_records(&out_path).unwrap();
        assert!(reloaded.contains_key(&kept_hash));
        assert!(!reloaded.contains_key(&dropped_hash));

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&out_path);
    }
}
