use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use ccache_files::FilesCache;
use ccache_index::ChunkIndex;
use ccache_lock::UpgradableLock;
use ccache_types::{CacheError, ChunkEntry, ChunkId, Key, PathHash, Repository, Stats};

use crate::config::CacheConfig;
use crate::manifest::Manifest;
use crate::sync;
use crate::txn;

const README_BANNER: &str = "This is a deduplicating backup client's chunk cache.\n";

/// Client-side chunk cache: chunk index, files cache, and the transaction
/// protocol wrapping both, sitting behind a single advisory lock per the
/// single-writer model (§5).
pub struct Cache<R, K> {
    root: PathBuf,
    lock: UpgradableLock,
    config: CacheConfig,
    chunks: ChunkIndex,
    files: FilesCache,
    txn_active: bool,
    stats: Stats,
    repository: R,
    key: K,
}

impl<R: Repository, K: Key> Cache<R, K> {
    /// Creates a new, empty cache directory at `root`.
    pub fn create(root: &Path, repository_id: [u8; 32]) -> Result<(), Error> {
        std::fs::create_dir_all(root)?;
        std::fs::write(root.join("README"), README_BANNER)?;

        let config = CacheConfig::new(repository_id);
        std::fs::write(root.join(txn::CONFIG_FILE), config.to_ini_string())?;

        ChunkIndex::new().write(&root.join(txn::CHUNKS_FILE))?;
        std::fs::write(root.join(txn::FILES_FILE), [])?;
        Ok(())
    }

    /// Opens an existing cache, taking the exclusive advisory lock and
    /// rolling back any transaction left behind by a crashed process.
    ///
    /// `check_files` toggles the files cache: when false, `lookup` always
    /// misses and `memorize` is a no-op (the on-disk `files` file is left
    /// untouched).
    pub fn open(root: PathBuf, repository: R, key: K, check_files: bool) -> Result<Self, Error> {
        if !root.is_dir() {
            bail!("{:?} does not look like a cache directory", root);
        }

        let lock = UpgradableLock::new_exclusive(root.join(txn::CONFIG_FILE))?;
        txn::rollback(&root)?;

        let config_text = std::fs::read_to_string(root.join(txn::CONFIG_FILE))?;
        let config = CacheConfig::parse(&config_text)?;

        let chunks = ChunkIndex::read(&root.join(txn::CHUNKS_FILE))?;
        let files = FilesCache::new(root.join(txn::FILES_FILE), check_files);

        Ok(Cache {
            root,
            lock,
            config,
            chunks,
            files,
            txn_active: false,
            stats: Stats::default(),
            repository,
            key,
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Ensures the chunk index reflects `manifest` (identified by
    /// `manifest_id`, the id_hash of its serialized bytes). A no-op if
    /// the cache already agrees with the manifest. Fails with
    /// `RepositoryReplay` if the cache's recorded timestamp is strictly
    /// newer than the manifest's — the repository regressed relative to
    /// what this cache last saw.
    pub fn ensure_synced(&mut self, manifest_id: ChunkId, manifest: &Manifest) -> Result<(), Error> {
        if self.config.manifest_id == Some(manifest_id) {
            return Ok(());
        }

        if let Some(cache_timestamp) = &self.config.timestamp {
            if cache_timestamp.as_str() > manifest.timestamp.as_str() {
                return Err(CacheError::RepositoryReplay.into());
            }
        }

        self.begin_if_needed()?;
        sync::sync(&self.repository, &self.key, manifest, &mut self.chunks)?;
        self.commit(manifest_id, manifest)
    }

    pub fn lookup_file(
        &mut self,
        path_hash: &PathHash,
        size: u64,
        inode: u64,
        mtime_ns: i64,
    ) -> Result<Option<Vec<ChunkId>>, Error> {
        self.files.lookup(path_hash, size, inode, mtime_ns)
    }

    pub fn memorize_file(
        &mut self,
        path_hash: PathHash,
        size: u64,
        inode: u64,
        mtime_ns: i64,
        chunk_ids: Vec<ChunkId>,
    ) -> Result<(), Error> {
        self.files.memorize(path_hash, size, inode, mtime_ns, chunk_ids)
    }

    pub fn seen_chunk(&self, id: &ChunkId) -> bool {
        self.chunks.get(id).is_some()
    }

    /// `add_chunk`: opens a transaction on first call this session. If
    /// the chunk is already known, this is just an incref (no repository
    /// traffic). Otherwise encrypts, stores, and records a fresh entry.
    pub fn add_chunk(&mut self, plaintext: &[u8]) -> Result<(ChunkId, u32, u32), Error> {
        self.begin_if_needed()?;

        let id = self.key.id_hash(plaintext);
        if self.seen_chunk(&id) {
            return self.chunk_incref(&id);
        }

        let ciphertext = self.key.encrypt(plaintext)?;
        let size = plaintext.len() as u32;
        let csize = ciphertext.len() as u32;

        self.repository.put(&id, &ciphertext, false)?;
        self.chunks.set(&id, ChunkEntry::new(size, csize));
        self.stats.chunk_added(size as u64, csize as u64, true);

        Ok((id, size, csize))
    }

    pub fn chunk_incref(&mut self, id: &ChunkId) -> Result<(ChunkId, u32, u32), Error> {
        self.begin_if_needed()?;

        let mut entry = self
            .chunks
            .get(id)
            .ok_or_else(|| format_err!("incref of unknown chunk {}", id))?;
        entry.refcount += 1;
        self.chunks.set(id, entry);
        self.stats
            .chunk_added(entry.plaintext_size as u64, entry.ciphertext_size as u64, false);

        Ok((*id, entry.plaintext_size, entry.ciphertext_size))
    }

    pub fn chunk_decref(&mut self, id: &ChunkId) -> Result<(), Error> {
        self.begin_if_needed()?;

        let entry = self
            .chunks
            .get(id)
            .ok_or_else(|| format_err!("decref of unknown chunk {}", id))?;

        if entry.refcount == 1 {
            self.chunks.remove(id);
            self.repository.delete(id, false)?;
            self.stats
                .chunk_freed(entry.plaintext_size as u64, entry.ciphertext_size as u64, true);
        } else {
            let mut updated = entry;
            updated.refcount -= 1;
            self.chunks.set(id, updated);
            self.stats
                .chunk_freed(entry.plaintext_size as u64, entry.ciphertext_size as u64, false);
        }

        Ok(())
    }

    fn begin_if_needed(&mut self) -> Result<(), Error> {
        if !self.txn_active {
            self.lock.upgrade()?;
            txn::begin(&self.root)?;
            self.txn_active = true;
        }
        Ok(())
    }

    /// Commit point: rewrites `files` (age/mtime filtered), `config`
    /// (new manifest id + timestamp), `chunks`, then renames
    /// `txn.active` away. A no-op if there is no open transaction.
    pub fn commit(&mut self, manifest_id: ChunkId, manifest: &Manifest) -> Result<(), Error> {
        if !self.txn_active {
            return Ok(());
        }

        self.files.write(&self.root.join(txn::FILES_FILE))?;

        self.config.manifest_id = Some(manifest_id);
        self.config.timestamp = Some(manifest.timestamp.clone());
        std::fs::write(self.root.join(txn::CONFIG_FILE), self.config.to_ini_string())?;

        self.chunks.write(&self.root.join(txn::CHUNKS_FILE))?;

        txn::commit_rename(&self.root)?;
        self.txn_active = false;
        Ok(())
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.lock.is_exclusive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccache_testkit::{build_manifest, ArchiveBuilder, ManifestEntry, MemoryRepository, TestKey};

    fn temp_root(case: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "ccache-core-test-{}-{}-{:x}",
            case,
            std::process::id(),
            std::ptr::addr_of!(case) as usize
        ));
        path
    }

    /// S1: an empty manifest syncs to zero chunk-index entries, and the
    /// committed config records the manifest's own id.
    #[test]
    fn test_empty_repo_sync_is_noop() {
        let root = temp_root("s1");
        let repository = MemoryRepository::new([0x11; 32]);
        let key = TestKey;

        Cache::create(&root, repository.id()).unwrap();
        let mut cache = Cache::open(root.clone(), repository.clone(), key, true).unwrap();

        let manifest_id = build_manifest(&repository, &key, "2024-01-01T00:00:00", &[]).unwrap();
        let ciphertext = repository.get(&ccache_types::ChunkId::MANIFEST).unwrap();
        let plaintext = key.decrypt(&ccache_types::ChunkId::MANIFEST, &ciphertext).unwrap();
        let manifest = Manifest::decode(&plaintext).unwrap();

        cache.ensure_synced(manifest_id, &manifest).unwrap();

        assert_eq!(cache.config().manifest_id, Some(manifest_id));
        assert_eq!(cache.config().timestamp.as_deref(), Some("2024-01-01T00:00:00"));

        let reopened = ChunkIndex::read(&root.join(txn::CHUNKS_FILE)).unwrap();
        assert_eq!(reopened.len(), 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    /// S2: incref/decref accounting and the delete-on-last-decref contract.
    #[test]
    fn test_incref_decref_lifecycle() {
        let root = temp_root("s2");
        let repository = MemoryRepository::new([0x22; 32]);
        let key = TestKey;

        Cache::create(&root, repository.id()).unwrap();
        let mut cache = Cache::open(root.clone(), repository.clone(), key, true).unwrap();

        let (id, size, csize) = cache.add_chunk(b"hello").unwrap();
        assert_eq!(size, 5);
        assert_eq!(cache.chunks.get(&id), Some(ChunkEntry { refcount: 1, plaintext_size: 5, ciphertext_size: csize }));

        let (id2, ..) = cache.add_chunk(b"hello").unwrap();
        assert_eq!(id2, id);
        assert_eq!(cache.chunks.get(&id).unwrap().refcount, 2);
        assert!(repository.contains(&id));

        cache.chunk_decref(&id).unwrap();
        assert_eq!(cache.chunks.get(&id).unwrap().refcount, 1);
        assert!(repository.contains(&id));

        cache.chunk_decref(&id).unwrap();
        assert!(cache.chunks.get(&id).is_none());
        assert!(!repository.contains(&id));

        let _ = std::fs::remove_dir_all(&root);
    }

    /// S3: a process that dies after `begin` but before `commit` leaves
    /// `txn.active/`; the next `open` rolls it back to the pre-begin
    /// snapshot and transactions work again afterwards.
    #[test]
    fn test_crash_mid_transaction_rolls_back() {
        let root = temp_root("s3");
        let repository = MemoryRepository::new([0x33; 32]);
        let key = TestKey;

        Cache::create(&root, repository.id()).unwrap();
        {
            let mut cache = Cache::open(root.clone(), repository.clone(), key, true).unwrap();
            cache.add_chunk(b"uncommitted").unwrap();
            // Process "crashes" here: cache is dropped with txn.active/
            // left on disk and no commit ever run.
        }

        assert!(root.join("txn.active").is_dir());

        let cache = Cache::open(root.clone(), repository.clone(), key, true).unwrap();
        assert!(!root.join("txn.active").exists());
        assert!(!root.join("txn.tmp").exists());
        assert_eq!(cache.stats().total_chunks, 0);

        let chunks = ChunkIndex::read(&root.join(txn::CHUNKS_FILE)).unwrap();
        assert_eq!(chunks.len(), 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    /// S4: a cache whose recorded timestamp is newer than the manifest's
    /// refuses to sync.
    #[test]
    fn test_replay_guard_rejects_regressed_manifest() {
        let root = temp_root("s4");
        let repository = MemoryRepository::new([0x44; 32]);
        let key = TestKey;

        Cache::create(&root, repository.id()).unwrap();
        let mut cache = Cache::open(root.clone(), repository.clone(), key, true).unwrap();

        let first_id = build_manifest(&repository, &key, "2024-01-02T00:00:00", &[]).unwrap();
        {
            let ciphertext = repository.get(&ccache_types::ChunkId::MANIFEST).unwrap();
            let plaintext = key.decrypt(&ccache_types::ChunkId::MANIFEST, &ciphertext).unwrap();
            let manifest = Manifest::decode(&plaintext).unwrap();
            cache.ensure_synced(first_id, &manifest).unwrap();
        }
        assert_eq!(cache.config().timestamp.as_deref(), Some("2024-01-02T00:00:00"));

        let stale = ArchiveBuilder::new();
        let root_id = stale.build_v1(&repository, &key).unwrap();
        let stale_manifest_id = build_manifest(
            &repository,
            &key,
            "2024-01-01T00:00:00",
            &[ManifestEntry {
                name: "home".to_string(),
                root_id,
                timestamp: "2024-01-01T00:00:00".to_string(),
            }],
        )
        .unwrap();
        let ciphertext = repository.get(&ccache_types::ChunkId::MANIFEST).unwrap();
        let plaintext = key.decrypt(&ccache_types::ChunkId::MANIFEST, &ciphertext).unwrap();
        let stale_manifest = Manifest::decode(&plaintext).unwrap();

        let err = cache
            .ensure_synced(stale_manifest_id, &stale_manifest)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::RepositoryReplay)
        ));

        let _ = std::fs::remove_dir_all(&root);
    }
}
