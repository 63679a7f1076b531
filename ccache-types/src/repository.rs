use anyhow::Error;

use crate::chunk::ChunkId;

/// The remote or local content-addressed blob store the cache sits in
/// front of. Transport and storage are out of scope here: this crate only
/// consumes the interface.
pub trait Repository {
    /// Stable identifier for the repository, used to derive the cache
    /// subdirectory name.
    fn id(&self) -> [u8; 32];

    /// Fetches the raw (encrypted) blob stored under `id`.
    fn get(&self, id: &ChunkId) -> Result<Vec<u8>, Error>;

    /// Fetches several blobs. Implementations may pipeline the underlying
    /// requests; callers only see a synchronous iterator.
    fn get_many<'a>(
        &'a self,
        ids: &'a [ChunkId],
    ) -> Box<dyn Iterator<Item = Result<Vec<u8>, Error>> + 'a>;

    /// Stores `ciphertext` under `id`. When `wait` is false this may return
    /// before the write is durable; the repository is responsible for
    /// flushing before any manifest write that depends on it.
    fn put(&self, id: &ChunkId, ciphertext: &[u8], wait: bool) -> Result<(), Error>;

    /// Deletes the blob stored under `id`, best-effort when `wait` is false.
    fn delete(&self, id: &ChunkId, wait: bool) -> Result<(), Error>;
}

/// The cryptographic key abstraction the cache uses to name and protect
/// chunk contents. Key derivation itself lives elsewhere and is out of
/// scope here; this crate only consumes the interface.
pub trait Key {
    /// Derives a `ChunkId` from plaintext bytes.
    fn id_hash(&self, plaintext: &[u8]) -> ChunkId;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Decrypts `ciphertext` previously stored under `id`. Implementations
    /// must fail (not silently truncate) on authentication failure; callers
    /// surface this as `CacheError::Integrity`.
    fn decrypt(&self, id: &ChunkId, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;
}
