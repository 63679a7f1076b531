use std::path::PathBuf;

/// Error kinds a caller can match on. Everything else fallible in this
/// workspace returns `anyhow::Error` and carries its context as a message
/// chain; these are the kinds callers need to distinguish
/// programmatically.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Cache timestamp is strictly newer than the manifest's at sync entry:
    /// the repository regressed relative to the cache.
    #[error("repository replay detected: cache is ahead of manifest")]
    RepositoryReplay,

    /// Another writer holds (or already upgraded) the cache lock.
    #[error("failed to upgrade lock on {path}")]
    LockUpgradeFailed { path: PathBuf },

    /// Decrypt failed, or a frame header was internally inconsistent.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
