use std::fmt;

/// 32-byte digest of a normalized absolute file path, used as the
/// `FilesCache` key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathHash(pub [u8; 32]);

impl PathHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PathHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest a normalized absolute path the same way the files cache key
    /// is derived: sha256 over the path's raw bytes.
    pub fn of(path: &std::path::Path) -> Self {
        let mut hasher = openssl::sha::Sha256::new();
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            hasher.update(path.as_os_str().as_bytes());
        }
        #[cfg(not(unix))]
        {
            hasher.update(path.to_string_lossy().as_bytes());
        }
        PathHash(hasher.finish())
    }
}

impl fmt::Debug for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathHash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for PathHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
