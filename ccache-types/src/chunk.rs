use std::fmt;

/// 32-byte content identifier produced by the key's `id_hash`.
///
/// Equality is plain byte equality; ordering is derived so `ChunkId` can be
/// used as a `BTreeMap`/`BTreeSet` key where that is convenient, but the
/// primary lookup structure (`ccache-index`) hashes it directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub [u8; 32]);

impl ChunkId {
    pub const LEN: usize = 32;

    /// The manifest's well-known sentinel id: 32 zero bytes.
    pub const MANIFEST: ChunkId = ChunkId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ChunkId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_manifest(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(ChunkId(out))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for ChunkId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ChunkId {
    fn from(bytes: [u8; 32]) -> Self {
        ChunkId(bytes)
    }
}

/// An entry in the chunk index: reference count plus the plaintext and
/// ciphertext sizes recorded at insert time.
///
/// Invariant: `refcount >= 1` while the entry is present in a `ChunkIndex`;
/// absence of an id means "not known to this cache", there is no zero-refcount
/// representation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChunkEntry {
    pub refcount: u32,
    pub plaintext_size: u32,
    pub ciphertext_size: u32,
}

impl ChunkEntry {
    pub fn new(plaintext_size: u32, ciphertext_size: u32) -> Self {
        ChunkEntry {
            refcount: 1,
            plaintext_size,
            ciphertext_size,
        }
    }
}
