//! Deterministic, reversible stand-in for the cache's key abstraction
//! (§3 "Key", out of scope). Not cryptographically meaningful: XORs
//! plaintext against a fixed byte and appends a sha256 tag so
//! authentication failure (the one behavior tests need) is reproducible.

use anyhow::{bail, Error};

use ccache_types::{ChunkId, Key};

const XOR_BYTE: u8 = 0x5a;

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ XOR_BYTE).collect()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(data);
    hasher.finish()
}

#[derive(Clone, Copy, Default)]
pub struct TestKey;

impl Key for TestKey {
    fn id_hash(&self, plaintext: &[u8]) -> ChunkId {
        ChunkId::from_bytes(sha256(plaintext))
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = xor(plaintext);
        out.extend_from_slice(&sha256(plaintext));
        Ok(out)
    }

    fn decrypt(&self, _id: &ChunkId, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() < 32 {
            bail!("ciphertext too short to carry an integrity tag");
        }
        let (body, tag) = ciphertext.split_at(ciphertext.len() - 32);
        let plaintext = xor(body);
        if sha256(&plaintext) != tag {
            bail!("integrity tag mismatch");
        }
        Ok(plaintext)
    }
}
