//! A passphrase-derived `Key`. Real key management (KDF tuning, key files,
//! key rotation) is out of scope for this crate; this exists only so the
//! binary has a concrete, genuinely encrypting `Key` to drive the cache and
//! materializer against real on-disk chunks.

use anyhow::{bail, Error};
use openssl::rand::rand_bytes;
use openssl::sha::Sha256;
use openssl::symm::{Cipher, Crypter, Mode};

use ccache_types::{ChunkId, Key};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct PassphraseKey {
    key: [u8; 32],
}

impl PassphraseKey {
    pub fn derive(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        PassphraseKey {
            key: hasher.finish(),
        }
    }
}

impl Key for PassphraseKey {
    fn id_hash(&self, plaintext: &[u8]) -> ChunkId {
        let mut hasher = Sha256::new();
        hasher.update(plaintext);
        ChunkId::from_bytes(hasher.finish())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Cipher::aes_256_gcm();
        let mut nonce = [0u8; NONCE_LEN];
        rand_bytes(&mut nonce)?;

        let mut crypter = Crypter::new(cipher, Mode::Encrypt, &self.key, Some(&nonce))?;
        let mut ciphertext = vec![0u8; plaintext.len() + cipher.block_size()];
        let mut offset = crypter.update(plaintext, &mut ciphertext)?;
        offset += crypter.finalize(&mut ciphertext[offset..])?;
        ciphertext.truncate(offset);

        let mut tag = [0u8; TAG_LEN];
        crypter.get_tag(&mut tag)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn decrypt(&self, _id: &ChunkId, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            bail!("ciphertext too short to carry a nonce and integrity tag");
        }
        let (nonce, rest) = ciphertext.split_at(NONCE_LEN);
        let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

        let cipher = Cipher::aes_256_gcm();
        let mut crypter = Crypter::new(cipher, Mode::Decrypt, &self.key, Some(nonce))?;
        crypter.set_tag(tag)?;
        let mut plaintext = vec![0u8; body.len() + cipher.block_size()];
        let mut offset = crypter.update(body, &mut plaintext)?;
        offset += crypter
            .finalize(&mut plaintext[offset..])
            .map_err(|_| anyhow::anyhow!("integrity tag mismatch"))?;
        plaintext.truncate(offset);
        Ok(plaintext)
    }
}
