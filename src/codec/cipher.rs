//! Deterministic AES-CTR for content-addressed blobs.
//!
//! A `CollectionKey` never encrypts anything by itself. The only way to get a cipher is
//! `CollectionKey::cipher_for(blob_ref)`, which fixes the IV to the first 16 bytes of the
//! blob's own content hash. With one key per collection that yields one IV per unique
//! plaintext, and identical plaintexts produce byte-identical ciphertext.

use openssl::symm::{Cipher, Crypter, Mode};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::StoreError;
use crate::types::BlobRef;

/// A collection's data encryption key, already unwrapped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CollectionKey {
    #[zeroize(skip)]
    key_id: String,
    key: Vec<u8>,
}

impl CollectionKey {
    /// Accepts 16, 24 or 32 byte keys (AES-128/192/256).
    pub fn new(key_id: impl Into<String>, key: &[u8]) -> Result<Self, StoreError> {
        Self::cipher_for_len(key.len())?;
        Ok(Self {
            key_id: key_id.into(),
            key: key.to_vec(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Binds this key to one blob.
    pub fn cipher_for(&self, blob_ref: &BlobRef) -> BlobCipher<'_> {
        BlobCipher {
            key: self,
            iv: blob_ref.encryption_iv(),
        }
    }

    fn cipher_for_len(len: usize) -> Result<Cipher, StoreError> {
        match len {
            16 => Ok(Cipher::aes_128_ctr()),
            24 => Ok(Cipher::aes_192_ctr()),
            32 => Ok(Cipher::aes_256_ctr()),
            other => Err(StoreError::Configuration(format!(
                "unsupported encryption key length {other}"
            ))),
        }
    }
}

impl fmt::Debug for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// A collection key bound to a single blob's IV.
pub struct BlobCipher<'a> {
    key: &'a CollectionKey,
    iv: [u8; 16],
}

impl BlobCipher<'_> {
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.apply(Mode::Encrypt, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.apply(Mode::Decrypt, ciphertext)
    }

    fn apply(&self, mode: Mode, input: &[u8]) -> Result<Vec<u8>, StoreError> {
        let cipher = CollectionKey::cipher_for_len(self.key.key.len())?;
        let mut crypter = Crypter::new(cipher, mode, &self.key.key, Some(&self.iv))?;
        let mut out = Zeroizing::new(vec![0u8; input.len() + cipher.block_size()]);
        let mut n = crypter.update(input, &mut out)?;
        n += crypter.finalize(&mut out[n..])?;
        Ok(out[..n].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: [u8; 32] = [0x11; 32];
    const KEY_B: [u8; 32] = [0x22; 32];

    #[test]
    fn test_ctr_preserves_length_and_roundtrips() {
        let key = CollectionKey::new("k", &KEY_A).unwrap();
        let data = b"The quick brown fox jumps over the lazy dog";
        let r = BlobRef::from_content(data);

        let ct = key.cipher_for(&r).encrypt(data).unwrap();
        assert_eq!(ct.len(), data.len());
        assert_ne!(&ct[..], &data[..]);
        assert_eq!(key.cipher_for(&r).decrypt(&ct).unwrap(), data);
    }

    #[test]
    fn test_same_plaintext_same_ciphertext_per_key() {
        let a = CollectionKey::new("a", &KEY_A).unwrap();
        let b = CollectionKey::new("b", &KEY_B).unwrap();
        let data = b"content";
        let r = BlobRef::from_content(data);

        let a1 = a.cipher_for(&r).encrypt(data).unwrap();
        let a2 = a.cipher_for(&r).encrypt(data).unwrap();
        let b1 = b.cipher_for(&r).encrypt(data).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b1);
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let err = CollectionKey::new("short", &[0u8; 15]).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(CollectionKey::new("aes128", &[0u8; 16]).is_ok());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = CollectionKey::new("visible-id", &KEY_A).unwrap();
        let dbg = format!("{key:?}");
        assert!(dbg.contains("visible-id"));
        assert!(!dbg.contains("17"));
    }
}
