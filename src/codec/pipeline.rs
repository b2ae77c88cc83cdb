//! Encode/decode pipeline for blob payloads.
//!
//! Write path: gzip (kept only when it saves at least 10%), AES-CTR with the blob's
//! content-derived IV, CRC32 over the ciphertext. Read path reverses it and re-checks
//! the plaintext hash so a decode never returns unverified bytes.

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};

use crate::codec::cipher::CollectionKey;
use crate::error::{ChecksumKind, ChecksumMismatch, StoreError};
use crate::types::BlobRef;

/// Compressed form is kept only when `compressed / plaintext` is below this.
pub const COMPRESSION_RATIO_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlob {
    pub ciphertext: Vec<u8>,
    pub is_compressed: bool,
    pub crc32: u32,
}

pub fn encode_blob(
    blob_ref: &BlobRef,
    plaintext: &[u8],
    key: &CollectionKey,
    maybe_compressible: bool,
) -> Result<EncodedBlob, StoreError> {
    let compressed = if maybe_compressible {
        compress_if_worthwhile(plaintext)?
    } else {
        None
    };
    let is_compressed = compressed.is_some();
    let chosen = compressed.as_deref().unwrap_or(plaintext);

    let ciphertext = key.cipher_for(blob_ref).encrypt(chosen)?;
    let crc32 = crc32fast::hash(&ciphertext);

    Ok(EncodedBlob {
        ciphertext,
        is_compressed,
        crc32,
    })
}

/// Returns the gzip form when it beats the ratio threshold.
fn compress_if_worthwhile(plaintext: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
    if plaintext.is_empty() {
        return Ok(None);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plaintext)?;
    let compressed = encoder.finish()?;

    let ratio = compressed.len() as f64 / plaintext.len() as f64;
    if ratio < COMPRESSION_RATIO_THRESHOLD {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decrypts, decompresses and verifies the plaintext hash against `blob_ref`.
/// The ciphertext CRC is the caller's job (it is checked while streaming).
pub fn decode_blob(
    blob_ref: &BlobRef,
    ciphertext: &[u8],
    key: &CollectionKey,
    is_compressed: bool,
) -> Result<Vec<u8>, StoreError> {
    let decrypted = key.cipher_for(blob_ref).decrypt(ciphertext)?;

    let plaintext = if is_compressed {
        let mut out = Vec::new();
        GzDecoder::new(decrypted.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| StoreError::IntegrityMismatch(format!("blob {blob_ref}: gunzip: {e}")))?;
        out
    } else {
        decrypted
    };

    let actual = BlobRef::from_content(&plaintext);
    if actual != *blob_ref {
        return Err(ChecksumMismatch {
            kind: ChecksumKind::Sha256,
            expected: blob_ref.to_hex(),
            actual: actual.to_hex(),
        }
        .into_io()
        .into());
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOX: &[u8] = b"The quick brown fox jumps over the lazy dog";

    fn key() -> CollectionKey {
        CollectionKey::new("test-key", &[7u8; 32]).unwrap()
    }

    #[test]
    fn test_incompressible_text_stays_plain() {
        let r = BlobRef::from_content(FOX);
        let encoded = encode_blob(&r, FOX, &key(), true).unwrap();
        assert!(!encoded.is_compressed);
        assert_eq!(encoded.ciphertext.len(), 43);
        assert_eq!(encoded.crc32, crc32fast::hash(&encoded.ciphertext));
    }

    #[test]
    fn test_repetitive_text_is_compressed() {
        let plaintext = FOX.repeat(4);
        let r = BlobRef::from_content(&plaintext);
        let encoded = encode_blob(&r, &plaintext, &key(), true).unwrap();
        assert!(encoded.is_compressed);
        assert!(
            (encoded.ciphertext.len() as f64) < plaintext.len() as f64 * COMPRESSION_RATIO_THRESHOLD
        );

        let decoded = decode_blob(&r, &encoded.ciphertext, &key(), true).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn test_not_compressible_hint_skips_gzip() {
        let plaintext = FOX.repeat(4);
        let r = BlobRef::from_content(&plaintext);
        let encoded = encode_blob(&r, &plaintext, &key(), false).unwrap();
        assert!(!encoded.is_compressed);
        assert_eq!(encoded.ciphertext.len(), plaintext.len());
    }

    #[test]
    fn test_empty_blob_roundtrip() {
        let r = BlobRef::from_content(b"");
        let encoded = encode_blob(&r, b"", &key(), true).unwrap();
        assert!(!encoded.is_compressed);
        assert!(encoded.ciphertext.is_empty());
        assert!(decode_blob(&r, &encoded.ciphertext, &key(), false).unwrap().is_empty());
    }

    #[test]
    fn test_decode_with_wrong_key_fails_hash_check() {
        let r = BlobRef::from_content(FOX);
        let encoded = encode_blob(&r, FOX, &key(), true).unwrap();
        let other = CollectionKey::new("other", &[8u8; 32]).unwrap();
        let err = decode_blob(&r, &encoded.ciphertext, &other, false).unwrap_err();
        assert!(err.is_integrity_mismatch(), "{err}");
    }

    #[test]
    fn test_decode_corrupted_gzip_is_integrity_error() {
        let plaintext = FOX.repeat(4);
        let r = BlobRef::from_content(&plaintext);
        let mut encoded = encode_blob(&r, &plaintext, &key(), true).unwrap();
        encoded.ciphertext[12] ^= 0x55;
        let err = decode_blob(&r, &encoded.ciphertext, &key(), true).unwrap_err();
        assert!(err.is_integrity_mismatch(), "{err}");
    }
}
