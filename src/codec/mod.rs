//! Blob codec: compression, deterministic encryption and checksum verification.

pub mod cipher;
pub mod pipeline;
pub mod verify;

pub use cipher::{BlobCipher, CollectionKey};
pub use pipeline::{COMPRESSION_RATIO_THRESHOLD, EncodedBlob, decode_blob, encode_blob};
pub use verify::{Crc32Verifier, Sha256Verifier, Verifier, VerifyingReader};
