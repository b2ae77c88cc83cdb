//! Streaming verification: readers that checksum everything passing through and fail
//! the read at EOF when the digest does not match.

use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{ChecksumKind, ChecksumMismatch};
use crate::types::BlobRef;

/// Incremental checksum with a fixed expected value.
pub trait Verifier: Unpin {
    fn update(&mut self, data: &[u8]);

    /// Called once at EOF.
    fn verify(&mut self) -> Result<(), ChecksumMismatch>;
}

pub struct Sha256Verifier {
    hasher: Sha256,
    expected: BlobRef,
}

impl Sha256Verifier {
    pub fn new(expected: BlobRef) -> Self {
        Self {
            hasher: Sha256::new(),
            expected,
        }
    }
}

impl Verifier for Sha256Verifier {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn verify(&mut self) -> Result<(), ChecksumMismatch> {
        let actual: [u8; 32] = self.hasher.finalize_reset().into();
        if actual == *self.expected.as_bytes() {
            return Ok(());
        }
        Err(ChecksumMismatch {
            kind: ChecksumKind::Sha256,
            expected: self.expected.to_hex(),
            actual: hex::encode(actual),
        })
    }
}

pub struct Crc32Verifier {
    hasher: crc32fast::Hasher,
    expected: u32,
}

impl Crc32Verifier {
    pub fn new(expected: u32) -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
            expected,
        }
    }
}

impl Verifier for Crc32Verifier {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn verify(&mut self) -> Result<(), ChecksumMismatch> {
        let actual = std::mem::take(&mut self.hasher).finalize();
        if actual == self.expected {
            return Ok(());
        }
        Err(ChecksumMismatch {
            kind: ChecksumKind::Crc32,
            expected: format!("{:08x}", self.expected),
            actual: format!("{actual:08x}"),
        })
    }
}

/// `AsyncRead` adapter feeding a `Verifier`. Bytes are handed out as they stream, so
/// callers must treat the content as untrusted until they observe a clean EOF.
pub struct VerifyingReader<R, V> {
    inner: R,
    verifier: V,
    outcome: Option<Result<(), ChecksumMismatch>>,
}

impl<R, V> VerifyingReader<R, V> {
    pub fn new(inner: R, verifier: V) -> Self {
        Self {
            inner,
            verifier,
            outcome: None,
        }
    }
}

impl<R> VerifyingReader<R, Sha256Verifier> {
    pub fn sha256(inner: R, expected: BlobRef) -> Self {
        Self::new(inner, Sha256Verifier::new(expected))
    }
}

impl<R> VerifyingReader<R, Crc32Verifier> {
    pub fn crc32(inner: R, expected: u32) -> Self {
        Self::new(inner, Crc32Verifier::new(expected))
    }
}

impl<R, V> AsyncRead for VerifyingReader<R, V>
where
    R: AsyncRead + Unpin,
    V: Verifier,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // a failed digest stays failed for every later read
        if let Some(outcome) = &this.outcome {
            return Poll::Ready(outcome.clone().map_err(ChecksumMismatch::into_io));
        }

        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];

        if !fresh.is_empty() {
            this.verifier.update(fresh);
        } else if had_room {
            let outcome = this.verifier.verify();
            this.outcome = Some(outcome.clone());
            outcome.map_err(ChecksumMismatch::into_io)?;
        }
        Poll::Ready(Ok(()))
    }
}
