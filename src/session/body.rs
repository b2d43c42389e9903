//! SHA-256 tee over a fetched body stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::types::Digest;

/// An `AsyncRead` adapter that hashes every byte it passes through.
///
/// Snapshot and delta bodies must be digested in full, including bytes the
/// parser never looks at; notification bodies must not be digested at all.
/// The same reader type serves both so the fetch path does not fork.
pub(crate) struct DigestingReader<R> {
    inner: R,
    context: Option<Sha256>,
}

impl<R> DigestingReader<R> {
    /// Wraps `inner`, hashing iff `digest` is set.
    pub(crate) fn new(inner: R, digest: bool) -> Self {
        DigestingReader {
            inner,
            context: digest.then(Sha256::new),
        }
    }

    /// Finalizes the digest over everything read so far.
    ///
    /// Returns `None` when the reader was created without digesting.
    pub(crate) fn finalize(self) -> Option<Digest> {
        self.context
            .map(|context| Digest::from(<[u8; 32]>::from(context.finalize())))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let already_filled = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(context) = &mut me.context {
                    context.update(&buf.filled()[already_filled..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn digest_of(data: &[u8]) -> Digest {
        let mut context = Sha256::new();
        context.update(data);
        Digest::from(<[u8; 32]>::from(context.finalize()))
    }

    #[tokio::test]
    async fn digests_every_byte_regardless_of_chunking() {
        let data: Vec<u8> = (0u8..=255).cycle().take(100_000).collect();

        let mut reader = DigestingReader::new(std::io::Cursor::new(data.clone()), true);
        let mut out = Vec::new();
        // Small reads force many partial fills.
        let mut chunk = [0u8; 977];
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }

        assert_eq!(out, data);
        assert_eq!(reader.finalize(), Some(digest_of(&data)));
    }

    #[tokio::test]
    async fn passthrough_mode_yields_no_digest() {
        let mut reader = DigestingReader::new(std::io::Cursor::new(b"body".to_vec()), false);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"body");
        assert_eq!(reader.finalize(), None);
    }

    #[tokio::test]
    async fn empty_stream_digests_to_empty_input_hash() {
        let reader = DigestingReader::new(std::io::Cursor::new(Vec::<u8>::new()), true);
        assert_eq!(reader.finalize(), Some(digest_of(b"")));
    }
}
