//! I/O filters shared by the download and upload paths.

#[cfg(feature = "tokio")]
use std::marker::Unpin;
#[cfg(feature = "tokio")]
use std::pin::Pin;
#[cfg(feature = "tokio")]
use std::sync::Arc;
#[cfg(feature = "tokio")]
use std::task::{Context, Poll};

#[cfg(feature = "tokio")]
use digest::{Digest, Output as DigestOutput};
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, ReadBuf};
#[cfg(feature = "tokio")]
use tokio::sync::OnceCell;

/// `AsyncRead` filter that hashes the bytes read through it.
///
/// The digest is finalized when EOF is reached. Used both to verify a
/// completed download and to re-hash the existing prefix of a `.partial`
/// file before resuming it.
#[cfg(feature = "tokio")]
pub struct HashReader<R, D>
where
    R: AsyncRead + Unpin,
    D: Digest + Unpin,
{
    inner: R,
    digest: Option<D>,
    bytes_read: u64,
    finalized: Arc<OnceCell<(DigestOutput<D>, u64)>>,
}

#[cfg(feature = "tokio")]
impl<R, D> HashReader<R, D>
where
    R: AsyncRead + Unpin,
    D: Digest + Unpin,
{
    pub fn new(inner: R, digest: D) -> (Self, Arc<OnceCell<(DigestOutput<D>, u64)>>) {
        let finalized = Arc::new(OnceCell::new());

        (
            Self {
                inner,
                digest: Some(digest),
                bytes_read: 0,
                finalized: finalized.clone(),
            },
            finalized,
        )
    }

    /// Bytes consumed so far, regardless of finalization.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

#[cfg(feature = "tokio")]
impl<R, D> AsyncRead for HashReader<R, D>
where
    R: AsyncRead + Unpin,
    D: Digest + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        let old_filled = buf.filled().len();
        let r = Pin::new(&mut self.inner).poll_read(cx, buf);
        let read_len = buf.filled().len() - old_filled;

        match r {
            Poll::Ready(Ok(())) => {
                if read_len == 0 {
                    if let Some(digest) = self.digest.take() {
                        let _ = self
                            .finalized
                            .set((digest.finalize(), self.bytes_read));
                    }
                } else {
                    let digest = self.digest.as_mut().expect("stream has data after EOF");
                    let filled = buf.filled();
                    digest.update(&filled[filled.len() - read_len..]);
                    self.bytes_read += read_len as u64;
                }
            }
            Poll::Ready(Err(_)) => {
                debug_assert_eq!(read_len, 0);
            }
            Poll::Pending => {}
        }

        r
    }
}
