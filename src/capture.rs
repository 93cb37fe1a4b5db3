//! Tee a streaming body into a bounded in-memory copy
//!
//! The client keeps streaming while the wrapper accumulates what passes
//! through. The copy is delivered only if the stream ends cleanly within the
//! byte limit; an error, an early drop or an overflow delivers nothing, so a
//! truncated body can never reach the cache.

use crate::error::Result;
use crate::transport::BodyStream;
use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// Stream adapter that forwards every chunk and keeps a copy
pub struct CaptureStream {
    inner: BodyStream,
    buffer: BytesMut,
    limit: usize,
    sender: Option<oneshot::Sender<Bytes>>,
}

impl CaptureStream {
    /// Wrap `inner`; the receiver yields the complete body or is closed
    pub fn new(inner: BodyStream, limit: usize) -> (Self, oneshot::Receiver<Bytes>) {
        let (sender, receiver) = oneshot::channel();
        let stream = CaptureStream {
            inner,
            buffer: BytesMut::new(),
            limit,
            sender: Some(sender),
        };
        (stream, receiver)
    }

    fn abandon(&mut self, reason: &str) {
        if self.sender.take().is_some() {
            debug!("Dropping body capture: {}", reason);
        }
        self.buffer = BytesMut::new();
    }
}

impl Stream for CaptureStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.sender.is_some() {
                    if this.buffer.len() + chunk.len() > this.limit {
                        this.abandon("body exceeds cacheable size");
                    } else {
                        this.buffer.extend_from_slice(&chunk);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.abandon("upstream body failed");
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(sender) = this.sender.take() {
                    let body = std::mem::take(&mut this.buffer).freeze();
                    // Receiver may be gone if nobody wants the copy any more
                    let _ = sender.send(body);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use futures::stream::{self, StreamExt};

    fn chunks(parts: Vec<Result<Bytes>>) -> BodyStream {
        Box::pin(stream::iter(parts))
    }

    #[tokio::test]
    async fn test_delivers_copy_on_clean_end() {
        let (mut capture, rx) = CaptureStream::new(
            chunks(vec![Ok(Bytes::from("abc")), Ok(Bytes::from("def"))]),
            1024,
        );
        let mut forwarded = Vec::new();
        while let Some(chunk) = capture.next().await {
            forwarded.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(forwarded, b"abcdef");
        assert_eq!(rx.await.unwrap(), Bytes::from("abcdef"));
    }

    #[tokio::test]
    async fn test_no_copy_after_error() {
        let (capture, rx) = CaptureStream::new(
            chunks(vec![
                Ok(Bytes::from("abc")),
                Err(ProxyError::BodyError("reset".into())),
            ]),
            1024,
        );
        let results: Vec<_> = capture.collect().await;
        assert!(results[1].is_err());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_no_copy_when_dropped_early() {
        let (mut capture, rx) = CaptureStream::new(
            chunks(vec![Ok(Bytes::from("abc")), Ok(Bytes::from("def"))]),
            1024,
        );
        let _ = capture.next().await;
        drop(capture);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_overflow_still_streams_but_skips_copy() {
        let (capture, rx) = CaptureStream::new(
            chunks(vec![Ok(Bytes::from("abcd")), Ok(Bytes::from("efgh"))]),
            6,
        );
        let forwarded: Vec<_> = capture.map(|c| c.unwrap()).collect().await;
        assert_eq!(forwarded.len(), 2);
        assert!(rx.await.is_err());
    }
}
