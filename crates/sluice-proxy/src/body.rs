//! Request and response body types

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use sluice_core::Error;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;

/// Boxed error carried by request bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased inbound body streamed to the upstream
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Box any body into a [`RequestBody`]
pub fn boxed<B>(body: B) -> RequestBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Request body holding a single buffer
pub fn full(data: impl Into<Bytes>) -> RequestBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Request body with no data
pub fn empty() -> RequestBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Event passed from a connection reader to a streaming [`ProxyBody`]
#[derive(Debug)]
pub(crate) enum BodyEvent {
    Data(Bytes),
    End,
    Abort(String),
}

/// Response body handed to the sink.
///
/// Streaming bodies are fed by the upstream connection reader. A stream that
/// stops without an explicit end yields an error, so the consumer aborts the
/// downstream response instead of truncating it silently.
#[derive(Debug)]
pub struct ProxyBody {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Empty,
    Full(Option<Bytes>),
    Streaming {
        events: mpsc::Receiver<BodyEvent>,
        remaining: Option<u64>,
        done: bool,
    },
}

impl ProxyBody {
    /// Body with no data
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    /// Body holding a single buffer
    pub fn full(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self {
            kind: Kind::Full(Some(data)),
        }
    }

    pub(crate) fn streaming(events: mpsc::Receiver<BodyEvent>, length: Option<u64>) -> Self {
        Self {
            kind: Kind::Streaming {
                events,
                remaining: length,
                done: false,
            },
        }
    }
}

impl Default for ProxyBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl Body for ProxyBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match &mut this.kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(data) => Poll::Ready(data.take().map(|data| Ok(Frame::data(data)))),
            Kind::Streaming {
                events,
                remaining,
                done,
            } => {
                if *done {
                    return Poll::Ready(None);
                }
                match ready!(events.poll_recv(cx)) {
                    Some(BodyEvent::Data(data)) => {
                        if let Some(remaining) = remaining {
                            *remaining = remaining.saturating_sub(data.len() as u64);
                        }
                        Poll::Ready(Some(Ok(Frame::data(data))))
                    }
                    Some(BodyEvent::End) => {
                        *done = true;
                        Poll::Ready(None)
                    }
                    Some(BodyEvent::Abort(reason)) => {
                        *done = true;
                        Poll::Ready(Some(Err(Error::ConnectionReset(reason))))
                    }
                    None => {
                        *done = true;
                        Poll::Ready(Some(Err(Error::ConnectionReset(
                            "upstream response ended prematurely".to_string(),
                        ))))
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Full(data) => data.is_none(),
            Kind::Streaming { done, .. } => *done,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Empty => SizeHint::with_exact(0),
            Kind::Full(data) => {
                SizeHint::with_exact(data.as_ref().map_or(0, |data| data.len() as u64))
            }
            Kind::Streaming {
                remaining: Some(remaining),
                done: false,
                ..
            } => SizeHint::with_exact(*remaining),
            Kind::Streaming { .. } => SizeHint::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_body() {
        let body = ProxyBody::full("Hello World!");
        assert_eq!(body.size_hint().exact(), Some(12));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"Hello World!");
    }

    #[tokio::test]
    async fn test_streaming_body_ends() {
        let (tx, rx) = mpsc::channel(4);
        let body = ProxyBody::streaming(rx, Some(10));
        assert_eq!(body.size_hint().exact(), Some(10));

        tx.send(BodyEvent::Data(Bytes::from_static(b"Hello"))).await.unwrap();
        tx.send(BodyEvent::Data(Bytes::from_static(b"World"))).await.unwrap();
        tx.send(BodyEvent::End).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"HelloWorld");
    }

    #[tokio::test]
    async fn test_streaming_body_without_end_errors() {
        let (tx, rx) = mpsc::channel(4);
        let body = ProxyBody::streaming(rx, None);
        tx.send(BodyEvent::Data(Bytes::from_static(b"partial"))).await.unwrap();
        drop(tx);

        let err = body.collect().await.unwrap_err();
        assert_eq!(err.kind(), sluice_core::FailureKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_streaming_body_abort() {
        let (tx, rx) = mpsc::channel(4);
        let body = ProxyBody::streaming(rx, None);
        tx.send(BodyEvent::Abort("reset by peer".to_string()))
            .await
            .unwrap();

        let err = body.collect().await.unwrap_err();
        assert!(err.to_string().contains("reset by peer"));
    }

    #[tokio::test]
    async fn test_request_body_helpers() {
        assert_eq!(full("abc").size_hint().exact(), Some(3));
        assert_eq!(empty().size_hint().exact(), Some(0));
        let collected = boxed(Full::new(Bytes::from_static(b"xyz")))
            .collect()
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&collected[..], b"xyz");
    }
}
