//! Request body representations.
//!
//! A body is a closed choice: nothing, a fixed sequence of immutable byte
//! buffers, or a single-pass byte stream. Buffer-backed bodies can be
//! replayed for retries and redirects; a stream can be taken exactly once.

use bytes::Bytes;
use futures::stream::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Boxed byte stream feeding a streamed request body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Request body.
#[derive(Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Fixed buffers, written in order. Cheap to clone and replay.
    Buffers(Arc<[Bytes]>),
    /// Single-consumption stream.
    Stream(StreamBody),
}

impl Body {
    /// Body made of fixed buffers. Empty input still counts as a buffer body.
    #[must_use]
    pub fn from_buffers<I>(buffers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        Self::Buffers(buffers.into_iter().map(Into::into).collect())
    }

    /// Body read from a stream.
    #[must_use]
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        Self::Stream(StreamBody::new(Box::pin(stream)))
    }

    /// Whether no body is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Whether the body is single-pass.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Whether the body can be sent more than once.
    #[must_use]
    pub const fn is_replayable(&self) -> bool {
        !self.is_stream()
    }

    /// Buffers, if buffer-backed.
    #[must_use]
    pub fn buffers(&self) -> Option<&[Bytes]> {
        match self {
            Self::Buffers(buffers) => Some(buffers),
            _ => None,
        }
    }

    /// Total buffered length; `None` for streams.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Buffers(buffers) => Some(buffers.iter().map(|b| b.len() as u64).sum()),
            Self::Stream(_) => None,
        }
    }

    /// Copy of a replayable body; `None` for streams.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Empty => Some(Self::Empty),
            Self::Buffers(buffers) => Some(Self::Buffers(Arc::clone(buffers))),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Body::Empty"),
            Self::Buffers(buffers) => f
                .debug_struct("Body::Buffers")
                .field("count", &buffers.len())
                .field("len", &self.content_length())
                .finish(),
            Self::Stream(stream) => f
                .debug_struct("Body::Stream")
                .field("taken", &stream.is_taken())
                .finish(),
        }
    }
}

/// A body stream that can be handed to the transport exactly once.
///
/// The descriptor owning it is shared across threads, so the stream sits
/// behind a lock and is moved out by [`StreamBody::take`].
pub struct StreamBody {
    inner: Mutex<Option<BodyStream>>,
}

impl StreamBody {
    fn new(stream: BodyStream) -> Self {
        Self {
            inner: Mutex::new(Some(stream)),
        }
    }

    /// Move the stream out. Every later call returns `None`.
    pub fn take(&self) -> Option<BodyStream> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether the stream has already been consumed.
    #[must_use]
    pub fn is_taken(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use futures::stream;

    #[test]
    fn buffers_are_replayable() {
        let body = Body::from_buffers([Bytes::from_static(b"ab"), Bytes::from_static(b"cde")]);
        assert!(body.is_replayable());
        assert_eq!(body.content_length(), Some(5));

        let copy = body.try_clone();
        assert!(matches!(copy, Some(Body::Buffers(ref b)) if b.len() == 2));
    }

    #[test]
    fn stream_is_single_pass() {
        let body = Body::from_stream(stream::iter(vec![Ok(Bytes::from_static(b"x"))]));
        assert!(body.is_stream());
        assert!(!body.is_replayable());
        assert!(body.try_clone().is_none());
        assert_eq!(body.content_length(), None);

        let Body::Stream(inner) = &body else {
            unreachable!("constructed as a stream");
        };
        assert!(inner.take().is_some());
        assert!(inner.is_taken());
        assert!(inner.take().is_none());
    }

    #[test]
    fn taken_stream_yields_chunks_in_order() {
        use futures::StreamExt;

        let body = Body::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"bc")),
        ]));
        let Body::Stream(inner) = &body else {
            unreachable!("constructed as a stream");
        };
        let chunks: Vec<_> = tokio_test::block_on(inner.take().unwrap().collect::<Vec<_>>());
        let chunks: Vec<Bytes> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")]);
    }

    #[test]
    fn empty_body_has_zero_length() {
        assert_eq!(Body::Empty.content_length(), Some(0));
        assert!(Body::default().is_empty());
    }
}
