//! Immutable request descriptors and their builder.
//!
//! A [`RequestDescriptor`] is validated once by [`RequestBuilder::build`] and
//! never mutated afterwards; the runtime shares it behind an `Arc` between
//! the caller, the event loop and the transport.
//!
//! # Example
//!
//! ```
//! use courier_core::{Method, RequestDescriptor};
//! use std::time::Duration;
//!
//! let request = RequestDescriptor::builder(Method::Post, "https://api.example.com/upload")
//!     .header("Content-Type", "application/octet-stream")
//!     .body_buffers([&b"hello"[..], &b" world"[..]])
//!     .priority(2.0)
//!     .timeout(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(request.destination().host(), "api.example.com");
//! assert!(!request.is_idempotent());
//! ```

use crate::body::{Body, BodyStream};
use crate::cookie::CookieHandler;
use crate::destination::Destination;
use crate::error::RequestError;
use crate::headers::{self, Headers};
use crate::method::Method;
use bytes::Bytes;
use futures::stream::Stream;
use http::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName,
    TRANSFER_ENCODING,
};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Redirect hops followed when the builder is not told otherwise.
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Headers that describe the body and must not survive a body-dropping redirect.
const BODY_HEADERS: [HeaderName; 4] = [
    CONTENT_LENGTH,
    CONTENT_TYPE,
    CONTENT_ENCODING,
    TRANSFER_ENCODING,
];

/// Headers that must not be forwarded to a different destination.
const CREDENTIAL_HEADERS: [HeaderName; 2] = [AUTHORIZATION, COOKIE];

/// Immutable description of one request.
#[derive(Debug)]
pub struct RequestDescriptor {
    target: Url,
    destination: Destination,
    method: Method,
    headers: Headers,
    body: Body,
    cookie_handler: Option<Arc<dyn CookieHandler>>,
    priority: f64,
    discretionary_delay: Duration,
    timeout: Duration,
    max_redirects: u32,
    idempotent: bool,
}

impl RequestDescriptor {
    /// Start building a request for `target`.
    ///
    /// The target is parsed when [`RequestBuilder::build`] runs, so a bad URL
    /// surfaces there as [`RequestError::InvalidTarget`].
    #[must_use]
    pub fn builder(method: Method, target: impl AsRef<str>) -> RequestBuilder {
        let target = Url::parse(target.as_ref())
            .map_err(|e| RequestError::InvalidTarget(format!("{}: {e}", target.as_ref())));
        RequestBuilder::new(method, target)
    }

    /// Start building a request for an already-parsed target.
    #[must_use]
    pub fn builder_for_url(method: Method, target: Url) -> RequestBuilder {
        RequestBuilder::new(method, Ok(target))
    }

    /// Absolute target URL.
    #[must_use]
    pub const fn target(&self) -> &Url {
        &self.target
    }

    /// Raw destination derived from the target, before alias resolution.
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Request method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Request headers.
    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Request body.
    #[must_use]
    pub const fn body(&self) -> &Body {
        &self.body
    }

    /// Cookie capability passed through to the transport.
    #[must_use]
    pub fn cookie_handler(&self) -> Option<&Arc<dyn CookieHandler>> {
        self.cookie_handler.as_ref()
    }

    /// Scheduling hint; higher runs sooner among otherwise equal requests.
    #[must_use]
    pub const fn priority(&self) -> f64 {
        self.priority
    }

    /// How long dispatch may be deferred. Zero means immediately eligible.
    #[must_use]
    pub const fn discretionary_delay(&self) -> Duration {
        self.discretionary_delay
    }

    /// Overall time budget. `None` when no timeout was requested.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }

    /// Upper bound on followed redirects.
    #[must_use]
    pub const fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    /// Effective idempotence: the caller's override, or the method default.
    #[must_use]
    pub const fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Whether a failed attempt may be silently sent again: idempotent and
    /// not backed by a single-pass stream.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.idempotent && self.body.is_replayable()
    }

    /// Descriptor for following a redirect to `target`.
    ///
    /// With `preserve_method` the method and body are kept, which requires a
    /// replayable body; otherwise the request becomes a bodyless `GET`.
    /// Credentials are dropped when the redirect leaves the destination.
    /// Returns `None` when the redirect cannot be expressed.
    #[must_use]
    pub fn redirected(&self, target: Url, preserve_method: bool) -> Option<Self> {
        let destination = Destination::from_url(&target).ok()?;
        let mut headers = self.headers.clone();

        let (method, body) = if preserve_method {
            (self.method, self.body.try_clone()?)
        } else {
            for name in &BODY_HEADERS {
                headers.remove(name);
            }
            (Method::Get, Body::Empty)
        };

        if destination != self.destination {
            for name in &CREDENTIAL_HEADERS {
                headers.remove(name);
            }
        }

        let idempotent = if method == self.method {
            self.idempotent
        } else {
            method.is_idempotent()
        };

        Some(Self {
            target,
            destination,
            method,
            headers,
            body,
            cookie_handler: self.cookie_handler.clone(),
            priority: self.priority,
            discretionary_delay: Duration::ZERO,
            timeout: self.timeout,
            max_redirects: self.max_redirects,
            idempotent,
        })
    }
}

/// Builder for [`RequestDescriptor`].
#[derive(Debug)]
pub struct RequestBuilder {
    target: Result<Url, RequestError>,
    method: Method,
    headers: Headers,
    invalid_header: Option<RequestError>,
    body: Body,
    cookie_handler: Option<Arc<dyn CookieHandler>>,
    priority: f64,
    discretionary_delay: Duration,
    timeout: Duration,
    max_redirects: u32,
    idempotent: Option<bool>,
}

impl RequestBuilder {
    fn new(method: Method, target: Result<Url, RequestError>) -> Self {
        Self {
            target,
            method,
            headers: Headers::new(),
            invalid_header: None,
            body: Body::Empty,
            cookie_handler: None,
            priority: 0.0,
            discretionary_delay: Duration::ZERO,
            timeout: Duration::ZERO,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            idempotent: None,
        }
    }

    /// Append a header value.
    ///
    /// A name or value that cannot be written on the wire is reported by
    /// [`RequestBuilder::build`].
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        match headers::parse_pair(name.as_ref(), value.as_ref()) {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(error) if self.invalid_header.is_none() => self.invalid_header = Some(error),
            Err(_) => {}
        }
        self
    }

    /// Replace all headers, including any rejected by
    /// [`RequestBuilder::header`].
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self.invalid_header = None;
        self
    }

    /// Set the body.
    ///
    /// Buffer-backed bodies take precedence: a stream supplied while buffers
    /// are already set is discarded.
    #[must_use]
    pub fn body(mut self, body: Body) -> Self {
        if !(body.is_stream() && matches!(self.body, Body::Buffers(_))) {
            self.body = body;
        }
        self
    }

    /// Body made of fixed buffers; replaces any stream body.
    #[must_use]
    pub fn body_buffers<I>(self, buffers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        self.body(Body::from_buffers(buffers))
    }

    /// Single-pass streamed body; ignored if buffers were already supplied.
    #[must_use]
    pub fn body_stream<S>(self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        self.body(Body::from_stream(stream))
    }

    /// Single-pass streamed body from an already boxed stream.
    #[must_use]
    pub fn boxed_body_stream(self, stream: BodyStream) -> Self {
        self.body(Body::from_stream(stream))
    }

    /// Attach a cookie capability.
    #[must_use]
    pub fn cookie_handler(mut self, handler: Arc<dyn CookieHandler>) -> Self {
        self.cookie_handler = Some(handler);
        self
    }

    /// Scheduling priority. Higher is dispatched sooner.
    #[must_use]
    pub const fn priority(mut self, priority: f64) -> Self {
        // Adding zero folds -0.0 into 0.0 so the two order as equals.
        self.priority = priority + 0.0;
        self
    }

    /// Allow dispatch to be deferred for up to `delay`.
    #[must_use]
    pub const fn discretionary_delay(mut self, delay: Duration) -> Self {
        self.discretionary_delay = delay;
        self
    }

    /// Fail the request if it has not finished within `timeout`. Zero disables.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound the number of followed redirects.
    #[must_use]
    pub const fn max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Override the method's default idempotence.
    #[must_use]
    pub const fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Validate and freeze the descriptor.
    ///
    /// # Errors
    ///
    /// - [`RequestError::InvalidTarget`], [`RequestError::UnsupportedScheme`]
    ///   or [`RequestError::MissingHost`] for an unusable target
    /// - [`RequestError::BodyNotSupported`] when a non-empty body is given
    ///   to a method that cannot carry one
    /// - [`RequestError::InvalidHeader`] for names or values that cannot be
    ///   written on the wire
    /// - [`RequestError::InvalidPriority`] for a NaN or infinite priority
    pub fn build(self) -> Result<RequestDescriptor, RequestError> {
        let target = self.target?;
        let destination = Destination::from_url(&target)?;

        let body = match self.body {
            Body::Buffers(ref buffers) if buffers.iter().all(Bytes::is_empty) => Body::Empty,
            body => body,
        };
        if !body.is_empty() && !self.method.is_body_supported() {
            return Err(RequestError::BodyNotSupported {
                method: self.method,
            });
        }

        if let Some(error) = self.invalid_header {
            return Err(error);
        }

        if !self.priority.is_finite() {
            return Err(RequestError::InvalidPriority);
        }

        Ok(RequestDescriptor {
            target,
            destination,
            method: self.method,
            headers: self.headers,
            body,
            cookie_handler: self.cookie_handler,
            priority: self.priority,
            discretionary_delay: self.discretionary_delay,
            timeout: self.timeout,
            max_redirects: self.max_redirects,
            idempotent: self.idempotent.unwrap_or_else(|| self.method.is_idempotent()),
        })
    }
}
