//! # Courier Core
//!
//! Shared types for the Courier client-side dispatch core.
//!
//! This crate holds everything that is plain data: what a request is, where
//! it goes, how the client is configured, and how things fail. The
//! scheduling machinery that acts on these types lives in
//! `courier-runtime`.
//!
//! ## Core Concepts
//!
//! - **`RequestDescriptor`**: immutable description of one request, built and
//!   validated by `RequestBuilder`
//! - **`Method` / `Protocol`**: static tables of HTTP-family facts
//! - **`Destination`**: normalized `(scheme, host, port)` key a connection
//!   pool is dedicated to
//! - **`AliasTable`**: runtime-mutable, single-hop alias mapping between
//!   destinations
//! - **`ClientConfiguration`**: read-only capacity limits and tunables
//! - **Errors**: `RequestError` (synchronous), `DispatchError` (delivered
//!   through an operation), `TransportError` (from the transport)
//!
//! ## Example
//!
//! ```
//! use courier_core::{AliasTable, Destination, Method, RequestDescriptor};
//!
//! let aliases = AliasTable::new();
//! aliases.insert(
//!     "https://cdn1.example.com".parse().unwrap(),
//!     "https://cdn.example.com".parse().unwrap(),
//! );
//!
//! let request = RequestDescriptor::builder(Method::Get, "https://cdn1.example.com/logo.png")
//!     .build()
//!     .unwrap();
//!
//! let canonical = aliases.resolve(request.destination());
//! assert_eq!(canonical, Destination::new("https", "cdn.example.com", 443));
//! ```

/// Request bodies (buffers or single-pass streams)
pub mod body;

/// Client configuration and its builder
pub mod config;

/// Cookie capability passed through to the transport
pub mod cookie;

/// Destinations and the alias table
pub mod destination;

/// Error types
pub mod error;

/// Header map and header parsing
pub mod headers;

/// Request methods and protocol identifiers
pub mod method;

/// Request descriptors and their builder
pub mod request;

/// Transport responses
pub mod response;

/// Retry budget and backoff
pub mod retry;

pub use body::{Body, BodyStream, StreamBody};
pub use config::{ClientConfiguration, ClientConfigurationBuilder, ConfigError};
pub use cookie::CookieHandler;
pub use destination::{AliasTable, Destination};
pub use error::{DispatchError, RequestError, TransportError, TransportErrorKind};
pub use headers::Headers;
pub use method::{Method, Protocol};
pub use request::{RequestBuilder, RequestDescriptor};
pub use response::Response;
pub use retry::{RetryPolicy, RetryPolicyBuilder};

// Re-export commonly used types
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
pub use url::Url;
