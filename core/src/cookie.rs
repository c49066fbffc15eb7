//! Cookie handling capability.
//!
//! A descriptor may carry a [`CookieHandler`]; the dispatch core passes it
//! through untouched and the transport consults it when writing request
//! headers and reading response headers.

use crate::headers::Headers;
use url::Url;

/// Attaches and stores cookies for requests.
///
/// Implementations must be shareable across the event loop and caller
/// threads.
pub trait CookieHandler: Send + Sync + std::fmt::Debug {
    /// Cookie headers to attach to a request for `target`.
    fn cookies_for(&self, target: &Url, request_headers: &Headers) -> Headers;

    /// Record cookies from a response received for `target`.
    fn store(&self, target: &Url, response_headers: &Headers);
}
