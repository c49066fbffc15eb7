//! Request methods and HTTP-family protocol identifiers.
//!
//! Both enumerations carry their static facts in a lookup table rather than
//! in per-variant logic, and both parse leniently: an unknown name yields
//! `None` instead of an error.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Static facts about one request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MethodInfo {
    name: &'static str,
    idempotent: bool,
    body_supported: bool,
    cacheable: bool,
}

impl MethodInfo {
    const fn new(
        name: &'static str,
        idempotent: bool,
        body_supported: bool,
        cacheable: bool,
    ) -> Self {
        Self {
            name,
            idempotent,
            body_supported,
            cacheable,
        }
    }
}

/// (name, idempotent, body supported, cacheable), indexed by `Method as usize`.
const METHOD_TABLE: [MethodInfo; 7] = [
    MethodInfo::new("OPTIONS", true, true, false),
    MethodInfo::new("GET", true, false, true),
    // HEAD and DELETE may invalidate existing cache entries
    MethodInfo::new("HEAD", true, false, false),
    MethodInfo::new("POST", false, true, true),
    MethodInfo::new("PUT", true, true, false),
    MethodInfo::new("DELETE", true, false, false),
    MethodInfo::new("TRACE", true, true, false),
];

/// HTTP request method (RFC 2616 §9).
///
/// # Examples
///
/// ```
/// use courier_core::Method;
///
/// let method = Method::from_name("post").unwrap();
/// assert_eq!(method, Method::Post);
/// assert!(!method.is_idempotent());
/// assert!(method.is_body_supported());
/// assert!(Method::from_name("BREW").is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `OPTIONS`
    Options,
    /// `GET`
    Get,
    /// `HEAD`
    Head,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
    /// `TRACE`
    Trace,
}

impl Method {
    /// Every method, in table order.
    pub const ALL: [Self; 7] = [
        Self::Options,
        Self::Get,
        Self::Head,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Trace,
    ];

    const fn info(self) -> MethodInfo {
        METHOD_TABLE[self as usize]
    }

    /// Upper-case request-line token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.info().name
    }

    /// Whether repeating the request has no additional side effects.
    #[must_use]
    pub const fn is_idempotent(self) -> bool {
        self.info().idempotent
    }

    /// Whether the request may carry a body.
    #[must_use]
    pub const fn is_body_supported(self) -> bool {
        self.info().body_supported
    }

    /// Whether responses to this method may be stored by a cache.
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        self.info().cacheable
    }

    /// Case-insensitive lookup by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP-compatible wire protocol.
///
/// The transport negotiates one of these per connection; the dispatch core
/// only carries the preference list and reports what was negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// `http/1.0`
    Http10,
    /// `http/1.1`
    Http11,
    /// `http/2`
    Http2,
    /// `spdy/2`
    Spdy2,
    /// `spdy/3`
    Spdy3,
    /// `spdy/3.1`
    Spdy31,
}

/// (wire name, canonical key), indexed by `Protocol as usize`.
const PROTOCOL_TABLE: [(&str, &str); 6] = [
    ("http/1.0", "HTTP_1_0"),
    ("http/1.1", "HTTP_1_1"),
    ("http/2", "HTTP_2_0"),
    ("spdy/2", "SPDY_2"),
    ("spdy/3", "SPDY_3"),
    ("spdy/3.1", "SPDY_3_1"),
];

impl Protocol {
    /// Every protocol, in table order.
    pub const ALL: [Self; 6] = [
        Self::Http10,
        Self::Http11,
        Self::Http2,
        Self::Spdy2,
        Self::Spdy3,
        Self::Spdy31,
    ];

    /// ALPN-style wire name, e.g. `http/1.1`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        PROTOCOL_TABLE[self as usize].0
    }

    /// Whether one connection can carry more than one request at a time.
    #[must_use]
    pub const fn is_multiplexed(self) -> bool {
        !matches!(self, Self::Http10 | Self::Http11)
    }

    /// Lenient lookup: `HTTP/1.1`, `http-1-1` and `http_1_1` all resolve,
    /// as does the canonical key (`HTTP_2_0`) of each protocol.
    ///
    /// ```
    /// use courier_core::Protocol;
    ///
    /// assert_eq!(Protocol::from_name("spdy/3.1"), Some(Protocol::Spdy31));
    /// assert_eq!(Protocol::from_name("HTTP_2_0"), Some(Protocol::Http2));
    /// assert_eq!(Protocol::from_name("gopher"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let key = normalize_protocol_name(name);
        Self::ALL.into_iter().find(|protocol| {
            let (wire, canonical) = PROTOCOL_TABLE[*protocol as usize];
            canonical == key || normalize_protocol_name(wire) == key
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_protocol_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '/' | '.' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}
