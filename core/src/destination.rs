//! Destinations (origins) and the alias table.
//!
//! A [`Destination`] is the `(scheme, host, port)` key one connection pool is
//! dedicated to. Collation: scheme and host are lower-case, and the port is
//! always explicit, so `http://Example.com` and `http://example.com:80` name
//! the same destination.
//!
//! The [`AliasTable`] maps caller-declared alias destinations onto canonical
//! ones. Resolution is a single hop: an alias pointing at another alias is
//! not followed further.

use crate::error::RequestError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use url::Url;

/// Canonical `(scheme, host, port)` key.
///
/// # Examples
///
/// ```
/// use courier_core::Destination;
///
/// let a: Destination = "https://Example.com".parse().unwrap();
/// let b = Destination::new("https", "example.com", 443);
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "https://example.com:443");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    scheme: String,
    host: String,
    port: u16,
}

impl Destination {
    /// Create a destination from trusted parts. Scheme and host are lower-cased.
    #[must_use]
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derive the destination of an absolute URL.
    ///
    /// # Errors
    ///
    /// - [`RequestError::UnsupportedScheme`] unless the scheme is `http` or `https`
    /// - [`RequestError::MissingHost`] if the URL has no host
    pub fn from_url(url: &Url) -> Result<Self, RequestError> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(RequestError::UnsupportedScheme(scheme.to_string()));
        }
        let host = url.host_str().ok_or(RequestError::MissingHost)?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RequestError::UnsupportedScheme(scheme.to_string()))?;
        Ok(Self::new(scheme, host, port))
    }

    /// Scheme, lower-case.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host, lower-case. IPv6 hosts keep their brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, explicit or the scheme default.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this destination use TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for Destination {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| RequestError::InvalidTarget(format!("{s}: {e}")))?;
        Self::from_url(&url)
    }
}

/// Runtime-mutable alias table.
///
/// Read on every submission and written rarely, so it sits behind a
/// reader-writer lock: a reader sees either the old or the new mapping.
#[derive(Debug, Default)]
pub struct AliasTable {
    aliases: RwLock<HashMap<Destination, Destination>>,
}

impl AliasTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `alias` to `canonical`, replacing any previous entry.
    pub fn insert(&self, alias: Destination, canonical: Destination) -> Option<Destination> {
        self.aliases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias, canonical)
    }

    /// Drop an alias.
    pub fn remove(&self, alias: &Destination) -> Option<Destination> {
        self.aliases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(alias)
    }

    /// Canonical destination for `destination`: one table lookup, falling
    /// back to the destination itself.
    #[must_use]
    pub fn resolve(&self, destination: &Destination) -> Destination {
        self.aliases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .unwrap_or(destination)
            .clone()
    }

    /// Number of aliases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.aliases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no aliases are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
