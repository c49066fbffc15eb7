//! Client configuration.
//!
//! [`ClientConfiguration`] is built once through
//! [`ClientConfiguration::builder`] and then read-only: every session manager
//! reads its capacity limits from it, and the transport receives it when
//! opening connections.
//!
//! # Example
//!
//! ```
//! use courier_core::ClientConfiguration;
//! use std::time::Duration;
//!
//! let config = ClientConfiguration::builder()
//!     .max_connections_per_destination(4)
//!     .max_streams_per_connection(1)
//!     .connect_timeout(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.max_connections_per_destination(), 4);
//! ```
//!
//! The configuration derives `serde` traits, with durations expressed in
//! milliseconds, so an application can embed it in its own config files.
//! Missing fields take their defaults, and a deserialized configuration is
//! validated exactly like a built one.

use crate::method::Protocol;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A limit that must be at least one was zero.
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),

    /// The protocol preference list was empty.
    #[error("At least one protocol must be enabled")]
    NoProtocols,

    /// The retry multiplier must be finite and at least 1.
    #[error("Retry multiplier must be finite and >= 1, got {0}")]
    InvalidMultiplier(String),
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Read-only tunables for the dispatch core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConfiguration")]
pub struct ClientConfiguration {
    max_connections_per_destination: usize,
    max_streams_per_connection: usize,
    #[serde(with = "duration_ms")]
    connect_timeout: Duration,
    protocols: Vec<Protocol>,
    retry: RetryPolicy,
    follow_redirects: bool,
    event_loop_name: String,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            max_connections_per_destination: 6,
            max_streams_per_connection: 100,
            connect_timeout: Duration::from_secs(30),
            protocols: vec![Protocol::Http2, Protocol::Http11],
            retry: RetryPolicy::default(),
            follow_redirects: true,
            event_loop_name: "courier-event-loop".to_string(),
        }
    }
}

/// Deserialized form, checked by [`ClientConfiguration::validate`] before
/// it becomes a [`ClientConfiguration`].
#[derive(Deserialize)]
#[serde(default)]
struct RawConfiguration {
    max_connections_per_destination: usize,
    max_streams_per_connection: usize,
    #[serde(deserialize_with = "duration_ms::deserialize")]
    connect_timeout: Duration,
    protocols: Vec<Protocol>,
    retry: RetryPolicy,
    follow_redirects: bool,
    event_loop_name: String,
}

impl Default for RawConfiguration {
    fn default() -> Self {
        let ClientConfiguration {
            max_connections_per_destination,
            max_streams_per_connection,
            connect_timeout,
            protocols,
            retry,
            follow_redirects,
            event_loop_name,
        } = ClientConfiguration::default();
        Self {
            max_connections_per_destination,
            max_streams_per_connection,
            connect_timeout,
            protocols,
            retry,
            follow_redirects,
            event_loop_name,
        }
    }
}

impl TryFrom<RawConfiguration> for ClientConfiguration {
    type Error = ConfigError;

    fn try_from(raw: RawConfiguration) -> Result<Self, Self::Error> {
        let config = Self {
            max_connections_per_destination: raw.max_connections_per_destination,
            max_streams_per_connection: raw.max_streams_per_connection,
            connect_timeout: raw.connect_timeout,
            protocols: raw.protocols,
            retry: raw.retry,
            follow_redirects: raw.follow_redirects,
            event_loop_name: raw.event_loop_name,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ClientConfiguration {
    /// Start from the defaults.
    #[must_use]
    pub fn builder() -> ClientConfigurationBuilder {
        ClientConfigurationBuilder {
            config: Self::default(),
        }
    }

    /// Caps concurrent sockets per destination.
    #[must_use]
    pub const fn max_connections_per_destination(&self) -> usize {
        self.max_connections_per_destination
    }

    /// Caps concurrent in-flight requests on one connection. The transport
    /// may advertise a lower limit per connection.
    #[must_use]
    pub const fn max_streams_per_connection(&self) -> usize {
        self.max_streams_per_connection
    }

    /// Budget for establishing one connection.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Protocols to offer, most preferred first.
    #[must_use]
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// Retry budget and backoff for idempotent requests.
    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Whether redirect responses are followed automatically.
    #[must_use]
    pub const fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// Name of the event loop thread.
    #[must_use]
    pub fn event_loop_name(&self) -> &str {
        &self.event_loop_name
    }

    /// Check the invariants every configuration upholds.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_destination == 0 {
            return Err(ConfigError::ZeroLimit("max_connections_per_destination"));
        }
        if self.max_streams_per_connection == 0 {
            return Err(ConfigError::ZeroLimit("max_streams_per_connection"));
        }
        if self.protocols.is_empty() {
            return Err(ConfigError::NoProtocols);
        }
        let multiplier = self.retry.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(multiplier.to_string()));
        }
        Ok(())
    }
}

/// Builder for [`ClientConfiguration`].
#[derive(Debug, Clone)]
pub struct ClientConfigurationBuilder {
    config: ClientConfiguration,
}

impl ClientConfigurationBuilder {
    /// Cap concurrent sockets per destination.
    #[must_use]
    pub const fn max_connections_per_destination(mut self, max: usize) -> Self {
        self.config.max_connections_per_destination = max;
        self
    }

    /// Cap concurrent in-flight requests on one connection.
    #[must_use]
    pub const fn max_streams_per_connection(mut self, max: usize) -> Self {
        self.config.max_streams_per_connection = max;
        self
    }

    /// Budget for establishing one connection.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Protocols to offer, most preferred first.
    #[must_use]
    pub fn protocols(mut self, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        self.config.protocols = protocols.into_iter().collect();
        self
    }

    /// Retry budget and backoff.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Enable or disable automatic redirect following.
    #[must_use]
    pub const fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Name of the event loop thread.
    #[must_use]
    pub fn event_loop_name(mut self, name: impl Into<String>) -> Self {
        self.config.event_loop_name = name.into();
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a limit is zero, no protocol is enabled, or
    /// the retry multiplier is unusable.
    pub fn build(self) -> Result<ClientConfiguration, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
