//! # Courier Testing
//!
//! Testing utilities for the Courier dispatch core.
//!
//! This crate provides:
//! - [`MockTransport`]: scripted in-memory transport that records dispatch
//!   order, connection attempts, and released streams
//! - [`OutcomeRecorder`]: collects operation outcomes in delivery order
//! - Helpers for descriptors, configurations, and clients
//! - proptest strategies for request metadata
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::StatusCode;
//! use courier_testing::{MockTransport, helpers};
//!
//! #[tokio::test]
//! async fn test_dispatch() {
//!     let transport = MockTransport::new();
//!     let client = helpers::client(&transport);
//!
//!     let response = client.send(helpers::get("http://mock.test/a")).await.unwrap();
//!     assert_eq!(response.status, StatusCode::OK);
//!     assert_eq!(transport.dispatched_paths(), vec!["/a"]);
//! }
//! ```

/// Scripted transport and connections
pub mod transport_mocks;

/// Outcome collection
pub mod outcome_recorder;

/// Test helpers and builders.
pub mod helpers {
    #![allow(clippy::unwrap_used)] // Helpers take known-good input
    #![allow(clippy::missing_panics_doc)]

    use crate::transport_mocks::MockTransport;
    use courier_core::{Bytes, ClientConfiguration, Method, RequestDescriptor, RetryPolicy};
    use courier_runtime::Client;
    use std::time::Duration;

    /// `GET` descriptor for `url`.
    #[must_use]
    pub fn get(url: &str) -> RequestDescriptor {
        RequestDescriptor::builder(Method::Get, url).build().unwrap()
    }

    /// `GET` descriptor for `url` with `priority`.
    #[must_use]
    pub fn get_with_priority(url: &str, priority: f64) -> RequestDescriptor {
        RequestDescriptor::builder(Method::Get, url)
            .priority(priority)
            .build()
            .unwrap()
    }

    /// `POST` descriptor for `url` carrying `body`.
    #[must_use]
    pub fn post(url: &str, body: &'static [u8]) -> RequestDescriptor {
        RequestDescriptor::builder(Method::Post, url)
            .body_buffers([Bytes::from_static(body)])
            .build()
            .unwrap()
    }

    /// Retry policy with millisecond delays.
    #[must_use]
    pub fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(10))
            .build()
    }

    /// Configuration with fast retries and the given capacity.
    #[must_use]
    pub fn config(max_connections: usize, max_streams: usize) -> ClientConfiguration {
        ClientConfiguration::builder()
            .max_connections_per_destination(max_connections)
            .max_streams_per_connection(max_streams)
            .connect_timeout(Duration::from_secs(2))
            .retry(fast_retry(3))
            .event_loop_name("courier-test-loop")
            .build()
            .unwrap()
    }

    /// Client over `transport` with [`config`]`(6, 100)`.
    #[must_use]
    pub fn client(transport: &MockTransport) -> Client {
        Client::new(config(6, 100), transport.shared())
    }

    /// Client over `transport` with a single stream slot, so dispatch order
    /// is fully observable.
    #[must_use]
    pub fn single_slot_client(transport: &MockTransport) -> Client {
        Client::new(config(1, 1), transport.shared())
    }

    /// Poll `condition` every few milliseconds until it holds. Returns
    /// `false` if it still does not hold after `timeout`.
    pub async fn eventually<F>(condition: F, timeout: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use courier_core::Method;
    use proptest::prelude::*;

    /// Any request method.
    pub fn method() -> impl Strategy<Value = Method> {
        proptest::sample::select(Method::ALL.to_vec())
    }

    /// Finite priorities, including negatives and duplicates.
    pub fn priority() -> impl Strategy<Value = f64> {
        prop_oneof![
            (-3i32..=3).prop_map(f64::from),
            -1000.0f64..1000.0,
        ]
    }

    /// A batch of priorities for one ordering scenario.
    pub fn priorities(max_len: usize) -> impl Strategy<Value = Vec<f64>> {
        proptest::collection::vec(priority(), 1..=max_len)
    }
}

// Re-export commonly used items
pub use outcome_recorder::OutcomeRecorder;
pub use transport_mocks::{Dispatch, MockConnection, MockTransport, Reply};
