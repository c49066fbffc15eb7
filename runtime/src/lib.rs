//! # Courier Runtime
//!
//! The moving parts of the Courier dispatch core.
//!
//! This crate takes the plain data from `courier-core` and schedules it: it
//! decides which connection handles which request, when, and for how long
//! before giving up. Byte-level protocol work stays behind the
//! [`Transport`] and [`Connection`] traits.
//!
//! ## Core Components
//!
//! - **`Client`**: the dispatch facade. Submits requests, arms timeouts,
//!   resolves aliases, and owns one `SessionManager` per canonical
//!   destination
//! - **`Operation`**: cancellable handle that finishes exactly once
//! - **`SessionManager`**: per-destination priority queue, discretionary
//!   deferral, connection pool, retries, and redirects
//! - **`EventLoop`**: the single thread all session state is mutated from
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::{ClientConfiguration, Method, RequestDescriptor};
//! use courier_runtime::Client;
//!
//! let client = Client::new(ClientConfiguration::default(), transport);
//!
//! let operation = client.submit(
//!     RequestDescriptor::builder(Method::Get, "https://example.com/")
//!         .priority(2.0)
//!         .build()?,
//! )?;
//!
//! // Cancel from any thread; a queued request is never dispatched afterwards
//! operation.cancel();
//! ```

/// The dispatch facade
pub mod client;

/// Single-threaded event loop with timers
pub mod event_loop;

/// Prometheus metrics for observability
pub mod metrics;

/// Cancellable operations
pub mod operation;

/// Per-destination queueing and connection assignment
pub mod session;

/// Transport and connection traits
pub mod transport;

/// Error types for the runtime
pub mod error {
    use courier_core::DispatchError;
    use thiserror::Error;

    /// Errors from handing work to the [`EventLoop`](crate::EventLoop).
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum EventLoopError {
        /// The loop was shut down and accepts no more work.
        #[error("Event loop has stopped")]
        Stopped,

        /// The loop thread or its runtime could not be started.
        #[error("Event loop failed to start: {0}")]
        Start(String),

        /// The loop thread panicked.
        #[error("Event loop thread panicked")]
        Panicked,
    }

    impl From<EventLoopError> for DispatchError {
        fn from(_: EventLoopError) -> Self {
            Self::ShuttingDown
        }
    }
}

pub use client::{Client, timeout_delay};
pub use error::EventLoopError;
pub use event_loop::{EventLoop, TimerHandle};
pub use operation::{Operation, OperationId, OperationState, Outcome};
pub use session::{Router, SessionManager, SessionStats};
pub use transport::{Connection, Transport};
