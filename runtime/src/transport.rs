//! The seam between the dispatch core and the wire.
//!
//! Framing, TLS, and protocol negotiation live behind these traits. The
//! session manager only opens connections, assigns requests to them, and
//! watches them for health.
//!
//! Both traits return boxed futures instead of using `async fn` so they
//! stay dyn-compatible; the manager holds them as `Arc<dyn Transport>` and
//! `Arc<dyn Connection>`.

use courier_core::{
    ClientConfiguration, Destination, Protocol, RequestDescriptor, Response, TransportError,
};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Opens connections to destinations.
pub trait Transport: Send + Sync + 'static {
    /// Open one connection to `destination`.
    ///
    /// The manager bounds the returned future by
    /// [`ClientConfiguration::connect_timeout`]; a transport does not need
    /// its own timer.
    fn connect(
        &self,
        destination: &Destination,
        config: &ClientConfiguration,
    ) -> BoxFuture<'static, Result<Arc<dyn Connection>, TransportError>>;
}

/// One established connection.
///
/// Futures returned by [`Connection::send`] run on the event loop. Dropping
/// one before it resolves must release the stream it occupies; that is how
/// cancellation and timeouts abort in-flight requests.
pub trait Connection: Send + Sync + 'static {
    /// Protocol negotiated for this connection.
    fn protocol(&self) -> Protocol;

    /// Concurrent streams the peer allows. The manager uses the smaller of
    /// this and [`ClientConfiguration::max_streams_per_connection`].
    fn max_concurrent_streams(&self) -> usize {
        if self.protocol().is_multiplexed() {
            usize::MAX
        } else {
            1
        }
    }

    /// Whether new requests may still be assigned here.
    fn is_open(&self) -> bool;

    /// Send one request and resolve with its response.
    fn send(
        &self,
        request: Arc<RequestDescriptor>,
    ) -> BoxFuture<'static, Result<Response, TransportError>>;

    /// Close the connection. In-flight sends may fail afterwards.
    fn close(&self);
}
