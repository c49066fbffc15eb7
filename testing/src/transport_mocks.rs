//! Scriptable in-memory transport.
//!
//! [`MockTransport`] hands out [`MockConnection`]s that answer requests from
//! a per-path script, falling back to `200 OK` with the request path as the
//! body. Every dispatch is recorded so tests can assert ordering, and stream
//! guards count how many in-flight requests were dropped before answering.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use courier_core::{
    ClientConfiguration, Destination, HeaderValue, Protocol, RequestDescriptor, Response,
    StatusCode, TransportError,
};
use http::header::LOCATION;
use courier_runtime::{Connection, Transport};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a mock connection does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with this response.
    Respond(Response),
    /// Fail with this transport error.
    Fail(TransportError),
    /// Never answer. Only cancellation, timeout, or kill finishes the
    /// operation.
    Hang,
}

impl Reply {
    /// Shorthand for an empty response with `status`.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self::Respond(Response::new(StatusCode::from_u16(status).unwrap()))
    }

    /// Shorthand for a redirect to `location`.
    #[must_use]
    pub fn redirect(status: u16, location: &str) -> Self {
        Self::Respond(
            Response::new(StatusCode::from_u16(status).unwrap())
                .with_header(LOCATION, HeaderValue::from_str(location).unwrap()),
        )
    }
}

/// One request as the transport saw it.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Connection the request was sent on.
    pub connection: usize,
    /// The descriptor handed to [`Connection::send`].
    pub request: Arc<RequestDescriptor>,
    /// When the manager dispatched it.
    pub at: Instant,
}

#[derive(Debug)]
struct MockState {
    protocol: Protocol,
    max_streams: usize,
    connect_latency: Duration,
    response_latency: Duration,
    connect_failures: VecDeque<TransportError>,
    scripts: HashMap<String, VecDeque<Reply>>,
    dispatched: Vec<Dispatch>,
    connects: usize,
    connections: Vec<Arc<MockConnection>>,
    in_flight: usize,
    peak_in_flight: usize,
    released: usize,
}

/// In-memory [`Transport`] with scripted replies.
///
/// # Example
///
/// ```
/// use courier_testing::{MockTransport, Reply};
/// use std::time::Duration;
///
/// let transport = MockTransport::new()
///     .with_connect_latency(Duration::from_millis(20))
///     .with_reply("/missing", Reply::status(404));
///
/// assert_eq!(transport.connect_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// HTTP/1.1 transport: one stream per connection, no latency.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                protocol: Protocol::Http11,
                max_streams: 1,
                connect_latency: Duration::ZERO,
                response_latency: Duration::ZERO,
                connect_failures: VecDeque::new(),
                scripts: HashMap::new(),
                dispatched: Vec::new(),
                connects: 0,
                connections: Vec::new(),
                in_flight: 0,
                peak_in_flight: 0,
                released: 0,
            })),
        }
    }

    /// Negotiate `protocol`, advertising `max_streams` per connection.
    #[must_use]
    pub fn with_protocol(self, protocol: Protocol, max_streams: usize) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.protocol = protocol;
            state.max_streams = max_streams;
        }
        self
    }

    /// Delay every connection attempt.
    #[must_use]
    pub fn with_connect_latency(self, latency: Duration) -> Self {
        self.state.lock().unwrap().connect_latency = latency;
        self
    }

    /// Delay every reply.
    #[must_use]
    pub fn with_response_latency(self, latency: Duration) -> Self {
        self.state.lock().unwrap().response_latency = latency;
        self
    }

    /// Queue a reply for the next request to `path`. Replies for one path
    /// are used in order.
    #[must_use]
    pub fn with_reply(self, path: &str, reply: Reply) -> Self {
        self.push_reply(path, reply);
        self
    }

    /// Fail the next connection attempt with `error`.
    #[must_use]
    pub fn with_connect_failure(self, error: TransportError) -> Self {
        self.state.lock().unwrap().connect_failures.push_back(error);
        self
    }

    /// Queue a reply after construction.
    pub fn push_reply(&self, path: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Connection attempts so far, successful or not.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Every dispatch, in order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<Dispatch> {
        self.state.lock().unwrap().dispatched.clone()
    }

    /// Paths of every dispatch, in order.
    #[must_use]
    pub fn dispatched_paths(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .dispatched
            .iter()
            .map(|d| d.request.target().path().to_string())
            .collect()
    }

    /// Number of dispatches so far.
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.state.lock().unwrap().dispatched.len()
    }

    /// Most requests that were ever in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().unwrap().peak_in_flight
    }

    /// Requests whose stream was dropped before they answered.
    #[must_use]
    pub fn released_streams(&self) -> usize {
        self.state.lock().unwrap().released
    }

    /// Connections established and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| c.is_open())
            .count()
    }

    /// Connections established so far.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.state.lock().unwrap().connections.clone()
    }

    /// The transport as the runtime takes it.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        _destination: &Destination,
        _config: &ClientConfiguration,
    ) -> BoxFuture<'static, Result<Arc<dyn Connection>, TransportError>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let (latency, failure, protocol, max_streams, id) = {
                let mut guard = state.lock().unwrap();
                guard.connects += 1;
                (
                    guard.connect_latency,
                    guard.connect_failures.pop_front(),
                    guard.protocol,
                    guard.max_streams,
                    guard.connections.len(),
                )
            };

            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if let Some(error) = failure {
                return Err(error);
            }

            let connection = Arc::new(MockConnection {
                id,
                protocol,
                max_streams,
                open: AtomicBool::new(true),
                state: Arc::clone(&state),
            });
            state
                .lock()
                .unwrap()
                .connections
                .push(Arc::clone(&connection));
            Ok(connection as Arc<dyn Connection>)
        })
    }
}

/// Connection handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockConnection {
    id: usize,
    protocol: Protocol,
    max_streams: usize,
    open: AtomicBool,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Index of this connection in [`MockTransport::connections`].
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Simulate the peer going away.
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Connection for MockConnection {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn max_concurrent_streams(&self) -> usize {
        self.max_streams
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(
        &self,
        request: Arc<RequestDescriptor>,
    ) -> BoxFuture<'static, Result<Response, TransportError>> {
        let path = request.target().path().to_string();
        let (reply, latency) = {
            let mut state = self.state.lock().unwrap();
            state.dispatched.push(Dispatch {
                connection: self.id,
                request,
                at: Instant::now(),
            });
            let reply = state
                .scripts
                .get_mut(&path)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| {
                    Reply::Respond(Response::new(StatusCode::OK).with_body(path.clone()))
                });
            (reply, state.response_latency)
        };

        let guard = StreamGuard::open(Arc::clone(&self.state));
        Box::pin(async move {
            let mut guard = guard;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let result = match reply {
                Reply::Respond(response) => Ok(response),
                Reply::Fail(error) => Err(error),
                Reply::Hang => futures::future::pending().await,
            };
            guard.answered = true;
            result
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Tracks one in-flight request; dropping it unanswered counts as a
/// released stream.
struct StreamGuard {
    state: Arc<Mutex<MockState>>,
    answered: bool,
}

impl StreamGuard {
    fn open(state: Arc<Mutex<MockState>>) -> Self {
        {
            let mut guard = state.lock().unwrap();
            guard.in_flight += 1;
            guard.peak_in_flight = guard.peak_in_flight.max(guard.in_flight);
        }
        Self {
            state,
            answered: false,
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.in_flight = state.in_flight.saturating_sub(1);
        if !self.answered {
            state.released += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Method;

    fn request(path: &str) -> Arc<RequestDescriptor> {
        Arc::new(
            RequestDescriptor::builder(Method::Get, format!("http://mock.test{path}"))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn scripted_replies_are_used_in_order() {
        let transport = MockTransport::new()
            .with_reply("/a", Reply::status(503))
            .with_reply("/a", Reply::status(201));
        let destination: Destination = "http://mock.test".parse().unwrap();
        let connection = transport
            .connect(&destination, &ClientConfiguration::default())
            .await
            .unwrap();

        let first = connection.send(request("/a")).await.unwrap();
        assert_eq!(first.status, StatusCode::SERVICE_UNAVAILABLE);
        let second = connection.send(request("/a")).await.unwrap();
        assert_eq!(second.status, StatusCode::CREATED);
        let fallback = connection.send(request("/a")).await.unwrap();
        assert_eq!(fallback.status, StatusCode::OK);
        assert_eq!(&fallback.body[..], b"/a");

        assert_eq!(transport.dispatched_paths(), vec!["/a", "/a", "/a"]);
        assert_eq!(transport.released_streams(), 0);
    }

    #[tokio::test]
    async fn dropped_send_counts_as_released() {
        let transport = MockTransport::new().with_reply("/hang", Reply::Hang);
        let destination: Destination = "http://mock.test".parse().unwrap();
        let connection = transport
            .connect(&destination, &ClientConfiguration::default())
            .await
            .unwrap();

        let send = connection.send(request("/hang"));
        assert_eq!(transport.peak_in_flight(), 1);
        drop(send);
        assert_eq!(transport.released_streams(), 1);
    }

    #[tokio::test]
    async fn connect_failures_are_consumed_once() {
        let transport = MockTransport::new().with_connect_failure(TransportError::retriable(
            courier_core::TransportErrorKind::Connect,
            "refused",
        ));
        let destination: Destination = "http://mock.test".parse().unwrap();
        let config = ClientConfiguration::default();

        assert!(transport.connect(&destination, &config).await.is_err());
        assert!(transport.connect(&destination, &config).await.is_ok());
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(transport.open_connections(), 1);
    }
}
