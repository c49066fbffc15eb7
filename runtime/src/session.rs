//! Per-destination session managers.
//!
//! A [`SessionManager`] owns every queued operation and every connection for
//! one canonical [`Destination`]. All of its state changes happen in tasks on
//! the [`EventLoop`]; the public entry points hop onto the loop when called
//! from elsewhere.
//!
//! # Scheduling
//!
//! Operations wait in one of three places:
//!
//! - the **ready** heap, ordered by priority (higher first) and then arrival
//! - the **deferred** heap, ordered by discretionary due time; a single
//!   wake-up timer is armed for the earliest entry
//! - the **backoff** set, for retries waiting out their delay
//!
//! Each pass over the queue first promotes due deferred entries, then hands
//! ready operations to connections with spare stream capacity, and finally
//! opens new connections if the backlog outgrows what is open or already
//! being opened.
//!
//! Operations that finish while queued (cancellation, timeout) are removed
//! by the release task their listener schedules, and skipped if a pass sees
//! them first. A finished active operation has its stream future dropped,
//! which releases the stream in the transport.

use crate::event_loop::{EventLoop, TimerHandle};
use crate::operation::{Operation, OperationId};
use crate::transport::{Connection, Transport};
use courier_core::{
    ClientConfiguration, Destination, DispatchError, Method, Response, StatusCode, TransportError,
    TransportErrorKind,
};
use futures::future::{AbortHandle, abortable};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Hands an operation back to the routing layer after its redirect target
/// changed.
pub trait Router: Send + Sync {
    /// Route `operation` by its current descriptor.
    fn route(&self, operation: Operation);
}

/// Point-in-time counters for one session manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Eligible operations waiting for a stream.
    pub queued: usize,
    /// Operations waiting for their discretionary due time.
    pub deferred: usize,
    /// Operations waiting out a retry delay.
    pub backing_off: usize,
    /// Operations assigned to a connection.
    pub active: usize,
    /// Established connections.
    pub connections: usize,
    /// Connection attempts in progress.
    pub connecting: usize,
    /// Streams started over the manager's lifetime.
    pub dispatched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Draining,
    Killed,
}

struct Queued {
    operation: Operation,
    priority: f64,
    seq: u64,
    enqueued_at: Instant,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

struct Deferred {
    due: Instant,
    entry: Queued,
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.entry.seq.cmp(&self.entry.seq))
    }
}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Deferred {}

struct Stream {
    connection: u64,
    abort: AbortHandle,
    entry: Queued,
}

struct ConnectionSlot {
    id: u64,
    connection: Arc<dyn Connection>,
    active: usize,
    limit: usize,
}

impl ConnectionSlot {
    fn has_capacity(&self) -> bool {
        self.active < self.limit && self.connection.is_open()
    }
}

struct State {
    lifecycle: Lifecycle,
    ready: BinaryHeap<Queued>,
    deferred: BinaryHeap<Deferred>,
    backoff: HashMap<OperationId, Queued>,
    active: HashMap<OperationId, Stream>,
    connections: Vec<ConnectionSlot>,
    connecting: usize,
    wake: Option<(Instant, TimerHandle)>,
    next_seq: u64,
    next_connection: u64,
    dispatched: u64,
}

impl State {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Open,
            ready: BinaryHeap::new(),
            deferred: BinaryHeap::new(),
            backoff: HashMap::new(),
            active: HashMap::new(),
            connections: Vec::new(),
            connecting: 0,
            wake: None,
            next_seq: 0,
            next_connection: 0,
            dispatched: 0,
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while self.deferred.peek().is_some_and(|d| d.due <= now) {
            if let Some(deferred) = self.deferred.pop() {
                self.ready.push(deferred.entry);
            }
        }
    }

    fn available_connection(&self) -> Option<usize> {
        self.connections.iter().position(ConnectionSlot::has_capacity)
    }

    fn free_stream(&mut self, connection: u64) {
        if let Some(slot) = self.connections.iter_mut().find(|s| s.id == connection) {
            slot.active = slot.active.saturating_sub(1);
        }
    }

    /// Connections to open for the current backlog. Pending attempts are
    /// credited with the stream limit seen on established connections, or
    /// one stream when none is established yet.
    fn connections_wanted(&self, max_connections: usize) -> usize {
        let waiting = self
            .ready
            .iter()
            .filter(|entry| !entry.operation.is_terminal())
            .count();
        if waiting == 0 {
            return 0;
        }

        let per_connection = self
            .connections
            .iter()
            .map(|slot| slot.limit)
            .max()
            .unwrap_or(1)
            .max(1);
        let expected = self.connecting.saturating_mul(per_connection);
        let needed = waiting.saturating_sub(expected).div_ceil(per_connection);
        let spare = max_connections.saturating_sub(self.connections.len() + self.connecting);
        needed.min(spare)
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty()
            && self.deferred.is_empty()
            && self.backoff.is_empty()
            && self.active.is_empty()
            && self.connecting == 0
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            queued: self.ready.len(),
            deferred: self.deferred.len(),
            backing_off: self.backoff.len(),
            active: self.active.len(),
            connections: self.connections.len(),
            connecting: self.connecting,
            dispatched: self.dispatched,
        }
    }
}

/// Queueing and connection assignment for one destination.
pub struct SessionManager {
    destination: Destination,
    config: Arc<ClientConfiguration>,
    transport: Arc<dyn Transport>,
    event_loop: EventLoop,
    router: Option<Weak<dyn Router>>,
    this: Weak<SessionManager>,
    state: Mutex<State>,
}

impl SessionManager {
    /// Create a manager that follows redirects only within its own
    /// destination.
    #[must_use]
    pub fn new(
        destination: Destination,
        config: Arc<ClientConfiguration>,
        transport: Arc<dyn Transport>,
        event_loop: EventLoop,
    ) -> Arc<Self> {
        Self::build(destination, config, transport, event_loop, None)
    }

    /// Create a manager that hands cross-destination redirects to `router`.
    #[must_use]
    pub fn with_router(
        destination: Destination,
        config: Arc<ClientConfiguration>,
        transport: Arc<dyn Transport>,
        event_loop: EventLoop,
        router: Weak<dyn Router>,
    ) -> Arc<Self> {
        Self::build(destination, config, transport, event_loop, Some(router))
    }

    fn build(
        destination: Destination,
        config: Arc<ClientConfiguration>,
        transport: Arc<dyn Transport>,
        event_loop: EventLoop,
        router: Option<Weak<dyn Router>>,
    ) -> Arc<Self> {
        metrics::counter!("courier.session.created").increment(1);
        tracing::info!(destination = %destination, "Session manager created");
        Arc::new_cyclic(|this| Self {
            destination,
            config,
            transport,
            event_loop,
            router,
            this: this.clone(),
            state: Mutex::new(State::new()),
        })
    }

    /// Destination this manager serves.
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Snapshot of queue and connection counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.lock().stats()
    }

    /// Whether [`SessionManager::close`] or [`SessionManager::kill`] was
    /// processed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle != Lifecycle::Open
    }

    /// Accept `operation` for dispatch.
    ///
    /// Operations that already finished are ignored; a killed manager fails
    /// them with [`DispatchError::Killed`].
    pub fn submit(self: &Arc<Self>, operation: Operation) {
        if self.event_loop.is_current() {
            self.admit(operation);
            return;
        }

        let manager = Arc::clone(self);
        let fallback = operation.clone();
        if let Err(error) = self.event_loop.execute(move || manager.admit(operation)) {
            tracing::warn!(
                destination = %self.destination,
                error = %error,
                "Event loop refused submission"
            );
            fallback.fail(DispatchError::ShuttingDown);
        }
    }

    /// Stop opening connections once the backlog is gone, and close idle
    /// connections. Queued and in-flight operations still run to
    /// completion.
    pub fn close(self: &Arc<Self>) {
        self.on_loop(Self::drain);
    }

    /// Fail every outstanding operation with [`DispatchError::Killed`],
    /// abort in-flight streams, and close all connections.
    pub fn kill(self: &Arc<Self>) {
        self.on_loop(Self::kill_now);
    }

    fn on_loop<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        if self.event_loop.is_current() {
            task(self);
            return;
        }
        let manager = Arc::clone(self);
        if let Err(error) = self.event_loop.execute(move || task(&manager)) {
            tracing::warn!(
                destination = %self.destination,
                error = %error,
                "Event loop refused session task"
            );
        }
    }

    fn admit(&self, operation: Operation) {
        if operation.is_terminal() {
            return;
        }

        let descriptor = operation.descriptor();
        let now = Instant::now();
        let killed = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Killed {
                true
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                let entry = Queued {
                    operation: operation.clone(),
                    priority: descriptor.priority(),
                    seq,
                    enqueued_at: now,
                };
                let delay = descriptor.discretionary_delay();
                if delay.is_zero() {
                    state.ready.push(entry);
                } else {
                    state.deferred.push(Deferred {
                        due: deferral_due(now, delay),
                        entry,
                    });
                }
                false
            }
        };

        if killed {
            operation.fail(DispatchError::Killed);
            return;
        }

        tracing::debug!(
            destination = %self.destination,
            operation = operation.id(),
            method = %descriptor.method(),
            priority = descriptor.priority(),
            deferred_ms = descriptor.discretionary_delay().as_millis(),
            "Operation queued"
        );
        self.watch(&operation);
        self.pump();
    }

    /// Have the operation's terminal transition schedule a release pass.
    fn watch(&self, operation: &Operation) {
        let manager = self.this.clone();
        let event_loop = self.event_loop.clone();
        let id = operation.id();
        operation.on_complete(move |_| {
            let _ = event_loop.execute(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.release(id);
                }
            });
        });
    }

    fn release(&self, id: OperationId) {
        {
            let mut state = self.lock();
            if let Some(stream) = state.active.remove(&id) {
                stream.abort.abort();
                state.free_stream(stream.connection);
                tracing::debug!(
                    destination = %self.destination,
                    operation = id,
                    connection = stream.connection,
                    "Released stream of finished operation"
                );
            }
            state.ready.retain(|entry| entry.operation.id() != id);
            state.deferred.retain(|deferred| deferred.entry.operation.id() != id);
            state.backoff.remove(&id);
        }
        self.pump();
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        name = "session_dispatch",
        fields(destination = %self.destination)
    )]
    fn pump(&self) {
        let mut starts = Vec::new();
        let mut idle_connections = Vec::new();
        let connects = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Killed {
                return;
            }

            let now = Instant::now();
            state.promote_due(now);
            state
                .connections
                .retain(|slot| slot.active > 0 || slot.connection.is_open());

            while let Some(index) = state.available_connection() {
                let Some(entry) = state.ready.pop() else {
                    break;
                };
                if !entry.operation.activate() {
                    continue;
                }
                let slot = &mut state.connections[index];
                slot.active += 1;
                starts.push((entry, slot.id, Arc::clone(&slot.connection)));
            }

            let connects = state.connections_wanted(self.config.max_connections_per_destination());
            state.connecting += connects;

            self.arm_wake(&mut state, now);

            if state.lifecycle == Lifecycle::Draining && state.is_idle() {
                idle_connections = state
                    .connections
                    .drain(..)
                    .map(|slot| slot.connection)
                    .collect();
            }
            connects
        };

        for (entry, connection_id, connection) in starts {
            self.start_stream(entry, connection_id, &connection);
        }
        for _ in 0..connects {
            self.start_connect();
        }
        if !idle_connections.is_empty() {
            tracing::info!(
                destination = %self.destination,
                count = idle_connections.len(),
                "Closing idle connections of drained session"
            );
            for connection in idle_connections {
                connection.close();
            }
        }
    }

    fn arm_wake(&self, state: &mut State, now: Instant) {
        let Some(due) = state.deferred.peek().map(|d| d.due) else {
            if let Some((_, timer)) = state.wake.take() {
                timer.cancel();
            }
            return;
        };
        if state.wake.as_ref().is_some_and(|(at, _)| *at <= due) {
            return;
        }
        if let Some((_, timer)) = state.wake.take() {
            timer.cancel();
        }

        let manager = self.this.clone();
        let delay = due.saturating_duration_since(now);
        match self.event_loop.schedule(
            move || {
                if let Some(manager) = manager.upgrade() {
                    manager.wake();
                }
            },
            delay,
        ) {
            Ok(timer) => state.wake = Some((due, timer)),
            Err(error) => {
                tracing::warn!(
                    destination = %self.destination,
                    error = %error,
                    "Could not arm deferral timer"
                );
            }
        }
    }

    fn wake(&self) {
        self.lock().wake = None;
        self.pump();
    }

    fn start_stream(&self, entry: Queued, connection_id: u64, connection: &Arc<dyn Connection>) {
        let operation = entry.operation.clone();
        let id = operation.id();
        let descriptor = operation.descriptor();

        metrics::counter!("courier.session.dispatched").increment(1);
        metrics::histogram!("courier.session.queue_wait_seconds")
            .record(entry.enqueued_at.elapsed().as_secs_f64());
        tracing::debug!(
            destination = %self.destination,
            operation = id,
            connection = connection_id,
            priority = entry.priority,
            target = %descriptor.target(),
            "Dispatching operation"
        );

        let (send, abort) = abortable(connection.send(descriptor));
        {
            let mut state = self.lock();
            state.dispatched += 1;
            state.active.insert(
                id,
                Stream {
                    connection: connection_id,
                    abort,
                    entry,
                },
            );
        }

        let manager = self.this.clone();
        let spawned = self.event_loop.spawn(async move {
            if let Ok(result) = send.await {
                if let Some(manager) = manager.upgrade() {
                    manager.stream_finished(id, result);
                }
            }
        });

        if let Err(error) = spawned {
            tracing::warn!(
                destination = %self.destination,
                operation = id,
                error = %error,
                "Could not start stream"
            );
            let stream = self.lock().active.remove(&id);
            if let Some(stream) = stream {
                self.lock().free_stream(stream.connection);
            }
            operation.fail(DispatchError::ShuttingDown);
        }
    }

    fn stream_finished(&self, id: OperationId, result: Result<Response, TransportError>) {
        let stream = {
            let mut state = self.lock();
            let stream = state.active.remove(&id);
            if let Some(stream) = &stream {
                state.free_stream(stream.connection);
            }
            stream
        };

        let Some(stream) = stream else {
            tracing::trace!(
                destination = %self.destination,
                operation = id,
                "Discarding result of released stream"
            );
            self.pump();
            return;
        };

        match result {
            Ok(response) => self.on_response(&stream.entry.operation, response),
            Err(error) => self.retry_or_fail(stream.entry, error),
        }
        self.pump();
    }

    fn on_response(&self, operation: &Operation, response: Response) {
        if self.follow_redirect(operation, &response) {
            return;
        }

        let status = response.status.as_u16();
        if operation.complete(response) {
            tracing::debug!(
                destination = %self.destination,
                operation = operation.id(),
                status,
                elapsed_ms = operation.elapsed().as_millis(),
                "Operation completed"
            );
        } else {
            tracing::trace!(
                destination = %self.destination,
                operation = operation.id(),
                status,
                "Late response discarded"
            );
        }
    }

    /// Returns `true` if the response was consumed by redirect handling.
    fn follow_redirect(&self, operation: &Operation, response: &Response) -> bool {
        if !self.config.follow_redirects() || !response.is_redirect() {
            return false;
        }
        let descriptor = operation.descriptor();
        if descriptor.max_redirects() == 0 {
            return false;
        }
        let Some(location) = response.location() else {
            return false;
        };
        let target = match descriptor.target().join(location) {
            Ok(target) => target,
            Err(error) => {
                tracing::warn!(
                    destination = %self.destination,
                    operation = operation.id(),
                    location,
                    error = %error,
                    "Ignoring unparseable redirect location"
                );
                return false;
            }
        };

        if operation.redirect_count() >= descriptor.max_redirects() {
            tracing::warn!(
                destination = %self.destination,
                operation = operation.id(),
                limit = descriptor.max_redirects(),
                "Redirect limit exceeded"
            );
            operation.fail(DispatchError::TooManyRedirects {
                limit: descriptor.max_redirects(),
            });
            return true;
        }

        let preserve_method = match response.status {
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => true,
            StatusCode::SEE_OTHER => descriptor.method() == Method::Head,
            _ => descriptor.method() != Method::Post,
        };
        let Some(next) = descriptor.redirected(target, preserve_method) else {
            return false;
        };

        let router = self.router.as_ref().and_then(Weak::upgrade);
        if router.is_none() && next.destination() != &self.destination {
            return false;
        }

        let next_target = next.target().to_string();
        if !operation.retarget(next) || !operation.requeue() {
            return true;
        }

        metrics::counter!("courier.session.redirects").increment(1);
        tracing::debug!(
            destination = %self.destination,
            operation = operation.id(),
            status = response.status.as_u16(),
            hop = operation.redirect_count(),
            target = %next_target,
            "Following redirect"
        );

        match router {
            Some(router) => router.route(operation.clone()),
            None => self.admit(operation.clone()),
        }
        true
    }

    fn retry_or_fail(&self, entry: Queued, error: TransportError) {
        let operation = entry.operation.clone();
        let descriptor = operation.descriptor();
        let attempt = operation.retry_count() + 1;

        let retriable = error.is_retriable()
            && descriptor.is_retriable()
            && self.config.retry().should_retry(attempt);
        if !retriable {
            tracing::warn!(
                destination = %self.destination,
                operation = operation.id(),
                attempts = attempt,
                error = %error,
                "Operation failed"
            );
            operation.fail(DispatchError::Transport(error));
            return;
        }

        if !operation.requeue() {
            return;
        }
        operation.record_retry();
        let delay = jittered(self.config.retry().delay_for_attempt(attempt - 1));

        metrics::counter!("courier.session.retries").increment(1);
        tracing::warn!(
            destination = %self.destination,
            operation = operation.id(),
            attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "Retrying after transport failure"
        );

        let id = operation.id();
        self.lock().backoff.insert(id, entry);
        let manager = self.this.clone();
        let scheduled = self.event_loop.schedule(
            move || {
                if let Some(manager) = manager.upgrade() {
                    manager.resume(id);
                }
            },
            delay,
        );
        if scheduled.is_err() {
            self.lock().backoff.remove(&id);
            operation.fail(DispatchError::Transport(error));
        }
    }

    fn resume(&self, id: OperationId) {
        let entry = self.lock().backoff.remove(&id);
        if let Some(entry) = entry {
            if !entry.operation.is_terminal() {
                self.lock().ready.push(entry);
            }
        }
        self.pump();
    }

    fn start_connect(&self) {
        let connect = self.transport.connect(&self.destination, &self.config);
        let timeout = self.config.connect_timeout();
        let destination = self.destination.clone();
        let manager = self.this.clone();

        tracing::debug!(destination = %self.destination, "Opening connection");
        let spawned = self.event_loop.spawn(async move {
            let result = match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::retriable(
                    TransportErrorKind::Connect,
                    format!("connect to {destination} timed out after {timeout:?}"),
                )),
            };
            if let Some(manager) = manager.upgrade() {
                manager.connected(result);
            }
        });

        if let Err(error) = spawned {
            tracing::warn!(
                destination = %self.destination,
                error = %error,
                "Could not start connection attempt"
            );
            let mut state = self.lock();
            state.connecting = state.connecting.saturating_sub(1);
        }
    }

    fn connected(&self, result: Result<Arc<dyn Connection>, TransportError>) {
        match result {
            Ok(connection) => {
                let mut state = self.lock();
                state.connecting = state.connecting.saturating_sub(1);
                if state.lifecycle == Lifecycle::Killed {
                    drop(state);
                    connection.close();
                    return;
                }

                let limit = self
                    .config
                    .max_streams_per_connection()
                    .min(connection.max_concurrent_streams())
                    .max(1);
                let id = state.next_connection;
                state.next_connection += 1;
                metrics::counter!("courier.session.connections_opened").increment(1);
                tracing::info!(
                    destination = %self.destination,
                    connection = id,
                    protocol = %connection.protocol(),
                    streams = limit,
                    "Connection established"
                );
                state.connections.push(ConnectionSlot {
                    id,
                    connection,
                    active: 0,
                    limit,
                });
            }
            Err(error) => {
                metrics::counter!("courier.session.connect_failures").increment(1);
                tracing::warn!(
                    destination = %self.destination,
                    error = %error,
                    "Connection attempt failed"
                );

                let head = {
                    let mut state = self.lock();
                    state.connecting = state.connecting.saturating_sub(1);
                    let mut head = None;
                    while let Some(entry) = state.ready.pop() {
                        if !entry.operation.is_terminal() {
                            head = Some(entry);
                            break;
                        }
                    }
                    head
                };
                if let Some(entry) = head {
                    self.retry_or_fail(entry, error);
                }
            }
        }
        self.pump();
    }

    fn drain(&self) {
        {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Open {
                return;
            }
            state.lifecycle = Lifecycle::Draining;
        }
        tracing::info!(destination = %self.destination, "Session draining");
        self.pump();
    }

    fn kill_now(&self) {
        let (operations, connections) = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Killed {
                return;
            }
            state.lifecycle = Lifecycle::Killed;
            if let Some((_, timer)) = state.wake.take() {
                timer.cancel();
            }

            let mut operations: Vec<Operation> =
                state.ready.drain().map(|entry| entry.operation).collect();
            operations.extend(state.deferred.drain().map(|d| d.entry.operation));
            operations.extend(state.backoff.drain().map(|(_, entry)| entry.operation));
            for (_, stream) in state.active.drain() {
                stream.abort.abort();
                operations.push(stream.entry.operation);
            }
            let connections: Vec<_> = state
                .connections
                .drain(..)
                .map(|slot| slot.connection)
                .collect();
            (operations, connections)
        };

        for connection in &connections {
            connection.close();
        }
        let failed = operations
            .into_iter()
            .filter(|operation| operation.fail(DispatchError::Killed))
            .count();
        tracing::warn!(
            destination = %self.destination,
            failed,
            connections = connections.len(),
            "Session killed"
        );
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("destination", &self.destination)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Deferrals longer than this never come due; only cancellation, timeout,
/// or kill finishes such an operation.
const INDEFINITE_DEFERRAL: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn deferral_due(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(INDEFINITE_DEFERRAL))
        .unwrap_or(now)
}

/// Scale `delay` by a random factor in `[0.5, 1.0]` so retries against the
/// same destination spread out.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    delay.mul_f64(factor)
}
