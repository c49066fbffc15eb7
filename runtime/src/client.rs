//! The dispatch facade.
//!
//! [`Client`] is the entry point applications use: it turns request
//! descriptors into [`Operation`]s, arms their timeouts, resolves aliases,
//! and hands each operation to the session manager of its canonical
//! destination on the event loop.

use crate::event_loop::EventLoop;
use crate::operation::{Operation, OperationId};
use crate::session::{Router, SessionManager};
use crate::transport::Transport;
use courier_core::{AliasTable, ClientConfiguration, Destination, DispatchError, RequestDescriptor};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const KILLED: u8 = 2;

/// Timer delay armed for a request timeout: whole milliseconds, never less
/// than one.
#[must_use]
pub fn timeout_delay(timeout: Duration) -> Duration {
    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(millis.max(1))
}

/// Client-side dispatch facade.
///
/// Cheap to clone. Dropping the last clone kills the client: outstanding
/// operations fail with [`DispatchError::Killed`]. If the event loop stops
/// underneath the client, outstanding operations fail with
/// [`DispatchError::ShuttingDown`].
///
/// # Example
///
/// ```no_run
/// use courier_core::{ClientConfiguration, Method, RequestDescriptor};
/// use courier_runtime::{Client, Transport};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new(ClientConfiguration::default(), transport);
///
/// let request = RequestDescriptor::builder(Method::Get, "https://example.com/")
///     .timeout(Duration::from_secs(5))
///     .build()?;
///
/// let operation = client.submit(request)?;
/// let response = operation.wait().await?;
/// println!("{}", response.status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<ClientConfiguration>,
    transport: Arc<dyn Transport>,
    event_loop: EventLoop,
    aliases: AliasTable,
    sessions: DashMap<Destination, Arc<SessionManager>>,
    lifecycle: AtomicU8,
    live: Arc<DashMap<OperationId, Operation>>,
    this: Weak<Shared>,
}

impl Client {
    /// Create a client with its own event loop, named after
    /// [`ClientConfiguration::event_loop_name`].
    #[must_use]
    pub fn new(config: ClientConfiguration, transport: Arc<dyn Transport>) -> Self {
        let event_loop = EventLoop::new(config.event_loop_name());
        Self::with_event_loop(config, transport, event_loop)
    }

    /// Create a client that schedules on `event_loop`, which may be shared
    /// with other clients.
    #[must_use]
    pub fn with_event_loop(
        config: ClientConfiguration,
        transport: Arc<dyn Transport>,
        event_loop: EventLoop,
    ) -> Self {
        let shared = Arc::new_cyclic(|this| Shared {
            config: Arc::new(config),
            transport,
            event_loop,
            aliases: AliasTable::new(),
            sessions: DashMap::new(),
            lifecycle: AtomicU8::new(OPEN),
            live: Arc::new(DashMap::new()),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&shared);
        shared.event_loop.on_stop(move || {
            if let Some(shared) = weak.upgrade() {
                shared.abandon();
            }
        });
        Self { shared }
    }

    /// Submit a request for dispatch.
    ///
    /// Never blocks on network work. The returned operation is already
    /// queued; if the descriptor carries a timeout, a timer that fails the
    /// operation with [`DispatchError::Timeout`] is armed before routing.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ShuttingDown`] after [`Client::close`] or
    /// [`Client::kill`], or if the event loop is gone.
    #[tracing::instrument(
        skip_all,
        name = "client_submit",
        fields(method = %descriptor.method(), target = %descriptor.target())
    )]
    pub fn submit(&self, descriptor: RequestDescriptor) -> Result<Operation, DispatchError> {
        let shared = &self.shared;
        if shared.lifecycle.load(Ordering::Acquire) != OPEN {
            metrics::counter!("courier.client.rejected").increment(1);
            tracing::warn!("Submission refused, client is shutting down");
            return Err(DispatchError::ShuttingDown);
        }

        let timeout = descriptor.timeout();
        let operation = Operation::new(descriptor);

        let id = operation.id();
        shared.live.insert(id, operation.clone());
        let live = Arc::clone(&shared.live);
        operation.on_complete(move |_| {
            live.remove(&id);
        });

        if let Some(after) = timeout {
            let expiring = operation.clone();
            let armed = shared.event_loop.schedule(
                move || {
                    if expiring.fail(DispatchError::Timeout { after }) {
                        metrics::counter!("courier.client.timeouts").increment(1);
                        tracing::debug!(
                            operation = expiring.id(),
                            timeout_ms = after.as_millis(),
                            "Operation timed out"
                        );
                    }
                },
                timeout_delay(after),
            );
            match armed {
                Ok(timer) => operation.on_complete(move |_| {
                    timer.cancel();
                }),
                Err(error) => {
                    tracing::error!(error = %error, "Could not arm timeout");
                    operation.fail(DispatchError::ShuttingDown);
                    return Err(DispatchError::ShuttingDown);
                }
            }
        }

        shared.route(operation.clone());
        metrics::counter!("courier.client.submitted").increment(1);
        tracing::debug!(operation = operation.id(), "Operation submitted");
        Ok(operation)
    }

    /// Submit and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`] from submission or from the operation.
    pub async fn send(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<courier_core::Response, DispatchError> {
        self.submit(descriptor)?.wait().await
    }

    /// Route requests for `alias` to the session of `canonical`.
    ///
    /// Takes effect for operations submitted afterwards; already-routed
    /// operations stay where they are.
    pub fn add_alias(&self, alias: Destination, canonical: Destination) {
        tracing::info!(alias = %alias, canonical = %canonical, "Alias registered");
        self.shared.aliases.insert(alias, canonical);
    }

    /// Stop routing `alias` elsewhere.
    pub fn remove_alias(&self, alias: &Destination) -> Option<Destination> {
        self.shared.aliases.remove(alias)
    }

    /// The alias table.
    #[must_use]
    pub fn aliases(&self) -> &AliasTable {
        &self.shared.aliases
    }

    /// Refuse new submissions and let every session drain.
    ///
    /// Queued and in-flight operations still run to completion (redirects
    /// and retries included). Idempotent.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared
            .lifecycle
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!(outstanding = self.outstanding(), "Client closing");

        let weak = shared.this.clone();
        let _ = shared.event_loop.execute(move || {
            if let Some(shared) = weak.upgrade() {
                for session in shared.sessions.iter() {
                    session.value().close();
                }
            }
        });
    }

    /// Refuse new submissions, fail every outstanding operation with
    /// [`DispatchError::Killed`], and close all connections. Idempotent.
    pub fn kill(&self) {
        let shared = &self.shared;
        if shared.lifecycle.swap(KILLED, Ordering::AcqRel) == KILLED {
            return;
        }
        tracing::warn!(outstanding = self.outstanding(), "Client killed");

        // Sessions are listed on the loop, after every dispatch task queued
        // before the kill has created its session.
        let killer = Arc::clone(shared);
        let _ = shared.event_loop.execute(move || {
            for session in killer.snapshot() {
                session.kill();
            }
        });
    }

    /// Wait until no submitted operation is outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Timeout`] if operations are still
    /// outstanding after `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), DispatchError> {
        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            let pending = self.outstanding();
            if pending == 0 {
                tracing::debug!("Client idle");
                return Ok(());
            }

            if start.elapsed() >= timeout {
                tracing::warn!(
                    outstanding = pending,
                    "Timed out waiting for {} operations", pending
                );
                return Err(DispatchError::Timeout { after: timeout });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Close, wait up to `timeout` for outstanding operations, and kill
    /// whatever is left.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Timeout`] if the client had to be killed.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), DispatchError> {
        self.close();
        let result = self.wait_idle(timeout).await;
        if result.is_err() {
            self.kill();
        }
        result
    }

    /// Submitted operations that have not finished.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.live.len()
    }

    /// Whether [`Client::close`] or [`Client::kill`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle.load(Ordering::Acquire) != OPEN
    }

    /// Session managers created so far (one per canonical destination).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Session manager of a canonical destination, if one was created.
    #[must_use]
    pub fn session(&self, destination: &Destination) -> Option<Arc<SessionManager>> {
        self.shared
            .sessions
            .get(destination)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// The configuration every session reads.
    #[must_use]
    pub fn config(&self) -> &ClientConfiguration {
        &self.shared.config
    }

    /// The event loop this client schedules on.
    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("sessions", &self.session_count())
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn snapshot(&self) -> Vec<Arc<SessionManager>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Runs on the loop thread once the loop has stopped: nothing will drive
    /// the outstanding operations any more.
    fn abandon(&self) {
        self.lifecycle.store(KILLED, Ordering::Release);
        let operations: Vec<Operation> = self
            .live
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let failed = operations
            .iter()
            .filter(|operation| operation.fail(DispatchError::ShuttingDown))
            .count();
        for session in self.snapshot() {
            session.kill();
        }
        if failed > 0 {
            tracing::warn!(failed, "Event loop stopped under outstanding operations");
        }
    }

    /// Runs on the event loop, so session creation is serialized with
    /// `close` and `kill`.
    fn dispatch(&self, destination: Destination, operation: Operation) {
        let lifecycle = self.lifecycle.load(Ordering::Acquire);
        if lifecycle == KILLED {
            operation.fail(DispatchError::Killed);
            return;
        }

        let mut created = false;
        let session = Arc::clone(
            self.sessions
                .entry(destination.clone())
                .or_insert_with(|| {
                    created = true;
                    let router: Weak<dyn Router> = self.this.clone();
                    SessionManager::with_router(
                        destination,
                        Arc::clone(&self.config),
                        Arc::clone(&self.transport),
                        self.event_loop.clone(),
                        router,
                    )
                })
                .value(),
        );

        session.submit(operation);
        if created && lifecycle == CLOSING {
            session.close();
        }
    }
}

impl Router for Shared {
    fn route(&self, operation: Operation) {
        let destination = self.aliases.resolve(operation.descriptor().destination());
        let shared = self.this.clone();
        let fallback = operation.clone();

        let queued = self.event_loop.execute(move || match shared.upgrade() {
            Some(shared) => shared.dispatch(destination, operation),
            None => {
                operation.fail(DispatchError::Killed);
            }
        });
        if let Err(error) = queued {
            tracing::warn!(
                operation = fallback.id(),
                error = %error,
                "Event loop refused operation"
            );
            fallback.fail(DispatchError::ShuttingDown);
        }
    }
}

impl Drop for Shared {
    // Dispatch tasks hold a strong reference while they create sessions, so
    // the set listed here is final.
    fn drop(&mut self) {
        self.lifecycle.store(KILLED, Ordering::Release);
        let sessions = self.snapshot();
        if sessions.is_empty() {
            return;
        }
        let _ = self.event_loop.execute(move || {
            for session in sessions {
                session.kill();
            }
        });
    }
}
