//! Operations: cancellable futures for one submitted request.
//!
//! An [`Operation`] is handed back by `Client::submit` and finishes exactly
//! once, with a response, a failure, or a cancellation. The timeout timer,
//! the transport, and the caller all race to finish it; the first transition
//! wins and every later one is a no-op that reports `false`.
//!
//! Listeners registered with [`Operation::on_complete`] run once, outside
//! the state lock, on whichever thread performed the winning transition. A
//! listener added after the operation finished runs immediately on the
//! registering thread.

use courier_core::{DispatchError, RequestDescriptor, Response};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Final result of an operation.
pub type Outcome = Result<Response, DispatchError>;

/// Process-unique operation identifier.
pub type OperationId = u64;

type Listener = Box<dyn FnOnce(&Outcome) + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Observable lifecycle state of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Waiting for a connection slot (or a retry/redirect hop).
    Queued,
    /// Assigned to a connection; the transport is working on it.
    Active,
    /// Finished with a response.
    Completed,
    /// Finished with a failure other than cancellation.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl OperationState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

enum Slot {
    Running {
        active: bool,
        listeners: Vec<Listener>,
    },
    Done(Outcome),
}

struct Inner {
    id: OperationId,
    descriptor: RwLock<Arc<RequestDescriptor>>,
    slot: Mutex<Slot>,
    redirects: AtomicU32,
    retries: AtomicU32,
    created_at: Instant,
}

/// Handle to one in-flight request.
///
/// Clones share the same state; the caller, the session manager, and the
/// timeout timer each hold one.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

impl Operation {
    /// Wrap a descriptor in a fresh, queued operation.
    #[must_use]
    pub fn new(descriptor: RequestDescriptor) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                descriptor: RwLock::new(Arc::new(descriptor)),
                slot: Mutex::new(Slot::Running {
                    active: false,
                    listeners: Vec::new(),
                }),
                redirects: AtomicU32::new(0),
                retries: AtomicU32::new(0),
                created_at: Instant::now(),
            }),
        }
    }

    /// Process-unique id, stable across redirects and retries.
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.inner.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        match &*self.lock() {
            Slot::Running { active: false, .. } => OperationState::Queued,
            Slot::Running { active: true, .. } => OperationState::Active,
            Slot::Done(Ok(_)) => OperationState::Completed,
            Slot::Done(Err(DispatchError::Cancelled)) => OperationState::Cancelled,
            Slot::Done(Err(_)) => OperationState::Failed,
        }
    }

    /// Whether the operation has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(&*self.lock(), Slot::Done(_))
    }

    /// The final outcome, once there is one.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.lock() {
            Slot::Done(outcome) => Some(outcome.clone()),
            Slot::Running { .. } => None,
        }
    }

    /// The descriptor currently being dispatched. Changes when a redirect
    /// is followed.
    #[must_use]
    pub fn descriptor(&self) -> Arc<RequestDescriptor> {
        Arc::clone(
            &self
                .inner
                .descriptor
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Swap in the descriptor for the next redirect hop.
    ///
    /// Returns `false` (and changes nothing) once the operation is terminal.
    pub fn retarget(&self, descriptor: RequestDescriptor) -> bool {
        let slot = self.lock();
        if matches!(&*slot, Slot::Done(_)) {
            return false;
        }
        *self
            .inner
            .descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(descriptor);
        self.inner.redirects.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Redirect hops followed so far.
    #[must_use]
    pub fn redirect_count(&self) -> u32 {
        self.inner.redirects.load(Ordering::Acquire)
    }

    /// Transport retries performed so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.retries.load(Ordering::Acquire)
    }

    /// Time since submission.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// Finish with a response.
    ///
    /// Returns `true` if this call performed the terminal transition.
    pub fn complete(&self, response: Response) -> bool {
        self.finish(Ok(response))
    }

    /// Finish with a failure.
    ///
    /// Returns `true` if this call performed the terminal transition.
    pub fn fail(&self, error: DispatchError) -> bool {
        self.finish(Err(error))
    }

    /// Cancel the operation.
    ///
    /// The owning session manager observes the transition through its
    /// listener: a queued operation is dropped from the queue and an active
    /// one has its stream aborted. Returns `true` if this call won.
    pub fn cancel(&self) -> bool {
        let won = self.finish(Err(DispatchError::Cancelled));
        if won {
            tracing::debug!(operation = self.inner.id, "Operation cancelled");
        }
        won
    }

    /// Register `listener` to receive the outcome.
    ///
    /// Runs exactly once: on the thread that finishes the operation, or
    /// right away if it already has.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.lock();
            match &mut *slot {
                Slot::Running { listeners, .. } => {
                    listeners.push(Box::new(listener));
                    return;
                }
                Slot::Done(outcome) => outcome.clone(),
            }
        };
        listener(&outcome);
    }

    /// Wait for the outcome.
    ///
    /// Combine with a submission timeout or an outer `tokio::time::timeout`
    /// if the transport may never answer.
    pub async fn wait(&self) -> Outcome {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        rx.await.unwrap_or(Err(DispatchError::Killed))
    }

    /// `Queued -> Active`. Fails if the operation is already active or
    /// terminal.
    pub(crate) fn activate(&self) -> bool {
        match &mut *self.lock() {
            Slot::Running { active, .. } if !*active => {
                *active = true;
                true
            }
            _ => false,
        }
    }

    /// `Active -> Queued` for a retry or redirect hop. Returns `true` if the
    /// operation is still running afterwards.
    pub(crate) fn requeue(&self) -> bool {
        match &mut *self.lock() {
            Slot::Running { active, .. } => {
                *active = false;
                true
            }
            Slot::Done(_) => false,
        }
    }

    pub(crate) fn record_retry(&self) -> u32 {
        self.inner.retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn finish(&self, outcome: Outcome) -> bool {
        let listeners = {
            let mut slot = self.lock();
            let Slot::Running { listeners, .. } = &mut *slot else {
                return false;
            };
            let listeners = mem::take(listeners);
            *slot = Slot::Done(outcome.clone());
            listeners
        };

        let label = match &outcome {
            Ok(_) => "completed",
            Err(DispatchError::Cancelled) => "cancelled",
            Err(DispatchError::Timeout { .. }) => "timeout",
            Err(_) => "failed",
        };
        metrics::counter!("courier.operation.completed", "outcome" => label).increment(1);

        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("target", &self.descriptor().target().as_str())
            .finish_non_exhaustive()
    }
}
