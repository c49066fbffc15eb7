//! Records operation outcomes in the order they were delivered.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use courier_runtime::{Operation, OperationId, Outcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Collects the outcome of every watched operation.
///
/// Each delivery is recorded, so a second delivery for the same operation
/// shows up in [`OutcomeRecorder::deliveries_for`] rather than being
/// silently merged.
///
/// # Example
///
/// ```ignore
/// let recorder = OutcomeRecorder::new();
/// recorder.watch(&client.submit(request)?);
/// assert!(recorder.wait_for(1, Duration::from_secs(1)).await);
/// assert!(recorder.outcomes()[0].1.is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct OutcomeRecorder {
    outcomes: Arc<Mutex<Vec<(OperationId, Outcome)>>>,
    notify: Arc<Notify>,
}

impl OutcomeRecorder {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of `operation` when it is delivered.
    pub fn watch(&self, operation: &Operation) {
        let outcomes = Arc::clone(&self.outcomes);
        let notify = Arc::clone(&self.notify);
        let id = operation.id();
        operation.on_complete(move |outcome| {
            outcomes.lock().unwrap().push((id, outcome.clone()));
            notify.notify_waiters();
        });
    }

    /// Deliveries so far, oldest first.
    #[must_use]
    pub fn outcomes(&self) -> Vec<(OperationId, Outcome)> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Ids in delivery order.
    #[must_use]
    pub fn completion_order(&self) -> Vec<OperationId> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of deliveries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }

    /// Whether nothing was delivered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How often `id` was delivered. Anything but 0 or 1 is a bug.
    #[must_use]
    pub fn deliveries_for(&self, id: OperationId) -> usize {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _)| *seen == id)
            .count()
    }

    /// Delivery counts per operation.
    #[must_use]
    pub fn delivery_counts(&self) -> HashMap<OperationId, usize> {
        let mut counts = HashMap::new();
        for (id, _) in self.outcomes.lock().unwrap().iter() {
            *counts.entry(*id).or_insert(0) += 1;
        }
        counts
    }

    /// Wait until at least `count` deliveries were recorded. Returns `false`
    /// on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                // Re-check periodically in case a delivery raced the
                // registration above.
                let _ = tokio::time::timeout(Duration::from_millis(10), notified).await;
            }
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{DispatchError, Method, RequestDescriptor, Response, StatusCode};

    fn operation() -> Operation {
        Operation::new(
            RequestDescriptor::builder(Method::Get, "http://example.com/")
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn records_in_delivery_order() {
        let recorder = OutcomeRecorder::new();
        let first = operation();
        let second = operation();
        recorder.watch(&first);
        recorder.watch(&second);

        second.fail(DispatchError::Cancelled);
        first.complete(Response::new(StatusCode::OK));

        assert!(recorder.wait_for(2, Duration::from_secs(1)).await);
        assert_eq!(recorder.completion_order(), vec![second.id(), first.id()]);
        assert_eq!(recorder.deliveries_for(first.id()), 1);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let recorder = OutcomeRecorder::new();
        recorder.watch(&operation());
        assert!(!recorder.wait_for(1, Duration::from_millis(20)).await);
        assert!(recorder.is_empty());
    }
}
