use std::fmt;

use tokio::sync::mpsc;

use crate::fetch::{FetchError, FetchResult};

use super::registry::{Request, RequestId};

/// The outcome of a request, queued for the delivery context.
pub struct Delivery<K, S> {
    pub(crate) request: Request<K, S>,
    pub(crate) result: FetchResult,
}

impl<K, S> Delivery<K, S> {
    /// The request this delivery belongs to.
    pub fn id(&self) -> RequestId {
        self.request.id
    }

    /// The key that was requested.
    pub fn key(&self) -> &K {
        &self.request.key
    }

    /// The slot that issued the request.
    pub fn slot(&self) -> &S {
        &self.request.slot
    }

    /// The fetched payload, or the reason it is missing.
    pub fn result(&self) -> &FetchResult {
        &self.result
    }
}

impl<K: fmt::Debug, S: fmt::Debug> fmt::Debug for Delivery<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.request.id)
            .field("key", &self.request.key)
            .field("slot", &self.request.slot)
            .field("result", &self.result.as_ref().map(|payload| payload.len()))
            .finish()
    }
}

/// Guarantees that a request is delivered exactly once.
///
/// If the guard is dropped without [`deliver`](Self::deliver) having been called, e.g. because
/// the forwarding task was aborted, it delivers [`FetchError::Canceled`] instead.
pub(crate) struct DeliveryGuard<K, S> {
    inner: Option<(Request<K, S>, mpsc::UnboundedSender<Delivery<K, S>>)>,
}

impl<K, S> DeliveryGuard<K, S> {
    pub fn new(request: Request<K, S>, queue: mpsc::UnboundedSender<Delivery<K, S>>) -> Self {
        Self {
            inner: Some((request, queue)),
        }
    }

    pub fn deliver(mut self, result: FetchResult) {
        self.send(result);
    }

    fn send(&mut self, result: FetchResult) {
        if let Some((request, queue)) = self.inner.take() {
            // the receiving half only goes away together with the pipeline
            let _ = queue.send(Delivery { request, result });
        }
    }
}

impl<K, S> Drop for DeliveryGuard<K, S> {
    fn drop(&mut self) {
        self.send(Err(FetchError::Canceled));
    }
}

/// What the delivery step did with a [`Delivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    /// The payload was applied to the slot.
    Applied,
    /// The slot shows a different key by now, the payload was discarded.
    Stale,
    /// The fetch failed, the slot was left untouched.
    Failed(FetchError),
    /// The request was canceled before it finished.
    Canceled,
}

impl Delivered {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Stale => "stale",
            Self::Failed(_) => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Counts of processed deliveries by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub applied: usize,
    pub stale: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl DeliveryReport {
    /// Adds one outcome to the report.
    pub fn record(&mut self, delivered: &Delivered) {
        match delivered {
            Delivered::Applied => self.applied += 1,
            Delivered::Stale => self.stale += 1,
            Delivered::Failed(_) => self.failed += 1,
            Delivered::Canceled => self.canceled += 1,
        }
    }

    /// Total number of processed deliveries.
    pub fn total(&self) -> usize {
        self.applied + self.stale + self.failed + self.canceled
    }

    /// Merges the counts of `other` into this report.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.failed += other.failed;
        self.canceled += other.canceled;
    }
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} stale, {} failed, {} canceled",
            self.applied, self.stale, self.failed, self.canceled
        )
    }
}
