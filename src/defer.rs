//! A value that is settled exactly once and can be awaited by anyone.
//!
//! [`Deferred`] is how the controllers expose their readiness signals: the controller
//! keeps a clone and settles it, any number of observers await it or inspect its
//! [`DeferredState`] without polling.

use std::sync::Arc;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::sync::watch;

/// The observable state of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DeferredState {
    /// Not settled yet.
    Pending,
    /// Resolved with a value.
    Fulfilled,
    /// Rejected with a reason.
    Rejected,
}

/// Waiting on a [`Deferred`] did not produce a value.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DeferredError {
    #[snafu(display("Deferred was rejected: {reason}"))]
    Rejected { reason: String },
    #[snafu(display("Deferred was dropped before it settled"))]
    Abandoned {},
}

#[derive(Debug, Clone)]
enum Settlement<T> {
    Pending,
    Fulfilled(T),
    Rejected(String),
}

/// A single-resolution future with inspectable state.
///
/// Clones share the same settlement. Only the first call to [`Deferred::resolve`] or
/// [`Deferred::reject`] has an effect.
#[derive(Debug)]
pub struct Deferred<T> {
    inner: Arc<watch::Sender<Settlement<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    /// Creates a new, pending deferred.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Settlement::Pending);
        Self {
            inner: Arc::new(tx),
        }
    }

    /// Resolves with `value`.
    ///
    /// Returns `false` if this deferred was already settled, in which case `value` is
    /// dropped.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Fulfilled(value))
    }

    /// Rejects with `reason`.
    ///
    /// Returns `false` if this deferred was already settled.
    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.settle(Settlement::Rejected(reason.into()))
    }

    fn settle(&self, settlement: Settlement<T>) -> bool {
        self.inner.send_if_modified(move |current| match current {
            Settlement::Pending => {
                *current = settlement;
                true
            }
            _ => false,
        })
    }

    /// Returns the current state.
    pub fn state(&self) -> DeferredState {
        match &*self.inner.borrow() {
            Settlement::Pending => DeferredState::Pending,
            Settlement::Fulfilled(_) => DeferredState::Fulfilled,
            Settlement::Rejected(_) => DeferredState::Rejected,
        }
    }

    /// Whether this deferred was resolved with a value.
    pub fn is_fulfilled(&self) -> bool {
        self.state() == DeferredState::Fulfilled
    }

    /// Returns the value if already fulfilled.
    pub fn get(&self) -> Option<T> {
        match &*self.inner.borrow() {
            Settlement::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Waits until this deferred is settled.
    ///
    /// The returned future does not borrow `self` and can be moved into a task.
    pub fn wait(&self) -> impl Future<Output = Result<T, DeferredError>> + Send + 'static
    where
        T: Send + Sync + 'static,
    {
        let mut rx = self.inner.subscribe();
        async move {
            let settlement = rx
                .wait_for(|s| !matches!(s, Settlement::Pending))
                .await
                .map_err(|_| AbandonedSnafu.build())?;
            match &*settlement {
                Settlement::Fulfilled(value) => Ok(value.clone()),
                Settlement::Rejected(reason) => Err(RejectedSnafu {
                    reason: reason.clone(),
                }
                .build()),
                Settlement::Pending => unreachable!("wait_for only returns settled values"),
            }
        }
    }

    /// Returns a read-only view which can await and inspect, but not settle.
    pub fn observer(&self) -> Observer<T> {
        Observer {
            inner: self.clone(),
        }
    }
}

/// A read-only view of a [`Deferred`].
#[derive(Debug, Clone)]
pub struct Observer<T> {
    inner: Deferred<T>,
}

impl<T: Clone> Observer<T> {
    /// See [`Deferred::state`].
    pub fn state(&self) -> DeferredState {
        self.inner.state()
    }

    /// See [`Deferred::is_fulfilled`].
    pub fn is_fulfilled(&self) -> bool {
        self.inner.is_fulfilled()
    }

    /// See [`Deferred::wait`].
    pub fn wait(&self) -> impl Future<Output = Result<T, DeferredError>> + Send + 'static
    where
        T: Send + Sync + 'static,
    {
        self.inner.wait()
    }
}
