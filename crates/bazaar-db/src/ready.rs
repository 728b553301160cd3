//! One-shot "database ready" broadcast.
//!
//! Components register callbacks before startup; the lifecycle manager
//! fires them once, in registration order, after the first successful
//! connect. The first failing callback stops the chain and its error is
//! returned to whoever drove the connect.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::DbError;

type ReadyCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), DbError>> + Send>;

#[derive(Default)]
struct Pending {
    fired: bool,
    callbacks: Vec<ReadyCallback>,
}

/// Ordered, fire-once set of ready callbacks.
#[derive(Default)]
pub struct ReadyBroadcast {
    pending: Mutex<Pending>,
}

impl core::fmt::Debug for ReadyBroadcast {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ReadyBroadcast")
            .field("fired", &pending.fired)
            .field("callbacks", &pending.callbacks.len())
            .finish()
    }
}

impl ReadyBroadcast {
    /// Create an empty broadcast.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Returns `false` (and drops the callback) if the
    /// broadcast already fired.
    pub fn on_ready<F, Fut>(&self, callback: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DbError>> + Send + 'static,
    {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.fired {
            tracing::warn!("Ready callback registered after the database became ready; ignoring");
            return false;
        }
        pending.callbacks.push(Box::new(move || callback().boxed()));
        true
    }

    /// Whether [`fire`](Self::fire) has run.
    pub fn has_fired(&self) -> bool {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).fired
    }

    /// Run every registered callback in order. Later calls are no-ops.
    pub async fn fire(&self) -> Result<(), DbError> {
        let callbacks = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.fired {
                return Ok(());
            }
            pending.fired = true;
            std::mem::take(&mut pending.callbacks)
        };

        let total = callbacks.len();
        for (position, callback) in callbacks.into_iter().enumerate() {
            if let Err(err) = callback().await {
                tracing::error!(position, total, error = %err, "Ready callback failed; skipping the rest");
                return Err(err);
            }
        }
        tracing::debug!(total, "Ready callbacks completed");
        Ok(())
    }
}
