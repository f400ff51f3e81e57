//! A pending batch for one operation.
//!
//! A [`Window`] accumulates parameters while it is reachable from the scheduler's table. Detaching
//! it yields a [`DetachedBatch`] that takes ownership of the window's completion sender, so the
//! outcome is published at most once and only by whoever executes the batch. Every [`Waiter`]
//! holds a receiver subscribed at append time.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    sync::watch,
    time::{Duration, Instant},
};
use uuid::Uuid;

use crate::error::CoalesceError;

/// Shared result of one batch: the executor's aggregate, or the failure every waiter receives.
pub(crate) type Outcome<A> = Result<Arc<A>, CoalesceError>;

type Completion<A> = watch::Sender<Option<Outcome<A>>>;

pub(crate) struct Window<P, A> {
    id: Uuid,
    operation: String,
    opened_at: Instant,
    deadline: Instant,
    size: usize,
    state: Mutex<WindowState<P, A>>,
}

struct WindowState<P, A> {
    params: Vec<P>,
    // Taken on detach.
    completion: Option<Completion<A>>,
}

impl<P, A> Window<P, A> {
    pub(crate) fn open(operation: &str, size: usize, timeout: Duration) -> Self {
        let (completion, _) = watch::channel(None);
        let opened_at = Instant::now();
        Self {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            opened_at,
            deadline: opened_at + timeout,
            size,
            state: Mutex::new(WindowState {
                params: Vec::new(),
                completion: Some(completion),
            }),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Add `param` to the batch and return the handle its caller waits on.
    pub(crate) fn append(&self, param: P) -> Result<Waiter<A>, CoalesceError> {
        let mut state = self.state.lock();
        let Some(completion) = state.completion.as_ref() else {
            return Err(self.already_detached());
        };
        let waiter = Waiter {
            rx: completion.subscribe(),
        };
        state.params.push(param);
        Ok(waiter)
    }

    /// True once the window is full or its deadline has passed. Detached windows are never ready.
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        let state = self.state.lock();
        state.completion.is_some() && (state.params.len() >= self.size || now >= self.deadline)
    }

    /// Freeze the parameter list and take the completion sender.
    ///
    /// Callers must already have removed the window from the scheduler's table.
    pub(crate) fn detach_snapshot(&self) -> Result<DetachedBatch<P, A>, CoalesceError> {
        let mut state = self.state.lock();
        let completion = state
            .completion
            .take()
            .ok_or_else(|| self.already_detached())?;
        let params = std::mem::take(&mut state.params);
        Ok(DetachedBatch {
            window_id: self.id,
            operation: self.operation.clone(),
            waiters: params.len(),
            params,
            opened_at: self.opened_at,
            completion,
        })
    }

    fn already_detached(&self) -> CoalesceError {
        CoalesceError::WindowAlreadyDetached {
            operation: self.operation.clone(),
            window_id: self.id,
        }
    }
}

/// A window that left the table and is on its way to the executor.
pub(crate) struct DetachedBatch<P, A> {
    pub(crate) window_id: Uuid,
    pub(crate) operation: String,
    pub(crate) params: Vec<P>,
    pub(crate) waiters: usize,
    pub(crate) opened_at: Instant,
    completion: Completion<A>,
}

impl<P, A> DetachedBatch<P, A> {
    /// Publish `outcome` to every waiter that joined the window.
    ///
    /// Consumes the batch, so a window completes exactly once. Dropping a batch without completing
    /// it releases its waiters with [`CoalesceError::EngineShutdown`].
    pub(crate) fn complete_and_release(self, outcome: Outcome<A>) {
        tracing::debug!(
            event = "window_released",
            window_id = %self.window_id,
            operation = %self.operation,
            waiters = self.waiters,
            listening = self.completion.receiver_count(),
            ok = outcome.is_ok(),
            "releasing waiters"
        );
        self.completion.send_replace(Some(outcome));
    }
}

/// One caller's handle on the outcome of the window it joined.
pub(crate) struct Waiter<A> {
    rx: watch::Receiver<Option<Outcome<A>>>,
}

impl<A> Waiter<A> {
    pub(crate) async fn wait(mut self) -> Outcome<A> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(CoalesceError::EngineShutdown))
    }
}
