//! Public entry point: executor registration, the coalescing call path, and lifecycle.
//!
//! An [`Engine`] owns its own registry and window table, so independent engines can coexist in
//! one process. Handles are cheap to clone and share the same state.

use std::{borrow::Cow, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    config::CoalescerConfig,
    error::CoalesceError,
    registry::{BatchExecutor, Registry},
    scheduler::Scheduler,
};

/// Prefix that turns a single-item operation name into its batch counterpart.
pub const BATCH_PREFIX: &str = "Batch";

/// `GetMember` -> `BatchGetMember`; names that already carry the prefix are returned unchanged.
pub fn batch_operation_name(operation: &str) -> Cow<'_, str> {
    if operation.starts_with(BATCH_PREFIX) {
        Cow::Borrowed(operation)
    } else {
        Cow::Owned(format!("{BATCH_PREFIX}{operation}"))
    }
}

/// Coalesces concurrent single-item calls into batched executor invocations.
///
/// `P` is the per-call parameter and `A` the aggregate an executor returns for a whole batch.
pub struct Engine<P, A> {
    inner: Arc<EngineInner<P, A>>,
}

impl<P, A> Clone for Engine<P, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<P, A> {
    registry: Arc<Registry<P, A>>,
    scheduler: Arc<Scheduler<P, A>>,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl<P, A> Engine<P, A>
where
    P: Clone + Send + 'static,
    A: Send + Sync + 'static,
{
    /// Validate `cfg` and build an engine. The trigger loop does not run until [`Engine::start`].
    pub fn configure(cfg: CoalescerConfig) -> Result<Self, CoalesceError> {
        cfg.validate()?;
        let registry = Arc::new(Registry::new());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&registry), &cfg));
        Ok(Self {
            inner: Arc::new(EngineInner {
                registry,
                scheduler,
                running: Mutex::new(None),
            }),
        })
    }

    /// Register the executor for a batch operation (e.g. `BatchGetMember`).
    pub fn register<E>(&self, operation: &str, executor: E)
    where
        E: BatchExecutor<P, A> + 'static,
    {
        self.inner.registry.register(operation, Arc::new(executor));
    }

    /// Spawn the trigger loop on the current Tokio runtime.
    ///
    /// Starting a running engine is a no-op; starting after [`Engine::shutdown`] fails.
    pub fn start(&self) -> Result<(), CoalesceError> {
        if self.inner.scheduler.is_closed() {
            return Err(CoalesceError::EngineShutdown);
        }

        let mut running = self.inner.running.lock();
        if running.is_some() {
            tracing::warn!("coalescing engine already started");
            return Ok(());
        }

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(&self.inner.scheduler).run(stop_rx));
        *running = Some(RunningLoop { stop, task });
        Ok(())
    }

    /// Submit `param` to the current window of `operation` and wait for the batch to complete.
    ///
    /// `operation` is mapped through [`batch_operation_name`]. On success the caller receives
    /// `extract(aggregate, &param)`; on failure every caller in the window receives the same error.
    ///
    /// Dropping the returned future does not withdraw `param` from its batch.
    pub async fn call<V, F>(
        &self,
        operation: &str,
        param: P,
        extract: F,
    ) -> Result<V, CoalesceError>
    where
        F: FnOnce(&A, &P) -> V,
    {
        let operation = batch_operation_name(operation);
        let waiter = self.inner.scheduler.enqueue(&operation, param.clone())?;
        let aggregate = waiter.wait().await?;
        Ok(extract(&aggregate, &param))
    }

    /// Stop the trigger loop and fail every window that is still accumulating.
    ///
    /// New calls fail with [`CoalesceError::EngineShutdown`]. Batches already executing run to
    /// completion and deliver their real outcome.
    pub async fn shutdown(&self) {
        if !self.inner.scheduler.close() {
            return;
        }

        let running = self.inner.running.lock().take();
        if let Some(RunningLoop { stop, task }) = running {
            let _ = stop.send(());
            if let Err(err) = task.await {
                tracing::error!(error = %err, "scheduler task failed");
            }
        }

        let released = self.inner.scheduler.fail_open_windows();
        tracing::info!(
            event = "engine_shutdown",
            released_waiters = released,
            "coalescing engine shut down"
        );
    }

    /// Number of windows currently accepting parameters.
    pub fn open_windows(&self) -> usize {
        self.inner.scheduler.open_windows()
    }
}
