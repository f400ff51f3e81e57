//! Active-window table, trigger loop, and batch execution.
//!
//! The table holds at most one open window per operation. Appends and detaches both happen under
//! the table's per-key entry lock, so once a window is removed nobody can join it. A window that
//! reaches `window_size` is detached by the append that filled it; everything else is picked up
//! by [`Scheduler::run`], which sleeps until the earliest open deadline or until an append wakes
//! it.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::FutureExt as _;
use tokio::{
    sync::{oneshot, Notify},
    time::{Duration, Instant, MissedTickBehavior},
};

use crate::{
    config::CoalescerConfig,
    error::CoalesceError,
    registry::Registry,
    window::{DetachedBatch, Waiter, Window},
};

pub(crate) struct Scheduler<P, A> {
    registry: Arc<Registry<P, A>>,
    windows: DashMap<String, Arc<Window<P, A>>>,
    wake: Notify,
    closed: AtomicBool,
    window_size: usize,
    window_timeout: Duration,
    heartbeat_interval: Duration,
}

impl<P, A> Scheduler<P, A>
where
    P: Send + 'static,
    A: Send + Sync + 'static,
{
    pub(crate) fn new(registry: Arc<Registry<P, A>>, cfg: &CoalescerConfig) -> Self {
        Self {
            registry,
            windows: DashMap::new(),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            window_size: cfg.window_size,
            window_timeout: cfg.window_timeout(),
            heartbeat_interval: cfg.heartbeat_interval(),
        }
    }

    /// Append `param` to the open window for `operation`, opening one if none exists.
    ///
    /// Must be called from within a Tokio runtime: a window filled by this append is dispatched
    /// for execution immediately.
    pub(crate) fn enqueue(&self, operation: &str, param: P) -> Result<Waiter<A>, CoalesceError> {
        let entry = self.windows.entry(operation.to_string());
        // Checked while holding the entry so shutdown cannot miss a window opened concurrently.
        if self.is_closed() {
            return Err(CoalesceError::EngineShutdown);
        }

        let now = Instant::now();
        let mut expired = None;
        let (waiter, filled) = match entry {
            // The loop has not detached this window yet, but its deadline has passed.
            Entry::Occupied(mut open) if open.get().is_ready(now) => {
                let window = self.open_window(operation);
                let waiter = self.append_to(operation, &window, param)?;
                if window.is_ready(now) {
                    let (_, stale) = open.remove_entry();
                    expired = Some(stale);
                    (waiter, Some(window))
                } else {
                    expired = Some(open.insert(window));
                    (waiter, None)
                }
            }
            Entry::Occupied(open) => {
                let waiter = self.append_to(operation, open.get(), param)?;
                if open.get().is_ready(now) {
                    let (_, window) = open.remove_entry();
                    (waiter, Some(window))
                } else {
                    (waiter, None)
                }
            }
            Entry::Vacant(slot) => {
                let window = self.open_window(operation);
                let waiter = self.append_to(operation, &window, param)?;
                if window.is_ready(now) {
                    (waiter, Some(window))
                } else {
                    slot.insert(window);
                    (waiter, None)
                }
            }
        };

        if let Some(window) = expired {
            self.dispatch(&window);
        }
        match filled {
            Some(window) => self.dispatch(&window),
            None => self.wake.notify_one(),
        }
        Ok(waiter)
    }

    fn open_window(&self, operation: &str) -> Arc<Window<P, A>> {
        let window = Arc::new(Window::open(
            operation,
            self.window_size,
            self.window_timeout,
        ));
        tracing::debug!(
            event = "window_opened",
            operation = %operation,
            window_id = %window.id(),
            "opened window"
        );
        window
    }

    fn append_to(
        &self,
        operation: &str,
        window: &Window<P, A>,
        param: P,
    ) -> Result<Waiter<A>, CoalesceError> {
        let waiter = window.append(param)?;
        tracing::debug!(
            event = "param_enqueued",
            operation = %operation,
            window_id = %window.id(),
            "enqueued param"
        );
        Ok(waiter)
    }

    /// Remove every ready window from the table.
    fn detach_ready(&self, now: Instant) -> Vec<Arc<Window<P, A>>> {
        let ready: Vec<String> = self
            .windows
            .iter()
            .filter(|entry| entry.value().is_ready(now))
            .map(|entry| entry.key().clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|operation| {
                self.windows
                    .remove_if(&operation, |_, window| window.is_ready(now))
            })
            .map(|(_, window)| window)
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.windows
            .iter()
            .map(|entry| entry.value().deadline())
            .min()
    }

    /// Detach a window that has already left the table and hand it to its own execution task.
    fn dispatch(&self, window: &Window<P, A>) {
        match window.detach_snapshot() {
            Ok(batch) => {
                tracing::debug!(
                    event = "batch_dispatched",
                    operation = %batch.operation,
                    window_id = %batch.window_id,
                    batch_size = batch.waiters,
                    "dispatching"
                );
                tokio::spawn(execute_batch(Arc::clone(&self.registry), batch));
            }
            Err(err) => {
                tracing::error!(error = %err, "window detached twice");
            }
        }
    }

    /// Trigger loop. Runs until `stop` fires or its sender is dropped.
    pub(crate) async fn run(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        tracing::info!(
            event = "scheduler_started",
            window_size = self.window_size,
            window_timeout_ms = millis(self.window_timeout),
            "scheduler started"
        );

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for window in self.detach_ready(Instant::now()) {
                self.dispatch(&window);
            }

            let next_deadline = self.next_deadline();
            let until_deadline = async move {
                match next_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut stop => break,
                _ = self.wake.notified() => {}
                _ = until_deadline => {}
                _ = heartbeat.tick() => {
                    tracing::debug!(
                        event = "scheduler_alive",
                        open_windows = self.windows.len(),
                        "scheduler alive"
                    );
                }
            }
        }

        tracing::info!(
            event = "scheduler_stopped",
            open_windows = self.windows.len(),
            "scheduler stopped"
        );
    }

    /// Reject all further enqueues. Returns `false` if the scheduler was already closed.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Detach every open window and release its waiters with `EngineShutdown`.
    ///
    /// Returns the number of waiters released.
    pub(crate) fn fail_open_windows(&self) -> usize {
        let open: Vec<String> = self
            .windows
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = 0;
        for operation in open {
            let Some((_, window)) = self.windows.remove(&operation) else {
                continue;
            };
            match window.detach_snapshot() {
                Ok(batch) => {
                    released += batch.waiters;
                    batch.complete_and_release(Err(CoalesceError::EngineShutdown));
                }
                Err(err) => tracing::error!(error = %err, "window detached twice"),
            }
        }
        released
    }

    pub(crate) fn open_windows(&self) -> usize {
        self.windows.len()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn execute_batch<P, A>(registry: Arc<Registry<P, A>>, mut batch: DetachedBatch<P, A>)
where
    P: Send + 'static,
    A: Send + Sync + 'static,
{
    let executor = match registry.resolve(&batch.operation) {
        Ok(executor) => executor,
        Err(err) => {
            tracing::error!(
                event = "unregistered_operation",
                operation = %batch.operation,
                window_id = %batch.window_id,
                waiters = batch.waiters,
                "no executor registered"
            );
            batch.complete_and_release(Err(err));
            return;
        }
    };

    let params = std::mem::take(&mut batch.params);
    let started = Instant::now();
    tracing::info!(
        event = "batch_execute",
        operation = %batch.operation,
        window_id = %batch.window_id,
        batch_size = params.len(),
        waited_ms = millis(started.duration_since(batch.opened_at)),
        "invoking"
    );

    let result = AssertUnwindSafe(executor.execute(params))
        .catch_unwind()
        .await;
    let elapsed_ms = millis(started.elapsed());

    let outcome = match result {
        Ok(Ok(aggregate)) => {
            tracing::debug!(
                event = "batch_complete",
                operation = %batch.operation,
                window_id = %batch.window_id,
                elapsed_ms,
                "executor finished"
            );
            Ok(Arc::new(aggregate))
        }
        Ok(Err(err)) => {
            tracing::warn!(
                event = "batch_failed",
                operation = %batch.operation,
                window_id = %batch.window_id,
                elapsed_ms,
                error = %err,
                "executor failed"
            );
            Err(CoalesceError::executor_failure(&batch.operation, err))
        }
        Err(_panic) => {
            tracing::error!(
                event = "batch_panicked",
                operation = %batch.operation,
                window_id = %batch.window_id,
                elapsed_ms,
                "executor panicked"
            );
            Err(CoalesceError::executor_failure(
                &batch.operation,
                anyhow::anyhow!("executor panicked"),
            ))
        }
    };

    batch.complete_and_release(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::executor_fn;

    fn scheduler(window_size: usize, timeout_ms: u64) -> Arc<Scheduler<u32, Vec<u32>>> {
        let registry = Arc::new(Registry::<u32, Vec<u32>>::new());
        registry.register(
            "BatchEcho",
            Arc::new(executor_fn(|params: Vec<u32>| async move {
                Ok::<_, anyhow::Error>(params)
            })),
        );
        Arc::new(Scheduler::new(
            registry,
            &CoalescerConfig::new(window_size, Duration::from_millis(timeout_ms)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn one_open_window_per_operation() {
        let sched = scheduler(10, 50);
        let _a = sched.enqueue("BatchEcho", 1).unwrap();
        let _b = sched.enqueue("BatchEcho", 2).unwrap();
        assert_eq!(sched.open_windows(), 1);

        let _c = sched.enqueue("BatchOther", 3).unwrap();
        assert_eq!(sched.open_windows(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn filling_a_window_detaches_it_immediately() {
        let sched = scheduler(2, 10_000);
        let a = sched.enqueue("BatchEcho", 1).unwrap();
        let b = sched.enqueue("BatchEcho", 2).unwrap();
        assert_eq!(sched.open_windows(), 0);

        // Executes without a running trigger loop.
        assert_eq!(*a.wait().await.unwrap(), vec![1, 2]);
        assert_eq!(*b.wait().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_ready_only_takes_expired_windows() {
        let sched = scheduler(10, 50);
        let _a = sched.enqueue("BatchEcho", 1).unwrap();
        tokio::time::advance(Duration::from_millis(30)).await;
        let _b = sched.enqueue("BatchOther", 2).unwrap();

        let now = Instant::now();
        assert!(sched.detach_ready(now).is_empty());
        assert_eq!(
            sched.next_deadline(),
            Some(now + Duration::from_millis(20))
        );

        let ready = sched.detach_ready(now + Duration::from_millis(20));
        assert_eq!(ready.len(), 1);
        assert_eq!(sched.open_windows(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_window_is_replaced_instead_of_joined() {
        let sched = scheduler(10, 50);
        let first = sched.enqueue("BatchEcho", 1).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;

        // No trigger loop: the late enqueue dispatches the expired window itself.
        let second = sched.enqueue("BatchEcho", 2).unwrap();
        assert_eq!(sched.open_windows(), 1);
        assert_eq!(*first.wait().await.unwrap(), vec![1]);

        let ready = sched.detach_ready(Instant::now() + Duration::from_millis(50));
        assert_eq!(ready.len(), 1);
        sched.dispatch(&ready[0]);
        assert_eq!(*second.wait().await.unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_scheduler_rejects_enqueue() {
        let sched = scheduler(10, 50);
        assert!(sched.close());
        assert!(!sched.close());
        assert!(matches!(
            sched.enqueue("BatchEcho", 1),
            Err(CoalesceError::EngineShutdown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_open_windows_releases_waiters_with_shutdown() {
        let sched = scheduler(10, 50);
        let a = sched.enqueue("BatchEcho", 1).unwrap();
        let b = sched.enqueue("BatchOther", 2).unwrap();

        sched.close();
        assert_eq!(sched.fail_open_windows(), 2);
        assert_eq!(sched.open_windows(), 0);
        assert!(matches!(a.wait().await, Err(CoalesceError::EngineShutdown)));
        assert!(matches!(b.wait().await, Err(CoalesceError::EngineShutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_fires_window_at_its_deadline() {
        let sched = scheduler(10, 50);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(&sched).run(stop_rx));

        let start = Instant::now();
        let waiter = sched.enqueue("BatchEcho", 7).unwrap();
        assert_eq!(*waiter.wait().await.unwrap(), vec![7]);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(60));

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_executor_fails_the_batch() {
        let registry = Arc::new(Registry::<u32, Vec<u32>>::new());
        registry.register(
            "BatchBoom",
            Arc::new(executor_fn(|_params: Vec<u32>| async move {
                if true {
                    panic!("boom");
                }
                Ok::<_, anyhow::Error>(Vec::new())
            })),
        );
        let sched = Scheduler::new(
            registry,
            &CoalescerConfig::new(1, Duration::from_millis(50)),
        );

        let waiter = sched.enqueue("BatchBoom", 1).unwrap();
        match waiter.wait().await {
            Err(CoalesceError::ExecutorFailure { operation, error }) => {
                assert_eq!(operation, "BatchBoom");
                assert_eq!(error.to_string(), "executor panicked");
            }
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
    }
}
