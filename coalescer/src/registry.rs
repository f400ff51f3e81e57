//! Batch executors and the name -> executor lookup table.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CoalesceError;

/// Performs the batched remote work for one operation.
///
/// The aggregate `A` is opaque to the engine; waiters pull their own slice out of it with the
/// extractor they passed to [`crate::engine::Engine::call`].
#[async_trait]
pub trait BatchExecutor<P, A>: Send + Sync {
    async fn execute(&self, params: Vec<P>) -> anyhow::Result<A>;
}

#[async_trait]
impl<P, A, E> BatchExecutor<P, A> for Arc<E>
where
    P: Send + 'static,
    A: Send + 'static,
    E: BatchExecutor<P, A> + ?Sized,
{
    async fn execute(&self, params: Vec<P>) -> anyhow::Result<A> {
        (**self).execute(params).await
    }
}

/// Adapter returned by [`executor_fn`].
pub struct FnExecutor<F>(F);

/// Wrap an async closure `Fn(Vec<P>) -> Future<Output = anyhow::Result<A>>` as an executor.
pub fn executor_fn<F>(f: F) -> FnExecutor<F> {
    FnExecutor(f)
}

#[async_trait]
impl<P, A, F, Fut> BatchExecutor<P, A> for FnExecutor<F>
where
    P: Send + 'static,
    A: Send + 'static,
    F: Fn(Vec<P>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
{
    async fn execute(&self, params: Vec<P>) -> anyhow::Result<A> {
        (self.0)(params).await
    }
}

pub(crate) struct Registry<P, A> {
    executors: DashMap<String, Arc<dyn BatchExecutor<P, A>>>,
}

impl<P, A> Registry<P, A> {
    pub(crate) fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    /// Store `executor` under `name`, replacing any previous registration.
    pub(crate) fn register(&self, name: &str, executor: Arc<dyn BatchExecutor<P, A>>) {
        if self.executors.insert(name.to_string(), executor).is_some() {
            tracing::warn!(operation = %name, "replaced registered executor");
        } else {
            tracing::debug!(operation = %name, "registered executor");
        }
    }

    pub(crate) fn resolve(
        &self,
        name: &str,
    ) -> Result<Arc<dyn BatchExecutor<P, A>>, CoalesceError> {
        self.executors
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoalesceError::UnregisteredOperation(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn len_executor() -> Arc<dyn BatchExecutor<u32, usize>> {
        Arc::new(executor_fn(|params: Vec<u32>| async move {
            Ok::<_, anyhow::Error>(params.len())
        }))
    }

    #[tokio::test]
    async fn resolves_registered_executor() {
        let registry = Registry::new();
        registry.register("BatchCount", len_executor());

        let executor = registry.resolve("BatchCount").unwrap();
        assert_eq!(executor.execute(vec![1, 2, 3]).await.unwrap(), 3);
    }

    #[test]
    fn unknown_name_is_unregistered() {
        let registry = Registry::<u32, usize>::new();
        match registry.resolve("BatchMissing") {
            Err(CoalesceError::UnregisteredOperation(name)) => assert_eq!(name, "BatchMissing"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an unregistered operation"),
        }
    }

    #[tokio::test]
    async fn registering_twice_overwrites() {
        let registry = Registry::new();
        registry.register("BatchCount", len_executor());
        registry.register(
            "BatchCount",
            Arc::new(executor_fn(|_params: Vec<u32>| async move {
                Ok::<_, anyhow::Error>(42usize)
            })),
        );

        let executor = registry.resolve("BatchCount").unwrap();
        assert_eq!(executor.execute(vec![1]).await.unwrap(), 42);
    }
}
