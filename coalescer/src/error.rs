//! Failures surfaced by the coalescing engine.

use std::sync::Arc;

use uuid::Uuid;

/// Error returned to callers of [`crate::engine::Engine`].
///
/// The type is `Clone` because a single batch outcome is handed to every waiter of a window.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoalesceError {
    /// No executor is registered under the resolved batch operation name.
    #[error("operation '{0}' has no registered executor")]
    UnregisteredOperation(String),

    /// The executor reported failure; every waiter of the window receives the same value.
    #[error("executor for '{operation}' failed: {error:#}")]
    ExecutorFailure {
        operation: String,
        error: Arc<anyhow::Error>,
    },

    /// Rejected at configuration time, before the engine starts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The engine was shut down before the call could complete.
    #[error("engine is shut down")]
    EngineShutdown,

    /// A parameter was appended to a window after it had been detached for execution.
    #[error("window {window_id} for '{operation}' is already detached")]
    WindowAlreadyDetached { operation: String, window_id: Uuid },
}

impl CoalesceError {
    pub(crate) fn executor_failure(operation: &str, error: anyhow::Error) -> Self {
        Self::ExecutorFailure {
            operation: operation.to_string(),
            error: Arc::new(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_failure_renders_error_chain() {
        let err = anyhow::anyhow!("connection reset").context("fetch members");
        let failure = CoalesceError::executor_failure("BatchGetMember", err);
        assert_eq!(
            failure.to_string(),
            "executor for 'BatchGetMember' failed: fetch members: connection reset"
        );
    }

    #[test]
    fn clones_share_the_executor_error() {
        let failure = CoalesceError::executor_failure("BatchGetMember", anyhow::anyhow!("boom"));
        let cloned = failure.clone();
        match (failure, cloned) {
            (
                CoalesceError::ExecutorFailure { error: a, .. },
                CoalesceError::ExecutorFailure { error: b, .. },
            ) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("unexpected variants: {other:?}"),
        }
    }
}
