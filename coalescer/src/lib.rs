//! `coalescer` turns many concurrent single-item calls into fewer batched calls.
//!
//! Callers ask for one item at a time through [`Engine::call`]. Calls for the same operation that
//! arrive within a short window are collected and handed to the operation's registered
//! [`BatchExecutor`] as one list. Each caller then extracts its own slice of the shared aggregate.
//! A window fires when it holds `window_size` parameters or when `window_timeout` has elapsed since
//! it opened, whichever happens first.
//!
//! Core modules:
//! - [`config`]: trigger policy and defaults (YAML)
//! - [`registry`]: batch executors and the operation lookup table
//! - [`engine`]: the call path and engine lifecycle
//! - `window` / `scheduler`: per-operation accumulation, trigger loop, result fan-out

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
mod scheduler;
mod window;

pub use config::{CoalescerConfig, MIN_WINDOW_TIMEOUT};
pub use engine::{batch_operation_name, Engine, BATCH_PREFIX};
pub use error::CoalesceError;
pub use registry::{executor_fn, BatchExecutor, FnExecutor};
