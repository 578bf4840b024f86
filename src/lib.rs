//! weft: a structured-concurrency runtime
//!
//! Tasks are reference-counted heap objects wrapping a body future. Each task
//! carries a lock-free status word and a chain of status records describing
//! the structured work in flight below it: child tasks, task groups,
//! cancellation and escalation handlers, executor preferences. Cancellation
//! and priority escalation flow down that tree.
//!
//! # Example
//!
//! ```
//! use weft::runtime::{with_task_group, GroupMode, Runtime, TaskOptions};
//! use weft::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str("executor = \"cooperative\"").unwrap();
//! let runtime = Runtime::from_config(config).unwrap();
//!
//! let total = runtime
//!     .block_on(|current| async move {
//!         with_task_group(&current, GroupMode::Accumulating, |group| async move {
//!             for n in 1..=4u64 {
//!                 group.spawn(TaskOptions::new(), move |_| async move { Ok(n * n) });
//!             }
//!             let mut total = 0;
//!             while let Some(square) = group.next().await {
//!                 total += square?;
//!             }
//!             Ok(total)
//!         })
//!         .await
//!     })
//!     .unwrap();
//! assert_eq!(total, 30);
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::{Runtime, TaskError, TaskResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
