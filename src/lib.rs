//! A multi-stage processing pipeline whose stages grow and shrink their
//! worker pools at runtime.
//!
//! Each stage runs a pool of worker threads over a shared bounded input
//! queue. A central scheduler hands out a fixed worker budget according to
//! the backlog of every stage, and a per-stage multiplexer restores the
//! original item order after the parallel, out-of-order processing.
//!
//! # Features
//!
//! - Bounded, closable queues built on crossbeam's ArrayQueue
//! - Order-preserving parallel stages with 0..n outputs per input
//! - Fan-out to several downstream queues
//! - Backlog-driven worker rebalancing under a global budget
//! - First-error-wins failure handling with pipeline-wide cancellation
//! - Per-stage metrics: throughput, latency percentiles, worker churn
//!
//! # Example
//!
//! ```ignore
//! use balanced_pipeline::{MapTransform, Pipeline, PipelineConfig};
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::default())?;
//! let raw = pipeline.queue::<u64>();
//! let squared = pipeline.queue::<u64>();
//!
//! pipeline.source("numbers", &raw, |out| {
//!     for n in 1..=100 {
//!         out.emit(n)?;
//!     }
//!     Ok(())
//! });
//! pipeline.stage("square", &raw, &[&squared], MapTransform::new("square", |n: u64| Ok(n * n)));
//! pipeline.sink("print", &squared, |item| {
//!     println!("{} -> {}", item.seq(), item.payload());
//!     Ok(())
//! });
//!
//! pipeline.run()?;
//! ```

pub mod cancel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod multiplexer;
pub mod pipeline;
pub mod pressure;
pub mod queue;
pub mod scheduler;
pub mod sequenced;
pub mod stage;
mod task;
pub mod transform;
mod worker;

// Re-exports for convenience
pub use cancel::CancellationToken;
pub use config::PipelineConfig;
pub use endpoint::Emitter;
pub use error::{BoxError, FailureLatch, PipelineError, QueueError, ReorderError, Result};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use multiplexer::ReorderBuffer;
pub use pipeline::Pipeline;
pub use queue::{take_from_any, BoundedQueue, TryPutError, TryTake};
pub use sequenced::{Sequenced, Sequencer};
pub use stage::{Rebalance, Stage};
pub use transform::{FilterTransform, FlatMapTransform, MapTransform, PassthroughTransform, Transform};
pub use worker::WorkerId;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
