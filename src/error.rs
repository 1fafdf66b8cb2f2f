use crate::cancel::CancellationToken;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type returned by user-supplied transforms, sources and sinks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pipeline execution
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pipeline or stage has already been started
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// Nothing registered to run
    #[error("Cannot run pipeline with no stages")]
    NoStages,

    /// A stage transform returned an error
    #[error("Stage {stage} ({transform}) failed on item {seq}: {source}")]
    Transform {
        stage: String,
        transform: String,
        seq: u64,
        #[source]
        source: BoxError,
    },

    /// A source task returned an error
    #[error("Source {task} failed: {source}")]
    Source {
        task: String,
        #[source]
        source: BoxError,
    },

    /// A sink task returned an error
    #[error("Sink {task} failed on item {seq}: {source}")]
    Sink {
        task: String,
        seq: u64,
        #[source]
        source: BoxError,
    },

    /// Sequence ordering was violated inside a multiplexer
    #[error("Protocol violation in stage {stage}: {source}")]
    Protocol {
        stage: String,
        #[source]
        source: ReorderError,
    },

    /// A pipeline thread panicked
    #[error("Task {task} panicked: {message}")]
    Panicked { task: String, message: String },

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Outcome of a queue operation that did not transfer an item
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The caller's cancellation signal fired while waiting
    #[error("queue operation cancelled")]
    Cancelled,

    /// The queue was closed for further puts
    #[error("queue is closed")]
    Closed,

    /// The queue is closed and fully drained
    #[error("queue is exhausted")]
    Exhausted,
}

/// Sequence violations detected while restoring item order
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReorderError {
    #[error("received seq {seq} after it was already released (next expected {expected})")]
    Stale { seq: u64, expected: u64 },

    #[error("received seq {seq} twice")]
    Duplicate { seq: u64 },

    #[error("input ended while waiting for seq {expected} ({pending} later items buffered)")]
    Gap { expected: u64, pending: usize },
}

/// Records the first failure of a pipeline and cancels everything on any failure
#[derive(Debug, Clone)]
pub struct FailureLatch {
    first: Arc<Mutex<Option<PipelineError>>>,
    token: CancellationToken,
}

impl FailureLatch {
    /// Create a latch that cancels `token` when tripped
    pub fn new(token: CancellationToken) -> Self {
        Self {
            first: Arc::new(Mutex::new(None)),
            token,
        }
    }

    /// The pipeline-wide token this latch cancels
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Record a failure. Only the first one is kept.
    pub fn trip(&self, err: PipelineError) {
        {
            let mut first = self.first.lock();
            if first.is_none() {
                error!(error = %err, "pipeline failed, cancelling");
                *first = Some(err);
            }
        }
        self.token.cancel();
    }

    /// Whether a failure has been recorded
    pub fn is_tripped(&self) -> bool {
        self.first.lock().is_some()
    }

    /// Take the recorded failure, leaving the latch empty
    pub fn take(&self) -> Option<PipelineError> {
        self.first.lock().take()
    }
}
