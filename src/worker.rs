use crate::cancel::CancellationToken;
use crate::error::{PipelineError, QueueError, Result};
use crate::metrics::StageMetrics;
use crate::queue::BoundedQueue;
use crate::sequenced::Sequenced;
use crate::transform::Transform;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::debug;

/// Identifier of a worker within its stage
pub type WorkerId = usize;

/// The results of transforming one input item, keyed by that item's seq
pub(crate) type Batch<O> = Sequenced<Vec<O>>;

/// A live worker thread as seen by its stage
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) token: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

/// Closes a queue when dropped, including during unwinding
pub(crate) struct CloseOnDrop<'a, T: Send>(pub(crate) &'a BoundedQueue<T>);

impl<T: Send> Drop for CloseOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// State moved into one worker thread
pub(crate) struct WorkerLoop<I, O> {
    pub(crate) id: WorkerId,
    pub(crate) stage: String,
    pub(crate) input: BoundedQueue<Sequenced<I>>,
    pub(crate) output: BoundedQueue<Batch<O>>,
    pub(crate) transform: Arc<dyn Transform<I, O>>,
    /// Stage-wide signal: aborts the put of a finished item
    pub(crate) stage_token: CancellationToken,
    /// Child of `stage_token`: stops this worker from taking more input
    pub(crate) self_token: CancellationToken,
    pub(crate) finished: Arc<AtomicBool>,
    /// Whether any multiplexer consumes `output`
    pub(crate) forward: bool,
    pub(crate) metrics: StageMetrics,
}

impl<I: Send + 'static, O: Send + 'static> WorkerLoop<I, O> {
    pub(crate) fn run(self) -> Result<()> {
        let _close = CloseOnDrop(&self.output);
        let transform = self.transform.name();
        debug!(stage = %self.stage, worker = self.id, transform, "worker running");

        loop {
            let item = match self.input.take(&self.self_token) {
                Ok(item) => item,
                Err(QueueError::Exhausted) => {
                    self.finished.store(true, Ordering::Release);
                    debug!(stage = %self.stage, worker = self.id, "input exhausted");
                    return Ok(());
                }
                Err(_) => {
                    debug!(stage = %self.stage, worker = self.id, "worker stopped");
                    return Ok(());
                }
            };

            let seq = item.seq();
            let started = Instant::now();
            let outputs = self
                .transform
                .apply(item.into_payload())
                .map_err(|source| PipelineError::Transform {
                    stage: self.stage.clone(),
                    transform: transform.to_string(),
                    seq,
                    source,
                })?;
            self.metrics.record_processed(started.elapsed());

            if !self.forward {
                continue;
            }
            // Only the stage-wide signal may drop a finished item.
            if self
                .output
                .put(Sequenced::new(seq, outputs), &self.stage_token)
                .is_err()
            {
                return Ok(());
            }
        }
    }
}
