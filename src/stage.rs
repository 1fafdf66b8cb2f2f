use crate::cancel::CancellationToken;
use crate::error::{FailureLatch, PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::multiplexer::{Multiplexer, PoolQueues, WorkerQueues};
use crate::queue::{BoundedQueue, Notify};
use crate::sequenced::Sequenced;
use crate::task::{join_task, spawn_task};
use crate::transform::Transform;
use crate::worker::{WorkerHandle, WorkerId, WorkerLoop};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// The interface the scheduler drives stages through.
///
/// Object safe, so stages with different item types can be balanced
/// together. Every method is safe to call while the stage's own threads run.
pub trait Rebalance: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn the first worker and the multiplexer
    fn start(&self) -> Result<()>;

    /// Add one worker. `None` once the stage has finished.
    fn add_worker(&self) -> Option<WorkerId>;

    /// Stop the newest worker and wait for it to exit.
    ///
    /// Refuses (returns false) when that would leave an unfinished stage
    /// without workers.
    fn remove_worker(&self) -> bool;

    fn worker_count(&self) -> usize;

    /// Items waiting in the stage input. Advisory.
    fn queue_depth(&self) -> usize;

    /// Terminal: input exhausted or stage cancelled. Never reverts.
    fn is_finished(&self) -> bool;

    /// Every thread of the stage has exited
    fn is_terminated(&self) -> bool;

    /// Join all remaining threads
    fn join(&self);

    fn metrics(&self) -> &StageMetrics;
}

/// A pipeline phase: a pool of workers applying one transform to a shared
/// input queue, merged back into order by a multiplexer.
pub struct Stage<I, O> {
    name: String,
    input: BoundedQueue<Sequenced<I>>,
    outputs: Vec<BoundedQueue<Sequenced<O>>>,
    transform: Arc<dyn Transform<I, O>>,
    workers: Mutex<WorkerPool>,
    queues: Arc<Mutex<WorkerQueues<O>>>,
    multiplexer: Mutex<Option<JoinHandle<()>>>,
    finished: Arc<AtomicBool>,
    started: AtomicBool,
    notify: Arc<Notify>,
    token: CancellationToken,
    latch: FailureLatch,
    capacity: usize,
    metrics: StageMetrics,
}

#[derive(Debug, Default)]
struct WorkerPool {
    live: Vec<WorkerHandle>,
    next_id: WorkerId,
}

impl<I, O> Stage<I, O>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    /// Create a stage reading `input` and writing to every queue in `outputs`.
    ///
    /// `capacity` sizes the private per-worker queues. The stage's token is a
    /// child of the latch's, and any failure inside the stage trips the latch.
    pub fn new(
        name: impl Into<String>,
        input: BoundedQueue<Sequenced<I>>,
        outputs: Vec<BoundedQueue<Sequenced<O>>>,
        transform: impl Transform<I, O>,
        latch: FailureLatch,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            outputs,
            transform: Arc::new(transform),
            workers: Mutex::new(WorkerPool::default()),
            queues: Arc::new(Mutex::new(WorkerQueues::new())),
            multiplexer: Mutex::new(None),
            finished: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
            token: latch.token().child(),
            latch,
            capacity,
            metrics: StageMetrics::new(),
        }
    }

    /// Stage-wide cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn spawn_multiplexer(&self) -> Result<()> {
        let multiplexer = Multiplexer {
            stage: self.name.clone(),
            source: Arc::new(PoolQueues {
                queues: Arc::clone(&self.queues),
                finished: Arc::clone(&self.finished),
            }),
            notify: Arc::clone(&self.notify),
            outputs: self.outputs.clone(),
            token: self.token.clone(),
            metrics: self.metrics.clone(),
        };
        let handle = spawn_task(
            format!("{}-mux", self.name),
            self.latch.clone(),
            move || multiplexer.run(),
        )?;
        *self.multiplexer.lock() = Some(handle);
        Ok(())
    }

    fn check_finished(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return true;
        }
        if self.input.is_exhausted() || self.token.is_cancelled() {
            self.finished.store(true, Ordering::Release);
            return true;
        }
        false
    }
}

impl<I, O> Rebalance for Stage<I, O>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyStarted);
        }
        if self.add_worker().is_none() && !self.check_finished() {
            return Err(PipelineError::ThreadError(format!(
                "could not start first worker of stage {}",
                self.name
            )));
        }
        if !self.outputs.is_empty() {
            self.spawn_multiplexer()?;
        }
        debug!(stage = %self.name, outputs = self.outputs.len(), "stage started");
        Ok(())
    }

    fn add_worker(&self) -> Option<WorkerId> {
        let mut pool = self.workers.lock();
        let mut queues = self.queues.lock();
        if self.check_finished() {
            return None;
        }

        let id = pool.next_id;
        let output = BoundedQueue::with_notify(self.capacity, Arc::clone(&self.notify));
        let token = self.token.child();
        let worker = WorkerLoop {
            id,
            stage: self.name.clone(),
            input: self.input.clone(),
            output: output.clone(),
            transform: Arc::clone(&self.transform),
            stage_token: self.token.clone(),
            self_token: token.clone(),
            finished: Arc::clone(&self.finished),
            forward: !self.outputs.is_empty(),
            metrics: self.metrics.clone(),
        };

        let handle = match spawn_task(
            format!("{}-worker-{}", self.name, id),
            self.latch.clone(),
            move || worker.run(),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(stage = %self.name, error = %err, "failed to spawn worker");
                return None;
            }
        };

        pool.next_id += 1;
        pool.live.push(WorkerHandle { id, token, handle });
        queues.live.push(output);
        drop(queues);
        self.notify.ring();
        self.metrics.record_worker_added();
        debug!(stage = %self.name, worker = id, count = pool.live.len(), "worker added");
        Some(id)
    }

    fn remove_worker(&self) -> bool {
        let worker = {
            let mut pool = self.workers.lock();
            let count = pool.live.len();
            if count == 0 || (count == 1 && !self.check_finished()) {
                return false;
            }
            let Some(worker) = pool.live.pop() else {
                return false;
            };
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.live.pop() {
                if !self.outputs.is_empty() {
                    queues.retired.push(queue);
                }
            }
            worker
        };

        // Outside the lock: the worker may still be finishing an item and
        // the multiplexer must be free to drain it.
        worker.token.cancel();
        join_task(&format!("{}-worker-{}", self.name, worker.id), worker.handle, &self.latch);
        self.notify.ring();
        self.metrics.record_worker_removed();
        debug!(stage = %self.name, worker = worker.id, "worker removed");
        true
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().live.len()
    }

    fn queue_depth(&self) -> usize {
        self.input.len()
    }

    fn is_finished(&self) -> bool {
        self.check_finished()
    }

    fn is_terminated(&self) -> bool {
        let workers_done = self
            .workers
            .lock()
            .live
            .iter()
            .all(|worker| worker.handle.is_finished());
        let multiplexer_done = self
            .multiplexer
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished());
        workers_done && multiplexer_done
    }

    fn join(&self) {
        let workers: Vec<WorkerHandle> = self.workers.lock().live.drain(..).collect();
        for worker in workers {
            join_task(&format!("{}-worker-{}", self.name, worker.id), worker.handle, &self.latch);
        }
        if let Some(handle) = self.multiplexer.lock().take() {
            join_task(&format!("{}-mux", self.name), handle, &self.latch);
        }
    }

    fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }
}
