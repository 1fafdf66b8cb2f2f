use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::endpoint::{run_sink, run_source, Emitter};
use crate::error::{BoxError, FailureLatch, PipelineError, Result};
use crate::queue::BoundedQueue;
use crate::scheduler::{FixedTask, Scheduler};
use crate::sequenced::Sequenced;
use crate::stage::{Rebalance, Stage};
use crate::task::spawn_task;
use crate::transform::Transform;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::info;

type Launch = Box<dyn FnOnce() -> Result<JoinHandle<()>> + Send>;

/// A source or sink registered but not yet spawned
struct PendingTask {
    name: String,
    launch: Launch,
}

/// A directed graph of sources, stages and sinks connected by queues.
///
/// Queues are created with [`Pipeline::queue`] and passed to the pieces that
/// read or write them, so chains and fan-out (one stage writing several
/// queues) are expressed the same way. Every queue needs exactly one writer:
/// sequence ids are assigned per writer, and two writers would collide.
/// Nothing runs until [`Pipeline::run`].
pub struct Pipeline {
    config: PipelineConfig,
    latch: FailureLatch,
    stages: Vec<Arc<dyn Rebalance>>,
    tasks: Vec<PendingTask>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_cancellation(config, &CancellationToken::new())
    }

    /// Create an empty pipeline that also stops when `token` is cancelled
    pub fn with_cancellation(config: PipelineConfig, token: &CancellationToken) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            latch: FailureLatch::new(token.child()),
            stages: Vec::new(),
            tasks: Vec::new(),
        })
    }

    /// Pipeline-wide token. Cancelling it stops the run without an error.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.latch.token().clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A new queue sized by the configured capacity
    pub fn queue<T: Send>(&self) -> BoundedQueue<Sequenced<T>> {
        BoundedQueue::new(self.config.queue_capacity)
    }

    /// Register a source feeding `output`.
    ///
    /// The closure emits items through the [`Emitter`], which assigns their
    /// sequence ids. `output` is closed when the closure returns.
    pub fn source<T, F>(&mut self, name: impl Into<String>, output: &BoundedQueue<Sequenced<T>>, source: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut Emitter<T>) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let name = name.into();
        let output = output.clone();
        let latch = self.latch.clone();
        let task = name.clone();
        self.tasks.push(PendingTask {
            name,
            launch: Box::new(move || {
                let token = latch.token().clone();
                spawn_task(task.clone(), latch, move || {
                    run_source(&task, output, token, source)
                })
            }),
        });
    }

    /// Register a stage applying `transform` to `input` and writing every
    /// result, in input order, to each queue in `outputs`.
    ///
    /// With no outputs the stage runs the transform only for its side effects.
    pub fn stage<I, O, T>(
        &mut self,
        name: impl Into<String>,
        input: &BoundedQueue<Sequenced<I>>,
        outputs: &[&BoundedQueue<Sequenced<O>>],
        transform: T,
    ) -> Arc<Stage<I, O>>
    where
        I: Send + 'static,
        O: Clone + Send + 'static,
        T: Transform<I, O>,
    {
        let stage = Arc::new(Stage::new(
            name,
            input.clone(),
            outputs.iter().map(|queue| (*queue).clone()).collect(),
            transform,
            self.latch.clone(),
            self.config.queue_capacity,
        ));
        self.stages.push(stage.clone());
        stage
    }

    /// Register a sink draining `input`
    pub fn sink<T, F>(&mut self, name: impl Into<String>, input: &BoundedQueue<Sequenced<T>>, sink: F)
    where
        T: Send + 'static,
        F: FnMut(Sequenced<T>) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let name = name.into();
        let input = input.clone();
        let latch = self.latch.clone();
        let task = name.clone();
        self.tasks.push(PendingTask {
            name,
            launch: Box::new(move || {
                let token = latch.token().clone();
                spawn_task(task.clone(), latch, move || run_sink(&task, input, token, sink))
            }),
        });
    }

    pub fn stages(&self) -> &[Arc<dyn Rebalance>] {
        &self.stages
    }

    /// Total workers the scheduler may keep alive
    pub fn worker_budget(&self) -> usize {
        self.config.worker_budget_for(self.stages.len())
    }

    /// One line per stage
    pub fn metrics_summary(&self) -> String {
        summarize(&self.stages)
    }

    /// Run until every source, stage and sink has finished.
    ///
    /// Returns the first failure, if any. External cancellation is not a
    /// failure.
    pub fn run(self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        let budget = self.worker_budget();
        info!(
            stages = self.stages.len(),
            tasks = self.tasks.len(),
            budget,
            "pipeline starting"
        );
        let started = Instant::now();

        for stage in &self.stages {
            if let Err(err) = stage.start() {
                self.latch.trip(err);
                break;
            }
        }

        let mut fixed = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            match (task.launch)() {
                Ok(handle) => fixed.push(FixedTask {
                    name: task.name,
                    handle,
                }),
                Err(err) => self.latch.trip(err),
            }
        }

        let stages = self.stages.clone();
        Scheduler::new(
            self.stages,
            fixed,
            budget,
            self.config.tick_interval(),
            self.latch.clone(),
        )
        .run();

        let elapsed = started.elapsed();
        match self.latch.take() {
            Some(err) => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "pipeline failed");
                Err(err)
            }
            None => {
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    cancelled = self.latch.token().is_cancelled(),
                    "pipeline finished"
                );
                for line in summarize(&stages).lines() {
                    info!("{}", line);
                }
                Ok(())
            }
        }
    }
}

fn summarize(stages: &[Arc<dyn Rebalance>]) -> String {
    stages
        .iter()
        .map(|stage| format!("{}: {}", stage.name(), stage.metrics().snapshot().format()))
        .collect::<Vec<_>>()
        .join("\n")
}
