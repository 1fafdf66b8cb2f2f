use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a pipeline run.
///
/// Deserializes with every field optional, so an application can embed
/// this in its own settings file and override only what it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of every queue the pipeline creates
    pub queue_capacity: usize,
    /// Scheduler tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Workers allowed per hardware thread
    pub budget_multiplier: usize,
    /// Fixed worker budget, overriding the hardware-derived one
    pub worker_budget: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            tick_interval_ms: 100,
            budget_multiplier: 4,
            worker_budget: None,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_budget_multiplier(mut self, multiplier: usize) -> Self {
        self.budget_multiplier = multiplier;
        self
    }

    pub fn with_worker_budget(mut self, budget: usize) -> Self {
        self.worker_budget = Some(budget);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PipelineError::ConfigError(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(PipelineError::ConfigError(
                "tick_interval_ms must be at least 1".into(),
            ));
        }
        if self.budget_multiplier == 0 {
            return Err(PipelineError::ConfigError(
                "budget_multiplier must be at least 1".into(),
            ));
        }
        if self.worker_budget == Some(0) {
            return Err(PipelineError::ConfigError(
                "worker_budget must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Total workers the scheduler may keep alive across `stage_count` stages
    pub fn worker_budget_for(&self, stage_count: usize) -> usize {
        match self.worker_budget {
            Some(budget) => budget.max(stage_count),
            None => {
                let parallelism = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (parallelism * self.budget_multiplier).max(stage_count * 2)
            }
        }
    }
}
