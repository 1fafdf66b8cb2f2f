//! Backlog pressure arithmetic used by the scheduler.
//!
//! Pressure is queue depth divided by worker count: a rough estimate of how
//! long a stage needs to drain what is already waiting for it. Everything
//! here works on plain snapshots so each scheduler tick starts fresh.

use crate::stage::Rebalance;

/// Point-in-time view of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLoad {
    pub workers: usize,
    pub depth: usize,
    /// False once the stage has finished; finished stages hold no budget
    pub active: bool,
}

impl StageLoad {
    /// Read the current load of a live stage
    pub fn observe(stage: &dyn Rebalance) -> Self {
        Self {
            workers: stage.worker_count(),
            depth: stage.queue_depth(),
            active: !stage.is_finished(),
        }
    }

    /// Items waiting per worker
    pub fn pressure(&self) -> f64 {
        if self.workers == 0 {
            return self.depth as f64;
        }
        self.depth as f64 / self.workers as f64
    }
}

/// Workers currently held by active stages
pub fn committed(loads: &[StageLoad]) -> usize {
    loads
        .iter()
        .filter(|load| load.active)
        .map(|load| load.workers)
        .sum()
}

/// Workers that may still be handed out under `budget`
pub fn available(loads: &[StageLoad], budget: usize) -> usize {
    budget.saturating_sub(committed(loads))
}

pub fn active_count(loads: &[StageLoad]) -> usize {
    loads.iter().filter(|load| load.active).count()
}

/// Active stage most in need of another worker. Ties go to the earliest stage.
pub fn most_pressured(loads: &[StageLoad]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, load) in loads.iter().enumerate() {
        if !load.active || load.workers == 0 {
            continue;
        }
        let pressure = load.pressure();
        if best.map_or(true, |(_, top)| pressure > top) {
            best = Some((index, pressure));
        }
    }
    best.map(|(index, _)| index)
}

/// Active stage that can best spare a worker. Ties go to the earliest stage.
pub fn least_pressured(loads: &[StageLoad]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, load) in loads.iter().enumerate() {
        if !load.active || load.workers <= 1 {
            continue;
        }
        let pressure = load.pressure();
        if best.map_or(true, |(_, low)| pressure < low) {
            best = Some((index, pressure));
        }
    }
    best.map(|(index, _)| index)
}

/// Stage to take a worker from when the budget is fully committed.
///
/// Skipped when the donor would be the very stage the grow step hands the
/// worker straight back to.
pub fn shrink_target(loads: &[StageLoad], budget: usize) -> Option<usize> {
    if available(loads, budget) > 0 || active_count(loads) <= 1 {
        return None;
    }
    let donor = least_pressured(loads)?;
    match most_pressured(loads) {
        Some(receiver) if loads[donor].pressure() < loads[receiver].pressure() => Some(donor),
        _ => None,
    }
}

/// Stage to give a worker to, if any budget is left
pub fn grow_target(loads: &[StageLoad], budget: usize) -> Option<usize> {
    if available(loads, budget) == 0 {
        return None;
    }
    most_pressured(loads)
}
