use crate::cancel::CancellationToken;
use crate::error::FailureLatch;
use crate::pressure::{self, StageLoad};
use crate::queue::CANCEL_POLL;
use crate::stage::Rebalance;
use crate::task::join_task;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// A thread that runs for the whole pipeline without rebalancing
/// (sources, sinks)
pub struct FixedTask {
    pub name: String,
    pub handle: JoinHandle<()>,
}

/// Redistributes a fixed worker budget across stages until the pipeline
/// has fully drained.
///
/// Holds no state between ticks beyond its inputs: every decision is made
/// from a fresh snapshot of the stages.
pub struct Scheduler {
    stages: Vec<Arc<dyn Rebalance>>,
    fixed: Vec<FixedTask>,
    budget: usize,
    tick: Duration,
    token: CancellationToken,
    latch: FailureLatch,
}

impl Scheduler {
    pub fn new(
        stages: Vec<Arc<dyn Rebalance>>,
        fixed: Vec<FixedTask>,
        budget: usize,
        tick: Duration,
        latch: FailureLatch,
    ) -> Self {
        Self {
            stages,
            fixed,
            budget,
            tick,
            token: latch.token().clone(),
            latch,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Rebalance until every tracked thread has exited, then join them all
    pub fn run(self) {
        debug!(
            stages = self.stages.len(),
            budget = self.budget,
            "scheduler started"
        );
        while !self.all_done() {
            if self.token.is_cancelled() {
                thread::sleep(CANCEL_POLL);
                continue;
            }
            if self.tick_once() {
                thread::sleep(self.tick);
            }
        }
        self.join_all();
        debug!("scheduler finished");
    }

    fn loads(&self) -> Vec<StageLoad> {
        self.stages
            .iter()
            .map(|stage| StageLoad::observe(stage.as_ref()))
            .collect()
    }

    /// One rebalancing step. Returns true when the loop should idle.
    pub(crate) fn tick_once(&self) -> bool {
        let mut loads = self.loads();

        if let Some(index) = pressure::shrink_target(&loads, self.budget) {
            let stage = &self.stages[index];
            if stage.remove_worker() {
                debug!(
                    stage = stage.name(),
                    workers = stage.worker_count(),
                    "moved worker away"
                );
                loads = self.loads();
            }
        }

        let available = pressure::available(&loads, self.budget);
        trace!(
            committed = pressure::committed(&loads),
            available,
            "scheduler tick"
        );
        if available == 0 {
            return true;
        }

        match pressure::grow_target(&loads, self.budget) {
            Some(index) => {
                let stage = &self.stages[index];
                match stage.add_worker() {
                    Some(id) => {
                        trace!(stage = stage.name(), worker = id, "granted worker");
                        false
                    }
                    None => true,
                }
            }
            None => true,
        }
    }

    fn all_done(&self) -> bool {
        self.fixed.iter().all(|task| task.handle.is_finished())
            && self.stages.iter().all(|stage| stage.is_terminated())
    }

    fn join_all(self) {
        for task in self.fixed {
            join_task(&task.name, task.handle, &self.latch);
        }
        for stage in &self.stages {
            stage.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::queue::BoundedQueue;
    use crate::sequenced::Sequenced;
    use crate::stage::Stage;
    use crate::transform::MapTransform;

    fn idle_stage(
        name: &str,
        latch: &FailureLatch,
    ) -> (Arc<Stage<u32, u32>>, BoundedQueue<Sequenced<u32>>) {
        let input = BoundedQueue::new(16);
        let output = BoundedQueue::new(16);
        let stage = Stage::new(
            name,
            input.clone(),
            vec![output],
            MapTransform::new(name, |n: u32| Ok::<_, BoxError>(n)),
            latch.clone(),
            4,
        );
        stage.start().unwrap();
        (Arc::new(stage), input)
    }

    #[test]
    fn test_fills_budget_then_idles() {
        let latch = FailureLatch::new(CancellationToken::new());
        let (a, a_in) = idle_stage("a", &latch);
        let (b, b_in) = idle_stage("b", &latch);
        let stages: Vec<Arc<dyn Rebalance>> = vec![a.clone(), b.clone()];
        let scheduler = Scheduler::new(
            stages,
            Vec::new(),
            5,
            Duration::from_millis(10),
            latch.clone(),
        );

        assert_eq!(scheduler.budget(), 5);

        let mut ticks = 0;
        while !scheduler.tick_once() {
            ticks += 1;
            assert!(ticks <= 5);
        }
        assert_eq!(a.worker_count() + b.worker_count(), 5);

        a_in.close();
        b_in.close();
        scheduler.run();
        assert!(latch.take().is_none());
    }

    #[test]
    fn test_moves_worker_toward_backlog() {
        let latch = FailureLatch::new(CancellationToken::new());
        let (a, a_in) = idle_stage("a", &latch);
        a.add_worker();
        a.add_worker();

        // b's single worker blocks on its first item so the rest stay queued.
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let open = Arc::clone(&gate);
        let b_in = BoundedQueue::new(16);
        let b_out: BoundedQueue<Sequenced<u32>> = BoundedQueue::new(16);
        let b = Arc::new(Stage::new(
            "b",
            b_in.clone(),
            vec![b_out],
            MapTransform::new("gated", move |n: u32| {
                while !open.load(std::sync::atomic::Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok::<_, BoxError>(n)
            }),
            latch.clone(),
            4,
        ));
        b.start().unwrap();

        let token = CancellationToken::new();
        for seq in 1..=3 {
            b_in.put(Sequenced::new(seq, seq as u32), &token).unwrap();
        }
        while b.queue_depth() != 2 {
            thread::sleep(Duration::from_millis(1));
        }

        let stages: Vec<Arc<dyn Rebalance>> = vec![a.clone(), b.clone()];
        let scheduler = Scheduler::new(
            stages,
            Vec::new(),
            4,
            Duration::from_millis(10),
            latch.clone(),
        );
        scheduler.tick_once();
        assert_eq!(a.worker_count(), 2);
        assert_eq!(b.worker_count(), 2);

        gate.store(true, std::sync::atomic::Ordering::Release);
        a_in.close();
        b_in.close();
        scheduler.run();
        assert!(latch.take().is_none());
    }
}
