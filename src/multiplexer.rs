//! Order restoration for a stage's parallel worker outputs.
//!
//! Workers finish items in whatever order the OS schedules them. Each one
//! writes into its own private queue, and the stage's multiplexer thread
//! merges those queues, holding back early arrivals until every earlier
//! sequence id has been released.

use crate::cancel::CancellationToken;
use crate::error::{PipelineError, ReorderError, Result};
use crate::metrics::StageMetrics;
use crate::queue::{try_take_from_any, BoundedQueue, Notify, TryTakeAny, CANCEL_POLL};
use crate::sequenced::{Sequenced, Sequencer};
use crate::worker::Batch;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Holds out-of-order items until their predecessors arrive
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    /// Expect sequence ids starting at 1
    pub fn new() -> Self {
        Self {
            next: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Accept an item. Ids already released or already held are rejected.
    pub fn push(&mut self, seq: u64, value: T) -> std::result::Result<(), ReorderError> {
        if seq < self.next {
            return Err(ReorderError::Stale {
                seq,
                expected: self.next,
            });
        }
        if self.pending.contains_key(&seq) {
            return Err(ReorderError::Duplicate { seq });
        }
        self.pending.insert(seq, value);
        Ok(())
    }

    /// Release the next item if it has arrived
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let value = self.pending.remove(&self.next)?;
        let seq = self.next;
        self.next += 1;
        Some((seq, value))
    }

    /// The id the buffer is waiting for
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    /// Items held back waiting for a predecessor
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Confirm nothing is still held back once input has ended
    pub fn finish(&self) -> std::result::Result<(), ReorderError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(ReorderError::Gap {
                expected: self.next,
                pending: self.pending.len(),
            })
        }
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Private output queues of a stage's workers
#[derive(Debug)]
pub(crate) struct WorkerQueues<O> {
    /// Index-aligned with the stage's live workers
    pub(crate) live: Vec<BoundedQueue<Batch<O>>>,
    /// Left behind by removed workers, drained until exhausted
    pub(crate) retired: Vec<BoundedQueue<Batch<O>>>,
}

impl<O: Send> WorkerQueues<O> {
    pub(crate) fn new() -> Self {
        Self {
            live: Vec::new(),
            retired: Vec::new(),
        }
    }

    fn snapshot(&mut self) -> Vec<BoundedQueue<Batch<O>>> {
        self.retired.retain(|queue| !queue.is_exhausted());
        self.live.iter().chain(self.retired.iter()).cloned().collect()
    }
}

/// Something the multiplexer can read the current worker queues from
pub(crate) trait QueueSource<O>: Send + Sync {
    /// Current queues plus whether the set is final
    fn current(&self) -> (Vec<BoundedQueue<Batch<O>>>, bool);
}

/// The multiplexer thread of one stage
pub(crate) struct Multiplexer<O> {
    pub(crate) stage: String,
    pub(crate) source: Arc<dyn QueueSource<O>>,
    pub(crate) notify: Arc<Notify>,
    pub(crate) outputs: Vec<BoundedQueue<Sequenced<O>>>,
    pub(crate) token: CancellationToken,
    pub(crate) metrics: StageMetrics,
}

/// Closes every output when dropped, including during unwinding
struct CloseAll<'a, T: Send>(&'a [BoundedQueue<T>]);

impl<T: Send> Drop for CloseAll<'_, T> {
    fn drop(&mut self) {
        for queue in self.0 {
            queue.close();
        }
    }
}

impl<O: Clone + Send + 'static> Multiplexer<O> {
    pub(crate) fn run(self) -> Result<()> {
        let _close = CloseAll(&self.outputs);
        let mut reorder = ReorderBuffer::new();
        let mut sequencer = Sequencer::new();
        let mut cursor = 0;

        loop {
            let observed = self.notify.generation();
            let (queues, settled) = self.source.current();

            match try_take_from_any(&queues, cursor) {
                TryTakeAny::Item(index, batch) => {
                    cursor = index + 1;
                    let seq = batch.seq();
                    reorder
                        .push(seq, batch.into_payload())
                        .map_err(|source| self.violation(source))?;
                    self.metrics.record_reorder_depth(reorder.pending());
                    while let Some((_, payloads)) = reorder.pop_ready() {
                        for payload in payloads {
                            if !self.forward(sequencer.stamp(payload)) {
                                return Ok(());
                            }
                        }
                    }
                    continue;
                }
                TryTakeAny::Exhausted if settled => break,
                _ => {}
            }

            if self.token.is_cancelled() {
                debug!(stage = %self.stage, "multiplexer cancelled");
                return Ok(());
            }
            self.notify.wait(observed, CANCEL_POLL);
        }

        // Workers stop mid-stream on cancellation, so gaps are expected then.
        if self.token.is_cancelled() {
            debug!(stage = %self.stage, pending = reorder.pending(), "multiplexer cancelled");
            return Ok(());
        }
        reorder.finish().map_err(|source| self.violation(source))?;
        debug!(
            stage = %self.stage,
            forwarded = sequencer.issued(),
            "multiplexer drained"
        );
        Ok(())
    }

    /// Deliver one item to every output. False if cancelled.
    fn forward(&self, item: Sequenced<O>) -> bool {
        let Some((last, rest)) = self.outputs.split_last() else {
            return true;
        };
        for output in rest {
            if output.put(item.clone(), &self.token).is_err() {
                return false;
            }
        }
        if last.put(item, &self.token).is_err() {
            return false;
        }
        self.metrics.record_forwarded();
        true
    }

    fn violation(&self, source: ReorderError) -> PipelineError {
        PipelineError::Protocol {
            stage: self.stage.clone(),
            source,
        }
    }
}

/// Queue source backed by a stage's worker pool
pub(crate) struct PoolQueues<O> {
    pub(crate) queues: Arc<Mutex<WorkerQueues<O>>>,
    pub(crate) finished: Arc<AtomicBool>,
}

impl<O: Send> QueueSource<O> for PoolQueues<O> {
    fn current(&self) -> (Vec<BoundedQueue<Batch<O>>>, bool) {
        // Read under the lock that guards worker registration: once the
        // flag is seen set, no further queue can be added.
        let mut queues = self.queues.lock();
        let settled = self.finished.load(Ordering::Acquire);
        (queues.snapshot(), settled)
    }
}
