//! The two ends of a pipeline: sources that produce items and sinks that
//! consume them. Both run on their own thread for the whole run.

use crate::cancel::CancellationToken;
use crate::error::{BoxError, PipelineError, QueueError, Result};
use crate::queue::BoundedQueue;
use crate::sequenced::{Sequenced, Sequencer};
use crate::worker::CloseOnDrop;
use tracing::debug;

/// Handed to a source: stamps every emitted item with the next sequence id.
///
/// Ids start at 1 and are never skipped, which is what the reordering in
/// every downstream stage relies on.
pub struct Emitter<T> {
    output: BoundedQueue<Sequenced<T>>,
    token: CancellationToken,
    sequencer: Sequencer,
}

impl<T: Send> Emitter<T> {
    pub(crate) fn new(output: BoundedQueue<Sequenced<T>>, token: CancellationToken) -> Self {
        Self {
            output,
            token,
            sequencer: Sequencer::new(),
        }
    }

    /// Send one item downstream, blocking while the queue is full.
    ///
    /// Fails with [`QueueError::Cancelled`] once the pipeline is cancelled.
    /// Returning that error from the source with `?` ends it cleanly.
    pub fn emit(&mut self, payload: T) -> std::result::Result<(), QueueError> {
        let item = self.sequencer.stamp(payload);
        self.output.put(item, &self.token)
    }

    /// Whether the source should stop early
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of items emitted so far
    pub fn emitted(&self) -> u64 {
        self.sequencer.issued()
    }
}

/// Run a source to completion. The output queue is closed however it ends.
pub(crate) fn run_source<T, F>(
    name: &str,
    output: BoundedQueue<Sequenced<T>>,
    token: CancellationToken,
    source: F,
) -> Result<()>
where
    T: Send,
    F: FnOnce(&mut Emitter<T>) -> std::result::Result<(), BoxError>,
{
    let _close = CloseOnDrop(&output);
    let mut emitter = Emitter::new(output.clone(), token);

    match source(&mut emitter) {
        Ok(()) => {
            debug!(source = name, emitted = emitter.emitted(), "source finished");
            Ok(())
        }
        Err(err) if is_cancellation(&err) => {
            debug!(source = name, emitted = emitter.emitted(), "source cancelled");
            Ok(())
        }
        Err(source) => Err(PipelineError::Source {
            task: name.to_string(),
            source,
        }),
    }
}

fn is_cancellation(err: &BoxError) -> bool {
    matches!(
        err.downcast_ref::<QueueError>(),
        Some(QueueError::Cancelled)
    )
}

/// Drain `input` into `sink` until it is exhausted or the pipeline is cancelled
pub(crate) fn run_sink<T, F>(
    name: &str,
    input: BoundedQueue<Sequenced<T>>,
    token: CancellationToken,
    mut sink: F,
) -> Result<()>
where
    T: Send,
    F: FnMut(Sequenced<T>) -> std::result::Result<(), BoxError>,
{
    let mut consumed = 0u64;
    loop {
        let item = match input.take(&token) {
            Ok(item) => item,
            Err(QueueError::Exhausted) => break,
            Err(_) => {
                debug!(sink = name, consumed, "sink cancelled");
                return Ok(());
            }
        };
        let seq = item.seq();
        sink(item).map_err(|source| PipelineError::Sink {
            task: name.to_string(),
            seq,
            source,
        })?;
        consumed += 1;
    }
    debug!(sink = name, consumed, "sink finished");
    Ok(())
}
