//! Read cursor bound to a handle opened for read.
use futures::StreamExt;
use tokio::runtime::Runtime;

use crate::config::TimestampWindow;
use crate::engine::query::{self, ArrayScan, ScanPlan};
use crate::engine::EngineError;
use crate::transaction_log::ArrayState;

/// Progress of a read cursor.
///
/// `Pending` holds the plan until the first pull; `Exhausted` and `Failed`
/// are terminal until the handle is reopened.
enum CursorState {
    Pending(Box<ScanPlan>),
    Streaming(ArrayScan),
    Exhausted,
    Failed,
}

impl std::fmt::Debug for CursorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorState::Pending(_) => f.write_str("Pending"),
            CursorState::Streaming(_) => f.write_str("Streaming"),
            CursorState::Exhausted => f.write_str("Exhausted"),
            CursorState::Failed => f.write_str("Failed"),
        }
    }
}

/// Outcome of one pull.
pub(crate) enum Pull {
    Batch(arrow::array::RecordBatch),
    Done,
    Poisoned,
}

#[derive(Debug)]
pub(crate) struct ReadCursor {
    state: CursorState,
}

impl ReadCursor {
    pub(crate) fn new(plan: ScanPlan) -> Self {
        Self {
            state: CursorState::Pending(Box::new(plan)),
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(self.state, CursorState::Failed)
    }

    /// Pull the next batch, starting the scan on first use.
    pub(crate) fn next_batch(&mut self, runtime: &Runtime) -> Result<Pull, EngineError> {
        let mut stream = match std::mem::replace(&mut self.state, CursorState::Exhausted) {
            CursorState::Pending(plan) => query::scan(*plan),
            CursorState::Streaming(stream) => stream,
            CursorState::Exhausted => return Ok(Pull::Done),
            CursorState::Failed => {
                self.state = CursorState::Failed;
                return Ok(Pull::Poisoned);
            }
        };

        match runtime.block_on(stream.next()) {
            Some(Ok(batch)) => {
                self.state = CursorState::Streaming(stream);
                Ok(Pull::Batch(batch))
            }
            Some(Err(e)) => {
                self.state = CursorState::Failed;
                Err(e)
            }
            None => Ok(Pull::Done),
        }
    }
}

/// State owned by a handle opened for read.
#[derive(Debug)]
pub(crate) struct ReadSession {
    pub(crate) window: TimestampWindow,
    pub(crate) state: ArrayState,
    pub(crate) cursor: ReadCursor,
}
