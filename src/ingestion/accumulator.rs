//! Accumulator - bounded in-memory buffer between fetches and the sink

use crate::ingestion::batch::RowBatch;
use tracing::warn;

/// Rows waiting to be flushed. Callers drain `take_ready` after every append,
/// so the buffer never stays at or above the threshold across merges.
pub struct Accumulator {
    buffer: RowBatch,
    threshold: usize,
}

impl Accumulator {
    pub fn new(threshold: usize) -> Self {
        Self {
            buffer: RowBatch::default(),
            threshold: threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn append(&mut self, batch: RowBatch) {
        let dropped = self.buffer.append(batch);
        if !dropped.is_empty() {
            warn!(
                "Dropping columns not present in the first batch: {}",
                dropped.join(", ")
            );
        }
    }

    /// Split off exactly `threshold` rows once the buffer has reached it.
    pub fn take_ready(&mut self) -> Option<RowBatch> {
        if self.buffer.len() >= self.threshold {
            Some(self.buffer.split_front(self.threshold))
        } else {
            None
        }
    }

    /// Everything still buffered; the buffer keeps its columns.
    pub fn take_remaining(&mut self) -> RowBatch {
        self.buffer.take_rows()
    }
}
