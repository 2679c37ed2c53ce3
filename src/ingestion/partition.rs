//! Quarter-aligned date partitioning for chunked requests

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One inclusive sub-range of a request, bounded by calendar quarters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl Chunk {
    pub fn days(&self) -> i64 {
        (self.end - self.begin).num_days() + 1
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.begin, self.end)
    }
}

/// First day of the quarter following the one containing `date`.
pub fn next_quarter_start(date: NaiveDate) -> Option<NaiveDate> {
    let quarter_month = (date.month0() / 3) * 3 + 1;
    if quarter_month == 10 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), quarter_month + 3, 1)
    }
}

/// Split `[begin, end]` into contiguous chunks, each ending on the last day of
/// its quarter or on `end`. Returns nothing when `begin > end`.
pub fn partition(begin: NaiveDate, end: NaiveDate) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut cursor = begin;

    while cursor <= end {
        let chunk_end = next_quarter_start(cursor)
            .and_then(|next| next.pred_opt())
            .map_or(end, |last| last.min(end));

        chunks.push(Chunk {
            begin: cursor,
            end: chunk_end,
        });

        match chunk_end.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }

    chunks
}
