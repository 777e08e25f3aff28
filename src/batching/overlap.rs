//! Overlap-bounded chunking for key server publishes.
//!
//! The key server rejects a publish whose keys, sorted by
//! `(interval_number, interval_count)`, contain an interval that starts
//! inside the previous distinct interval, or more than `max_overlapping`
//! keys sharing one start interval. Chunks produced here never trip either
//! rule, nor exceed `batch_size`.
//!
//! Keys are placed first-fit, in sorted order, into the earliest open chunk
//! that still accepts them; a new chunk is opened when none does.

use std::fmt;

use crate::error::BatchingError;
use crate::storage::models::ExposureKey;

/// Why a chunk would be rejected by the key server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkViolation {
    TooLarge { len: usize, batch_size: usize },
    TooManyOverlapping { interval_number: u32, count: usize },
    Misaligned { interval_number: u32, covered_until: u64 },
}

impl fmt::Display for ChunkViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkViolation::TooLarge { len, batch_size } => {
                write!(f, "chunk has {} keys, limit {}", len, batch_size)
            }
            ChunkViolation::TooManyOverlapping {
                interval_number,
                count,
            } => write!(
                f,
                "{} keys share start interval {}",
                count, interval_number
            ),
            ChunkViolation::Misaligned {
                interval_number,
                covered_until,
            } => write!(
                f,
                "start interval {} overlaps previous interval ending at {}",
                interval_number, covered_until
            ),
        }
    }
}

/// Incremental validity state of a chunk being filled in sorted order.
#[derive(Debug)]
struct OpenChunk {
    keys: Vec<ExposureKey>,
    last_start: u32,
    same_start: usize,
    covered_until: u64,
}

impl OpenChunk {
    fn new(first: ExposureKey) -> Self {
        let mut chunk = Self {
            keys: Vec::new(),
            last_start: first.interval_number,
            same_start: 0,
            covered_until: 0,
        };
        chunk.push(first);
        chunk
    }

    fn accepts(&self, key: &ExposureKey, batch_size: usize, max_overlapping: usize) -> bool {
        if self.keys.len() >= batch_size {
            return false;
        }
        if key.interval_number == self.last_start {
            self.same_start < max_overlapping
        } else {
            key.interval_number as u64 >= self.covered_until
        }
    }

    fn push(&mut self, key: ExposureKey) {
        let end = interval_end(&key);
        if self.keys.is_empty() || key.interval_number != self.last_start {
            self.last_start = key.interval_number;
            self.same_start = 1;
            self.covered_until = end;
        } else {
            self.same_start += 1;
            self.covered_until = self.covered_until.max(end);
        }
        self.keys.push(key);
    }
}

fn interval_end(key: &ExposureKey) -> u64 {
    key.interval_number as u64 + key.interval_count as u64
}

fn sort_intervals(keys: &mut [ExposureKey]) {
    keys.sort_by(|a, b| {
        (a.interval_number, a.interval_count).cmp(&(b.interval_number, b.interval_count))
    });
}

/// Partition `keys` into chunks the key server accepts.
///
/// Every input key lands in exactly one chunk. Chunk contents are sorted by
/// `(interval_number, interval_count)`.
pub fn overlap_bounded_chunks(
    keys: Vec<ExposureKey>,
    batch_size: usize,
    max_overlapping: usize,
) -> Result<Vec<Vec<ExposureKey>>, BatchingError> {
    if batch_size == 0 {
        return Err(BatchingError::ZeroBatchSize);
    }
    if max_overlapping == 0 {
        return Err(BatchingError::ZeroMaxOverlapping);
    }

    let mut sorted = keys;
    sort_intervals(&mut sorted);

    let mut chunks: Vec<OpenChunk> = Vec::new();
    for key in sorted {
        match chunks
            .iter_mut()
            .find(|chunk| chunk.accepts(&key, batch_size, max_overlapping))
        {
            Some(chunk) => chunk.push(key),
            None => chunks.push(OpenChunk::new(key)),
        }
    }

    Ok(chunks.into_iter().map(|chunk| chunk.keys).collect())
}

/// Check a chunk against the key server's batch rules.
pub fn validate_chunk(
    keys: &[ExposureKey],
    batch_size: usize,
    max_overlapping: usize,
) -> Result<(), ChunkViolation> {
    if keys.len() > batch_size {
        return Err(ChunkViolation::TooLarge {
            len: keys.len(),
            batch_size,
        });
    }

    let mut sorted = keys.to_vec();
    sort_intervals(&mut sorted);

    let mut last_start: Option<u32> = None;
    let mut same_start = 0;
    let mut covered_until = 0u64;

    for key in &sorted {
        if last_start == Some(key.interval_number) {
            same_start += 1;
            covered_until = covered_until.max(interval_end(key));
        } else {
            if last_start.is_some() && (key.interval_number as u64) < covered_until {
                return Err(ChunkViolation::Misaligned {
                    interval_number: key.interval_number,
                    covered_until,
                });
            }
            last_start = Some(key.interval_number);
            same_start = 1;
            covered_until = interval_end(key);
        }

        if same_start > max_overlapping {
            return Err(ChunkViolation::TooManyOverlapping {
                interval_number: key.interval_number,
                count: same_start,
            });
        }
    }

    Ok(())
}
