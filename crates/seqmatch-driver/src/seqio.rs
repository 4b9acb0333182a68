//! Sequence file loading.
//!
//! Record format: a line starting with `@` opens a record and carries its
//! description, following lines are sequence data, and a line starting with
//! `+` skips everything up to the next `@` header (quality data the core
//! has no use for). Records are staged straight into two DMA arrays, bases
//! at the core's compiled-in stride and lengths as u32 cells, so a loaded
//! set is ready to bind into a job without further copying.

use std::io::BufRead;
use std::path::Path;

use crate::dma::{DmaBuffer, DmaRegistry};
use crate::error::{DriverError, Result};
use seqmatch_hw::layout::MAX_DESCRIPTION_LENGTH;

/// A set of sequences staged in DMA memory.
#[derive(Debug)]
pub struct SequenceSet {
    sequences: DmaBuffer,
    lengths: DmaBuffer,
    count: u32,
    descriptions: Vec<String>,
}

impl SequenceSet {
    /// Number of records in the set.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Base data, one record per stride.
    #[must_use]
    pub const fn sequences(&self) -> &DmaBuffer {
        &self.sequences
    }

    /// Per-record lengths as u32 cells.
    #[must_use]
    pub const fn lengths(&self) -> &DmaBuffer {
        &self.lengths
    }

    /// Description lines, in record order. Host-side only.
    #[must_use]
    pub fn descriptions(&self) -> &[String] {
        &self.descriptions
    }
}

struct Record {
    description: String,
    bases: Vec<u8>,
}

/// Load every record of `path` into DMA memory at stride `max_seq_len`.
///
/// # Errors
///
/// Returns [`DriverError::SequenceFormat`] for malformed input (data before
/// the first header, a record longer than `max_seq_len`, an empty file),
/// plus the registry's allocation errors.
pub fn load_sequences(
    registry: &DmaRegistry,
    path: &Path,
    max_seq_len: usize,
) -> Result<SequenceSet> {
    let file = std::fs::File::open(path).map_err(|e| DriverError::open_failed(path, e))?;
    let reader = std::io::BufReader::new(file);

    let mut records: Vec<Record> = Vec::new();
    let mut skipping_quality = false;

    for line in reader.lines() {
        let line = line?;
        if let Some(header) = line.strip_prefix('@') {
            records.push(Record {
                description: clip(header, MAX_DESCRIPTION_LENGTH),
                bases: Vec::new(),
            });
            skipping_quality = false;
        } else if skipping_quality {
            // Quality data, discarded until the next header
        } else if line.starts_with('+') {
            skipping_quality = true;
        } else {
            let bases = line.trim();
            if bases.is_empty() {
                continue;
            }
            let Some(current) = records.last_mut() else {
                return Err(DriverError::sequence_format(
                    path,
                    "sequence data before the first '@' header",
                ));
            };
            current.bases.extend_from_slice(bases.as_bytes());
            if current.bases.len() > max_seq_len {
                return Err(DriverError::sequence_format(
                    path,
                    format!(
                        "record {} exceeds {max_seq_len} bases",
                        records.len() - 1
                    ),
                ));
            }
        }
    }

    if records.is_empty() {
        return Err(DriverError::sequence_format(path, "no sequence records"));
    }
    let count = u32::try_from(records.len())
        .map_err(|_| DriverError::sequence_format(path, "too many records"))?;

    let mut sequences = registry.allocate(records.len() * max_seq_len, true)?;
    let mut lengths = registry.allocate(records.len() * seqmatch_hw::layout::CELL_BYTES, true)?;

    // Pool memory arrives with stale contents; the stride padding must be
    // deterministic for score comparisons across runs
    sequences.as_mut_slice().fill(0);

    for (i, record) in records.iter().enumerate() {
        let start = i * max_seq_len;
        sequences.as_mut_slice()[start..start + record.bases.len()]
            .copy_from_slice(&record.bases);
    }
    {
        let cells = lengths.as_u32_slice_mut();
        for (i, record) in records.iter().enumerate() {
            cells[i] = u32::try_from(record.bases.len()).unwrap_or(u32::MAX);
        }
    }

    let longest = records.iter().map(|r| r.bases.len()).max().unwrap_or(0);
    tracing::info!(
        "Loaded {count} sequences from {} (longest {longest} bases)",
        path.display()
    );

    Ok(SequenceSet {
        sequences,
        lengths,
        count,
        descriptions: records.into_iter().map(|r| r.description).collect(),
    })
}

/// Truncate to at most `max` bytes without splitting a character.
fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
