//! Bounded circular monitoring history.
//!
//! One slot per integration cycle, `depth` slots in total. Each slot holds a
//! timestamp and, for every (beam, baseline), the mean visibility, the
//! estimated delay and the control word of the cycle.
//!
//! ```text
//!   advance(t0)  advance(t1)  advance(t1)  advance(t2)
//!   [t0 . . .]   [t0 t1 . .]  unchanged    [t0 t1 t2 .]
//!        ^            ^                           ^ cursor
//! ```
//!
//! The beam dimension is sized statically (`max_beams`) and may exceed the
//! number of beams actually running. Records for beams beyond it are dropped
//! silently.

use crate::error::{CorrError, CorrResult};
use chrono::{DateTime, SecondsFormat, Utc};
use num_complex::Complex;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

/// One (beam, baseline) cell of a history slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistoryEntry {
    /// Mean visibility over channels.
    pub value: Complex<f64>,
    /// Estimated delay in seconds.
    pub delay: f64,
    /// Control word of the baseline's reference antenna.
    pub control_word: u32,
}

#[derive(Debug, Clone)]
struct Slot {
    timestamp: Option<DateTime<Utc>>,
    entries: Vec<HistoryEntry>,
}

/// Fixed-capacity ring of integration cycles.
#[derive(Debug, Clone)]
pub struct MonitorHistory {
    max_beams: usize,
    baselines: usize,
    slots: Vec<Slot>,
    cursor: usize,
    populated: usize,
    last: Option<DateTime<Utc>>,
}

/// One row of [`HistoryTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    /// Cycle timestamp.
    pub timestamp: DateTime<Utc>,
    /// Beam-major cells, `max_beams × baselines`.
    pub entries: Vec<HistoryEntry>,
}

/// Snapshot of the populated history, oldest row first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryTable {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows oldest to newest.
    pub rows: Vec<HistoryRow>,
    baselines: usize,
}

impl MonitorHistory {
    /// Empty history of `depth` cycles.
    ///
    /// # Panics
    /// If `depth` is zero.
    #[must_use]
    pub fn new(depth: usize, max_beams: usize, baselines: usize) -> Self {
        assert!(depth > 0, "history depth must be > 0");
        let slot = Slot {
            timestamp: None,
            entries: vec![HistoryEntry::default(); max_beams * baselines],
        };
        Self {
            max_beams,
            baselines,
            slots: vec![slot; depth],
            cursor: 0,
            populated: 0,
            last: None,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots holding a cycle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Whether no cycle has been started yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Start a new cycle at `timestamp`, overwriting the oldest slot once
    /// the ring is full.
    ///
    /// Repeating the current timestamp is a no-op and returns `false`. An
    /// earlier timestamp is accepted with a warning.
    pub fn advance(&mut self, timestamp: DateTime<Utc>) -> bool {
        match self.last {
            Some(last) if last == timestamp => return false,
            Some(last) if timestamp < last => {
                warn!(
                    previous = %last,
                    timestamp = %timestamp,
                    "History timestamp went backwards"
                );
            }
            _ => {}
        }

        if self.populated > 0 {
            self.cursor = (self.cursor + 1) % self.slots.len();
        }
        self.populated = (self.populated + 1).min(self.slots.len());

        let slot = &mut self.slots[self.cursor];
        slot.timestamp = Some(timestamp);
        slot.entries.fill(HistoryEntry::default());
        self.last = Some(timestamp);
        true
    }

    /// Write one cell of the current cycle.
    ///
    /// Beams at or beyond `max_beams` are dropped. A baseline outside the
    /// configured count is an [`CorrError::UnmappedBaseline`].
    pub fn record(
        &mut self,
        beam: usize,
        baseline: usize,
        value: Complex<f64>,
        delay: f64,
        control_word: u32,
    ) -> CorrResult<()> {
        if baseline >= self.baselines {
            return Err(CorrError::UnmappedBaseline {
                baseline,
                count: self.baselines,
            });
        }
        if beam >= self.max_beams {
            trace!(beam, max_beams = self.max_beams, "Beam outside history, dropped");
            return Ok(());
        }
        if self.populated == 0 {
            debug!(beam, baseline, "Record before first cycle, dropped");
            return Ok(());
        }

        self.slots[self.cursor].entries[beam * self.baselines + baseline] = HistoryEntry {
            value,
            delay,
            control_word,
        };
        Ok(())
    }

    /// Populated slots, oldest first.
    #[must_use]
    pub fn dump(&self) -> HistoryTable {
        let depth = self.slots.len();
        let oldest = (self.cursor + depth + 1 - self.populated) % depth;
        let rows = (0..self.populated)
            .map(|i| &self.slots[(oldest + i) % depth])
            .filter_map(|slot| {
                slot.timestamp.map(|timestamp| HistoryRow {
                    timestamp,
                    entries: slot.entries.clone(),
                })
            })
            .collect();

        HistoryTable {
            columns: self.columns(),
            rows,
            baselines: self.baselines,
        }
    }

    /// Dump to a tab-delimited file, creating parent directories.
    pub fn dump_to_file(&self, path: &Path) -> CorrResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.dump().write_table(BufWriter::new(file))?;
        debug!(path = %path.display(), rows = self.populated, "History table written");
        Ok(())
    }

    fn columns(&self) -> Vec<String> {
        let mut columns = vec!["timestamp".to_string()];
        for beam in 0..self.max_beams {
            for bl in 0..self.baselines {
                columns.push(format!("amp_b{beam}_bl{bl}"));
                columns.push(format!("phase_b{beam}_bl{bl}"));
                columns.push(format!("delay_b{beam}_bl{bl}"));
            }
        }
        columns.extend((0..self.baselines).map(|bl| format!("ctrl_bl{bl}")));
        columns
    }
}

impl HistoryTable {
    /// Render as tab-delimited text with a header row.
    ///
    /// Control words are taken from beam 0 only.
    pub fn write_table<W: Write>(&self, writer: W) -> CorrResult<()> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        out.write_record(&self.columns)?;

        for row in &self.rows {
            let mut record = Vec::with_capacity(self.columns.len());
            record.push(row.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true));
            for entry in &row.entries {
                record.push(format!("{:.6e}", entry.value.norm()));
                record.push(format!("{:.6}", entry.value.arg()));
                record.push(format!("{:.6e}", entry.delay));
            }
            let beam0 = row.entries.iter().take(self.baselines);
            record.extend(beam0.map(|entry| entry.control_word.to_string()));
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }
}
