//! Error types for the correlator core.
//!
//! `CorrError` consolidates every failure the correlator can report:
//!
//! - **`Config`** / **`Configuration`**: parse failures from `figment` and
//!   semantic validation failures of a parsed configuration.
//! - **`Io`** / **`Csv`**: diagnostic output (snapshots, history table).
//! - **`Pool`**, **`UnmappedBaseline`**, **`UnmappedAntenna`**: coordination
//!   contract violations. These are never data-quality problems; the
//!   correlator routes them to the partition supervisor.
//! - **`Decode`**: a transport frame of the wrong size.
//! - **`WriterStopped`** / **`Sink`**: hand-off and external sink failures.
//!
//! Pool exhaustion, out-of-range headers and degenerate estimator input are
//! deliberately absent: they are handled locally and never surface as errors.

use corr_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using the correlator error type.
pub type CorrResult<T> = std::result::Result<T, CorrError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum CorrError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Buffer pool invariant violated: {0}")]
    Pool(#[from] PoolError),

    #[error("Baseline {baseline} is not mapped ({count} baselines configured)")]
    UnmappedBaseline { baseline: usize, count: usize },

    #[error("Antenna {antenna} is not mapped ({count} antennas configured)")]
    UnmappedAntenna { antenna: usize, count: usize },

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Writer worker has stopped")]
    WriterStopped,

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Partition ch{channel}/beam{beam} is quarantined")]
    PartitionQuarantined { channel: usize, beam: usize },
}

impl CorrError {
    /// Whether the error signals a broken coordination contract rather than
    /// an I/O or data problem.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CorrError::Pool(_)
                | CorrError::UnmappedBaseline { .. }
                | CorrError::UnmappedAntenna { .. }
        )
    }
}
