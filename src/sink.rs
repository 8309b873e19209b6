//! Per-beam integration records and the collaborators that consume them.
//!
//! The correlator produces one [`BeamRecord`] per beam per integration
//! cycle. The writer hands each record, together with per-baseline
//! [`GeometricTerm`]s from a [`GeometryProvider`], to a [`VisibilitySink`].

use crate::error::CorrResult;
use chrono::{DateTime, Utc};
use num_complex::Complex;
use parking_lot::Mutex;
use std::sync::Arc;

/// Visibilities of one beam over one integration cycle.
///
/// Matrices are baseline-major: the entry for (baseline, channel) lives at
/// `baseline * channels + channel`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamRecord {
    /// Beam index.
    pub beam: usize,
    /// Time the cycle closed.
    pub timestamp: DateTime<Utc>,
    /// Number of channels.
    pub channels: usize,
    /// Number of baselines.
    pub baselines: usize,
    /// Mean visibility per (baseline, channel).
    pub visibilities: Vec<Complex<f64>>,
    /// `true` where no data contributed to the visibility.
    pub flags: Vec<bool>,
    /// Control word per baseline, from the baseline's first antenna.
    pub control_words: Vec<u32>,
}

impl BeamRecord {
    /// Fully flagged record.
    #[must_use]
    pub fn new(beam: usize, timestamp: DateTime<Utc>, baselines: usize, channels: usize) -> Self {
        Self {
            beam,
            timestamp,
            channels,
            baselines,
            visibilities: vec![Complex::new(0.0, 0.0); baselines * channels],
            flags: vec![true; baselines * channels],
            control_words: vec![0; baselines],
        }
    }

    /// Spectrum of one baseline.
    #[must_use]
    pub fn spectrum(&self, baseline: usize) -> &[Complex<f64>] {
        let start = baseline * self.channels;
        &self.visibilities[start..start + self.channels]
    }

    /// Flags of one baseline.
    #[must_use]
    pub fn baseline_flags(&self, baseline: usize) -> &[bool] {
        let start = baseline * self.channels;
        &self.flags[start..start + self.channels]
    }

    /// Mean of the unflagged channels of a baseline.
    #[must_use]
    pub fn channel_mean(&self, baseline: usize) -> Complex<f64> {
        let (sum, n) = self
            .spectrum(baseline)
            .iter()
            .zip(self.baseline_flags(baseline))
            .filter(|(_, flagged)| !**flagged)
            .fold((Complex::new(0.0, 0.0), 0usize), |(sum, n), (v, _)| (sum + v, n + 1));
        if n == 0 {
            sum
        } else {
            sum / n as f64
        }
    }

    /// Whether any channel of any baseline is flagged.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.flags.iter().any(|&f| f)
    }
}

/// Per-baseline geometry supplied alongside a record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeometricTerm {
    /// Baseline u coordinate in metres.
    pub u: f64,
    /// Baseline v coordinate in metres.
    pub v: f64,
    /// Baseline w coordinate in metres.
    pub w: f64,
    /// Geometric delay in seconds.
    pub delay: f64,
}

/// Source of geometric terms.
pub trait GeometryProvider: Send {
    /// Terms for every baseline of `beam` at `timestamp`.
    fn terms(&self, beam: usize, timestamp: DateTime<Utc>, baselines: usize)
        -> Vec<GeometricTerm>;
}

/// Geometry for a zero-length array: every term is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroGeometry;

impl GeometryProvider for ZeroGeometry {
    fn terms(&self, _beam: usize, _timestamp: DateTime<Utc>, baselines: usize) -> Vec<GeometricTerm> {
        vec![GeometricTerm::default(); baselines]
    }
}

/// Consumer of finished beam records.
pub trait VisibilitySink: Send {
    /// Persist one record.
    fn write(&mut self, record: &BeamRecord, geometry: &[GeometricTerm]) -> CorrResult<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl VisibilitySink for NullSink {
    fn write(&mut self, _record: &BeamRecord, _geometry: &[GeometricTerm]) -> CorrResult<()> {
        Ok(())
    }
}

/// Keeps every record in memory behind a shared handle.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<BeamRecord>>>,
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    #[must_use]
    pub fn records(&self) -> Vec<BeamRecord> {
        self.records.lock().clone()
    }

    /// Number of records written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl VisibilitySink for MemorySink {
    fn write(&mut self, record: &BeamRecord, _geometry: &[GeometricTerm]) -> CorrResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
