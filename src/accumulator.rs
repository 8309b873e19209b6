//! Per-baseline cross-correlation accumulator.
//!
//! Each baseline keeps a running complex sum of `a[i] * conj(b[i + d])`
//! over every index where both streams overlap after the baseline's integer
//! sample shift `d`, plus the number of products summed. Sums are kept in
//! `f64` and never normalised here; callers divide by the count.
//!
//! Accumulating `[0, k)` and then `[k, n)` performs exactly the same
//! sequence of additions as one pass over `[0, n)`, so split calls produce
//! bit-identical sums.

use crate::error::{CorrError, CorrResult};
use num_complex::Complex;
use std::ops::Range;

/// Running correlation state for a set of baselines.
#[derive(Debug, Clone)]
pub struct CorrelationAccumulator {
    sums: Vec<Complex<f64>>,
    counts: Vec<u64>,
    delays: Vec<i64>,
}

impl CorrelationAccumulator {
    /// Accumulator for `baselines` baselines with zero shift.
    #[must_use]
    pub fn new(baselines: usize) -> Self {
        Self {
            sums: vec![Complex::new(0.0, 0.0); baselines],
            counts: vec![0; baselines],
            delays: vec![0; baselines],
        }
    }

    /// Clear every baseline and set the per-baseline sample shifts.
    ///
    /// The number of baselines becomes `delays.len()`.
    pub fn reset(&mut self, delays: &[i64]) {
        self.sums.clear();
        self.sums.resize(delays.len(), Complex::new(0.0, 0.0));
        self.counts.clear();
        self.counts.resize(delays.len(), 0);
        self.delays.clear();
        self.delays.extend_from_slice(delays);
    }

    /// Number of baselines.
    #[must_use]
    pub fn baselines(&self) -> usize {
        self.sums.len()
    }

    /// Sample shift applied to a baseline's second stream.
    pub fn delay(&self, baseline: usize) -> CorrResult<i64> {
        self.check(baseline)?;
        Ok(self.delays[baseline])
    }

    /// Accumulate indices `[0, n)` of `stream_a`.
    pub fn accumulate(
        &mut self,
        baseline: usize,
        stream_a: &[Complex<f32>],
        stream_b: &[Complex<f32>],
        n: usize,
    ) -> CorrResult<()> {
        self.accumulate_range(baseline, stream_a, stream_b, 0..n)
    }

    /// Accumulate the indices of `stream_a` in `range` that overlap
    /// `stream_b` after the baseline's shift.
    pub fn accumulate_range(
        &mut self,
        baseline: usize,
        stream_a: &[Complex<f32>],
        stream_b: &[Complex<f32>],
        range: Range<usize>,
    ) -> CorrResult<()> {
        self.check(baseline)?;
        let shift = self.delays[baseline];

        // i must satisfy 0 <= i + shift < len(b)
        let magnitude = usize::try_from(shift.unsigned_abs()).unwrap_or(usize::MAX);
        let (first_valid, end_valid) = if shift < 0 {
            (magnitude, stream_b.len().saturating_add(magnitude))
        } else {
            (0, stream_b.len().saturating_sub(magnitude))
        };
        let lo = range.start.max(first_valid);
        let hi = range.end.min(stream_a.len()).min(end_valid);
        if lo >= hi {
            return Ok(());
        }

        let mut sum = self.sums[baseline];
        for i in lo..hi {
            let j = if shift < 0 { i - magnitude } else { i + magnitude };
            sum += widen(stream_a[i]) * widen(stream_b[j]).conj();
        }
        self.sums[baseline] = sum;
        self.counts[baseline] += (hi - lo) as u64;
        Ok(())
    }

    /// Running sum and number of products for a baseline.
    pub fn sum(&self, baseline: usize) -> CorrResult<(Complex<f64>, u64)> {
        self.check(baseline)?;
        Ok((self.sums[baseline], self.counts[baseline]))
    }

    /// Mean visibility, or `None` if nothing has been accumulated.
    pub fn mean(&self, baseline: usize) -> CorrResult<Option<Complex<f64>>> {
        let (sum, count) = self.sum(baseline)?;
        Ok((count > 0).then(|| sum / count as f64))
    }

    fn check(&self, baseline: usize) -> CorrResult<()> {
        if baseline < self.sums.len() {
            Ok(())
        } else {
            Err(CorrError::UnmappedBaseline {
                baseline,
                count: self.sums.len(),
            })
        }
    }
}

#[inline]
fn widen(x: Complex<f32>) -> Complex<f64> {
    Complex::new(f64::from(x.re), f64::from(x.im))
}
