//! Baseline enumeration.
//!
//! Baselines are the antenna pairs (a, b) with a < b, numbered row-major:
//! for 4 antennas the order is (0,1) (0,2) (0,3) (1,2) (1,3) (2,3).

use crate::error::{CorrError, CorrResult};

/// One antenna pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Baseline {
    /// Reference antenna (the unconjugated stream).
    pub a: usize,
    /// Second antenna (the conjugated stream).
    pub b: usize,
}

impl std::fmt::Display for Baseline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.a, self.b)
    }
}

/// Bidirectional mapping between baseline numbers and antenna pairs.
#[derive(Debug, Clone)]
pub struct BaselineTable {
    antennas: usize,
    pairs: Vec<Baseline>,
}

impl BaselineTable {
    /// Enumerate every pair of `antennas` antennas.
    #[must_use]
    pub fn new(antennas: usize) -> Self {
        let pairs = (0..antennas)
            .flat_map(|a| ((a + 1)..antennas).map(move |b| Baseline { a, b }))
            .collect();
        Self { antennas, pairs }
    }

    /// Number of baselines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the table has no baselines (fewer than two antennas).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of antennas.
    #[must_use]
    pub fn antennas(&self) -> usize {
        self.antennas
    }

    /// All baselines in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Baseline)> + '_ {
        self.pairs.iter().copied().enumerate()
    }

    /// Antenna pair for a baseline number.
    pub fn pair(&self, baseline: usize) -> CorrResult<Baseline> {
        self.pairs
            .get(baseline)
            .copied()
            .ok_or(CorrError::UnmappedBaseline {
                baseline,
                count: self.pairs.len(),
            })
    }

    /// Baseline number for an antenna pair, in either order.
    pub fn index(&self, a: usize, b: usize) -> CorrResult<usize> {
        for antenna in [a, b] {
            if antenna >= self.antennas {
                return Err(CorrError::UnmappedAntenna {
                    antenna,
                    count: self.antennas,
                });
            }
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        if lo == hi {
            return Err(CorrError::UnmappedBaseline {
                baseline: usize::MAX,
                count: self.pairs.len(),
            });
        }
        // Rows before `lo` hold (n-1) + (n-2) + ... + (n-lo) pairs.
        let n = self.antennas;
        Ok(lo * (2 * n - lo - 1) / 2 + (hi - lo - 1))
    }
}
