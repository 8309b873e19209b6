//! Delay and quality estimation from a baseline's cross-correlation
//! spectrum (one complex visibility per channel).
//!
//! Two estimators are provided:
//!
//! - [`DelayMode::PhaseRegression`]: unwrap the per-channel phase and fit a
//!   straight line against channel index. The delay is
//!   `slope / (2π · Δf)`.
//! - [`DelayMode::LagTransform`]: zero-pad and FFT the spectrum into the lag
//!   domain, take the peak lag, refine it with a parabola through the peak
//!   and its neighbours, then polish it on the coherence curve.
//!
//! Both report the same quality figure, the coherence of the spectrum after
//! removing the estimated phase slope:
//!
//! ```text
//! q(τ) = |Σ X_k · exp(-i·2π·k·Δf·τ)| / Σ |X_k|
//! ```
//!
//! which is exactly 1 for a pure phase ramp and of order `1/√N` for random
//! phases.
//!
//! An all-zero spectrum carries no information and yields delay 0 with
//! quality 1. A spectrum with fewer than two usable channels yields delay 0
//! with quality 0.

use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

/// Adjacent-channel phase jump above which a 2π correction is applied
/// during unwrapping.
pub const DEFAULT_UNWRAP_THRESHOLD: f64 = 1.5 * PI;

const POLISH_ITERATIONS: usize = 64;

/// Estimation method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    /// Least-squares fit of unwrapped phase against channel index.
    #[default]
    PhaseRegression,
    /// Peak search in the lag domain.
    LagTransform,
}

/// Parameters of a [`DelayEstimator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSettings {
    /// Estimation method.
    pub mode: DelayMode,
    /// Frequency spacing between adjacent channels in Hz.
    pub channel_spacing_hz: f64,
    /// Phase unwrap threshold in radians.
    pub unwrap_threshold: f64,
    /// Zero-padding factor for the lag transform.
    pub lag_padding: usize,
}

impl EstimatorSettings {
    /// Phase-regression settings with the default threshold.
    #[must_use]
    pub fn phase_regression(channel_spacing_hz: f64) -> Self {
        Self {
            mode: DelayMode::PhaseRegression,
            channel_spacing_hz,
            unwrap_threshold: DEFAULT_UNWRAP_THRESHOLD,
            lag_padding: 2,
        }
    }

    /// Lag-transform settings with two-fold padding.
    #[must_use]
    pub fn lag_transform(channel_spacing_hz: f64) -> Self {
        Self {
            mode: DelayMode::LagTransform,
            ..Self::phase_regression(channel_spacing_hz)
        }
    }
}

/// Delay in seconds and its quality in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayEstimate {
    /// Delay of the second antenna relative to the first, in seconds.
    pub delay: f64,
    /// Coherence after removing the delay.
    pub quality: f64,
}

impl DelayEstimate {
    const SILENT: Self = Self {
        delay: 0.0,
        quality: 1.0,
    };
    const UNDETERMINED: Self = Self {
        delay: 0.0,
        quality: 0.0,
    };
}

/// Stateful estimator; keeps an FFT planner and the quality of the last
/// call.
pub struct DelayEstimator {
    settings: EstimatorSettings,
    planner: FftPlanner<f64>,
    scratch: Vec<Complex<f64>>,
    quality: f64,
}

impl std::fmt::Debug for DelayEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayEstimator")
            .field("settings", &self.settings)
            .field("quality", &self.quality)
            .finish_non_exhaustive()
    }
}

impl DelayEstimator {
    /// Create an estimator.
    #[must_use]
    pub fn new(settings: EstimatorSettings) -> Self {
        Self {
            settings,
            planner: FftPlanner::new(),
            scratch: Vec::new(),
            quality: 1.0,
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn settings(&self) -> EstimatorSettings {
        self.settings
    }

    /// Estimate the delay in seconds, caching the quality for
    /// [`quality`](Self::quality).
    pub fn get_delay(&mut self, spectrum: &[Complex<f64>]) -> f64 {
        self.estimate(spectrum).delay
    }

    /// Quality of the most recent estimate.
    #[must_use]
    pub fn quality(&self) -> f64 {
        self.quality
    }

    /// Estimate delay and quality together.
    pub fn estimate(&mut self, spectrum: &[Complex<f64>]) -> DelayEstimate {
        let estimate = if spectrum.iter().all(|x| x.norm_sqr() == 0.0) {
            DelayEstimate::SILENT
        } else {
            match self.settings.mode {
                DelayMode::PhaseRegression => self.phase_regression(spectrum),
                DelayMode::LagTransform => self.lag_transform(spectrum),
            }
        };
        self.quality = estimate.quality;
        estimate
    }

    fn phase_regression(&self, spectrum: &[Complex<f64>]) -> DelayEstimate {
        // Channels with no power have no defined phase
        let (channels, mut phases): (Vec<f64>, Vec<f64>) = spectrum
            .iter()
            .enumerate()
            .filter(|(_, x)| x.norm_sqr() > 0.0)
            .map(|(k, x)| (k as f64, x.arg()))
            .unzip();

        if phases.len() < 2 {
            debug!(
                channels = phases.len(),
                "Too few channels for phase regression"
            );
            return DelayEstimate::UNDETERMINED;
        }

        unwrap_phase(&mut phases, self.settings.unwrap_threshold);
        let slope = fit_slope(&channels, &phases);
        let delay = slope / (2.0 * PI * self.settings.channel_spacing_hz);
        DelayEstimate {
            delay,
            quality: coherence(spectrum, delay, self.settings.channel_spacing_hz),
        }
    }

    fn lag_transform(&mut self, spectrum: &[Complex<f64>]) -> DelayEstimate {
        let n = spectrum.len();
        let df = self.settings.channel_spacing_hz;
        let fft_len = n.next_power_of_two() * self.settings.lag_padding.max(1);

        // the planner caches plans by length
        let plan = self.planner.plan_fft_forward(fft_len);

        self.scratch.clear();
        self.scratch.extend_from_slice(spectrum);
        self.scratch.resize(fft_len, Complex::new(0.0, 0.0));
        plan.process(&mut self.scratch);

        let magnitudes: Vec<f64> = self.scratch.iter().map(|x| x.norm()).collect();
        let peak = magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);

        let below = magnitudes[(peak + fft_len - 1) % fft_len];
        let above = magnitudes[(peak + 1) % fft_len];
        let offset = parabolic_offset(below, magnitudes[peak], above);

        // Bins past the midpoint are negative lags
        let signed_peak = if peak > fft_len / 2 {
            peak as f64 - fft_len as f64
        } else {
            peak as f64
        };
        let lag = signed_peak + offset;

        let bin = 1.0 / (fft_len as f64 * df);
        let coarse = lag * bin;
        let delay = polish(spectrum, df, coarse - bin, coarse + bin);
        DelayEstimate {
            delay,
            quality: coherence(spectrum, delay, df),
        }
    }
}

/// Unwrap phases in place, correcting by 2π whenever adjacent raw values
/// jump by more than `threshold`.
pub fn unwrap_phase(phases: &mut [f64], threshold: f64) {
    let Some(&first) = phases.first() else {
        return;
    };
    let mut offset = 0.0;
    let mut raw_prev = first;
    for phase in phases.iter_mut().skip(1) {
        let raw = *phase;
        let diff = raw - raw_prev;
        if diff > threshold {
            offset -= 2.0 * PI;
        } else if diff < -threshold {
            offset += 2.0 * PI;
        }
        *phase += offset;
        raw_prev = raw;
    }
}

/// Least-squares slope of `y` against `x`.
fn fit_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let (sxy, sxx) = x
        .iter()
        .zip(y)
        .fold((0.0, 0.0), |(sxy, sxx), (&xi, &yi)| {
            let dx = xi - mean_x;
            (sxy + dx * (yi - mean_y), sxx + dx * dx)
        });
    if sxx == 0.0 {
        0.0
    } else {
        sxy / sxx
    }
}

/// Vertex of the parabola through three equally spaced samples, relative to
/// the middle one.
fn parabolic_offset(below: f64, peak: f64, above: f64) -> f64 {
    let denom = below - 2.0 * peak + above;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (0.5 * (below - above) / denom).clamp(-0.5, 0.5)
}

/// Golden-section search for the coherence maximum in `[lo, hi]`.
fn polish(spectrum: &[Complex<f64>], df: f64, mut lo: f64, mut hi: f64) -> f64 {
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let mut left = hi - ratio * (hi - lo);
    let mut right = lo + ratio * (hi - lo);
    let mut f_left = coherence(spectrum, left, df);
    let mut f_right = coherence(spectrum, right, df);
    for _ in 0..POLISH_ITERATIONS {
        if f_left < f_right {
            lo = left;
            left = right;
            f_left = f_right;
            right = lo + ratio * (hi - lo);
            f_right = coherence(spectrum, right, df);
        } else {
            hi = right;
            right = left;
            f_right = f_left;
            left = hi - ratio * (hi - lo);
            f_left = coherence(spectrum, left, df);
        }
    }
    0.5 * (lo + hi)
}

/// Coherence of `spectrum` after derotating by delay `tau`.
#[must_use]
pub fn coherence(spectrum: &[Complex<f64>], tau: f64, channel_spacing_hz: f64) -> f64 {
    let total: f64 = spectrum.iter().map(|x| x.norm()).sum();
    if total == 0.0 {
        return 1.0;
    }
    let step = -2.0 * PI * channel_spacing_hz * tau;
    let derotated: Complex<f64> = spectrum
        .iter()
        .enumerate()
        .map(|(k, x)| x * Complex::from_polar(1.0, step * k as f64))
        .sum();
    (derotated.norm() / total).min(1.0)
}
