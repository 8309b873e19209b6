//! Synthetic feed for exercising a pipeline without hardware.
//!
//! Every antenna sees the same common noise source. Antenna `a` receives it
//! `a · delay_samples` samples late, and its channel `ch` is additionally
//! rotated by `exp(-i·2π·ch·Δf·a·residual_delay_s)`, so baseline (a, b)
//! carries an integer lag of `(b − a) · delay_samples` and a residual delay
//! of `(b − a) · residual_delay_s`.
//!
//! One ingest thread runs per antenna. The threads move in lockstep, one
//! integration set at a time, and wait until the correlator has matched a
//! set before publishing the next so no ready buffer is superseded. A thread
//! whose frame is rejected raises an abort flag and still meets the others
//! at the set barrier, where they all stop.

use crate::config::CorrelatorConfig;
use crate::error::{CorrError, CorrResult};
use crate::ingest::{encode_frame, Delivery, IngestPort};
use crate::pipeline::{Pipeline, PipelineReport};
use crate::sink::{GeometryProvider, VisibilitySink};
use corr_pool::BufferHeader;
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const NOISE_AMPLITUDE: f32 = 1000.0;
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Parameters of a simulated run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationOptions {
    /// Integration cycles per beam.
    pub cycles: usize,
    /// Integer sample lag added per antenna index.
    pub delay_samples: i64,
    /// Residual delay in seconds added per antenna index.
    pub residual_delay_s: f64,
    /// Seed of the common noise source.
    pub seed: u64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            cycles: 4,
            delay_samples: 0,
            residual_delay_s: 0.0,
            seed: 0x5EED,
        }
    }
}

/// Outcome of a simulated run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    /// Frames published to the pool.
    pub delivered: u64,
    /// Frames retried because the pool was exhausted.
    pub exhausted: u64,
    /// Pipeline counters after shutdown.
    pub pipeline: PipelineReport,
}

/// Baseline shifts that realign the simulated lags, unless the
/// configuration already sets some.
pub fn align_baseline_delays(config: &mut CorrelatorConfig, delay_samples: i64) {
    if !config.correlator.baseline_delays.is_empty() {
        return;
    }
    let n = config.array.antennas;
    config.correlator.baseline_delays = (0..n)
        .flat_map(|a| ((a + 1)..n).map(move |b| (b - a) as i64 * delay_samples))
        .collect();
}

/// Run a pipeline on synthetic data and shut it down.
pub fn run(
    mut config: CorrelatorConfig,
    options: SimulationOptions,
    sink: Box<dyn VisibilitySink>,
    geometry: Box<dyn GeometryProvider>,
) -> CorrResult<SimulationReport> {
    if options.delay_samples < 0 {
        return Err(CorrError::Configuration(format!(
            "delay_samples must be >= 0, got {}",
            options.delay_samples
        )));
    }
    align_baseline_delays(&mut config, options.delay_samples);

    let antennas = config.array.antennas;
    let sets = options.cycles * config.correlator.integration_buffers;
    let pipeline = Pipeline::start(config, sink, geometry)?;
    info!(
        cycles = options.cycles,
        sets,
        delay_samples = options.delay_samples,
        residual_delay_s = options.residual_delay_s,
        "Simulation started"
    );

    let context = Arc::clone(pipeline.context());
    let feed = Feed::new(&context.config, options, sets);

    thread::scope(|scope| -> CorrResult<()> {
        let workers: Vec<_> = (0..antennas)
            .map(|antenna| {
                let port = pipeline.ingest();
                let feed = &feed;
                thread::Builder::new()
                    .name(format!("corr-ingest-{antenna}"))
                    .spawn_scoped(scope, move || feed.produce(antenna, &port))
            })
            .collect::<Result<_, _>>()?;
        for worker in workers {
            worker
                .join()
                .map_err(|_| CorrError::Configuration("ingest thread panicked".to_string()))??;
        }
        Ok(())
    })?;

    let pipeline = pipeline.shutdown()?;
    Ok(SimulationReport {
        delivered: feed.delivered.load(Ordering::SeqCst),
        exhausted: feed.exhausted.load(Ordering::SeqCst),
        pipeline,
    })
}

/// State shared by the ingest threads of one run.
struct Feed<'a> {
    config: &'a CorrelatorConfig,
    options: SimulationOptions,
    sets: usize,
    barrier: Barrier,
    abort: AtomicBool,
    delivered: AtomicU64,
    exhausted: AtomicU64,
}

impl<'a> Feed<'a> {
    fn new(config: &'a CorrelatorConfig, options: SimulationOptions, sets: usize) -> Self {
        Self {
            config,
            options,
            sets,
            barrier: Barrier::new(config.array.antennas),
            abort: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    fn produce(&self, antenna: usize, port: &IngestPort) -> CorrResult<()> {
        for set in 0..self.sets {
            let published = self.publish_set(antenna, set, port);
            if published.is_err() {
                self.abort.store(true, Ordering::SeqCst);
            }

            self.barrier.wait();
            if self.abort.load(Ordering::SeqCst) {
                debug!(antenna, set, "Ingest aborted");
                return published;
            }
            while port.pending() > 0 {
                thread::sleep(POLL_INTERVAL);
            }
            // nobody publishes set k+1 while another antenna is still
            // polling for set k
            self.barrier.wait();
            debug!(antenna, set, "Set published");
        }
        Ok(())
    }

    /// Deliver one antenna's frames for every (beam, channel) of a set.
    fn publish_set(&self, antenna: usize, set: usize, port: &IngestPort) -> CorrResult<()> {
        let array = &self.config.array;
        let n = array.samples_per_buffer;
        let max_lag = (array.antennas - 1) * self.options.delay_samples as usize;
        let lag = max_lag - antenna * self.options.delay_samples as usize;
        let mut samples = vec![Complex::new(0.0f32, 0.0); n];

        for beam in 0..array.beams {
            for channel in 0..array.channels {
                let noise = self.common_noise(set, channel, beam, n + max_lag);
                let step = -2.0
                    * PI
                    * channel as f64
                    * array.channel_spacing_hz
                    * antenna as f64
                    * self.options.residual_delay_s;
                let rotation = Complex::from_polar(1.0, (step % (2.0 * PI)) as f32);
                for (i, sample) in samples.iter_mut().enumerate() {
                    *sample = noise[i + lag] * rotation;
                }

                let header = BufferHeader {
                    antenna: antenna as u32,
                    channel: channel as u32,
                    beam: beam as u32,
                    control_word: ((set as u32) << 8) | antenna as u32,
                };
                let frame = encode_frame(&header, &samples);
                loop {
                    if self.abort.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    match port.deliver(&frame)? {
                        Delivery::Registered => break,
                        Delivery::Exhausted => {
                            self.exhausted.fetch_add(1, Ordering::Relaxed);
                            thread::sleep(POLL_INTERVAL);
                        }
                        Delivery::Malformed => {
                            return Err(CorrError::Configuration(format!(
                                "simulated frame rejected: {header:?}"
                            )))
                        }
                    }
                }
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// The common signal for one (set, channel, beam), identical for every
    /// antenna thread.
    fn common_noise(&self, set: usize, channel: usize, beam: usize, len: usize) -> Vec<Complex<f32>> {
        let cell = ((set * self.config.array.beams + beam) * self.config.array.channels + channel) as u64;
        let mut rng = StdRng::seed_from_u64(self.options.seed ^ cell.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        (0..len)
            .map(|_| {
                Complex::new(
                    rng.gen_range(-NOISE_AMPLITUDE..NOISE_AMPLITUDE),
                    rng.gen_range(-NOISE_AMPLITUDE..NOISE_AMPLITUDE),
                )
            })
            .collect()
    }
}
