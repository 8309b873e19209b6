//! End-to-end tests driving the pipeline with the synthetic feed.

use rt_correlator::config::CorrelatorConfig;
use rt_correlator::delay::DelayMode;
use rt_correlator::ingest::{encode_frame, Delivery};
use rt_correlator::pipeline::Pipeline;
use rt_correlator::simulate::{self, SimulationOptions};
use rt_correlator::sink::{MemorySink, NullSink, ZeroGeometry};
use rt_correlator::corr_pool::BufferHeader;
use num_complex::Complex;
use std::path::Path;
use tempfile::TempDir;

/// Mean power of the simulated noise, `2 · 1000² / 3`.
const SIGNAL_POWER: f64 = 666_666.7;

fn create_test_config(dir: &Path) -> CorrelatorConfig {
    let mut config = CorrelatorConfig::default();
    config.array.antennas = 3;
    config.array.channels = 8;
    config.array.beams = 2;
    config.array.samples_per_buffer = 256;
    config.array.channel_spacing_hz = 1.0e6;
    config.correlator.integration_buffers = 2;
    config.history.max_beams = 2;
    config.output.directory = dir.to_path_buf();
    config
}

fn read_history(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .unwrap();
    let header = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (header, rows)
}

fn column(header: &[String], name: &str) -> usize {
    header.iter().position(|c| c == name).unwrap()
}

#[test]
fn test_simulated_run_produces_one_record_per_beam_cycle() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    let sink = MemorySink::new();
    let options = SimulationOptions {
        cycles: 3,
        ..SimulationOptions::default()
    };

    let report = simulate::run(
        config,
        options,
        Box::new(sink.clone()),
        Box::new(ZeroGeometry),
    )
    .unwrap();

    // 3 antennas × 8 channels × 2 beams × 3 cycles × 2 buffers
    assert_eq!(report.delivered, 288);
    assert_eq!(report.pipeline.pool.sets_matched, 96);
    assert_eq!(report.pipeline.correlator.sets_correlated, 96);
    assert_eq!(report.pipeline.correlator.records_submitted, 6);
    assert_eq!(report.pipeline.writer.written, 6);
    assert!(report.pipeline.faults.is_empty());

    let records = sink.records();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| !r.is_partial()));
    for beam in 0..2 {
        assert_eq!(records.iter().filter(|r| r.beam == beam).count(), 3);
    }
}

#[test]
fn test_buffers_are_conserved_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    let report = simulate::run(
        config,
        SimulationOptions::default(),
        Box::new(NullSink),
        Box::new(ZeroGeometry),
    )
    .unwrap();

    let states = report.pipeline.pool_states;
    assert_eq!(states.free, states.total());
    assert_eq!(states.being_filled + states.ready + states.being_processed, 0);
    assert_eq!(report.pipeline.pool.superseded, 0);
}

#[test]
fn test_aligned_lags_stay_coherent() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    let sink = MemorySink::new();
    let options = SimulationOptions {
        cycles: 2,
        delay_samples: 3,
        ..SimulationOptions::default()
    };

    simulate::run(config, options, Box::new(sink.clone()), Box::new(ZeroGeometry)).unwrap();

    for record in sink.records() {
        for bl in 0..record.baselines {
            for vis in record.spectrum(bl) {
                let ratio = vis.norm() / SIGNAL_POWER;
                assert!(ratio > 0.8 && ratio < 1.2, "baseline {bl}: ratio {ratio}");
            }
        }
    }
}

#[test]
fn test_misaligned_lags_decorrelate() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path());
    // explicit zero shifts keep the feed's lags uncorrected
    config.correlator.baseline_delays = vec![0, 0, 0];
    let sink = MemorySink::new();
    let options = SimulationOptions {
        cycles: 2,
        delay_samples: 2,
        ..SimulationOptions::default()
    };

    simulate::run(config, options, Box::new(sink.clone()), Box::new(ZeroGeometry)).unwrap();

    for record in sink.records() {
        for bl in 0..record.baselines {
            for vis in record.spectrum(bl) {
                assert!(vis.norm() / SIGNAL_POWER < 0.25);
            }
        }
    }
}

#[test]
fn test_history_tracks_residual_delay() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    let history_path = config.history_path();
    let residual = 50.0e-9;
    let options = SimulationOptions {
        cycles: 3,
        delay_samples: 1,
        residual_delay_s: residual,
        ..SimulationOptions::default()
    };

    simulate::run(config, options, Box::new(NullSink), Box::new(ZeroGeometry)).unwrap();

    let (header, rows) = read_history(&history_path);
    assert_eq!(rows.len(), 3, "one row per cycle shared by both beams");

    // baselines (0,1), (0,2), (1,2)
    let expected = [residual, 2.0 * residual, residual];
    for row in &rows {
        for beam in 0..2 {
            for (bl, want) in expected.iter().enumerate() {
                let got: f64 = row[column(&header, &format!("delay_b{beam}_bl{bl}"))]
                    .parse()
                    .unwrap();
                assert!(
                    (got - want).abs() < 2.0e-9,
                    "beam {beam} baseline {bl}: {got} vs {want}"
                );
            }
        }
    }
}

#[test]
fn test_history_with_lag_transform() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path());
    config.delay.mode = DelayMode::LagTransform;
    let history_path = config.history_path();
    let residual = 40.0e-9;
    let options = SimulationOptions {
        cycles: 2,
        residual_delay_s: residual,
        ..SimulationOptions::default()
    };

    simulate::run(config, options, Box::new(NullSink), Box::new(ZeroGeometry)).unwrap();

    let (header, rows) = read_history(&history_path);
    assert_eq!(rows.len(), 2);
    let got: f64 = rows[1][column(&header, "delay_b0_bl1")].parse().unwrap();
    assert!((got - 2.0 * residual).abs() < 5.0e-9, "{got}");
}

#[test]
fn test_snapshot_files_written_per_beam() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    simulate::run(
        config,
        SimulationOptions::default(),
        Box::new(NullSink),
        Box::new(ZeroGeometry),
    )
    .unwrap();

    for beam in 0..2 {
        let path = dir.path().join(format!("spectrum_beam{beam}.txt"));
        let text = std::fs::read_to_string(&path).unwrap();
        // header plus one line per channel
        assert_eq!(text.lines().count(), 9);
        assert!(text.starts_with("channel\tamp_0\tphase_0"));
    }
    assert!(!dir.path().join("spectrum_beam0.txt.tmp").exists());
}

#[test]
fn test_shutdown_while_idle() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    let history_path = config.history_path();
    let pipeline = Pipeline::start(config, Box::new(NullSink), Box::new(ZeroGeometry)).unwrap();

    let report = pipeline.shutdown().unwrap();
    assert_eq!(report.correlator.sets_correlated, 0);
    assert_eq!(report.writer.written, 0);
    assert_eq!(report.pool_states.free, report.pool_states.total());

    let (header, rows) = read_history(&history_path);
    assert_eq!(header[0], "timestamp");
    assert!(rows.is_empty());
}

#[test]
fn test_port_rejects_out_of_range_frames() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    let samples = vec![Complex::new(5.0f32, -5.0); config.array.samples_per_buffer];
    let pipeline = Pipeline::start(config, Box::new(NullSink), Box::new(ZeroGeometry)).unwrap();
    let port = pipeline.ingest();

    let bad = BufferHeader {
        antenna: 7,
        channel: 0,
        beam: 0,
        control_word: 0,
    };
    assert_eq!(port.deliver(&encode_frame(&bad, &samples)).unwrap(), Delivery::Malformed);
    assert!(port.deliver(&[0u8; 9]).is_err());

    let report = pipeline.shutdown().unwrap();
    assert_eq!(report.pool.malformed_dropped, 1);
    assert_eq!(report.pool_states.free, report.pool_states.total());
}
