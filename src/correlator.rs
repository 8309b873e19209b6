//! Correlator worker: the matcher thread between the pool and the writer.
//!
//! The worker blocks in [`SampleBufferPool::get_filled_buffers`], correlates
//! every baseline of the matched set into the (channel, beam) cell's
//! accumulator, and releases the set. A cell is complete after
//! `integration_buffers` sets. Once every channel of a beam is complete the
//! beam's frame is turned into a [`BeamRecord`] and submitted to the writer.
//!
//! Every beam that closes its n-th cycle is stamped with the same timestamp,
//! taken when the first beam closed that cycle, so the history keeps all
//! beams of a cycle in one row. Stamps are kept for at most `history.depth`
//! cycles behind the fastest beam; a beam lagging further is stamped with
//! the time it closes.
//!
//! Faults are confined to their partition: the error is reported to the
//! [`PartitionSupervisor`](crate::supervisor::PartitionSupervisor), and later
//! sets of that partition are released without being read. A quarantined
//! channel no longer holds up its beam; it is flagged in every record.
//!
//! After pool shutdown the worker drains every remaining complete set, then
//! flushes partially integrated frames with their missing channels flagged.

use crate::accumulator::CorrelationAccumulator;
use crate::error::{CorrError, CorrResult};
use crate::pipeline::PipelineContext;
use crate::sink::BeamRecord;
use crate::writer::RecordSender;
use chrono::{DateTime, Utc};
use corr_pool::{BufferSet, PartitionKey, SampleBufferPool};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Correlator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    /// Sets correlated into a cell.
    pub sets_correlated: u64,
    /// Sets released unread because their partition is quarantined.
    pub sets_skipped: u64,
    /// Faults raised while handling sets.
    pub faults: u64,
    /// Records accepted by the writer.
    pub records_submitted: u64,
    /// Records the writer refused.
    pub records_lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sets_correlated: AtomicU64,
    sets_skipped: AtomicU64,
    faults: AtomicU64,
    records_submitted: AtomicU64,
    records_lost: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CorrelatorStats {
        CorrelatorStats {
            sets_correlated: self.sets_correlated.load(Ordering::SeqCst),
            sets_skipped: self.sets_skipped.load(Ordering::SeqCst),
            faults: self.faults.load(Ordering::SeqCst),
            records_submitted: self.records_submitted.load(Ordering::SeqCst),
            records_lost: self.records_lost.load(Ordering::SeqCst),
        }
    }
}

/// Integration state of one (channel, beam).
struct Cell {
    accumulator: CorrelationAccumulator,
    sets: usize,
    control_words: Vec<u32>,
}

/// Integration state of one beam: one cell per channel.
struct BeamFrame {
    cycle: u64,
    cells: Vec<Cell>,
}

impl BeamFrame {
    fn has_data(&self) -> bool {
        self.cells.iter().any(|cell| cell.sets > 0)
    }
}

/// The matcher thread's state.
pub struct CorrelatorWorker {
    context: Arc<PipelineContext>,
    pool: Arc<SampleBufferPool>,
    writer: RecordSender,
    frames: Vec<BeamFrame>,
    delays: Vec<i64>,
    cycle_stamps: BTreeMap<u64, DateTime<Utc>>,
    counters: Arc<Counters>,
}

/// Owner of a running correlator thread.
pub struct CorrelatorHandle {
    thread: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl CorrelatorHandle {
    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        self.counters.snapshot()
    }

    /// Wait for the thread to finish. It only finishes after the pool is
    /// shut down.
    pub fn join(self) -> CorrelatorStats {
        if let Err(e) = self.thread.join() {
            error!("Correlator thread panicked: {:?}", e);
        }
        self.counters.snapshot()
    }
}

impl CorrelatorWorker {
    /// Build the worker without starting a thread.
    #[must_use]
    pub fn new(
        context: Arc<PipelineContext>,
        pool: Arc<SampleBufferPool>,
        writer: RecordSender,
    ) -> Self {
        let array = &context.config.array;
        let delays = context.config.baseline_delays();
        let frames = (0..array.beams)
            .map(|_| BeamFrame {
                cycle: 0,
                cells: (0..array.channels)
                    .map(|_| {
                        let mut accumulator = CorrelationAccumulator::new(delays.len());
                        accumulator.reset(&delays);
                        Cell {
                            accumulator,
                            sets: 0,
                            control_words: vec![0; array.antennas],
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            context,
            pool,
            writer,
            frames,
            delays,
            cycle_stamps: BTreeMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start the worker on its own thread.
    pub fn spawn(
        context: Arc<PipelineContext>,
        pool: Arc<SampleBufferPool>,
        writer: RecordSender,
    ) -> CorrResult<CorrelatorHandle> {
        let worker = Self::new(context, pool, writer);
        let counters = Arc::clone(&worker.counters);
        let thread = thread::Builder::new()
            .name("corr-matcher".to_string())
            .spawn(move || worker.run())?;
        Ok(CorrelatorHandle { thread, counters })
    }

    /// Process sets until the pool is shut down and drained, then flush.
    pub fn run(mut self) {
        info!(
            beams = self.frames.len(),
            baselines = self.delays.len(),
            "Correlator started"
        );
        let pool = Arc::clone(&self.pool);
        while let Some(set) = pool.get_filled_buffers() {
            self.handle_set(set);
        }
        self.flush();
        info!("Correlator stopped");
    }

    fn handle_set(&mut self, set: BufferSet<'_>) {
        let key = set.key();
        let supervisor = Arc::clone(&self.context.supervisor);

        if let Err(e) = supervisor.check(key) {
            trace!(error = %e, "Set released unread");
            self.counters.sets_skipped.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.pool.release_buffers(set) {
                self.fault(key, &e.into());
            }
            return;
        }

        let correlated = self.correlate(&set);
        if let Err(e) = self.pool.release_buffers(set) {
            self.fault(key, &e.into());
            return;
        }
        match correlated {
            Ok(()) => {
                self.counters.sets_correlated.fetch_add(1, Ordering::SeqCst);
                self.close_beam_if_complete(key.beam);
            }
            Err(e) => {
                self.fault(key, &e);
                // the faulted channel is now skipped; the beam may be done
                self.close_beam_if_complete(key.beam);
            }
        }
    }

    fn correlate(&mut self, set: &BufferSet<'_>) -> CorrResult<()> {
        let key = set.key();
        let antennas = set.antennas();
        let Some(cell) = self
            .frames
            .get_mut(key.beam)
            .and_then(|frame| frame.cells.get_mut(key.channel))
        else {
            return Err(CorrError::Configuration(format!(
                "no integration cell for {key}"
            )));
        };

        for (bl, pair) in self.context.baselines.iter() {
            let a = set.samples(pair.a).ok_or(CorrError::UnmappedAntenna {
                antenna: pair.a,
                count: antennas,
            })?;
            let b = set.samples(pair.b).ok_or(CorrError::UnmappedAntenna {
                antenna: pair.b,
                count: antennas,
            })?;
            cell.accumulator.accumulate(bl, a, b, a.len())?;
        }
        for (antenna, word) in cell.control_words.iter_mut().enumerate() {
            if let Some(header) = set.header(antenna) {
                *word = header.control_word;
            }
        }
        cell.sets += 1;
        Ok(())
    }

    /// Quarantine the partition on a coordination fault. Anything else
    /// only costs the current set.
    fn fault(&self, key: PartitionKey, err: &CorrError) {
        self.counters.faults.fetch_add(1, Ordering::SeqCst);
        if err.is_invariant_violation() {
            self.context.supervisor.report(key, err);
        } else {
            warn!(channel = key.channel, beam = key.beam, error = %err, "Set dropped");
        }
    }

    fn channel_done(&self, beam: usize, channel: usize, cell: &Cell) -> bool {
        cell.sets >= self.context.config.correlator.integration_buffers
            || self
                .context
                .supervisor
                .is_quarantined(PartitionKey { channel, beam })
    }

    fn close_beam_if_complete(&mut self, beam: usize) {
        let Some(frame) = self.frames.get(beam) else {
            return;
        };
        let complete = frame.has_data()
            && frame
                .cells
                .iter()
                .enumerate()
                .all(|(channel, cell)| self.channel_done(beam, channel, cell));
        if complete {
            self.close_beam(beam);
        }
    }

    /// Turn a beam's frame into a record, submit it, and start the next
    /// cycle.
    fn close_beam(&mut self, beam: usize) {
        let context = Arc::clone(&self.context);
        let baselines = &context.baselines;
        let quarantined: Vec<bool> = (0..self.frames[beam].cells.len())
            .map(|channel| {
                context
                    .supervisor
                    .is_quarantined(PartitionKey { channel, beam })
            })
            .collect();

        let cycle = self.frames[beam].cycle;
        let timestamp = self.cycle_stamp(beam, cycle);
        let frame = &mut self.frames[beam];
        let channels = frame.cells.len();
        let mut record = BeamRecord::new(beam, timestamp, baselines.len(), channels);

        let mut control_from: Option<usize> = None;
        for (channel, cell) in frame.cells.iter_mut().enumerate() {
            if cell.sets > 0 && !quarantined[channel] {
                for (bl, _) in baselines.iter() {
                    if let Ok(Some(mean)) = cell.accumulator.mean(bl) {
                        record.visibilities[bl * channels + channel] = mean;
                        record.flags[bl * channels + channel] = false;
                    }
                }
                control_from.get_or_insert(channel);
            }
            cell.accumulator.reset(&self.delays);
            cell.sets = 0;
        }
        if let Some(channel) = control_from {
            let words = &frame.cells[channel].control_words;
            for (bl, pair) in baselines.iter() {
                record.control_words[bl] = words[pair.a];
            }
        }
        frame.cycle += 1;

        let floor = self.stamp_floor();
        self.cycle_stamps.retain(|&c, _| c >= floor);

        debug!(beam, cycle, partial = record.is_partial(), "Beam cycle closed");
        match self.writer.submit(record) {
            Ok(()) => {
                self.counters.records_submitted.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                self.counters.records_lost.fetch_add(1, Ordering::SeqCst);
                warn!(beam, cycle, error = %e, "Record not accepted by writer");
            }
        }
    }

    /// Shared timestamp of `cycle`, taken now if no beam has closed it yet
    /// or if its stamp has already been pruned.
    fn cycle_stamp(&mut self, beam: usize, cycle: u64) -> DateTime<Utc> {
        if let Some(&stamp) = self.cycle_stamps.get(&cycle) {
            return stamp;
        }
        let stamp = Utc::now();
        if cycle >= self.stamp_floor() {
            self.cycle_stamps.insert(cycle, stamp);
        } else {
            debug!(beam, cycle, "Beam lags behind the shared cycle stamps");
        }
        stamp
    }

    /// Oldest cycle whose stamp is still kept.
    fn stamp_floor(&self) -> u64 {
        let depth = self.context.config.history.depth as u64;
        let oldest = self.frames.iter().map(|f| f.cycle).min().unwrap_or(0);
        let newest = self.frames.iter().map(|f| f.cycle).max().unwrap_or(0);
        oldest.max(newest.saturating_sub(depth))
    }

    /// Submit every partially integrated frame.
    fn flush(&mut self) {
        for beam in 0..self.frames.len() {
            if self.frames[beam].has_data() {
                debug!(beam, "Flushing partial frame");
                self.close_beam(beam);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorrelatorConfig;
    use crate::ingest::{encode_frame, IngestPort};
    use crate::sink::{MemorySink, ZeroGeometry};
    use crate::writer::WriterWorker;
    use corr_pool::BufferHeader;
    use num_complex::Complex;
    use std::time::Duration;

    struct Rig {
        context: Arc<PipelineContext>,
        pool: Arc<SampleBufferPool>,
        sink: MemorySink,
        writer: crate::writer::WriterHandle,
    }

    fn rig(channels: usize, beams: usize, integration_buffers: usize) -> (Rig, tempfile::TempDir) {
        rig_with_depth(channels, beams, integration_buffers, 256)
    }

    fn rig_with_depth(
        channels: usize,
        beams: usize,
        integration_buffers: usize,
        history_depth: usize,
    ) -> (Rig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CorrelatorConfig::default();
        config.history.depth = history_depth;
        config.array.antennas = 3;
        config.array.channels = channels;
        config.array.beams = beams;
        config.array.samples_per_buffer = 4;
        config.correlator.integration_buffers = integration_buffers;
        config.output.directory = dir.path().to_path_buf();
        let context = PipelineContext::new(config).unwrap();
        let pool = Arc::new(SampleBufferPool::new(context.config.pool_dimensions()));
        let sink = MemorySink::new();
        let writer = WriterWorker::spawn(
            Arc::clone(&context),
            Box::new(sink.clone()),
            Box::new(ZeroGeometry),
        )
        .unwrap();
        (
            Rig {
                context,
                pool,
                sink,
                writer,
            },
            dir,
        )
    }

    fn deliver_set(port: &IngestPort, channel: u32, beam: u32, value: f32) {
        for antenna in 0..3 {
            let header = BufferHeader {
                antenna,
                channel,
                beam,
                control_word: 10 * (antenna + 1),
            };
            let frame = encode_frame(&header, &[Complex::new(value, 0.0); 4]);
            port.deliver(&frame).unwrap();
        }
        // a second set for the same cell must not supersede this one
        while port.pending() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Publish one set without waiting for a matcher.
    fn deliver_unmatched(port: &IngestPort, channel: u32, beam: u32, value: f32) {
        for antenna in 0..3 {
            let header = BufferHeader {
                antenna,
                channel,
                beam,
                control_word: antenna,
            };
            let frame = encode_frame(&header, &[Complex::new(value, 0.0); 4]);
            port.deliver(&frame).unwrap();
        }
    }

    #[test]
    fn test_integration_closes_beam_after_all_channels() {
        let (rig, _dir) = rig(2, 1, 2);
        let port = IngestPort::new(Arc::clone(&rig.pool));
        let handle = CorrelatorWorker::spawn(
            Arc::clone(&rig.context),
            Arc::clone(&rig.pool),
            rig.writer.sender(),
        )
        .unwrap();

        deliver_set(&port, 0, 0, 1.0);
        deliver_set(&port, 1, 0, 2.0);
        deliver_set(&port, 0, 0, 3.0);
        deliver_set(&port, 1, 0, 4.0);

        rig.pool.shutdown();
        let stats = handle.join();
        rig.writer.stop();

        assert_eq!(stats.sets_correlated, 4);
        assert_eq!(stats.records_submitted, 1);
        let records = rig.sink.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(!record.is_partial());
        // mean of 1·1 and 3·3 on channel 0, 2·2 and 4·4 on channel 1
        assert_eq!(record.spectrum(0), &[Complex::new(5.0, 0.0), Complex::new(10.0, 0.0)]);
        // baseline 2 is (1, 2): control word of antenna 1
        assert_eq!(record.control_words, vec![10, 10, 20]);
    }

    #[test]
    fn test_shutdown_flushes_partial_frame() {
        let (rig, _dir) = rig(3, 1, 1);
        let port = IngestPort::new(Arc::clone(&rig.pool));
        let handle = CorrelatorWorker::spawn(
            Arc::clone(&rig.context),
            Arc::clone(&rig.pool),
            rig.writer.sender(),
        )
        .unwrap();

        deliver_set(&port, 2, 0, 1.0);
        rig.pool.shutdown();
        handle.join();
        rig.writer.stop();

        let records = rig.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].baseline_flags(0), &[true, true, false]);
    }

    #[test]
    fn test_beams_of_a_cycle_share_timestamp() {
        let (rig, _dir) = rig(1, 2, 1);
        let port = IngestPort::new(Arc::clone(&rig.pool));
        let handle = CorrelatorWorker::spawn(
            Arc::clone(&rig.context),
            Arc::clone(&rig.pool),
            rig.writer.sender(),
        )
        .unwrap();

        deliver_set(&port, 0, 0, 1.0);
        deliver_set(&port, 0, 1, 1.0);
        deliver_set(&port, 0, 0, 1.0);
        rig.pool.shutdown();
        handle.join();
        rig.writer.stop();

        let records = rig.sink.records();
        assert_eq!(records.len(), 3);
        let beam0: Vec<_> = records.iter().filter(|r| r.beam == 0).collect();
        let beam1: Vec<_> = records.iter().filter(|r| r.beam == 1).collect();
        assert_eq!(beam0[0].timestamp, beam1[0].timestamp);
        assert!(beam0[1].timestamp >= beam0[0].timestamp);
    }

    #[test]
    fn test_quarantined_partition_is_skipped_and_flagged() {
        let (rig, _dir) = rig(2, 1, 1);
        let port = IngestPort::new(Arc::clone(&rig.pool));
        rig.context
            .supervisor
            .report(PartitionKey { channel: 1, beam: 0 }, &CorrError::WriterStopped);
        let handle = CorrelatorWorker::spawn(
            Arc::clone(&rig.context),
            Arc::clone(&rig.pool),
            rig.writer.sender(),
        )
        .unwrap();

        deliver_set(&port, 1, 0, 1.0);
        deliver_set(&port, 0, 0, 2.0);
        rig.pool.shutdown();
        let stats = handle.join();
        rig.writer.stop();

        assert_eq!(stats.sets_skipped, 1);
        assert_eq!(stats.sets_correlated, 1);
        let records = rig.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].baseline_flags(0), &[false, true]);
        assert_eq!(rig.pool.state_counts().free, rig.pool.capacity());
    }

    #[test]
    fn test_silent_beam_keeps_cycle_stamps_bounded() {
        let (rig, _dir) = rig_with_depth(1, 2, 1, 8);
        let port = IngestPort::new(Arc::clone(&rig.pool));
        let mut worker = CorrelatorWorker::new(
            Arc::clone(&rig.context),
            Arc::clone(&rig.pool),
            rig.writer.sender(),
        );

        for _ in 0..200 {
            deliver_unmatched(&port, 0, 0, 1.0);
            let set = rig.pool.get_filled_buffers().unwrap();
            worker.handle_set(set);
            assert!(worker.cycle_stamps.len() <= 9);
        }
        assert_eq!(worker.frames[0].cycle, 200);

        // beam 1 finally closes its first cycle long after beam 0 did
        deliver_unmatched(&port, 0, 1, 1.0);
        let set = rig.pool.get_filled_buffers().unwrap();
        worker.handle_set(set);
        drop(worker);
        rig.writer.stop();

        let records = rig.sink.records();
        assert_eq!(records.len(), 201);
        let newest_beam0 = records
            .iter()
            .filter(|r| r.beam == 0)
            .map(|r| r.timestamp)
            .max()
            .unwrap();
        let beam1 = records.iter().find(|r| r.beam == 1).unwrap();
        assert!(beam1.timestamp >= newest_beam0);
    }

    #[test]
    fn test_only_invariant_violations_quarantine() {
        let (rig, _dir) = rig(1, 1, 1);
        let worker = CorrelatorWorker::new(
            Arc::clone(&rig.context),
            Arc::clone(&rig.pool),
            rig.writer.sender(),
        );
        let key = PartitionKey { channel: 0, beam: 0 };

        worker.fault(key, &CorrError::Configuration("no cell".to_string()));
        assert!(!rig.context.supervisor.is_quarantined(key));

        worker.fault(key, &CorrError::UnmappedAntenna { antenna: 5, count: 3 });
        assert!(rig.context.supervisor.is_quarantined(key));
        assert_eq!(worker.counters.snapshot().faults, 2);
    }
}
