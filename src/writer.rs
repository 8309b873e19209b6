//! Writer worker: drains finished beam records in FIFO order.
//!
//! For every record the worker
//! 1. forwards it, with geometry, to the [`VisibilitySink`],
//! 2. estimates delay and quality per baseline and logs both at debug,
//! 3. starts or continues the history cycle for the record's timestamp and
//!    records one cell per baseline,
//! 4. overwrites the beam's spectrum snapshot file.
//!
//! Sink and snapshot failures are counted and logged; the worker keeps
//! going. [`WriterHandle::stop`] closes the queue, lets the worker drain
//! every record already submitted, and joins it.

use crate::delay::DelayEstimator;
use crate::error::{CorrError, CorrResult};
use crate::pipeline::PipelineContext;
use crate::sink::{BeamRecord, GeometryProvider, VisibilitySink};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, info_span, warn};

/// Writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Records fully processed.
    pub written: u64,
    /// Records the sink rejected.
    pub sink_errors: u64,
    /// Snapshot files that could not be written.
    pub snapshot_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    sink_errors: AtomicU64,
    snapshot_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            written: self.written.load(Ordering::SeqCst),
            sink_errors: self.sink_errors.load(Ordering::SeqCst),
            snapshot_errors: self.snapshot_errors.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct QueueState {
    records: VecDeque<BeamRecord>,
    closed: bool,
}

/// Hand-off queue between the correlator and the writer.
#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Queue {
    fn push(&self, record: BeamRecord) -> CorrResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CorrError::WriterStopped);
        }
        state.records.push_back(record);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Next record, or `None` once closed and empty.
    fn pop(&self) -> Option<BeamRecord> {
        let mut state = self.state.lock();
        loop {
            if let Some(record) = state.records.pop_front() {
                return Some(record);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }
}

/// Submits records to a running writer. Cheap to clone.
#[derive(Clone)]
pub struct RecordSender {
    queue: Arc<Queue>,
}

impl RecordSender {
    /// Queue a record. Fails with [`CorrError::WriterStopped`] after stop.
    pub fn submit(&self, record: BeamRecord) -> CorrResult<()> {
        self.queue.push(record)
    }
}

/// The worker thread's state.
pub struct WriterWorker {
    context: Arc<PipelineContext>,
    sink: Box<dyn VisibilitySink>,
    geometry: Box<dyn GeometryProvider>,
    estimator: DelayEstimator,
    counters: Arc<Counters>,
}

/// Owner of a running writer thread.
pub struct WriterHandle {
    queue: Arc<Queue>,
    counters: Arc<Counters>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriterWorker {
    /// Start the writer on its own thread.
    pub fn spawn(
        context: Arc<PipelineContext>,
        sink: Box<dyn VisibilitySink>,
        geometry: Box<dyn GeometryProvider>,
    ) -> CorrResult<WriterHandle> {
        let queue = Arc::new(Queue::default());
        let counters = Arc::new(Counters::default());
        let mut worker = WriterWorker {
            estimator: DelayEstimator::new(context.estimator),
            context,
            sink,
            geometry,
            counters: Arc::clone(&counters),
        };

        let worker_queue = Arc::clone(&queue);
        let span = info_span!("corr_writer");
        let thread = thread::Builder::new()
            .name("corr-writer".to_string())
            .spawn(move || {
                let _span = span.enter();
                info!("Writer started");
                while let Some(record) = worker_queue.pop() {
                    worker.process(&record);
                }
                debug!("Writer queue drained");
            })?;

        Ok(WriterHandle {
            queue,
            counters,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn process(&mut self, record: &BeamRecord) {
        let terms = self
            .geometry
            .terms(record.beam, record.timestamp, record.baselines);
        if let Err(e) = self.sink.write(record, &terms) {
            self.counters.sink_errors.fetch_add(1, Ordering::SeqCst);
            warn!(beam = record.beam, error = %e, "Sink rejected record");
        }

        let estimates: Vec<_> = (0..record.baselines)
            .map(|bl| self.estimator.estimate(record.spectrum(bl)))
            .collect();
        for (bl, estimate) in estimates.iter().enumerate() {
            debug!(
                beam = record.beam,
                baseline = bl,
                delay = estimate.delay,
                quality = estimate.quality,
                "Delay estimated"
            );
        }

        {
            let mut history = self.context.history.lock();
            history.advance(record.timestamp);
            for (bl, estimate) in estimates.iter().enumerate() {
                if let Err(e) = history.record(
                    record.beam,
                    bl,
                    record.channel_mean(bl),
                    estimate.delay,
                    record.control_words[bl],
                ) {
                    error!(beam = record.beam, baseline = bl, error = %e, "History record failed");
                }
            }
        }

        let output = &self.context.config.output;
        let path = snapshot_path(&output.directory, &output.snapshot_prefix, record.beam);
        if let Err(e) = write_snapshot(&path, record) {
            self.counters.snapshot_errors.fetch_add(1, Ordering::SeqCst);
            warn!(path = %path.display(), error = %e, "Snapshot write failed");
        }

        self.counters.written.fetch_add(1, Ordering::SeqCst);
        debug!(
            beam = record.beam,
            timestamp = %record.timestamp,
            partial = record.is_partial(),
            "Record written"
        );
    }
}

impl WriterHandle {
    /// Sender for the correlator thread.
    #[must_use]
    pub fn sender(&self) -> RecordSender {
        RecordSender {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Queue a record.
    pub fn submit(&self, record: BeamRecord) -> CorrResult<()> {
        self.queue.push(record)
    }

    /// Records waiting to be written.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.state.lock().records.len()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }

    /// Stop accepting records, drain the queue and join the thread.
    /// Calling it again is a no-op.
    pub fn stop(&self) -> WriterStats {
        self.queue.close();
        if let Some(handle) = self.thread.lock().take() {
            if let Err(e) = handle.join() {
                error!("Writer thread panicked: {:?}", e);
            }
            let stats = self.stats();
            info!(
                written = stats.written,
                sink_errors = stats.sink_errors,
                snapshot_errors = stats.snapshot_errors,
                "Writer stopped"
            );
        }
        self.stats()
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `<dir>/<prefix>_beam<b>.txt`
#[must_use]
pub fn snapshot_path(directory: &Path, prefix: &str, beam: usize) -> PathBuf {
    directory.join(format!("{prefix}_beam{beam}.txt"))
}

/// Overwrite a beam's spectrum snapshot.
///
/// The table goes to a sibling temporary file first and is renamed over the
/// previous snapshot, so readers never see a half-written file.
pub fn write_snapshot(path: &Path, record: &BeamRecord) -> CorrResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("txt.tmp");
    {
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(BufWriter::new(File::create(&tmp)?));

        let mut header = vec!["channel".to_string()];
        for bl in 0..record.baselines {
            header.push(format!("amp_{bl}"));
            header.push(format!("phase_{bl}"));
        }
        out.write_record(&header)?;

        for ch in 0..record.channels {
            let mut row = vec![ch.to_string()];
            for bl in 0..record.baselines {
                let v = record.visibilities[bl * record.channels + ch];
                row.push(format!("{:.6e}", v.norm()));
                row.push(format!("{:.6}", v.arg()));
            }
            out.write_record(&row)?;
        }
        out.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
