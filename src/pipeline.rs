//! Pipeline assembly and lifecycle.
//!
//! ```text
//! ingest threads ──IngestPort──▶ SampleBufferPool ──▶ correlator ──RecordSender──▶ writer
//!                                                         │                         │
//!                                                  PartitionSupervisor       MonitorHistory
//! ```
//!
//! Shared state travels in a [`PipelineContext`] handed to each worker at
//! construction; nothing lives in process-wide statics.

use crate::baseline::BaselineTable;
use crate::config::CorrelatorConfig;
use crate::correlator::{CorrelatorHandle, CorrelatorStats, CorrelatorWorker};
use crate::delay::EstimatorSettings;
use crate::error::CorrResult;
use crate::history::MonitorHistory;
use crate::ingest::IngestPort;
use crate::sink::{GeometryProvider, VisibilitySink};
use crate::supervisor::{PartitionFault, PartitionSupervisor};
use crate::writer::{WriterHandle, WriterStats, WriterWorker};
use corr_pool::{PoolStats, SampleBufferPool, StateCounts};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// State shared by every worker of one pipeline.
#[derive(Debug)]
pub struct PipelineContext {
    /// Validated configuration.
    pub config: CorrelatorConfig,
    /// Monitoring history, written by the writer and read by diagnostics.
    pub history: Arc<Mutex<MonitorHistory>>,
    /// Partition fault tracking.
    pub supervisor: Arc<PartitionSupervisor>,
    /// Baseline numbering.
    pub baselines: BaselineTable,
    /// Delay estimator parameters.
    pub estimator: EstimatorSettings,
}

impl PipelineContext {
    /// Validate `config` and build the shared state.
    pub fn new(config: CorrelatorConfig) -> CorrResult<Arc<Self>> {
        config.validate()?;
        let baselines = BaselineTable::new(config.array.antennas);
        let history = MonitorHistory::new(config.history.depth, config.history.max_beams, baselines.len());
        let estimator = EstimatorSettings {
            mode: config.delay.mode,
            channel_spacing_hz: config.array.channel_spacing_hz,
            unwrap_threshold: config.delay.unwrap_threshold_rad,
            lag_padding: config.delay.lag_padding,
        };
        Ok(Arc::new(Self {
            config,
            history: Arc::new(Mutex::new(history)),
            supervisor: Arc::new(PartitionSupervisor::new()),
            baselines,
            estimator,
        }))
    }
}

/// Final counters of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Pool drop and match counters.
    pub pool: PoolStats,
    /// Buffer states after shutdown.
    pub pool_states: StateCounts,
    /// Correlator counters.
    pub correlator: CorrelatorStats,
    /// Writer counters.
    pub writer: WriterStats,
    /// Partitions quarantined during the run.
    pub faults: Vec<PartitionFault>,
}

/// A running pool, correlator and writer.
pub struct Pipeline {
    context: Arc<PipelineContext>,
    pool: Arc<SampleBufferPool>,
    correlator: Option<CorrelatorHandle>,
    writer: Option<WriterHandle>,
}

impl Pipeline {
    /// Build the pool and start the writer and correlator threads.
    pub fn start(
        config: CorrelatorConfig,
        sink: Box<dyn VisibilitySink>,
        geometry: Box<dyn GeometryProvider>,
    ) -> CorrResult<Self> {
        let context = PipelineContext::new(config)?;
        let pool = Arc::new(SampleBufferPool::new(context.config.pool_dimensions()));
        let writer = WriterWorker::spawn(Arc::clone(&context), sink, geometry)?;
        let correlator =
            CorrelatorWorker::spawn(Arc::clone(&context), Arc::clone(&pool), writer.sender())?;

        info!(
            name = %context.config.application.name,
            antennas = context.config.array.antennas,
            channels = context.config.array.channels,
            beams = context.config.array.beams,
            baselines = context.baselines.len(),
            "Pipeline started"
        );
        Ok(Self {
            context,
            pool,
            correlator: Some(correlator),
            writer: Some(writer),
        })
    }

    /// A producer port for an ingest thread.
    #[must_use]
    pub fn ingest(&self) -> IngestPort {
        IngestPort::new(Arc::clone(&self.pool))
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// The buffer pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<SampleBufferPool> {
        &self.pool
    }

    /// Drain and stop every worker, then write the history table.
    pub fn shutdown(mut self) -> CorrResult<PipelineReport> {
        let report = self.stop_workers();
        let path = self.context.config.history_path();
        self.context.history.lock().dump_to_file(&path)?;
        info!(
            path = %path.display(),
            sets = report.correlator.sets_correlated,
            records = report.writer.written,
            faults = report.faults.len(),
            "Pipeline shut down"
        );
        Ok(report)
    }

    fn stop_workers(&mut self) -> PipelineReport {
        self.pool.shutdown();
        let correlator = self
            .correlator
            .take()
            .map(CorrelatorHandle::join)
            .unwrap_or_default();
        let writer = self
            .writer
            .take()
            .map(|w| w.stop())
            .unwrap_or_default();

        let pool_states = self.pool.state_counts();
        if pool_states.free != pool_states.total() {
            warn!(?pool_states, "Buffers still claimed after shutdown");
        }
        PipelineReport {
            pool: self.pool.stats(),
            pool_states,
            correlator,
            writer,
            faults: self.context.supervisor.faults(),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.correlator.is_some() || self.writer.is_some() {
            self.stop_workers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CorrError;
    use crate::ingest::{encode_frame, Delivery};
    use crate::sink::{MemorySink, ZeroGeometry};
    use corr_pool::BufferHeader;
    use num_complex::Complex;

    fn config(dir: &std::path::Path) -> CorrelatorConfig {
        let mut config = CorrelatorConfig::default();
        config.array.antennas = 2;
        config.array.channels = 2;
        config.array.samples_per_buffer = 8;
        config.output.directory = dir.to_path_buf();
        config
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        let mut config = CorrelatorConfig::default();
        config.array.channels = 0;
        assert!(matches!(
            PipelineContext::new(config),
            Err(CorrError::Configuration(_))
        ));
    }

    #[test]
    fn test_one_cycle_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let pipeline =
            Pipeline::start(config(dir.path()), Box::new(sink.clone()), Box::new(ZeroGeometry))
                .unwrap();
        let port = pipeline.ingest();

        let samples = [Complex::new(3.0, -4.0); 8];
        for channel in 0..2 {
            for antenna in 0..2 {
                let header = BufferHeader {
                    antenna,
                    channel,
                    beam: 0,
                    control_word: 100 + antenna,
                };
                assert_eq!(
                    port.deliver(&encode_frame(&header, &samples)).unwrap(),
                    Delivery::Registered
                );
            }
        }

        let report = pipeline.shutdown().unwrap();
        assert_eq!(report.correlator.sets_correlated, 2);
        assert_eq!(report.writer.written, 1);
        assert_eq!(report.pool_states.free, report.pool_states.total());
        assert!(report.faults.is_empty());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_partial());
        assert_eq!(records[0].spectrum(0)[1], Complex::new(25.0, 0.0));
        assert_eq!(records[0].control_words, vec![100]);
        assert!(dir.path().join("history.txt").exists());
    }
}
