//! # Real-Time Correlator Core
//!
//! This crate is the real-time core of a small software correlator for an
//! interferometric test array. Sample buffers arrive independently per
//! antenna, channel and beam. They are matched into complete antenna-sets,
//! cross-correlated per baseline, integrated into per-beam records, and
//! handed to a writer that estimates delays and keeps a monitoring history.
//!
//! ## Crate Structure
//!
//! - **`corr_pool`** (workspace crate): the `SampleBufferPool`, a fixed
//!   pool of sample buffers with a four-state lifecycle and a
//!   (antenna × channel × beam) matching index.
//! - **`accumulator`**: per-baseline running cross-correlation sums with
//!   integer sample alignment.
//! - **`delay`**: delay and quality estimation from a cross-correlation
//!   spectrum, by phase regression or lag transform.
//! - **`history`**: the bounded circular `MonitorHistory` and its
//!   tab-delimited dump.
//! - **`correlator`**: the matcher thread driving pool → accumulator →
//!   writer.
//! - **`writer`**: the `WriterWorker` thread draining finished records to
//!   the sink, the delay estimator, the history and snapshot files.
//! - **`ingest`**: the ingest frame codec and the producer-side pool port.
//! - **`sink`**: `BeamRecord`, the `VisibilitySink` and `GeometryProvider`
//!   collaborator traits and simple implementations.
//! - **`supervisor`**: per-partition fault quarantine.
//! - **`pipeline`**: `PipelineContext` and pipeline start/shutdown.
//! - **`simulate`**: a synthetic multi-antenna feed.
//! - **`baseline`**, **`config`**, **`error`**, **`logging`**: baseline
//!   numbering, Figment configuration, the `CorrError` type and tracing
//!   setup.

pub mod accumulator;
pub mod baseline;
pub mod config;
pub mod correlator;
pub mod delay;
pub mod error;
pub mod history;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod simulate;
pub mod sink;
pub mod supervisor;
pub mod writer;

pub use corr_pool;
pub use error::{CorrError, CorrResult};
