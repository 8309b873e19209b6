//! Fixed-capacity sample buffer pool with antenna-set matching.
//!
//! Ingest threads (one per antenna/channel feed) claim a free buffer, fill
//! its payload with complex samples, and publish it together with a header
//! naming the antenna, channel and beam it belongs to. A single matcher
//! thread blocks until every antenna has published a buffer for the same
//! (channel, beam) key and then receives the whole antenna-set at once.
//!
//! - [`SampleBufferPool`]: the pool itself, one mutex + condition variable
//!   guarding the state vector, the free-list and the [`ReadyIndex`]
//! - [`FillSlot`]: exclusive write access to a buffer in `BeingFilled`
//! - [`BufferSet`]: exclusive read access to a matched antenna-set in
//!   `BeingProcessed`
//!
//! # State Machine
//!
//! ```text
//!   Free ──get_buffer_to_fill──▶ BeingFilled ──buffer_filled──▶ Ready
//!    ▲                              │ (bad header / dropped guard)  │
//!    │◀─────────────────────────────┘                               │
//!    │                                                  get_filled_buffers
//!    │                                                              ▼
//!    └────────────────release_buffers─────────────────── BeingProcessed
//! ```
//!
//! The sum of buffers over the four states always equals the pool capacity,
//! and a buffer id appears in the ready index only while it is `Ready`.
//!
//! # Safety Model
//!
//! Payload storage lives in `UnsafeCell`s outside the lock. Only the state
//! vector and the ready index are locked; a payload is touched only by the
//! single holder of its `BeingFilled` or `BeingProcessed` state, so payload
//! reads and writes need no lock once the buffer is claimed. The lock
//! release in `buffer_filled` and the lock acquire in `get_filled_buffers`
//! order the producer's writes before the consumer's reads.
//!
//! # Example
//!
//! ```
//! use corr_pool::{BufferHeader, PoolDimensions, SampleBufferPool};
//!
//! let pool = SampleBufferPool::new(PoolDimensions {
//!     antennas: 2,
//!     channels: 1,
//!     beams: 1,
//!     samples_per_buffer: 8,
//!     oversubscription: 2,
//! });
//!
//! for antenna in 0..2 {
//!     let mut slot = pool.get_buffer_to_fill().unwrap();
//!     slot.samples_mut().fill(num_complex::Complex::new(1.0, 0.0));
//!     let header = BufferHeader { antenna, channel: 0, beam: 0, control_word: 0 };
//!     pool.buffer_filled(slot, header).unwrap();
//! }
//!
//! let set = pool.get_filled_buffers().unwrap();
//! assert_eq!(set.samples(1).unwrap().len(), 8);
//! pool.release_buffers(set).unwrap();
//! assert_eq!(pool.state_counts().free, 4);
//! ```

pub mod ready_index;
pub mod sample_pool;

pub use ready_index::ReadyIndex;
pub use sample_pool::{BufferSet, FillSlot, PoolStats, SampleBufferPool};

use thiserror::Error;

/// Identity of a buffer: its slot index in the pool.
pub type BufferId = usize;

/// Lifecycle state of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Available for an ingest thread to claim.
    Free,
    /// Claimed by an ingest thread; payload being written.
    BeingFilled,
    /// Payload complete and registered in the ready index.
    Ready,
    /// Claimed by the matcher as part of a [`BufferSet`].
    BeingProcessed,
}

/// Metadata published with a filled buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferHeader {
    /// Antenna the samples came from.
    pub antenna: u32,
    /// Channel (card) index.
    pub channel: u32,
    /// Beam index.
    pub beam: u32,
    /// Opaque per-antenna control state carried through to monitoring.
    pub control_word: u32,
}

/// A (channel, beam) partition of the matching index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// Channel index.
    pub channel: usize,
    /// Beam index.
    pub beam: usize,
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}/beam{}", self.channel, self.beam)
    }
}

/// Static shape of the pool, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDimensions {
    /// Number of antennas that make up a complete set.
    pub antennas: usize,
    /// Number of channels (cards).
    pub channels: usize,
    /// Number of beams.
    pub beams: usize,
    /// Complex samples per buffer payload.
    pub samples_per_buffer: usize,
    /// Buffers per (antenna, channel, beam) combination.
    pub oversubscription: usize,
}

impl PoolDimensions {
    /// Number of (channel, beam) partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.channels * self.beams
    }

    /// Pool capacity: every antenna/channel/beam combination times the
    /// oversubscription factor.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.antennas * self.channels * self.beams * self.oversubscription
    }

    /// Whether a header addresses a cell inside the configured bounds.
    #[must_use]
    pub fn contains(&self, header: &BufferHeader) -> bool {
        (header.antenna as usize) < self.antennas
            && (header.channel as usize) < self.channels
            && (header.beam as usize) < self.beams
    }
}

/// Per-state buffer counts taken atomically under the pool lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Buffers in [`BufferState::Free`].
    pub free: usize,
    /// Buffers in [`BufferState::BeingFilled`].
    pub being_filled: usize,
    /// Buffers in [`BufferState::Ready`].
    pub ready: usize,
    /// Buffers in [`BufferState::BeingProcessed`].
    pub being_processed: usize,
}

impl StateCounts {
    /// Sum over all four states; always equals the pool capacity.
    #[must_use]
    pub fn total(&self) -> usize {
        self.free + self.being_filled + self.ready + self.being_processed
    }
}

/// Coordination contract violations.
///
/// Exhaustion and malformed headers are not errors; they are reported
/// through `None` and [`FillOutcome::Dropped`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A buffer was not in the state an operation requires.
    #[error("buffer {id} is {actual:?}, expected {expected:?}")]
    InvalidTransition {
        /// Offending buffer.
        id: BufferId,
        /// Required source state.
        expected: BufferState,
        /// State found.
        actual: BufferState,
    },

    /// A buffer id outside the pool.
    #[error("buffer {id} does not exist (capacity {capacity})")]
    UnknownBuffer {
        /// Offending id.
        id: BufferId,
        /// Pool capacity.
        capacity: usize,
    },
}

/// Result of publishing a filled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The buffer is `Ready` and registered in the ready index.
    Registered,
    /// The header was out of range; the buffer went back to `Free`.
    Dropped,
}
