//! The sample buffer pool and its access guards.
//!
//! One `parking_lot::Mutex` guards the per-slot state vector, the free-list
//! stack and the ready index; a `Condvar` paired with it wakes matchers when
//! a buffer becomes ready. Payloads are stored outside the lock.

use crate::ready_index::ReadyIndex;
use crate::{
    BufferHeader, BufferId, BufferState, FillOutcome, PartitionKey, PoolDimensions, PoolError,
    StateCounts,
};
use num_complex::Complex;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: BufferState,
    header: BufferHeader,
}

/// Lock-protected coordination state.
struct PoolInner {
    slots: Vec<Slot>,
    /// Stack of `Free` ids; claim and release are O(1).
    free: Vec<BufferId>,
    ready: ReadyIndex,
    /// Partition the next match scan starts from.
    next_partition: usize,
    shutdown: bool,
}

impl PoolInner {
    fn state_of(&self, id: BufferId) -> Result<BufferState, PoolError> {
        self.slots
            .get(id)
            .map(|slot| slot.state)
            .ok_or(PoolError::UnknownBuffer {
                id,
                capacity: self.slots.len(),
            })
    }

    fn expect_state(&self, id: BufferId, expected: BufferState) -> Result<(), PoolError> {
        let actual = self.state_of(id)?;
        if actual == expected {
            Ok(())
        } else {
            Err(PoolError::InvalidTransition {
                id,
                expected,
                actual,
            })
        }
    }

    fn free_slot(&mut self, id: BufferId) {
        self.slots[id].state = BufferState::Free;
        self.free.push(id);
    }
}

/// Snapshot of the pool's drop and match counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Claims refused because no buffer was free.
    pub fills_dropped: u64,
    /// Published buffers dropped for an out-of-range header.
    pub malformed_dropped: u64,
    /// Ready buffers displaced by a newer buffer for the same cell.
    pub superseded: u64,
    /// Complete antenna-sets handed to matchers.
    pub sets_matched: u64,
}

/// Fixed-capacity pool of fixed-size complex sample buffers.
///
/// Share it between threads with `Arc<SampleBufferPool>`.
pub struct SampleBufferPool {
    dims: PoolDimensions,
    inner: Mutex<PoolInner>,
    ready_cond: Condvar,
    payloads: Vec<UnsafeCell<Vec<Complex<f32>>>>,
    fills_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
    superseded: AtomicU64,
    sets_matched: AtomicU64,
}

// SAFETY: SampleBufferPool is Sync because:
// 1. All coordination state is behind `inner`'s mutex
// 2. A payload is only dereferenced through a FillSlot (slot is BeingFilled)
//    or a BufferSet (slot is BeingProcessed)
// 3. Each of those states has exactly one holder, handed out under the lock
// 4. Id-level transitions are crate-private; outside the crate a buffer only
//    changes hands by consuming its guard
// 5. The lock hand-off orders producer writes before consumer reads
unsafe impl Sync for SampleBufferPool {}

impl SampleBufferPool {
    /// Create a pool sized from `dims`, with every buffer `Free`.
    ///
    /// # Panics
    /// Panics if any dimension is 0.
    #[must_use]
    pub fn new(dims: PoolDimensions) -> Self {
        assert!(dims.antennas > 0, "antennas must be > 0");
        assert!(dims.channels > 0, "channels must be > 0");
        assert!(dims.beams > 0, "beams must be > 0");
        assert!(dims.samples_per_buffer > 0, "samples_per_buffer must be > 0");
        assert!(dims.oversubscription > 0, "oversubscription must be > 0");

        let capacity = dims.capacity();
        let slots = vec![
            Slot {
                state: BufferState::Free,
                header: BufferHeader::default(),
            };
            capacity
        ];
        // Reversed so the lowest id is claimed first.
        let free: Vec<BufferId> = (0..capacity).rev().collect();
        let payloads = (0..capacity)
            .map(|_| UnsafeCell::new(vec![Complex::new(0.0, 0.0); dims.samples_per_buffer]))
            .collect();

        info!(
            capacity,
            antennas = dims.antennas,
            channels = dims.channels,
            beams = dims.beams,
            samples_per_buffer = dims.samples_per_buffer,
            "SampleBufferPool created"
        );

        Self {
            dims,
            inner: Mutex::new(PoolInner {
                slots,
                free,
                ready: ReadyIndex::new(dims.antennas, dims.channels, dims.beams),
                next_partition: 0,
                shutdown: false,
            }),
            ready_cond: Condvar::new(),
            payloads,
            fills_dropped: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            sets_matched: AtomicU64::new(0),
        }
    }

    /// Claim a free buffer for filling without blocking.
    ///
    /// Returns `None` when the pool is exhausted or shut down; the caller
    /// should drop the current sample interval.
    #[must_use]
    pub fn get_buffer_to_fill(&self) -> Option<FillSlot<'_>> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return None;
        }
        let Some(id) = inner.free.pop() else {
            drop(inner);
            self.fills_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Pool exhausted, dropping sample interval");
            return None;
        };
        inner.slots[id].state = BufferState::BeingFilled;
        Some(FillSlot {
            pool: self,
            id,
            armed: true,
        })
    }

    /// Publish a filled buffer.
    ///
    /// An out-of-range header sends the buffer back to `Free` and yields
    /// [`FillOutcome::Dropped`]. Otherwise the buffer becomes `Ready`, is
    /// registered in the ready index, and every blocked matcher is woken.
    pub fn buffer_filled(
        &self,
        slot: FillSlot<'_>,
        header: BufferHeader,
    ) -> Result<FillOutcome, PoolError> {
        let id = slot.detach();
        self.buffer_filled_id(id, header)
    }

    /// Id-level form of [`buffer_filled`](Self::buffer_filled). Callers
    /// must have given up the slot's guard first.
    ///
    /// Fails with [`PoolError::InvalidTransition`] unless `id` is
    /// `BeingFilled`.
    pub(crate) fn buffer_filled_id(
        &self,
        id: BufferId,
        header: BufferHeader,
    ) -> Result<FillOutcome, PoolError> {
        let mut inner = self.inner.lock();
        inner.expect_state(id, BufferState::BeingFilled)?;

        if !self.dims.contains(&header) {
            inner.free_slot(id);
            drop(inner);
            self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                buffer_id = id,
                antenna = header.antenna,
                channel = header.channel,
                beam = header.beam,
                "Dropping buffer with out-of-range header"
            );
            return Ok(FillOutcome::Dropped);
        }

        inner.slots[id] = Slot {
            state: BufferState::Ready,
            header,
        };
        let displaced = inner.ready.insert(
            header.antenna as usize,
            header.channel as usize,
            header.beam as usize,
            id,
        );
        if let Some(old) = displaced {
            inner.free_slot(old);
        }
        drop(inner);

        if let Some(old) = displaced {
            self.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(
                buffer_id = old,
                replaced_by = id,
                antenna = header.antenna,
                channel = header.channel,
                beam = header.beam,
                "Ready buffer superseded before it was matched"
            );
        }

        self.ready_cond.notify_all();
        Ok(FillOutcome::Registered)
    }

    /// Block until some (channel, beam) key has a ready buffer from every
    /// antenna, then claim that whole set.
    ///
    /// Returns `None` only after [`shutdown`](Self::shutdown) once no
    /// complete set remains, so consumers drain before exiting.
    pub fn get_filled_buffers(&self) -> Option<BufferSet<'_>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(set) = self.claim_complete(&mut inner) {
                return Some(set);
            }
            if inner.shutdown {
                return None;
            }
            self.ready_cond.wait(&mut inner);
        }
    }

    /// Like [`get_filled_buffers`](Self::get_filled_buffers) but gives up
    /// after `timeout`.
    pub fn get_filled_buffers_timeout(&self, timeout: Duration) -> Option<BufferSet<'_>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(set) = self.claim_complete(&mut inner) {
                return Some(set);
            }
            if inner.shutdown {
                return None;
            }
            if self.ready_cond.wait_until(&mut inner, deadline).timed_out() {
                return self.claim_complete(&mut inner);
            }
        }
    }

    /// Match and claim under the lock; the scan starts after the last
    /// matched partition.
    fn claim_complete(&self, inner: &mut PoolInner) -> Option<BufferSet<'_>> {
        let partition = inner.ready.find_complete(inner.next_partition)?;
        let key = inner.ready.key_at(partition);
        let members = inner.ready.take_partition(partition);

        let mut headers = Vec::with_capacity(members.len());
        for &id in members.iter().flatten() {
            inner.slots[id].state = BufferState::BeingProcessed;
            headers.push(inner.slots[id].header);
        }
        inner.next_partition = (partition + 1) % inner.ready.partitions();
        self.sets_matched.fetch_add(1, Ordering::Relaxed);

        trace!(channel = key.channel, beam = key.beam, "Matched antenna-set");
        Some(BufferSet {
            pool: self,
            key,
            members,
            headers,
        })
    }

    /// Return every member of a matched set to `Free`.
    pub fn release_buffers(&self, mut set: BufferSet<'_>) -> Result<(), PoolError> {
        let members = std::mem::take(&mut set.members);
        self.release_ids(&members)
    }

    /// Id-level release, reached only through a `BufferSet` that gives up
    /// its members.
    ///
    /// Absent members and buffers that are already `Free` are skipped. Any
    /// member in `BeingFilled` or `Ready` fails the whole call with
    /// [`PoolError::InvalidTransition`] before any state changes.
    pub(crate) fn release_ids(&self, ids: &[Option<BufferId>]) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        for &id in ids.iter().flatten() {
            match inner.state_of(id)? {
                BufferState::BeingProcessed | BufferState::Free => {}
                actual => {
                    return Err(PoolError::InvalidTransition {
                        id,
                        expected: BufferState::BeingProcessed,
                        actual,
                    })
                }
            }
        }
        for &id in ids.iter().flatten() {
            if inner.slots[id].state == BufferState::BeingProcessed {
                inner.free_slot(id);
            } else {
                trace!(buffer_id = id, "Buffer already released");
            }
        }
        drop(inner);
        self.ready_cond.notify_all();
        Ok(())
    }

    /// Return a claimed-but-unpublished buffer to `Free`.
    fn abandon_fill(&self, id: BufferId) {
        let mut inner = self.inner.lock();
        match inner.expect_state(id, BufferState::BeingFilled) {
            Ok(()) => inner.free_slot(id),
            Err(e) => error!(buffer_id = id, error = %e, "Abandoned fill slot in wrong state"),
        }
    }

    /// Wake every blocked matcher and refuse further fills.
    ///
    /// Ready buffers stay matchable until drained.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.ready_cond.notify_all();
        info!("SampleBufferPool shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// Per-state counts, taken atomically.
    #[must_use]
    pub fn state_counts(&self) -> StateCounts {
        let inner = self.inner.lock();
        let mut counts = StateCounts::default();
        for slot in &inner.slots {
            match slot.state {
                BufferState::Free => counts.free += 1,
                BufferState::BeingFilled => counts.being_filled += 1,
                BufferState::Ready => counts.ready += 1,
                BufferState::BeingProcessed => counts.being_processed += 1,
            }
        }
        counts
    }

    /// Current state of one buffer.
    pub fn state(&self, id: BufferId) -> Result<BufferState, PoolError> {
        self.inner.lock().state_of(id)
    }

    /// Number of entries currently registered in the ready index.
    #[must_use]
    pub fn ready_entries(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Drop and match counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fills_dropped: self.fills_dropped.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            sets_matched: self.sets_matched.load(Ordering::Relaxed),
        }
    }

    /// Static shape of the pool.
    #[must_use]
    pub fn dimensions(&self) -> PoolDimensions {
        self.dims
    }

    /// Total number of buffers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.payloads.len()
    }
}

/// Exclusive write access to a buffer in `BeingFilled`.
///
/// Dropping the slot without publishing it returns the buffer to `Free`.
pub struct FillSlot<'a> {
    pool: &'a SampleBufferPool,
    id: BufferId,
    armed: bool,
}

impl FillSlot<'_> {
    /// Slot index of the claimed buffer.
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Payload, writable without the pool lock.
    #[must_use]
    pub fn samples_mut(&mut self) -> &mut [Complex<f32>] {
        // SAFETY: this slot is BeingFilled and this guard is its only holder;
        // &mut self rules out other borrows through the guard.
        unsafe { (*self.pool.payloads[self.id].get()).as_mut_slice() }
    }

    /// Payload, read-only.
    #[must_use]
    pub fn samples(&self) -> &[Complex<f32>] {
        // SAFETY: see samples_mut
        unsafe { (*self.pool.payloads[self.id].get()).as_slice() }
    }

    /// Give up payload access and keep only the id, leaving the buffer in
    /// `BeingFilled` for [`SampleBufferPool::buffer_filled_id`].
    #[must_use]
    pub(crate) fn detach(mut self) -> BufferId {
        self.armed = false;
        self.id
    }
}

impl Drop for FillSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon_fill(self.id);
        }
    }
}

/// A matched antenna-set: one `BeingProcessed` buffer per antenna, all for
/// the same (channel, beam).
///
/// Dropping the set without [`SampleBufferPool::release_buffers`] releases
/// it.
pub struct BufferSet<'a> {
    pool: &'a SampleBufferPool,
    key: PartitionKey,
    members: Vec<Option<BufferId>>,
    headers: Vec<BufferHeader>,
}

impl BufferSet<'_> {
    /// The (channel, beam) this set was matched on.
    #[must_use]
    pub fn key(&self) -> PartitionKey {
        self.key
    }

    /// Buffer id per antenna.
    #[must_use]
    pub fn ids(&self) -> &[Option<BufferId>] {
        &self.members
    }

    /// Number of antennas in the set.
    #[must_use]
    pub fn antennas(&self) -> usize {
        self.members.len()
    }

    /// Header published with an antenna's buffer.
    #[must_use]
    pub fn header(&self, antenna: usize) -> Option<&BufferHeader> {
        self.members.get(antenna).copied().flatten()?;
        self.headers.get(antenna)
    }

    /// Payload of an antenna's buffer.
    #[must_use]
    pub fn samples(&self, antenna: usize) -> Option<&[Complex<f32>]> {
        let id = self.members.get(antenna).copied().flatten()?;
        // SAFETY: the buffer is BeingProcessed and this set is its only
        // holder until released.
        Some(unsafe { (*self.pool.payloads[id].get()).as_slice() })
    }
}

impl Drop for BufferSet<'_> {
    fn drop(&mut self) {
        if self.members.iter().any(Option::is_some) {
            if let Err(e) = self.pool.release_ids(&self.members) {
                error!(channel = self.key.channel, beam = self.key.beam, error = %e,
                    "Failed to release dropped buffer set");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tracing_test::traced_test;

    fn dims(antennas: usize, channels: usize, beams: usize, oversub: usize) -> PoolDimensions {
        PoolDimensions {
            antennas,
            channels,
            beams,
            samples_per_buffer: 4,
            oversubscription: oversub,
        }
    }

    fn header(antenna: u32, channel: u32, beam: u32) -> BufferHeader {
        BufferHeader {
            antenna,
            channel,
            beam,
            control_word: 0,
        }
    }

    fn fill(pool: &SampleBufferPool, h: BufferHeader) -> FillOutcome {
        let mut slot = pool.get_buffer_to_fill().unwrap();
        slot.samples_mut()
            .fill(Complex::new(h.antenna as f32, h.channel as f32));
        pool.buffer_filled(slot, h).unwrap()
    }

    #[test]
    fn test_pool_creation() {
        let pool = SampleBufferPool::new(dims(3, 2, 1, 2));
        assert_eq!(pool.capacity(), 12);
        assert_eq!(pool.state_counts().free, 12);
        assert_eq!(pool.state_counts().total(), 12);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = SampleBufferPool::new(dims(1, 1, 1, 2));
        let a = pool.get_buffer_to_fill();
        let b = pool.get_buffer_to_fill();
        assert!(a.is_some() && b.is_some());

        assert!(pool.get_buffer_to_fill().is_none());
        assert_eq!(pool.stats().fills_dropped, 1);
        assert_eq!(pool.state_counts().being_filled, 2);
    }

    #[test]
    fn test_dropped_fill_slot_returns_to_free() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 1));
        let slot = pool.get_buffer_to_fill().unwrap();
        let id = slot.id();
        assert_eq!(pool.state(id), Ok(BufferState::BeingFilled));

        drop(slot);
        assert_eq!(pool.state(id), Ok(BufferState::Free));
        assert_eq!(pool.state_counts().free, 2);
    }

    #[test]
    #[traced_test]
    fn test_malformed_header_is_dropped() {
        let pool = SampleBufferPool::new(dims(2, 2, 1, 1));
        for bad in [header(2, 0, 0), header(0, 2, 0), header(0, 0, 1)] {
            let slot = pool.get_buffer_to_fill().unwrap();
            let id = slot.id();
            assert_eq!(pool.buffer_filled(slot, bad), Ok(FillOutcome::Dropped));
            assert_eq!(pool.state(id), Ok(BufferState::Free));
        }
        assert_eq!(pool.ready_entries(), 0);
        assert_eq!(pool.stats().malformed_dropped, 3);
        assert_eq!(pool.state_counts().free, 4);
        assert!(logs_contain("Dropping buffer with out-of-range header"));
    }

    #[test]
    fn test_buffer_filled_requires_being_filled() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 1));
        let err = pool.buffer_filled_id(0, header(0, 0, 0)).unwrap_err();
        assert_eq!(
            err,
            PoolError::InvalidTransition {
                id: 0,
                expected: BufferState::BeingFilled,
                actual: BufferState::Free,
            }
        );
        assert!(matches!(
            pool.buffer_filled_id(99, header(0, 0, 0)),
            Err(PoolError::UnknownBuffer { id: 99, .. })
        ));
    }

    #[test]
    fn test_detached_slot_can_be_published_by_id() {
        let pool = SampleBufferPool::new(dims(1, 1, 1, 1));
        let id = pool.get_buffer_to_fill().unwrap().detach();
        assert_eq!(pool.state(id), Ok(BufferState::BeingFilled));
        assert_eq!(
            pool.buffer_filled_id(id, header(0, 0, 0)),
            Ok(FillOutcome::Registered)
        );
        assert_eq!(pool.state(id), Ok(BufferState::Ready));
    }

    #[test]
    fn test_match_and_release() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 2));
        fill(&pool, header(0, 0, 0));
        fill(&pool, header(1, 0, 0));

        let set = pool.get_filled_buffers().unwrap();
        assert_eq!(set.key(), PartitionKey { channel: 0, beam: 0 });
        assert_eq!(set.samples(1).unwrap()[0], Complex::new(1.0, 0.0));
        assert_eq!(set.header(1).unwrap().antenna, 1);
        assert_eq!(pool.state_counts().being_processed, 2);

        pool.release_buffers(set).unwrap();
        assert_eq!(pool.state_counts().free, 4);
        assert_eq!(pool.stats().sets_matched, 1);
    }

    #[test]
    fn test_dropped_set_is_released() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 1));
        fill(&pool, header(0, 0, 0));
        fill(&pool, header(1, 0, 0));
        drop(pool.get_filled_buffers().unwrap());
        assert_eq!(pool.state_counts().free, 2);
    }

    #[test]
    fn test_release_tolerates_absent_and_released_members() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 1));
        fill(&pool, header(0, 0, 0));
        fill(&pool, header(1, 0, 0));
        let set = pool.get_filled_buffers().unwrap();
        let ids = set.ids().to_vec();
        pool.release_buffers(set).unwrap();

        let mut again = ids.clone();
        again.push(None);
        assert!(pool.release_ids(&again).is_ok());
        assert_eq!(pool.state_counts().free, 2);
    }

    #[test]
    fn test_reused_buffer_stays_with_its_new_set() {
        let pool = SampleBufferPool::new(dims(1, 1, 1, 1));
        fill(&pool, header(0, 0, 0));
        let first = pool.get_filled_buffers().unwrap();
        let first_ids = first.ids().to_vec();
        pool.release_buffers(first).unwrap();

        let mut slot = pool.get_buffer_to_fill().unwrap();
        slot.samples_mut().fill(Complex::new(2.0, 0.0));
        pool.buffer_filled(slot, header(0, 0, 0)).unwrap();
        let second = pool.get_filled_buffers().unwrap();
        assert_eq!(second.ids(), first_ids.as_slice());

        // the only buffer belongs to `second` until it is released
        assert!(pool.get_buffer_to_fill().is_none());
        let id = second.ids()[0].unwrap();
        assert_eq!(pool.state(id), Ok(BufferState::BeingProcessed));
        assert_eq!(second.samples(0).unwrap()[0], Complex::new(2.0, 0.0));

        drop(second);
        assert_eq!(pool.state(id), Ok(BufferState::Free));
        assert_eq!(pool.state_counts().free, 1);
    }

    #[test]
    fn test_release_of_ready_buffer_is_rejected() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 1));
        fill(&pool, header(0, 0, 0));
        let ready_id = (0..pool.capacity())
            .find(|&id| pool.state(id) == Ok(BufferState::Ready))
            .unwrap();

        let err = pool.release_ids(&[Some(ready_id)]).unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidTransition {
                expected: BufferState::BeingProcessed,
                actual: BufferState::Ready,
                ..
            }
        ));
        assert_eq!(pool.state(ready_id), Ok(BufferState::Ready));
    }

    #[test]
    fn test_newer_buffer_supersedes_ready_entry() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 2));
        fill(&pool, header(0, 0, 0));
        fill(&pool, header(0, 0, 0));

        let counts = pool.state_counts();
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.free, 3);
        assert_eq!(pool.stats().superseded, 1);
    }

    #[test]
    fn test_timeout_without_complete_set() {
        let pool = SampleBufferPool::new(dims(2, 1, 1, 1));
        fill(&pool, header(0, 0, 0));
        assert!(pool
            .get_filled_buffers_timeout(Duration::from_millis(20))
            .is_none());
        assert_eq!(pool.state_counts().ready, 1);
    }

    #[test]
    fn test_match_scan_rotates_between_partitions() {
        let pool = SampleBufferPool::new(dims(1, 2, 1, 2));
        fill(&pool, header(0, 0, 0));
        fill(&pool, header(0, 1, 0));

        let first = pool.get_filled_buffers().unwrap();
        assert_eq!(first.key().channel, 0);
        pool.release_buffers(first).unwrap();

        fill(&pool, header(0, 0, 0));
        let second = pool.get_filled_buffers().unwrap();
        assert_eq!(second.key().channel, 1);
    }

    #[test]
    fn test_shutdown_wakes_blocked_matcher() {
        let pool = Arc::new(SampleBufferPool::new(dims(2, 1, 1, 1)));
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let woke_empty = pool.get_filled_buffers().is_none();
                woke_empty
            })
        };
        thread::sleep(Duration::from_millis(20));
        pool.shutdown();
        assert!(waiter.join().unwrap());
        assert!(pool.get_buffer_to_fill().is_none());
    }

    #[test]
    fn test_shutdown_drains_complete_sets_first() {
        let pool = SampleBufferPool::new(dims(1, 2, 1, 1));
        fill(&pool, header(0, 0, 0));
        fill(&pool, header(0, 1, 0));
        pool.shutdown();

        assert!(pool.get_filled_buffers().is_some());
        assert!(pool.get_filled_buffers().is_some());
        assert!(pool.get_filled_buffers().is_none());
    }

    #[test]
    fn test_conservation_over_mixed_operations() {
        let d = dims(3, 2, 2, 2);
        let pool = SampleBufferPool::new(d);
        let capacity = pool.capacity();
        let mut held = Vec::new();

        for step in 0..200u32 {
            match step % 5 {
                0 | 1 | 2 => {
                    if let Some(mut slot) = pool.get_buffer_to_fill() {
                        slot.samples_mut()[0] = Complex::new(step as f32, 0.0);
                        // Every seventh header is out of range.
                        let antenna = if step % 7 == 0 { 9 } else { step % 3 };
                        let h = header(antenna, (step / 3) % 2, (step / 5) % 2);
                        pool.buffer_filled(slot, h).unwrap();
                    }
                }
                3 => {
                    if let Some(set) = pool.get_filled_buffers_timeout(Duration::ZERO) {
                        held.push(set);
                    }
                }
                _ => {
                    if let Some(set) = held.pop() {
                        pool.release_buffers(set).unwrap();
                    }
                }
            }
            assert_eq!(pool.state_counts().total(), capacity);
            assert_eq!(pool.ready_entries(), pool.state_counts().ready);
        }
    }
}
