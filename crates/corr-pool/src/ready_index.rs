//! Three-dimensional (antenna × channel × beam) index of `Ready` buffers.
//!
//! Stored flat, with a per-partition count of present antennas so that a
//! complete antenna-set is detected without walking the antenna axis.

use crate::{BufferId, PartitionKey};

/// Mapping (antenna, channel, beam) → ready buffer id.
///
/// Only mutated under the pool lock.
#[derive(Debug, Clone)]
pub struct ReadyIndex {
    antennas: usize,
    channels: usize,
    beams: usize,
    cells: Vec<Option<BufferId>>,
    present: Vec<usize>,
}

impl ReadyIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new(antennas: usize, channels: usize, beams: usize) -> Self {
        Self {
            antennas,
            channels,
            beams,
            cells: vec![None; antennas * channels * beams],
            present: vec![0; channels * beams],
        }
    }

    /// Number of (channel, beam) partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.channels * self.beams
    }

    /// Partition key for a flat partition number.
    #[must_use]
    pub fn key_at(&self, partition: usize) -> PartitionKey {
        PartitionKey {
            channel: partition / self.beams,
            beam: partition % self.beams,
        }
    }

    fn partition(&self, channel: usize, beam: usize) -> usize {
        channel * self.beams + beam
    }

    fn cell(&self, antenna: usize, channel: usize, beam: usize) -> usize {
        self.partition(channel, beam) * self.antennas + antenna
    }

    /// Ready buffer for a cell, if any.
    #[must_use]
    pub fn get(&self, antenna: usize, channel: usize, beam: usize) -> Option<BufferId> {
        self.cells[self.cell(antenna, channel, beam)]
    }

    /// Register `id` and return the id it displaced, if the cell was occupied.
    pub fn insert(
        &mut self,
        antenna: usize,
        channel: usize,
        beam: usize,
        id: BufferId,
    ) -> Option<BufferId> {
        let cell = self.cell(antenna, channel, beam);
        let previous = self.cells[cell].replace(id);
        if previous.is_none() {
            let partition = self.partition(channel, beam);
            self.present[partition] += 1;
        }
        previous
    }

    /// Whether every antenna has a ready buffer for `key`.
    #[must_use]
    pub fn is_complete(&self, key: PartitionKey) -> bool {
        self.present[self.partition(key.channel, key.beam)] == self.antennas
    }

    /// Number of antennas with a ready buffer for `key`.
    #[must_use]
    pub fn present(&self, key: PartitionKey) -> usize {
        self.present[self.partition(key.channel, key.beam)]
    }

    /// First complete partition scanning from `start` and wrapping around.
    #[must_use]
    pub fn find_complete(&self, start: usize) -> Option<usize> {
        let n = self.partitions();
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&p| self.present[p] == self.antennas)
    }

    /// Remove and return every antenna's entry for a partition.
    pub fn take_partition(&mut self, partition: usize) -> Vec<Option<BufferId>> {
        let base = partition * self.antennas;
        let taken = self.cells[base..base + self.antennas]
            .iter_mut()
            .map(Option::take)
            .collect();
        self.present[partition] = 0;
        taken
    }

    /// Number of registered entries across all partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.present.iter().sum()
    }

    /// Whether no entry is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
