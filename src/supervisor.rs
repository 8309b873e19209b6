//! Failure isolation per (channel, beam) partition.
//!
//! A coordination fault (a buffer in the wrong state, an unmapped baseline)
//! quarantines the partition it happened in. The correlator keeps running
//! every other partition and releases sets from a quarantined one unread
//! until an operator calls [`PartitionSupervisor::clear`].

use crate::error::{CorrError, CorrResult};
use chrono::{DateTime, Utc};
use corr_pool::PartitionKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Fault record of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFault {
    /// Affected partition.
    pub key: PartitionKey,
    /// Faults reported since the partition was last cleared.
    pub count: u64,
    /// Message of the most recent fault.
    pub last_error: String,
    /// When the partition was quarantined.
    pub since: DateTime<Utc>,
}

/// Tracks quarantined partitions. Shared between workers by reference.
#[derive(Debug, Default)]
pub struct PartitionSupervisor {
    faults: Mutex<HashMap<PartitionKey, PartitionFault>>,
}

impl PartitionSupervisor {
    /// Supervisor with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault. Returns `true` if this quarantined the partition.
    pub fn report(&self, key: PartitionKey, err: &CorrError) -> bool {
        let mut faults = self.faults.lock();
        match faults.get_mut(&key) {
            Some(fault) => {
                fault.count += 1;
                fault.last_error = err.to_string();
                warn!(
                    channel = key.channel,
                    beam = key.beam,
                    count = fault.count,
                    error = %err,
                    "Further fault in quarantined partition"
                );
                false
            }
            None => {
                error!(
                    channel = key.channel,
                    beam = key.beam,
                    error = %err,
                    "Partition quarantined"
                );
                faults.insert(
                    key,
                    PartitionFault {
                        key,
                        count: 1,
                        last_error: err.to_string(),
                        since: Utc::now(),
                    },
                );
                true
            }
        }
    }

    /// Whether the partition is quarantined.
    #[must_use]
    pub fn is_quarantined(&self, key: PartitionKey) -> bool {
        self.faults.lock().contains_key(&key)
    }

    /// `Err(PartitionQuarantined)` if the partition is quarantined.
    pub fn check(&self, key: PartitionKey) -> CorrResult<()> {
        if self.is_quarantined(key) {
            Err(CorrError::PartitionQuarantined {
                channel: key.channel,
                beam: key.beam,
            })
        } else {
            Ok(())
        }
    }

    /// Every quarantined partition, ordered by key.
    #[must_use]
    pub fn faults(&self) -> Vec<PartitionFault> {
        let mut faults: Vec<_> = self.faults.lock().values().cloned().collect();
        faults.sort_by_key(|f| f.key);
        faults
    }

    /// Re-admit a partition. Returns `false` if it was not quarantined.
    pub fn clear(&self, key: PartitionKey) -> bool {
        let cleared = self.faults.lock().remove(&key).is_some();
        if cleared {
            info!(channel = key.channel, beam = key.beam, "Partition re-admitted");
        }
        cleared
    }
}
