//! Counters for worker-reported reconstruction progress.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals reported by workers through `ReportWorkerTaskStats`.
#[derive(Default)]
pub struct TaskStatsRecorder {
    repaired_data_bytes: AtomicU64,
    repaired_shard_cnt: AtomicU64,
}

/// Frozen point-in-time snapshot of the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStatsSnapshot {
    pub repaired_data_bytes: u64,
    pub repaired_shard_cnt: u64,
}

impl TaskStatsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, data_size_bytes: u64, shard_cnt: u64) {
        self.repaired_data_bytes
            .fetch_add(data_size_bytes, Ordering::AcqRel);
        self.repaired_shard_cnt.fetch_add(shard_cnt, Ordering::AcqRel);
    }

    #[must_use]
    pub fn snapshot(&self) -> TaskStatsSnapshot {
        TaskStatsSnapshot {
            repaired_data_bytes: self.repaired_data_bytes.load(Ordering::Acquire),
            repaired_shard_cnt: self.repaired_shard_cnt.load(Ordering::Acquire),
        }
    }
}
