#![forbid(unsafe_code)]
//! Persistence adapter for repair task records.
//!
//! The scheduler owns its task records through the [`TaskStore`] trait:
//! lookup by task id, scan, query by source disk, insert/update, and bulk
//! delete once a disk is declared repaired. Two implementations are provided:
//!
//! - [`MemTaskStore`]: in-memory, for tests and embedded use;
//! - [`LogTaskStore`]: durable append-only JSON-line log, replayed on open.
//!
//! Both enforce the per-disk uniqueness invariant at insert time: a task id
//! may exist only once, and a live `(disk, bad vuid)` pair may not be
//! duplicated. Violations surface as fatal invariant errors rather than being
//! silently reconciled.

use asupersync::Cx;
use shoal_error::{Result, ShoalError};
use shoal_types::{DiskId, RepairTask, TaskId};

mod log;
mod mem;

pub use crate::log::{LogStoreOptions, LogTaskStore};
pub use crate::mem::MemTaskStore;

/// CRUD surface over persisted repair task records.
///
/// Implementations must be safely concurrent; every call honors `cx`.
pub trait TaskStore: Send + Sync {
    /// Fetch one record; `NotFound` if absent.
    fn find(&self, cx: &Cx, task_id: &TaskId) -> Result<RepairTask>;

    /// All records, in insertion order.
    fn find_all(&self, cx: &Cx) -> Result<Vec<RepairTask>>;

    /// All records whose source disk is `disk_id`, in insertion order.
    fn find_by_disk(&self, cx: &Cx, disk_id: DiskId) -> Result<Vec<RepairTask>>;

    /// Persist a new record. Duplicate task id or duplicate
    /// `(disk, bad vuid)` is an invariant violation.
    fn insert(&self, cx: &Cx, task: &RepairTask) -> Result<()>;

    /// Overwrite an existing record; `NotFound` if it was never inserted.
    fn update(&self, cx: &Cx, task: &RepairTask) -> Result<()>;

    /// Drop every record of `disk_id`. Absent disk is a no-op.
    fn mark_delete_by_disk(&self, cx: &Cx, disk_id: DiskId) -> Result<()>;
}

#[inline]
fn checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ShoalError::Cancelled)
}

/// Shared insert-time invariant check over the current live set.
fn check_insert_unique(live: &[&RepairTask], task: &RepairTask) -> Result<()> {
    for existing in live {
        if existing.task_id == task.task_id {
            return Err(ShoalError::Invariant(format!(
                "duplicate task id {}",
                task.task_id
            )));
        }
        if existing.broken_disk_id == task.broken_disk_id && existing.bad_vuid == task.bad_vuid {
            return Err(ShoalError::Invariant(format!(
                "duplicate repair target: disk_id={} bad_vuid={} (tasks {} and {})",
                task.broken_disk_id, task.bad_vuid, existing.task_id, task.task_id
            )));
        }
    }
    Ok(())
}
