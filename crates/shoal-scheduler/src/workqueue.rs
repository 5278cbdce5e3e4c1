//! Per-idc queue of prepared tasks leased to remote workers.
//!
//! Workers acquire a task inside their own idc, renew the lease while the
//! reconstruction runs, and finish with complete, cancel, or reclaim. A
//! leased task whose lease lapses without renewal becomes acquirable again;
//! a cancelled task is punished with a delay before it can be re-acquired.
//! Complete, cancel and reclaim all validate the worker-reported locations
//! against the leased task, so a stale worker (for example one that missed a
//! reclaim) cannot advance the task.

use parking_lot::Mutex;
use shoal_error::{Result, ShoalError};
use shoal_types::{Idc, RepairTask, TaskId, VunitLocation};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct WorkEntry {
    task: RepairTask,
    /// Some while leased to a worker.
    lease_until: Option<Instant>,
    /// Not acquirable before this instant (cancel punish).
    not_before: Option<Instant>,
}

impl WorkEntry {
    fn acquirable(&self, now: Instant) -> bool {
        let lease_free = self.lease_until.map_or(true, |until| until <= now);
        let punished = self.not_before.is_some_and(|at| at > now);
        lease_free && !punished
    }
}

#[derive(Default)]
struct IdcQueue {
    order: VecDeque<TaskId>,
    entries: HashMap<TaskId, WorkEntry>,
}

/// Lease-tracking queue of prepared tasks, partitioned by idc.
pub struct WorkQueue {
    lease: Duration,
    cancel_punish: Duration,
    state: Mutex<HashMap<Idc, IdcQueue>>,
}

impl WorkQueue {
    #[must_use]
    pub fn new(lease: Duration, cancel_punish: Duration) -> Self {
        Self {
            lease,
            cancel_punish,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Add a prepared task under its source idc. Returns false when the task
    /// id is already present in any partition.
    pub fn add_prepared(&self, task: RepairTask) -> bool {
        let mut state = self.state.lock();
        if state
            .values()
            .any(|queue| queue.entries.contains_key(&task.task_id))
        {
            return false;
        }
        let queue = state.entry(task.idc.clone()).or_default();
        queue.order.push_back(task.task_id.clone());
        queue.entries.insert(
            task.task_id.clone(),
            WorkEntry {
                task,
                lease_until: None,
                not_before: None,
            },
        );
        true
    }

    /// Lease the oldest acquirable task in `idc`.
    pub fn acquire(&self, idc: &Idc) -> Option<RepairTask> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let queue = state.get_mut(idc)?;
        let id = queue
            .order
            .iter()
            .find(|id| {
                queue
                    .entries
                    .get(*id)
                    .is_some_and(|entry| entry.acquirable(now))
            })?
            .clone();
        let entry = queue.entries.get_mut(&id)?;
        entry.lease_until = Some(now + self.lease);
        Some(entry.task.clone())
    }

    /// Reset the lease deadline of a leased task.
    pub fn renewal(&self, idc: &Idc, task_id: &TaskId) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let entry = Self::entry_mut(&mut state, idc, task_id)?;
        if entry.lease_until.is_none() {
            return Err(ShoalError::NotFound(format!(
                "task {task_id} is not leased in idc {idc}"
            )));
        }
        entry.lease_until = Some(now + self.lease);
        Ok(())
    }

    /// Remove a finished task, returning it for the finalize stage.
    pub fn complete(
        &self,
        idc: &Idc,
        task_id: &TaskId,
        src: &[VunitLocation],
        dest: &VunitLocation,
    ) -> Result<RepairTask> {
        let mut state = self.state.lock();
        let queue = state.get_mut(idc).ok_or_else(|| {
            ShoalError::NotFound(format!("task {task_id} not in work queue of idc {idc}"))
        })?;
        let entry = queue.entries.get(task_id).ok_or_else(|| {
            ShoalError::NotFound(format!("task {task_id} not in work queue of idc {idc}"))
        })?;
        Self::check_locations(&entry.task, src, dest)?;
        let entry = queue.entries.remove(task_id).ok_or_else(|| {
            ShoalError::NotFound(format!("task {task_id} not in work queue of idc {idc}"))
        })?;
        queue.order.retain(|id| id != task_id);
        Ok(entry.task)
    }

    /// Return a leased task, punished, so it is re-acquirable after a delay.
    pub fn cancel(
        &self,
        idc: &Idc,
        task_id: &TaskId,
        src: &[VunitLocation],
        dest: &VunitLocation,
    ) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let entry = Self::entry_mut(&mut state, idc, task_id)?;
        Self::check_locations(&entry.task, src, dest)?;
        entry.lease_until = None;
        entry.not_before = Some(now + self.cancel_punish);
        Ok(())
    }

    /// Swap the task's destination and return it to the acquirable pool.
    ///
    /// Returns the updated task so the caller can persist it.
    pub fn reclaim(
        &self,
        idc: &Idc,
        task_id: &TaskId,
        src: &[VunitLocation],
        dest: &VunitLocation,
        new_dest: VunitLocation,
    ) -> Result<RepairTask> {
        let mut state = self.state.lock();
        let entry = Self::entry_mut(&mut state, idc, task_id)?;
        Self::check_locations(&entry.task, src, dest)?;
        entry.task.destination = Some(new_dest);
        entry.task.touch();
        entry.lease_until = None;
        Ok(entry.task.clone())
    }

    /// `(todo, doing)` across all partitions; "doing" counts active leases.
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        let now = Instant::now();
        let state = self.state.lock();
        let mut todo = 0;
        let mut doing = 0;
        for queue in state.values() {
            for entry in queue.entries.values() {
                if entry.lease_until.is_some_and(|until| until > now) {
                    doing += 1;
                } else {
                    todo += 1;
                }
            }
        }
        (todo, doing)
    }

    #[must_use]
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.state
            .lock()
            .values()
            .any(|queue| queue.entries.contains_key(task_id))
    }

    fn entry_mut<'a>(
        state: &'a mut HashMap<Idc, IdcQueue>,
        idc: &Idc,
        task_id: &TaskId,
    ) -> Result<&'a mut WorkEntry> {
        state
            .get_mut(idc)
            .and_then(|queue| queue.entries.get_mut(task_id))
            .ok_or_else(|| {
                ShoalError::NotFound(format!("task {task_id} not in work queue of idc {idc}"))
            })
    }

    fn check_locations(
        task: &RepairTask,
        src: &[VunitLocation],
        dest: &VunitLocation,
    ) -> Result<()> {
        if task.sources != src {
            return Err(ShoalError::UnmatchedLocation(format!(
                "sources differ for task {}",
                task.task_id
            )));
        }
        if task.destination.as_ref() != Some(dest) {
            return Err(ShoalError::UnmatchedLocation(format!(
                "destination differs for task {}",
                task.task_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_types::{DiskId, RepairState, Vid, Vuid};

    fn prepared_task(id: &str, idc: &str, vid: u32) -> RepairTask {
        let bad_vuid = Vuid::new(Vid(vid), 0, 1).expect("vuid");
        let dest_vuid = bad_vuid.bump_epoch().expect("bump");
        let mut task = RepairTask::new(TaskId::new(id), DiskId(1), Idc::new(idc), bad_vuid);
        task.state = RepairState::Prepared;
        task.sources = vec![VunitLocation {
            vuid: bad_vuid,
            host: "127.0.0.1:8000".to_owned(),
            disk_id: DiskId(1),
        }];
        task.destination = Some(VunitLocation {
            vuid: dest_vuid,
            host: "127.0.0.1:8001".to_owned(),
            disk_id: DiskId(2),
        });
        task
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    #[test]
    fn acquire_is_partitioned_by_idc() {
        let queue = queue();
        assert!(queue.add_prepared(prepared_task("a", "z0", 1)));
        assert!(queue.acquire(&Idc::new("z1")).is_none());
        let task = queue.acquire(&Idc::new("z0")).expect("task in z0");
        assert_eq!(task.task_id, TaskId::new("a"));
        assert_eq!(queue.stats(), (0, 1));
    }

    #[test]
    fn leased_task_is_not_acquirable_until_lease_expires() {
        let queue = WorkQueue::new(Duration::from_millis(20), Duration::from_secs(60));
        queue.add_prepared(prepared_task("a", "z0", 1));
        let idc = Idc::new("z0");
        assert!(queue.acquire(&idc).is_some());
        assert!(queue.acquire(&idc).is_none(), "lease still active");
        std::thread::sleep(Duration::from_millis(40));
        assert!(
            queue.acquire(&idc).is_some(),
            "expired lease must be re-acquirable"
        );
    }

    #[test]
    fn renewal_extends_a_lease_and_rejects_unknown_tasks() {
        let queue = queue();
        queue.add_prepared(prepared_task("a", "z0", 1));
        let idc = Idc::new("z0");

        let err = queue
            .renewal(&idc, &TaskId::new("a"))
            .expect_err("unleased task cannot renew");
        assert!(matches!(err, ShoalError::NotFound(_)), "got {err:?}");

        queue.acquire(&idc).expect("lease");
        queue.renewal(&idc, &TaskId::new("a")).expect("renew leased");

        let err = queue
            .renewal(&idc, &TaskId::new("missing"))
            .expect_err("unknown task");
        assert!(matches!(err, ShoalError::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn complete_removes_entry_and_validates_locations() {
        let queue = queue();
        let task = prepared_task("a", "z0", 1);
        queue.add_prepared(task.clone());
        let idc = Idc::new("z0");
        queue.acquire(&idc).expect("lease");

        let wrong_dest = VunitLocation {
            vuid: task.bad_vuid,
            host: "other".to_owned(),
            disk_id: DiskId(9),
        };
        let err = queue
            .complete(&idc, &task.task_id, &task.sources, &wrong_dest)
            .expect_err("mismatched destination");
        assert!(matches!(err, ShoalError::UnmatchedLocation(_)), "got {err:?}");
        assert!(queue.contains(&task.task_id));

        let dest = task.destination.clone().expect("destination");
        let done = queue
            .complete(&idc, &task.task_id, &task.sources, &dest)
            .expect("complete");
        assert_eq!(done.task_id, task.task_id);
        assert!(!queue.contains(&task.task_id));
        assert_eq!(queue.stats(), (0, 0));
    }

    #[test]
    fn cancelled_task_is_punished_before_reacquire() {
        let queue = WorkQueue::new(Duration::from_secs(60), Duration::from_millis(30));
        let task = prepared_task("a", "z0", 1);
        queue.add_prepared(task.clone());
        let idc = Idc::new("z0");
        queue.acquire(&idc).expect("lease");

        let dest = task.destination.clone().expect("destination");
        queue
            .cancel(&idc, &task.task_id, &task.sources, &dest)
            .expect("cancel");
        assert!(queue.acquire(&idc).is_none(), "punish window active");
        std::thread::sleep(Duration::from_millis(60));
        assert!(queue.acquire(&idc).is_some(), "punish window elapsed");
    }

    #[test]
    fn reclaim_swaps_destination_and_requeues() {
        let queue = queue();
        let task = prepared_task("a", "z0", 1);
        queue.add_prepared(task.clone());
        let idc = Idc::new("z0");
        queue.acquire(&idc).expect("lease");

        let old_dest = task.destination.clone().expect("destination");
        let new_dest = VunitLocation {
            vuid: old_dest.vuid.bump_epoch().expect("bump"),
            host: "127.0.0.1:8002".to_owned(),
            disk_id: DiskId(3),
        };
        let updated = queue
            .reclaim(&idc, &task.task_id, &task.sources, &old_dest, new_dest.clone())
            .expect("reclaim");
        assert_eq!(updated.destination, Some(new_dest.clone()));

        // Old destination no longer validates; the task is re-acquirable.
        let err = queue
            .complete(&idc, &task.task_id, &task.sources, &old_dest)
            .expect_err("stale destination");
        assert!(matches!(err, ShoalError::UnmatchedLocation(_)), "got {err:?}");
        let again = queue.acquire(&idc).expect("re-acquirable after reclaim");
        assert_eq!(again.destination, Some(new_dest));
    }
}
