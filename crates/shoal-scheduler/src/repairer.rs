//! Disk-repair manager.
//!
//! Owns the three task queues, the persistence adapter, the task switch and
//! the cluster-manager client, and drives every repair task of the one
//! adopted disk through its lifecycle:
//!
//! ```text
//! collect: broken disk → task records (Inited) → prepare queue
//! prepare: volume lookup → replacement allocation → Prepared → work queue
//! workers: acquire / renew / complete (→ WorkCompleted, finish queue)
//! finish:  volume commit → Finished   (or re-allocate and re-work)
//! check:   all terminal → disk Repaired, records deleted
//! ```
//!
//! At most one disk repairs at a time. Two latches (the adopted disk id and
//! the "revised since startup" flag) form a small outer state machine; the
//! collect and completion-check loops serialize on a cycle lock so their
//! transitions never interleave.
//!
//! Loops swallow transient errors and retry on the next tick. Invariant
//! violations (a mixed-disk task set, a corrupt record, an `OldVuidNotMatch`
//! commit answer) are routed to a fatal latch that stops every loop; the
//! embedding service decides how to surface it.

use asupersync::Cx;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shoal_clustermgr::{AllocatedVunit, ClusterMgrApi, DiskInfo};
use shoal_error::{Result, ShoalError};
use shoal_taskstore::TaskStore;
use shoal_types::{
    DiskId, Idc, RepairState, RepairTask, TaskId, VunitLocation, DISK_REPAIR_TASK_PREFIX,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::base::{checkpoint, gen_task_id, insist_on};
use crate::queue::TaskQueue;
use crate::stats::{TaskStatsRecorder, TaskStatsSnapshot};
use crate::taskswitch::TaskSwitch;
use crate::workqueue::WorkQueue;

/// How long loops wait for the task switch before re-checking the stop flag.
const WAIT_ENABLE_TICK: Duration = Duration::from_millis(500);
/// Pause after an empty pop or a full work queue.
const IDLE_DELAY: Duration = Duration::from_millis(500);
/// Slice used to keep interval sleeps responsive to shutdown.
const STOP_POLL_TICK: Duration = Duration::from_millis(50);

// ── Configuration ───────────────────────────────────────────────────────────

/// Disk-repair manager configuration. All durations are whole seconds, as
/// they arrive from the service config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskRepairConfig {
    /// Seconds between collect ticks.
    pub collect_task_interval_s: u64,
    /// Seconds between completion-check ticks.
    pub check_task_interval_s: u64,
    /// Delay before a popped-but-failed prepare task is re-eligible.
    pub prepare_queue_retry_delay_s: u64,
    /// Delay before a popped-but-failed finalize task is re-eligible.
    pub finish_queue_retry_delay_s: u64,
    /// Work-queue lease window; unrenewed leases become re-acquirable.
    pub task_lease_expired_s: u64,
    /// Delay before a cancelled task is re-acquirable.
    pub cancel_punish_duration_s: u64,
    /// Admission bound on tasks held in the work queue.
    pub work_queue_size: usize,
}

impl Default for DiskRepairConfig {
    fn default() -> Self {
        Self {
            collect_task_interval_s: 5,
            check_task_interval_s: 5,
            prepare_queue_retry_delay_s: 10,
            finish_queue_retry_delay_s: 10,
            task_lease_expired_s: 120,
            cancel_punish_duration_s: 20,
            work_queue_size: 20,
        }
    }
}

impl DiskRepairConfig {
    pub fn validate(self) -> Result<Self> {
        if self.collect_task_interval_s == 0 {
            return Err(ShoalError::Config(
                "collect_task_interval_s must be > 0".to_owned(),
            ));
        }
        if self.check_task_interval_s == 0 {
            return Err(ShoalError::Config(
                "check_task_interval_s must be > 0".to_owned(),
            ));
        }
        if self.task_lease_expired_s == 0 {
            return Err(ShoalError::Config(
                "task_lease_expired_s must be > 0".to_owned(),
            ));
        }
        if self.work_queue_size == 0 {
            return Err(ShoalError::Config("work_queue_size must be > 0".to_owned()));
        }
        Ok(self)
    }

    #[must_use]
    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_task_interval_s)
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_task_interval_s)
    }
}

// ── Worker-surface argument and result types ────────────────────────────────

/// Arguments of a worker's `CompleteTask` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTaskArgs {
    pub idc: Idc,
    pub task_id: TaskId,
    pub src: Vec<VunitLocation>,
    pub dest: VunitLocation,
}

/// Arguments of a worker's `CancelTask` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskArgs {
    pub idc: Idc,
    pub task_id: TaskId,
    pub src: Vec<VunitLocation>,
    pub dest: VunitLocation,
}

/// Arguments of a worker's periodic stats report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReportArgs {
    pub task_id: TaskId,
    pub increase_data_size_byte: u64,
    pub increase_shard_cnt: u64,
}

/// Point-in-time view of the manager for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairStats {
    /// `DiskId::EMPTY` when no disk is repairing.
    pub repairing_disk_id: DiskId,
    /// Tasks awaiting replacement-unit allocation.
    pub inited: usize,
    /// Tasks leased (or leasable) to workers.
    pub prepared: usize,
    /// Tasks awaiting volume commit.
    pub completed: usize,
    pub worker: TaskStatsSnapshot,
}

// ── Outer state machine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct OuterState {
    repairing_disk: Option<DiskId>,
    has_revised: bool,
}

// ── Manager ─────────────────────────────────────────────────────────────────

/// Orchestrator of per-unit repair tasks for one broken disk at a time.
pub struct DiskRepairMgr {
    cfg: DiskRepairConfig,
    task_store: Arc<dyn TaskStore>,
    cluster_mgr: Arc<dyn ClusterMgrApi>,
    task_switch: Arc<TaskSwitch>,

    prepare_queue: TaskQueue,
    work_queue: WorkQueue,
    finish_queue: TaskQueue,

    sm: Mutex<OuterState>,
    /// Serializes the collect and completion-check cycles.
    cycle_lock: Mutex<()>,

    stats: TaskStatsRecorder,
    stop: Arc<AtomicBool>,
    fatal: Mutex<Option<ShoalError>>,
}

impl DiskRepairMgr {
    pub fn new(
        cfg: DiskRepairConfig,
        task_store: Arc<dyn TaskStore>,
        cluster_mgr: Arc<dyn ClusterMgrApi>,
        task_switch: Arc<TaskSwitch>,
    ) -> Result<Self> {
        let cfg = cfg.validate()?;
        Ok(Self {
            cfg,
            task_store,
            cluster_mgr,
            task_switch,
            prepare_queue: TaskQueue::new(Duration::from_secs(cfg.prepare_queue_retry_delay_s)),
            work_queue: WorkQueue::new(
                Duration::from_secs(cfg.task_lease_expired_s),
                Duration::from_secs(cfg.cancel_punish_duration_s),
            ),
            finish_queue: TaskQueue::new(Duration::from_secs(cfg.finish_queue_retry_delay_s)),
            sm: Mutex::new(OuterState {
                repairing_disk: None,
                has_revised: false,
            }),
            cycle_lock: Mutex::new(()),
            stats: TaskStatsRecorder::new(),
            stop: Arc::new(AtomicBool::new(false)),
            fatal: Mutex::new(None),
        })
    }

    // ── Startup reconciliation ──────────────────────────────────────────────

    /// Replay persisted tasks into the in-memory queues and establish the
    /// outer state. Must run before the loops.
    ///
    /// A task set spanning more than one disk, duplicate task ids, or
    /// duplicate `(disk, bad vuid)` targets mean the store is corrupt;
    /// nothing is reconciled and the fatal error is returned.
    pub fn load(&self, cx: &Cx) -> Result<()> {
        let tasks = self.task_store.find_all(cx)?;
        if tasks.is_empty() {
            *self.sm.lock() = OuterState {
                repairing_disk: None,
                has_revised: true,
            };
            info!(event = "load_complete", tasks = 0);
            return Ok(());
        }

        let disk_id = tasks[0].broken_disk_id;
        let by_disk = self.task_store.find_by_disk(cx, disk_id)?;
        let all_ids: HashSet<&TaskId> = tasks.iter().map(|task| &task.task_id).collect();
        let disk_ids: HashSet<&TaskId> = by_disk.iter().map(|task| &task.task_id).collect();
        if all_ids != disk_ids {
            return Err(ShoalError::Invariant(format!(
                "task set is not a single disk: full scan has {} tasks, disk {} has {}",
                all_ids.len(),
                disk_id,
                disk_ids.len()
            )));
        }
        if all_ids.len() != tasks.len() {
            return Err(ShoalError::Invariant(
                "duplicate task id in persisted set".to_owned(),
            ));
        }
        let mut seen_vuids = HashSet::new();
        for task in &tasks {
            if !seen_vuids.insert(task.bad_vuid) {
                return Err(ShoalError::Invariant(format!(
                    "duplicate bad vuid {} for disk {}",
                    task.bad_vuid, disk_id
                )));
            }
        }

        let mut prepare = 0usize;
        let mut finish = 0usize;
        let mut terminal = 0usize;
        for task in tasks {
            match task.state {
                RepairState::Inited | RepairState::Prepared => {
                    self.prepare_queue.push(task);
                    prepare += 1;
                }
                RepairState::WorkCompleted => {
                    self.finish_queue.push(task);
                    finish += 1;
                }
                RepairState::FinishedInAdvance | RepairState::Finished => terminal += 1,
            }
        }

        *self.sm.lock() = OuterState {
            repairing_disk: Some(disk_id),
            has_revised: false,
        };
        info!(
            event = "load_complete",
            disk_id = disk_id.0,
            prepare,
            finish,
            terminal
        );
        Ok(())
    }

    // ── Collect ─────────────────────────────────────────────────────────────

    /// One collect tick: reconcile the adopted disk after startup, or adopt
    /// the next broken disk. Errors are logged and retried next tick.
    pub fn collect_task(&self, cx: &Cx) {
        let _cycle = self.cycle_lock.lock();
        if let Err(err) = self.collect_cycle(cx) {
            self.handle_cycle_error("collect", err);
        }
    }

    fn collect_cycle(&self, cx: &Cx) -> Result<()> {
        checkpoint(cx)?;
        let state = *self.sm.lock();
        if let Some(disk_id) = state.repairing_disk {
            if !state.has_revised {
                self.revise_repair_tasks(cx, disk_id)?;
                self.sm.lock().has_revised = true;
            }
            return Ok(());
        }

        let Some(disk) = self.acquire_broken_disk(cx)? else {
            return Ok(());
        };
        let created = self.gen_disk_repair_tasks(cx, &disk)?;
        self.cluster_mgr.set_disk_repairing(cx, disk.disk_id)?;
        *self.sm.lock() = OuterState {
            repairing_disk: Some(disk.disk_id),
            has_revised: false,
        };
        info!(
            event = "adopt_broken_disk",
            disk_id = disk.disk_id.0,
            idc = %disk.idc,
            created
        );
        Ok(())
    }

    /// Re-derive the task set for the adopted disk, creating any records a
    /// prior run failed to persist, and re-mark the disk repairing if it is
    /// still listed broken.
    fn revise_repair_tasks(&self, cx: &Cx, disk_id: DiskId) -> Result<()> {
        let disk = self.cluster_mgr.get_disk_info(cx, disk_id)?;
        let created = self.gen_disk_repair_tasks(cx, &disk)?;
        if disk.is_broken() {
            self.cluster_mgr.set_disk_repairing(cx, disk_id)?;
        }
        info!(event = "revise_repair_tasks", disk_id = disk_id.0, created);
        Ok(())
    }

    fn acquire_broken_disk(&self, cx: &Cx) -> Result<Option<DiskInfo>> {
        let disks = self.cluster_mgr.list_broken_disks(cx)?;
        Ok(disks.into_iter().next())
    }

    /// Create one task per volume unit on the disk that does not already
    /// have a persisted task, persisting each before it is enqueued.
    fn gen_disk_repair_tasks(&self, cx: &Cx, disk: &DiskInfo) -> Result<usize> {
        let existing = self.task_store.find_by_disk(cx, disk.disk_id)?;
        let existing_vuids: HashSet<_> = existing.iter().map(|task| task.bad_vuid).collect();
        let units = self.cluster_mgr.list_disk_volume_units(cx, disk.disk_id)?;

        let mut created = 0usize;
        for unit in units {
            if existing_vuids.contains(&unit.vuid) {
                continue;
            }
            let task = RepairTask::new(
                gen_task_id(DISK_REPAIR_TASK_PREFIX, unit.vuid.vid()),
                disk.disk_id,
                disk.idc.clone(),
                unit.vuid,
            );
            self.task_store.insert(cx, &task)?;
            debug!(
                event = "repair_task_created",
                task_id = %task.task_id,
                disk_id = disk.disk_id.0,
                bad_vuid = task.bad_vuid.0
            );
            self.prepare_queue.push(task);
            created += 1;
        }
        Ok(created)
    }

    // ── Prepare ─────────────────────────────────────────────────────────────

    /// Pop one task and allocate its replacement unit.
    ///
    /// `NoTaskInQueue` when empty. A transient failure leaves the task in
    /// the queue's retry window.
    pub fn pop_task_and_prepare(&self, cx: &Cx) -> Result<()> {
        let Some(mut task) = self.prepare_queue.pop() else {
            return Err(ShoalError::NoTaskInQueue);
        };
        self.prepare_task(cx, &mut task)
    }

    fn prepare_task(&self, cx: &Cx, task: &mut RepairTask) -> Result<()> {
        checkpoint(cx)?;
        let volume = self.cluster_mgr.get_volume_info(cx, task.vid())?;
        let index = task.bad_vuid.index();
        let Some(current) = volume.location_at(index) else {
            return Err(ShoalError::Invariant(format!(
                "volume {} has no unit at index {index} (task {})",
                volume.vid, task.task_id
            )));
        };

        if current.vuid != task.bad_vuid {
            // The unit moved under us; repair happened out-of-band.
            return self.finish_task_in_advance(cx, task);
        }

        let alloc = self.cluster_mgr.alloc_volume_unit(cx, task.bad_vuid)?;
        if alloc.location.vuid.epoch() <= task.bad_vuid.epoch() {
            return Err(ShoalError::Invariant(format!(
                "allocation for {} did not advance the epoch: got {}",
                task.bad_vuid, alloc.location.vuid
            )));
        }

        task.code_mode = Some(volume.code_mode);
        task.sources = volume.locations.clone();
        task.destination = Some(alloc.location);
        task.state = RepairState::Prepared;
        task.touch();
        self.insist_update(cx, task)?;

        self.prepare_queue.remove(&task.task_id);
        self.work_queue.add_prepared(task.clone());
        info!(
            event = "task_prepared",
            task_id = %task.task_id,
            bad_vuid = task.bad_vuid.0,
            dest_vuid = task.destination_vuid().map_or(0, |vuid| vuid.0)
        );
        Ok(())
    }

    fn finish_task_in_advance(&self, cx: &Cx, task: &mut RepairTask) -> Result<()> {
        task.state = RepairState::FinishedInAdvance;
        task.touch();
        // Nothing irreversible has happened; a failed persist just returns
        // the task to the queue's retry window.
        self.task_store.update(cx, task)?;
        self.prepare_queue.remove(&task.task_id);
        info!(
            event = "task_finished_in_advance",
            task_id = %task.task_id,
            bad_vuid = task.bad_vuid.0
        );
        Ok(())
    }

    // ── Finish ──────────────────────────────────────────────────────────────

    /// Pop one worker-completed task and commit its new unit to the volume.
    pub fn pop_task_and_finish(&self, cx: &Cx) -> Result<()> {
        let Some(mut task) = self.finish_queue.pop() else {
            return Err(ShoalError::NoTaskInQueue);
        };
        if task.state != RepairState::WorkCompleted {
            return Err(ShoalError::Invariant(format!(
                "task {} in finish queue with state {:?}",
                task.task_id, task.state
            )));
        }
        self.finish_task(cx, &mut task)
    }

    fn finish_task(&self, cx: &Cx, task: &mut RepairTask) -> Result<()> {
        checkpoint(cx)?;
        // The worker-reported completion only lived in memory until now.
        // The commit has not been issued yet, so a failed persist is
        // transient: the task stays queued and the cycle retries later.
        self.task_store.update(cx, task)?;

        let Some(dest_vuid) = task.destination_vuid() else {
            return Err(ShoalError::Invariant(format!(
                "work-completed task {} has no destination",
                task.task_id
            )));
        };

        match self
            .cluster_mgr
            .update_volume(cx, task.vid(), dest_vuid, task.bad_vuid)
        {
            Ok(()) => {
                task.state = RepairState::Finished;
                task.touch();
                self.insist_update(cx, task)?;
                self.finish_queue.remove(&task.task_id);
                info!(
                    event = "task_finished",
                    task_id = %task.task_id,
                    bad_vuid = task.bad_vuid.0,
                    dest_vuid = dest_vuid.0
                );
                Ok(())
            }
            Err(err @ ShoalError::OldVuidNotMatch) => {
                // The volume's current unit is not the one we believed; the
                // persisted picture has diverged from the cluster.
                Err(err)
            }
            Err(err @ (ShoalError::NewVuidNotMatch | ShoalError::StatChunkFailed)) => {
                self.redo_with_new_destination(cx, task, &err)
            }
            Err(err) => Err(err),
        }
    }

    /// The committed-to destination is stale or unreachable: allocate a fresh
    /// unit and hand the task back to the workers.
    fn redo_with_new_destination(
        &self,
        cx: &Cx,
        task: &mut RepairTask,
        cause: &ShoalError,
    ) -> Result<()> {
        warn!(
            event = "stale_destination",
            task_id = %task.task_id,
            error = %cause
        );
        let alloc = self.cluster_mgr.alloc_volume_unit(cx, task.bad_vuid)?;
        task.destination = Some(alloc.location);
        task.state = RepairState::Prepared;
        task.touch();
        self.insist_update(cx, task)?;

        self.finish_queue.remove(&task.task_id);
        self.work_queue.add_prepared(task.clone());
        info!(
            event = "task_requeued_for_rework",
            task_id = %task.task_id,
            dest_vuid = task.destination_vuid().map_or(0, |vuid| vuid.0)
        );
        Ok(())
    }

    // ── Completion check ────────────────────────────────────────────────────

    /// Declare the adopted disk repaired once every task is terminal and the
    /// cluster holds no units for it, then delete its task records.
    pub fn check_repaired_and_clear(&self, cx: &Cx) {
        let _cycle = self.cycle_lock.lock();
        if let Err(err) = self.check_cycle(cx) {
            self.handle_cycle_error("check", err);
        }
    }

    fn check_cycle(&self, cx: &Cx) -> Result<()> {
        checkpoint(cx)?;
        let Some(disk_id) = self.sm.lock().repairing_disk else {
            return Ok(());
        };

        let tasks = self.task_store.find_by_disk(cx, disk_id)?;
        if tasks.iter().any(|task| !task.is_terminal()) {
            return Ok(());
        }
        if !self.disk_repaired(cx, disk_id)? {
            return Ok(());
        }

        self.cluster_mgr.set_disk_repaired(cx, disk_id)?;
        insist_on(&self.stop, "delete repaired disk tasks", || {
            self.task_store.mark_delete_by_disk(cx, disk_id)
        })?;
        *self.sm.lock() = OuterState {
            repairing_disk: None,
            has_revised: true,
        };
        info!(
            event = "disk_repaired_and_cleared",
            disk_id = disk_id.0,
            tasks = tasks.len()
        );
        Ok(())
    }

    fn disk_repaired(&self, cx: &Cx, disk_id: DiskId) -> Result<bool> {
        let units = self.cluster_mgr.list_disk_volume_units(cx, disk_id)?;
        if units.is_empty() {
            return Ok(true);
        }
        // Units remain listed although every task is terminal. If the disk
        // is already marked repaired the listing is stale and clearing may
        // proceed; anything else keeps the disk held.
        let disk = self.cluster_mgr.get_disk_info(cx, disk_id)?;
        if disk.is_repaired() {
            info!(
                event = "stale_unit_listing",
                disk_id = disk_id.0,
                units = units.len()
            );
            return Ok(true);
        }
        Ok(false)
    }

    // ── Worker-facing surface ───────────────────────────────────────────────

    /// Lease one prepared task in `idc` to a worker.
    pub fn acquire_task(&self, cx: &Cx, idc: &Idc) -> Result<RepairTask> {
        checkpoint(cx)?;
        if !self.task_switch.enabled() {
            return Err(ShoalError::TaskPaused);
        }
        self.work_queue.acquire(idc).ok_or(ShoalError::TaskEmpty)
    }

    /// Extend a worker's lease.
    pub fn renewal_task(&self, cx: &Cx, idc: &Idc, task_id: &TaskId) -> Result<()> {
        checkpoint(cx)?;
        if !self.task_switch.enabled() {
            return Err(ShoalError::TaskPaused);
        }
        self.work_queue.renewal(idc, task_id)
    }

    /// Record a worker's successful reconstruction and queue the task for
    /// the volume commit. Persistence happens in the finalize stage.
    pub fn complete_task(&self, cx: &Cx, args: &CompleteTaskArgs) -> Result<()> {
        checkpoint(cx)?;
        let mut task = self
            .work_queue
            .complete(&args.idc, &args.task_id, &args.src, &args.dest)?;
        task.state = RepairState::WorkCompleted;
        task.touch();
        self.finish_queue.push(task);
        info!(event = "task_work_completed", task_id = %args.task_id);
        Ok(())
    }

    /// Return a worker's lease; the task is re-leased after a punish delay.
    pub fn cancel_task(&self, cx: &Cx, args: &CancelTaskArgs) -> Result<()> {
        checkpoint(cx)?;
        self.work_queue
            .cancel(&args.idc, &args.task_id, &args.src, &args.dest)?;
        info!(event = "task_cancelled", task_id = %args.task_id);
        Ok(())
    }

    /// Swap in a freshly allocated destination for a task whose current one
    /// went bad, keeping the task leasable.
    ///
    /// A persistence failure here is deliberately not surfaced to the
    /// worker: the in-memory queue already carries the new destination, the
    /// record catches up on the next update, and the task stays reclaimable.
    pub fn reclaim_task(
        &self,
        cx: &Cx,
        idc: &Idc,
        task_id: &TaskId,
        src: &[VunitLocation],
        dest: &VunitLocation,
        new_dest: &AllocatedVunit,
    ) -> Result<()> {
        checkpoint(cx)?;
        let task = self
            .work_queue
            .reclaim(idc, task_id, src, dest, new_dest.location.clone())?;
        if let Err(err) = self.task_store.update(cx, &task) {
            warn!(
                event = "reclaim_persist_failed",
                task_id = %task_id,
                error = %err
            );
        }
        info!(
            event = "task_reclaimed",
            task_id = %task_id,
            dest_vuid = new_dest.location.vuid.0
        );
        Ok(())
    }

    /// Fetch the persisted record of a task.
    pub fn query_task(&self, cx: &Cx, task_id: &TaskId) -> Result<RepairTask> {
        self.task_store.find(cx, task_id)
    }

    /// Accumulate a worker's reconstruction counters.
    pub fn report_worker_task_stats(&self, args: &TaskReportArgs) {
        self.stats
            .record(args.increase_data_size_byte, args.increase_shard_cnt);
        debug!(
            event = "worker_task_stats",
            task_id = %args.task_id,
            data_size_byte = args.increase_data_size_byte,
            shard_cnt = args.increase_shard_cnt
        );
    }

    /// `(disk, total, repaired)` for the repairing disk; `DiskId::EMPTY`
    /// when none.
    pub fn progress(&self, cx: &Cx) -> (DiskId, usize, usize) {
        let Some(disk_id) = self.sm.lock().repairing_disk else {
            return (DiskId::EMPTY, 0, 0);
        };
        match self.task_store.find_by_disk(cx, disk_id) {
            Ok(tasks) => {
                let repaired = tasks.iter().filter(|task| task.is_terminal()).count();
                (disk_id, tasks.len(), repaired)
            }
            Err(err) => {
                warn!(event = "progress_query_failed", disk_id = disk_id.0, error = %err);
                (disk_id, 0, 0)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> RepairStats {
        let (inited, prepared, completed) = self.stat_queue_task_cnt();
        RepairStats {
            repairing_disk_id: self.sm.lock().repairing_disk.unwrap_or(DiskId::EMPTY),
            inited,
            prepared,
            completed,
            worker: self.stats.snapshot(),
        }
    }

    /// Queue depths: `(inited, prepared, completed)`.
    #[must_use]
    pub fn stat_queue_task_cnt(&self) -> (usize, usize, usize) {
        let (todo, doing) = self.prepare_queue.stats();
        let inited = todo + doing;
        let (todo, doing) = self.work_queue.stats();
        let prepared = todo + doing;
        let (todo, doing) = self.finish_queue.stats();
        let completed = todo + doing;
        (inited, prepared, completed)
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.task_switch.enabled()
    }

    #[must_use]
    pub fn has_repairing_disk(&self) -> bool {
        self.sm.lock().repairing_disk.is_some()
    }

    /// First fatal invariant violation hit by any loop, if one occurred.
    #[must_use]
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().as_ref().map(ToString::to_string)
    }

    // ── Loop plumbing ───────────────────────────────────────────────────────

    /// Start the collect, prepare, finish and completion-check loops.
    ///
    /// The returned handle stops and joins them on `shutdown` (or drop).
    pub fn run(self: &Arc<Self>) -> Result<RepairDaemon> {
        let mut joins = Vec::with_capacity(4);
        for (name, body) in [
            ("shoal-repair-collect", Self::collect_loop as fn(&Self)),
            ("shoal-repair-prepare", Self::prepare_loop as fn(&Self)),
            ("shoal-repair-finish", Self::finish_loop as fn(&Self)),
            ("shoal-repair-check", Self::check_loop as fn(&Self)),
        ] {
            let mgr = Arc::clone(self);
            let join = thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || body(&mgr))
                .map_err(ShoalError::from)?;
            joins.push(join);
        }
        info!(event = "repair_loops_started");
        Ok(RepairDaemon {
            stop: Arc::clone(&self.stop),
            joins,
        })
    }

    fn collect_loop(&self) {
        while !self.stopping() {
            if !self.sleep_unless_stopped(self.cfg.collect_interval()) {
                break;
            }
            if !self.task_switch.wait_enabled_for(WAIT_ENABLE_TICK) {
                continue;
            }
            let cx = Cx::for_request();
            self.collect_task(&cx);
        }
        debug!(event = "collect_loop_stopped");
    }

    fn prepare_loop(&self) {
        while !self.stopping() {
            if !self.task_switch.wait_enabled_for(WAIT_ENABLE_TICK) {
                continue;
            }
            let (todo, doing) = self.work_queue.stats();
            if todo + doing >= self.cfg.work_queue_size {
                self.sleep_unless_stopped(IDLE_DELAY);
                continue;
            }
            let cx = Cx::for_request();
            match self.pop_task_and_prepare(&cx) {
                Ok(()) => {}
                Err(ShoalError::NoTaskInQueue) => {
                    self.sleep_unless_stopped(IDLE_DELAY);
                }
                Err(err) => {
                    self.handle_cycle_error("prepare", err);
                    self.sleep_unless_stopped(IDLE_DELAY);
                }
            }
        }
        debug!(event = "prepare_loop_stopped");
    }

    fn finish_loop(&self) {
        while !self.stopping() {
            if !self.task_switch.wait_enabled_for(WAIT_ENABLE_TICK) {
                continue;
            }
            let cx = Cx::for_request();
            match self.pop_task_and_finish(&cx) {
                Ok(()) => {}
                Err(ShoalError::NoTaskInQueue) => {
                    self.sleep_unless_stopped(IDLE_DELAY);
                }
                Err(err) => {
                    self.handle_cycle_error("finish", err);
                    self.sleep_unless_stopped(IDLE_DELAY);
                }
            }
        }
        debug!(event = "finish_loop_stopped");
    }

    fn check_loop(&self) {
        while !self.stopping() {
            if !self.sleep_unless_stopped(self.cfg.check_interval()) {
                break;
            }
            if !self.task_switch.wait_enabled_for(WAIT_ENABLE_TICK) {
                continue;
            }
            let cx = Cx::for_request();
            self.check_repaired_and_clear(&cx);
        }
        debug!(event = "check_loop_stopped");
    }

    fn handle_cycle_error(&self, stage: &str, err: ShoalError) {
        if matches!(err, ShoalError::Cancelled) {
            debug!(event = "cycle_cancelled", stage);
            return;
        }
        if err.is_fatal() {
            error!(event = "fatal_invariant", stage, error = %err);
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err);
            }
            self.stop.store(true, Ordering::Release);
            return;
        }
        warn!(event = "cycle_failed", stage, error = %err);
    }

    fn insist_update(&self, cx: &Cx, task: &RepairTask) -> Result<()> {
        insist_on(&self.stop, "update task record", || {
            self.task_store.update(cx, task)
        })
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep `total`, waking early on stop. Returns false when stopping.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.stopping() {
                return false;
            }
            let slice = remaining.min(STOP_POLL_TICK);
            thread::sleep(slice);
            remaining -= slice;
        }
        !self.stopping()
    }
}

/// Handle for the running repair loops.
#[derive(Debug)]
pub struct RepairDaemon {
    stop: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl RepairDaemon {
    /// Request shutdown and block until every loop exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for RepairDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
