//! In-memory task store.

use asupersync::Cx;
use parking_lot::Mutex;
use shoal_error::{Result, ShoalError};
use shoal_types::{DiskId, RepairTask, TaskId};
use std::collections::HashMap;

use crate::{check_insert_unique, checkpoint, TaskStore};

#[derive(Debug, Default)]
pub(crate) struct TableState {
    tasks: HashMap<TaskId, RepairTask>,
    /// Insertion order, for deterministic scans.
    order: Vec<TaskId>,
}

impl TableState {
    pub(crate) fn get(&self, task_id: &TaskId) -> Option<&RepairTask> {
        self.tasks.get(task_id)
    }

    pub(crate) fn scan(&self) -> Vec<RepairTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    pub(crate) fn scan_disk(&self, disk_id: DiskId) -> Vec<RepairTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|task| task.broken_disk_id == disk_id)
            .cloned()
            .collect()
    }

    pub(crate) fn check_insert(&self, task: &RepairTask) -> Result<()> {
        let live: Vec<&RepairTask> = self.order.iter().filter_map(|id| self.tasks.get(id)).collect();
        check_insert_unique(&live, task)
    }

    pub(crate) fn insert(&mut self, task: &RepairTask) -> Result<()> {
        self.check_insert(task)?;
        self.order.push(task.task_id.clone());
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    pub(crate) fn update(&mut self, task: &RepairTask) -> Result<()> {
        match self.tasks.get_mut(&task.task_id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(ShoalError::NotFound(format!(
                "task {} not in store",
                task.task_id
            ))),
        }
    }

    /// Returns the number of removed records.
    pub(crate) fn delete_by_disk(&mut self, disk_id: DiskId) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, task| task.broken_disk_id != disk_id);
        self.order.retain(|id| self.tasks.contains_key(id));
        before - self.tasks.len()
    }
}

/// In-memory [`TaskStore`], safe for concurrent use.
#[derive(Default)]
pub struct MemTaskStore {
    state: Mutex<TableState>,
}

impl MemTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemTaskStore {
    fn find(&self, cx: &Cx, task_id: &TaskId) -> Result<RepairTask> {
        checkpoint(cx)?;
        self.state
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| ShoalError::NotFound(format!("task {task_id} not in store")))
    }

    fn find_all(&self, cx: &Cx) -> Result<Vec<RepairTask>> {
        checkpoint(cx)?;
        Ok(self.state.lock().scan())
    }

    fn find_by_disk(&self, cx: &Cx, disk_id: DiskId) -> Result<Vec<RepairTask>> {
        checkpoint(cx)?;
        Ok(self.state.lock().scan_disk(disk_id))
    }

    fn insert(&self, cx: &Cx, task: &RepairTask) -> Result<()> {
        checkpoint(cx)?;
        self.state.lock().insert(task)
    }

    fn update(&self, cx: &Cx, task: &RepairTask) -> Result<()> {
        checkpoint(cx)?;
        self.state.lock().update(task)
    }

    fn mark_delete_by_disk(&self, cx: &Cx, disk_id: DiskId) -> Result<()> {
        checkpoint(cx)?;
        self.state.lock().delete_by_disk(disk_id);
        Ok(())
    }
}
