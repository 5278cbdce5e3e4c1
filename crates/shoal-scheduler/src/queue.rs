//! Ordered task queue with pop/retry semantics.
//!
//! Entries are deduplicated by task id. `pop` hands a task out and parks it
//! in a "doing" set; a task whose cycle fails is simply left there and
//! becomes poppable again once its retry delay lapses, while a successful
//! cycle calls `remove`. `stats` reports `(todo, doing)` where "doing" counts
//! entries still inside their retry window.

use parking_lot::Mutex;
use shoal_types::{RepairTask, TaskId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct QueueState {
    todo: VecDeque<TaskId>,
    doing: HashMap<TaskId, Instant>,
    tasks: HashMap<TaskId, RepairTask>,
}

/// FIFO-ish queue feeding the prepare and finalize loops.
pub struct TaskQueue {
    retry_delay: Duration,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    #[must_use]
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            state: Mutex::new(QueueState {
                todo: VecDeque::new(),
                doing: HashMap::new(),
                tasks: HashMap::new(),
            }),
        }
    }

    /// Enqueue a task. Returns false (and keeps the stored task) when the id
    /// is already present in either set.
    pub fn push(&self, task: RepairTask) -> bool {
        let mut state = self.state.lock();
        if state.tasks.contains_key(&task.task_id) {
            return false;
        }
        state.todo.push_back(task.task_id.clone());
        state.tasks.insert(task.task_id.clone(), task);
        true
    }

    /// Pop the next eligible task and park it as "doing" for the retry
    /// window. Expired "doing" entries are re-eligible.
    pub fn pop(&self) -> Option<RepairTask> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired: Vec<TaskId> = state
            .doing
            .iter()
            .filter(|(_, eligible_at)| **eligible_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            state.doing.remove(&id);
            state.todo.push_back(id);
        }

        let id = state.todo.pop_front()?;
        state.doing.insert(id.clone(), now + self.retry_delay);
        state.tasks.get(&id).cloned()
    }

    /// Drop a task from the queue entirely (after its cycle succeeded).
    pub fn remove(&self, task_id: &TaskId) -> Option<RepairTask> {
        let mut state = self.state.lock();
        let task = state.tasks.remove(task_id)?;
        state.doing.remove(task_id);
        state.todo.retain(|id| id != task_id);
        Some(task)
    }

    #[must_use]
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.state.lock().tasks.contains_key(task_id)
    }

    /// `(todo, doing)` counts; expired "doing" entries count as todo.
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        let now = Instant::now();
        let state = self.state.lock();
        let doing = state
            .doing
            .values()
            .filter(|eligible_at| **eligible_at > now)
            .count();
        (state.tasks.len() - doing, doing)
    }
}
