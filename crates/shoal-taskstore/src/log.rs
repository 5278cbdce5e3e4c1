//! Durable append-only task log.
//!
//! Each mutation is one JSON record per line. On open, the log is replayed
//! into an in-memory table; a torn tail record (crash mid-append) is
//! discarded and the file truncated to the last valid line, while corruption
//! anywhere else is a fatal decode error. After a bulk delete the log is
//! compacted by rewriting the live set.

use asupersync::Cx;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shoal_error::{Result, ShoalError};
use shoal_types::{DiskId, RepairTask, TaskId};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::mem::TableState;
use crate::{checkpoint, TaskStore};

/// Options for [`LogTaskStore`].
#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    /// Sync file data after each appended record (default: true).
    pub sync_on_write: bool,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Insert { task: RepairTask },
    Update { task: RepairTask },
    DeleteByDisk { disk_id: DiskId },
}

#[derive(Debug)]
struct LogState {
    table: TableState,
    file: File,
    path: PathBuf,
    sync_on_write: bool,
}

impl LogState {
    fn append(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|err| ShoalError::Store(format!("encode log record: {err}")))?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Rewrite the log with only the live records and swap it into place.
    fn compact(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path)?;
        for task in self.table.scan() {
            let mut line = serde_json::to_string(&LogRecord::Insert { task })
                .map_err(|err| ShoalError::Store(format!("encode log record: {err}")))?;
            line.push('\n');
            tmp.write_all(line.as_bytes())?;
        }
        tmp.sync_data()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Durable [`TaskStore`] backed by a JSON-line log file.
#[derive(Debug)]
pub struct LogTaskStore {
    state: Mutex<LogState>,
}

impl LogTaskStore {
    /// Open (or create) the log at `path` and replay it.
    ///
    /// A record that fails to decode is fatal (`CorruptRecord`) unless it is
    /// the unterminated final line, which is treated as a torn append and
    /// dropped.
    pub fn open(cx: &Cx, path: impl AsRef<Path>, options: LogStoreOptions) -> Result<Self> {
        checkpoint(cx)?;
        let path = path.as_ref().to_path_buf();

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut table = TableState::default();
        let mut valid_len: usize = 0;
        let mut records: u64 = 0;
        let mut offset = 0;
        while offset < bytes.len() {
            let rest = &bytes[offset..];
            let (line, consumed, terminated) = match rest.iter().position(|byte| *byte == b'\n') {
                Some(nl) => (&rest[..nl], nl + 1, true),
                None => (rest, rest.len(), false),
            };

            match serde_json::from_slice::<LogRecord>(line) {
                Ok(record) => {
                    Self::apply(&mut table, record)?;
                    records += 1;
                    offset += consumed;
                    valid_len = offset;
                }
                Err(err) if !terminated => {
                    warn!(
                        event = "task_log_torn_tail_dropped",
                        path = %path.display(),
                        offset,
                        error = %err
                    );
                    break;
                }
                Err(err) => {
                    return Err(ShoalError::CorruptRecord(format!(
                        "task log {} offset {offset}: {err}",
                        path.display()
                    )));
                }
            }
        }

        if valid_len < bytes.len() {
            // Drop the torn tail so future appends start on a record boundary.
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len as u64)?;
            file.sync_data()?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if valid_len > 0 && bytes[valid_len - 1] != b'\n' {
            // Final record survived without its terminator; restore the
            // record boundary before anything else is appended.
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        debug!(
            event = "task_log_opened",
            path = %path.display(),
            records,
            live_tasks = table.scan().len()
        );

        Ok(Self {
            state: Mutex::new(LogState {
                table,
                file,
                path,
                sync_on_write: options.sync_on_write,
            }),
        })
    }

    fn apply(table: &mut TableState, record: LogRecord) -> Result<()> {
        match record {
            LogRecord::Insert { task } => table.insert(&task),
            LogRecord::Update { task } => table.update(&task).map_err(|_| {
                ShoalError::CorruptRecord(format!("update of unknown task {}", task.task_id))
            }),
            LogRecord::DeleteByDisk { disk_id } => {
                table.delete_by_disk(disk_id);
                Ok(())
            }
        }
    }
}

impl TaskStore for LogTaskStore {
    fn find(&self, cx: &Cx, task_id: &TaskId) -> Result<RepairTask> {
        checkpoint(cx)?;
        self.state
            .lock()
            .table
            .get(task_id)
            .cloned()
            .ok_or_else(|| ShoalError::NotFound(format!("task {task_id} not in store")))
    }

    fn find_all(&self, cx: &Cx) -> Result<Vec<RepairTask>> {
        checkpoint(cx)?;
        Ok(self.state.lock().table.scan())
    }

    fn find_by_disk(&self, cx: &Cx, disk_id: DiskId) -> Result<Vec<RepairTask>> {
        checkpoint(cx)?;
        Ok(self.state.lock().table.scan_disk(disk_id))
    }

    fn insert(&self, cx: &Cx, task: &RepairTask) -> Result<()> {
        checkpoint(cx)?;
        let mut state = self.state.lock();
        state.table.check_insert(task)?;
        state.append(&LogRecord::Insert {
            task: task.clone(),
        })?;
        state.table.insert(task)
    }

    fn update(&self, cx: &Cx, task: &RepairTask) -> Result<()> {
        checkpoint(cx)?;
        let mut state = self.state.lock();
        if state.table.get(&task.task_id).is_none() {
            return Err(ShoalError::NotFound(format!(
                "task {} not in store",
                task.task_id
            )));
        }
        state.append(&LogRecord::Update {
            task: task.clone(),
        })?;
        state.table.update(task)
    }

    fn mark_delete_by_disk(&self, cx: &Cx, disk_id: DiskId) -> Result<()> {
        checkpoint(cx)?;
        let mut state = self.state.lock();
        state.append(&LogRecord::DeleteByDisk { disk_id })?;
        let removed = state.table.delete_by_disk(disk_id);
        if removed > 0 {
            // The deletion record above is already durable; compaction only
            // bounds the log size, so a failure here is not an error.
            if let Err(err) = state.compact() {
                warn!(
                    event = "task_log_compact_failed",
                    disk_id = disk_id.0,
                    error = %err
                );
            }
        }
        Ok(())
    }
}
