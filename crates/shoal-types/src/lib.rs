#![forbid(unsafe_code)]
//! Core identifier and record types for the shoal repair scheduler.
//!
//! A `Vuid` packs (volume id, index within volume, epoch) into a single
//! `u64`; the epoch strictly increases every time a unit is replaced, so two
//! generations of the same slot never collide.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Lowest valid unit epoch.
pub const MIN_EPOCH: u32 = 1;
/// Highest valid unit epoch (24 bits).
pub const MAX_EPOCH: u32 = 0x00FF_FFFF;

/// Task-id prefix for disk-repair tasks.
pub const DISK_REPAIR_TASK_PREFIX: &str = "disk-repair";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Physical disk identifier. Zero is reserved as "no disk".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DiskId(pub u32);

impl DiskId {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Volume identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vid(pub u32);

impl fmt::Display for Vid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Volume-unit identifier: `vid (32) | index (8) | epoch (24)`.
///
/// The packed layout keeps ordering by volume, then slot, then generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vuid(pub u64);

impl Vuid {
    /// Pack a vuid, validating the epoch range.
    pub fn new(vid: Vid, index: u8, epoch: u32) -> Result<Self, TypeError> {
        if !(MIN_EPOCH..=MAX_EPOCH).contains(&epoch) {
            return Err(TypeError::InvalidField {
                field: "epoch",
                reason: "must be in [1, 0xFFFFFF]",
            });
        }
        Ok(Self(
            (u64::from(vid.0) << 32) | (u64::from(index) << 24) | u64::from(epoch),
        ))
    }

    #[must_use]
    pub fn vid(self) -> Vid {
        Vid((self.0 >> 32) as u32)
    }

    #[must_use]
    pub fn index(self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }

    #[must_use]
    pub fn epoch(self) -> u32 {
        (self.0 & 0x00FF_FFFF) as u32
    }

    /// The same slot one generation later.
    pub fn bump_epoch(self) -> Result<Self, TypeError> {
        Self::new(self.vid(), self.index(), self.epoch() + 1)
    }
}

impl fmt::Display for Vuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Availability/failure domain name (datacenter).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Idc(pub String);

impl Idc {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Idc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Repair task identifier, shaped `"disk-repair-<vid>-<nonce>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Disk lifecycle status as tracked by the cluster manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Normal,
    Broken,
    Repairing,
    Repaired,
    Dropped,
}

/// Volume lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Idle,
    Active,
    Lock,
    Unlocking,
}

/// Erasure-coding scheme of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeMode {
    Ec15P12,
    Ec6P6,
    Ec16P20L2,
    Ec6P10L2,
}

/// Shard counts of a code mode: `n` data, `m` parity, `l` local, spread over
/// `az_count` availability zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeTactic {
    pub n: u8,
    pub m: u8,
    pub l: u8,
    pub az_count: u8,
}

impl CodeTactic {
    /// Total unit slots in a volume of this mode.
    #[must_use]
    pub fn unit_count(self) -> usize {
        usize::from(self.n) + usize::from(self.m) + usize::from(self.l)
    }
}

impl CodeMode {
    #[must_use]
    pub fn tactic(self) -> CodeTactic {
        match self {
            Self::Ec15P12 => CodeTactic {
                n: 15,
                m: 12,
                l: 0,
                az_count: 3,
            },
            Self::Ec6P6 => CodeTactic {
                n: 6,
                m: 6,
                l: 0,
                az_count: 3,
            },
            Self::Ec16P20L2 => CodeTactic {
                n: 16,
                m: 20,
                l: 2,
                az_count: 2,
            },
            Self::Ec6P10L2 => CodeTactic {
                n: 6,
                m: 10,
                l: 2,
                az_count: 2,
            },
        }
    }
}

/// One unit's placement: which chunk on which disk serves this vuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VunitLocation {
    pub vuid: Vuid,
    pub host: String,
    pub disk_id: DiskId,
}

/// Lifecycle state of a repair task.
///
/// Persisted as the raw discriminant so a corrupted store surfaces as a
/// decode error instead of a mis-dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RepairState {
    Inited,
    Prepared,
    WorkCompleted,
    FinishedInAdvance,
    Finished,
}

impl RepairState {
    /// True once the task needs no further scheduling.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FinishedInAdvance | Self::Finished)
    }
}

impl From<RepairState> for u8 {
    fn from(state: RepairState) -> Self {
        match state {
            RepairState::Inited => 1,
            RepairState::Prepared => 2,
            RepairState::WorkCompleted => 3,
            RepairState::FinishedInAdvance => 4,
            RepairState::Finished => 5,
        }
    }
}

impl TryFrom<u8> for RepairState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Inited),
            2 => Ok(Self::Prepared),
            3 => Ok(Self::WorkCompleted),
            4 => Ok(Self::FinishedInAdvance),
            5 => Ok(Self::Finished),
            other => Err(format!("unknown repair state {other}")),
        }
    }
}

/// Persisted per-unit repair descriptor.
///
/// Created by the collect loop with only identity fields; code mode, source
/// peers and the destination are filled in when the task is prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairTask {
    pub task_id: TaskId,
    pub state: RepairState,
    pub broken_disk_id: DiskId,
    pub idc: Idc,
    pub bad_vuid: Vuid,
    pub code_mode: Option<CodeMode>,
    pub sources: Vec<VunitLocation>,
    pub destination: Option<VunitLocation>,
    pub ctime_ms: u64,
    pub mtime_ms: u64,
}

impl RepairTask {
    #[must_use]
    pub fn new(task_id: TaskId, broken_disk_id: DiskId, idc: Idc, bad_vuid: Vuid) -> Self {
        let now = now_ms();
        Self {
            task_id,
            state: RepairState::Inited,
            broken_disk_id,
            idc,
            bad_vuid,
            code_mode: None,
            sources: Vec::new(),
            destination: None,
            ctime_ms: now,
            mtime_ms: now,
        }
    }

    /// Volume this task repairs.
    #[must_use]
    pub fn vid(&self) -> Vid {
        self.bad_vuid.vid()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Destination vuid, if the task has been prepared.
    #[must_use]
    pub fn destination_vuid(&self) -> Option<Vuid> {
        self.destination.as_ref().map(|loc| loc.vuid)
    }

    pub fn touch(&mut self) {
        self.mtime_ms = now_ms();
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
