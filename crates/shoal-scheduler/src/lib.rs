#![forbid(unsafe_code)]
//! Disk-repair manager for the shoal erasure-coded blob store.
//!
//! When the cluster manager declares a physical disk broken, the
//! [`repairer::DiskRepairMgr`] adopts it, generates one repair task per
//! damaged volume unit, drives each task through
//! `Inited → Prepared → WorkCompleted → Finished` (or `FinishedInAdvance`
//! when the unit was replaced out-of-band), and declares the disk repaired
//! once every task is terminal. Remote workers that perform the byte-level
//! reconstruction lease prepared tasks through the acquire/renew/complete
//! surface on the manager.
//!
//! # Flow
//!
//! ```text
//! cluster-mgr → collect → prepare queue → prepare (alloc unit) → work queue
//!     → worker acquire/renew → complete → finish queue → finalize (commit)
//!     → completion check → disk repaired, tasks deleted
//! ```

pub mod base;
pub mod queue;
pub mod repairer;
pub mod stats;
pub mod taskswitch;
pub mod workqueue;

pub use repairer::{
    CancelTaskArgs, CompleteTaskArgs, DiskRepairConfig, DiskRepairMgr, RepairDaemon, RepairStats,
    TaskReportArgs,
};
pub use taskswitch::TaskSwitch;
