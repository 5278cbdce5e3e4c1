#![forbid(unsafe_code)]
//! Cluster-manager capability surface consumed by the repair scheduler.
//!
//! The cluster manager is a remote authoritative service; this crate only
//! defines the calls the scheduler depends on, with `&Cx` capability context
//! for cooperative cancellation. Transport, retries and auth live behind the
//! trait.

use asupersync::Cx;
use serde::{Deserialize, Serialize};
use shoal_error::Result;
use shoal_types::{CodeMode, DiskId, DiskStatus, Idc, Vid, VolumeStatus, Vuid, VunitLocation};

/// Summary of one physical disk as the cluster manager sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub disk_id: DiskId,
    pub idc: Idc,
    pub rack: String,
    pub host: String,
    pub status: DiskStatus,
    pub free_chunk_cnt: i64,
    pub max_chunk_cnt: i64,
}

impl DiskInfo {
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.status == DiskStatus::Broken
    }

    #[must_use]
    pub fn is_repaired(&self) -> bool {
        self.status == DiskStatus::Repaired
    }
}

/// One volume unit resident on a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VunitInfo {
    pub vuid: Vuid,
    pub disk_id: DiskId,
    pub host: String,
    pub used: u64,
}

/// Volume metadata with the ordered unit locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub vid: Vid,
    pub status: VolumeStatus,
    pub code_mode: CodeMode,
    /// Ordered by unit index; `locations[i].vuid.index() == i`.
    pub locations: Vec<VunitLocation>,
}

impl VolumeInfo {
    /// Current location at a unit index, if the index is in range.
    #[must_use]
    pub fn location_at(&self, index: u8) -> Option<&VunitLocation> {
        self.locations.get(usize::from(index))
    }
}

/// A freshly allocated replacement unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedVunit {
    pub location: VunitLocation,
}

/// Remote calls the repair core depends on.
///
/// Every method is a suspension point and must honor `cx` cancellation.
/// Implementations are expected to be safely shareable across the manager's
/// loops and RPC handlers.
pub trait ClusterMgrApi: Send + Sync {
    /// Disks the cluster has declared broken, in adoption order.
    fn list_broken_disks(&self, cx: &Cx) -> Result<Vec<DiskInfo>>;

    fn get_disk_info(&self, cx: &Cx, disk_id: DiskId) -> Result<DiskInfo>;

    /// Volume units still recorded as resident on `disk_id`.
    fn list_disk_volume_units(&self, cx: &Cx, disk_id: DiskId) -> Result<Vec<VunitInfo>>;

    fn get_volume_info(&self, cx: &Cx, vid: Vid) -> Result<VolumeInfo>;

    /// Allocate a replacement unit for `bad_vuid`.
    ///
    /// The returned location carries the same vid and index with a strictly
    /// greater epoch.
    fn alloc_volume_unit(&self, cx: &Cx, bad_vuid: Vuid) -> Result<AllocatedVunit>;

    /// Commit `new_vuid` in place of `old_vuid` on the volume.
    ///
    /// Fails `OldVuidNotMatch` when the volume's current unit at that index
    /// is not `old_vuid`, `NewVuidNotMatch` when the allocation is stale, and
    /// `StatChunkFailed` when the destination chunk cannot be reached.
    fn update_volume(&self, cx: &Cx, vid: Vid, new_vuid: Vuid, old_vuid: Vuid) -> Result<()>;

    fn set_disk_repairing(&self, cx: &Cx, disk_id: DiskId) -> Result<()>;

    fn set_disk_repaired(&self, cx: &Cx, disk_id: DiskId) -> Result<()>;
}
