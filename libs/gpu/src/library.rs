//! Hardware capability API.
//!
//! `DeviceLibrary` is the seam between this crate and the vendor management
//! library. Handles are plain values addressing a device by enumeration
//! position, so they can be copied across threads and compared freely; they
//! are only meaningful within one initialized session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LibResult;

/// Symbol looked up before issuing partition-mode queries.
pub const SYMBOL_MIG_MODE: &str = "nvmlDeviceGetMigMode";

/// Symbol looked up before asking whether a handle is a partition handle.
pub const SYMBOL_IS_MIG_DEVICE_HANDLE: &str = "nvmlDeviceIsMigDeviceHandle";

/// Number of GPU instance profile slots to query per device.
pub const GPU_INSTANCE_PROFILE_COUNT: u32 = 10;

/// Event class for critical XID errors.
pub const EVENT_TYPE_XID_CRITICAL_ERROR: u64 = 0x0000_0000_0000_0008;

/// Marker the library uses for "no instance id" in event payloads.
pub const INVALID_INSTANCE_ID: u32 = 0xFFFF_FFFF;

/// Opaque reference to a physical device or one of its partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceHandle {
    /// Physical device at `index` in enumeration order.
    Gpu { index: u32 },
    /// Partition in `slot` of the physical device at `parent`.
    Mig { parent: u32, slot: u32 },
}

impl DeviceHandle {
    /// Enumeration index of the owning physical device.
    pub fn physical_index(&self) -> u32 {
        match self {
            Self::Gpu { index } => *index,
            Self::Mig { parent, .. } => *parent,
        }
    }
}

/// Current partitioning mode of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigMode {
    Disabled,
    Enabled,
}

/// Shape of a GPU instance profile a device could offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInstanceProfileInfo {
    pub slice_count: u32,
    pub memory_size_mb: u64,
}

/// Attributes of an instantiated partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigAttributes {
    pub gpu_instance_slice_count: u32,
    pub compute_instance_slice_count: u32,
    pub memory_size_mb: u64,
}

/// Closest common interconnect ancestor of two physical devices,
/// ordered from nearest to farthest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyLevel {
    /// Same board.
    Internal,
    /// Behind a single PCIe switch.
    Single,
    /// Behind multiple PCIe switches without crossing the host bridge.
    Multiple,
    /// Connected through the same host bridge.
    HostBridge,
    /// Same NUMA node, different host bridges.
    Node,
    /// Crossing the inter-socket link.
    System,
}

/// Undecoded event as delivered by an event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub device: DeviceHandle,
    pub event_type: u64,
    pub event_data: u64,
    pub gpu_instance_id: u32,
    pub compute_instance_id: u32,
}

/// The vendor management library.
///
/// Implementations must be shareable across the supervisor and every
/// endpoint worker.
pub trait DeviceLibrary: Send + Sync {
    /// Open a session with the library.
    fn init(&self) -> LibResult<()>;

    /// Close the session opened by [`DeviceLibrary::init`].
    fn shutdown(&self) -> LibResult<()>;

    /// Whether the loaded library exports `symbol`.
    fn has_symbol(&self, symbol: &str) -> bool;

    fn device_count(&self) -> LibResult<u32>;

    fn device_by_index(&self, index: u32) -> LibResult<DeviceHandle>;

    fn uuid(&self, device: DeviceHandle) -> LibResult<String>;

    fn minor_number(&self, device: DeviceHandle) -> LibResult<u32>;

    /// PCI bus id as reported by the library, e.g. `00000000:3B:00.0`.
    fn pci_bus_id(&self, device: DeviceHandle) -> LibResult<String>;

    fn mig_mode(&self, device: DeviceHandle) -> LibResult<MigMode>;

    fn is_mig_device_handle(&self, device: DeviceHandle) -> LibResult<bool>;

    fn max_mig_device_count(&self, device: DeviceHandle) -> LibResult<u32>;

    fn mig_device_by_index(&self, device: DeviceHandle, index: u32) -> LibResult<DeviceHandle>;

    fn parent_device(&self, mig: DeviceHandle) -> LibResult<DeviceHandle>;

    fn gpu_instance_profile_info(
        &self,
        device: DeviceHandle,
        profile: u32,
    ) -> LibResult<GpuInstanceProfileInfo>;

    fn mig_attributes(&self, mig: DeviceHandle) -> LibResult<MigAttributes>;

    fn gpu_instance_id(&self, mig: DeviceHandle) -> LibResult<u32>;

    fn compute_instance_id(&self, mig: DeviceHandle) -> LibResult<u32>;

    fn topology_common_ancestor(&self, a: DeviceHandle, b: DeviceHandle)
        -> LibResult<TopologyLevel>;

    /// Number of active NVLink links between two physical devices.
    fn nvlink_count(&self, a: DeviceHandle, b: DeviceHandle) -> LibResult<u32>;

    fn new_event_set(&self) -> LibResult<Box<dyn EventSet>>;
}

/// A registration set for asynchronous hardware events.
///
/// The underlying library resource is released when the set is dropped.
pub trait EventSet: Send {
    fn register(&mut self, device: DeviceHandle, event_types: u64) -> LibResult<()>;

    /// Block until an event arrives or `timeout` elapses.
    fn wait(&mut self, timeout: Duration) -> LibResult<RawEvent>;
}
