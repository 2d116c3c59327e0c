//! In-memory device library for development and tests.
//!
//! `FakeLibrary` answers capability queries from a [`FakeTopology`], which
//! can be built in code or deserialized from JSON. Failures can be injected
//! per call name and events can be pushed to waiting event sets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{LibError, LibResult};
use crate::library::{
    DeviceHandle, DeviceLibrary, EventSet, GpuInstanceProfileInfo, MigAttributes, MigMode,
    RawEvent, TopologyLevel,
};
use crate::paths::StaticPathResolver;

// =============================================================================
// Topology description
// =============================================================================

/// Description of a simulated fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FakeTopology {
    #[serde(default)]
    pub gpus: Vec<FakeGpu>,

    #[serde(default)]
    pub links: Vec<FakeLink>,

    /// Library symbols to report as absent.
    #[serde(default)]
    pub missing_symbols: Vec<String>,
}

impl FakeTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpu(mut self, gpu: FakeGpu) -> Self {
        self.gpus.push(gpu);
        self
    }

    pub fn with_link(mut self, a: &str, b: &str, level: TopologyLevel, nvlinks: u32) -> Self {
        self.links.push(FakeLink {
            a: a.to_string(),
            b: b.to_string(),
            level,
            nvlinks,
        });
        self
    }

    pub fn without_symbol(mut self, symbol: &str) -> Self {
        self.missing_symbols.push(symbol.to_string());
        self
    }
}

/// A simulated physical device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeGpu {
    pub uuid: String,
    pub minor: u32,
    pub bus_id: String,

    #[serde(default)]
    pub mig_supported: bool,

    #[serde(default)]
    pub mig_enabled: bool,

    #[serde(default)]
    pub max_mig_devices: u32,

    /// GPU instance profiles, indexed by profile id.
    #[serde(default)]
    pub profiles: Vec<GpuInstanceProfileInfo>,

    #[serde(default)]
    pub mig_devices: Vec<FakeMigDevice>,
}

impl FakeGpu {
    pub fn new(uuid: &str, minor: u32, bus_id: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            minor,
            bus_id: bus_id.to_string(),
            mig_supported: false,
            mig_enabled: false,
            max_mig_devices: 0,
            profiles: Vec::new(),
            mig_devices: Vec::new(),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<GpuInstanceProfileInfo>) -> Self {
        self.mig_supported = true;
        self.profiles = profiles;
        self
    }

    pub fn with_max_mig_devices(mut self, count: u32) -> Self {
        self.mig_supported = true;
        self.max_mig_devices = count;
        self
    }

    pub fn with_mig_enabled(mut self) -> Self {
        self.mig_supported = true;
        self.mig_enabled = true;
        self
    }

    pub fn with_mig_device(mut self, device: FakeMigDevice) -> Self {
        self.max_mig_devices = self.max_mig_devices.max(device.slot + 1);
        self.mig_devices.push(device);
        self
    }
}

/// A simulated MIG partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeMigDevice {
    pub slot: u32,
    pub uuid: String,
    pub gpu_instance_slice_count: u32,
    pub compute_instance_slice_count: u32,
    pub memory_size_mb: u64,

    #[serde(default)]
    pub gpu_instance_id: u32,

    #[serde(default)]
    pub compute_instance_id: u32,

    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl FakeMigDevice {
    pub fn new(slot: u32, uuid: &str, gpu_slices: u32, compute_slices: u32, memory_mb: u64) -> Self {
        Self {
            slot,
            uuid: uuid.to_string(),
            gpu_instance_slice_count: gpu_slices,
            compute_instance_slice_count: compute_slices,
            memory_size_mb: memory_mb,
            gpu_instance_id: slot,
            compute_instance_id: 0,
            paths: Vec::new(),
        }
    }

    pub fn with_ids(mut self, gpu_instance_id: u32, compute_instance_id: u32) -> Self {
        self.gpu_instance_id = gpu_instance_id;
        self.compute_instance_id = compute_instance_id;
        self
    }

    pub fn with_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }
}

/// Interconnect between two simulated devices, by uuid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeLink {
    pub a: String,
    pub b: String,
    pub level: TopologyLevel,
    #[serde(default)]
    pub nvlinks: u32,
}

// =============================================================================
// Library
// =============================================================================

#[derive(Default)]
struct FakeState {
    failures: Mutex<HashMap<String, LibError>>,
    events: Mutex<VecDeque<RawEvent>>,
    event_ready: Condvar,
    init_calls: AtomicU32,
    shutdown_calls: AtomicU32,
    open_event_sets: AtomicU32,
}

/// Deterministic [`DeviceLibrary`] backed by a [`FakeTopology`].
///
/// Clones share failure injection, the event queue and call counters.
#[derive(Clone)]
pub struct FakeLibrary {
    topology: Arc<FakeTopology>,
    state: Arc<FakeState>,
}

impl FakeLibrary {
    pub fn new(topology: FakeTopology) -> Self {
        Self {
            topology: Arc::new(topology),
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn topology(&self) -> &FakeTopology {
        &self.topology
    }

    /// Make every later call named `call` fail with `error`.
    pub fn fail(&self, call: &str, error: LibError) {
        if let Ok(mut failures) = self.state.failures.lock() {
            failures.insert(call.to_string(), error);
        }
    }

    pub fn clear_failure(&self, call: &str) {
        if let Ok(mut failures) = self.state.failures.lock() {
            failures.remove(call);
        }
    }

    /// Queue an event for any event set registered on its device.
    pub fn inject_event(&self, event: RawEvent) {
        if let Ok(mut events) = self.state.events.lock() {
            events.push_back(event);
        }
        self.state.event_ready.notify_all();
    }

    pub fn init_calls(&self) -> u32 {
        self.state.init_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.state.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Event sets created and not yet dropped.
    pub fn open_event_sets(&self) -> u32 {
        self.state.open_event_sets.load(Ordering::SeqCst)
    }

    /// Path table built from the partitions' configured paths.
    pub fn path_resolver(&self) -> StaticPathResolver {
        let mut resolver = StaticPathResolver::default();
        for gpu in &self.topology.gpus {
            for mig in &gpu.mig_devices {
                resolver.insert(mig.uuid.clone(), mig.paths.clone());
            }
        }
        resolver
    }

    fn check(&self, call: &str) -> LibResult<()> {
        match self.state.failures.lock() {
            Ok(failures) => match failures.get(call) {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            },
            Err(_) => Err(LibError::Unknown {
                code: 999,
                message: "fake state poisoned".to_string(),
            }),
        }
    }

    fn gpu(&self, index: u32) -> LibResult<&FakeGpu> {
        self.topology
            .gpus
            .get(index as usize)
            .ok_or(LibError::InvalidArgument)
    }

    fn physical(&self, device: DeviceHandle) -> LibResult<&FakeGpu> {
        match device {
            DeviceHandle::Gpu { index } => self.gpu(index),
            DeviceHandle::Mig { .. } => Err(LibError::InvalidArgument),
        }
    }

    fn mig(&self, device: DeviceHandle) -> LibResult<&FakeMigDevice> {
        match device {
            DeviceHandle::Mig { parent, slot } => self
                .gpu(parent)?
                .mig_devices
                .iter()
                .find(|m| m.slot == slot)
                .ok_or(LibError::NotFound),
            DeviceHandle::Gpu { .. } => Err(LibError::InvalidArgument),
        }
    }

    fn link(&self, a: DeviceHandle, b: DeviceHandle) -> LibResult<&FakeLink> {
        let a = &self.physical(a)?.uuid;
        let b = &self.physical(b)?.uuid;
        self.topology
            .links
            .iter()
            .find(|l| (&l.a == a && &l.b == b) || (&l.a == b && &l.b == a))
            .ok_or(LibError::NotSupported)
    }
}

impl DeviceLibrary for FakeLibrary {
    fn init(&self) -> LibResult<()> {
        self.check("init")?;
        self.state.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> LibResult<()> {
        self.check("shutdown")?;
        self.state.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn has_symbol(&self, symbol: &str) -> bool {
        !self.topology.missing_symbols.iter().any(|s| s == symbol)
    }

    fn device_count(&self) -> LibResult<u32> {
        self.check("device_count")?;
        Ok(self.topology.gpus.len() as u32)
    }

    fn device_by_index(&self, index: u32) -> LibResult<DeviceHandle> {
        self.check("device_by_index")?;
        self.gpu(index)?;
        Ok(DeviceHandle::Gpu { index })
    }

    fn uuid(&self, device: DeviceHandle) -> LibResult<String> {
        self.check("uuid")?;
        match device {
            DeviceHandle::Gpu { .. } => Ok(self.physical(device)?.uuid.clone()),
            DeviceHandle::Mig { .. } => Ok(self.mig(device)?.uuid.clone()),
        }
    }

    fn minor_number(&self, device: DeviceHandle) -> LibResult<u32> {
        self.check("minor_number")?;
        Ok(self.physical(device)?.minor)
    }

    fn pci_bus_id(&self, device: DeviceHandle) -> LibResult<String> {
        self.check("pci_bus_id")?;
        Ok(self.physical(device)?.bus_id.clone())
    }

    fn mig_mode(&self, device: DeviceHandle) -> LibResult<MigMode> {
        self.check("mig_mode")?;
        let gpu = self.physical(device)?;
        if !gpu.mig_supported {
            return Err(LibError::NotSupported);
        }
        Ok(if gpu.mig_enabled {
            MigMode::Enabled
        } else {
            MigMode::Disabled
        })
    }

    fn is_mig_device_handle(&self, device: DeviceHandle) -> LibResult<bool> {
        self.check("is_mig_device_handle")?;
        Ok(matches!(device, DeviceHandle::Mig { .. }))
    }

    fn max_mig_device_count(&self, device: DeviceHandle) -> LibResult<u32> {
        self.check("max_mig_device_count")?;
        let gpu = self.physical(device)?;
        if !gpu.mig_supported {
            return Err(LibError::NotSupported);
        }
        Ok(gpu.max_mig_devices)
    }

    fn mig_device_by_index(&self, device: DeviceHandle, index: u32) -> LibResult<DeviceHandle> {
        self.check("mig_device_by_index")?;
        let parent = device.physical_index();
        let gpu = self.physical(device)?;
        if index >= gpu.max_mig_devices {
            return Err(LibError::InvalidArgument);
        }
        if gpu.mig_devices.iter().any(|m| m.slot == index) {
            Ok(DeviceHandle::Mig {
                parent,
                slot: index,
            })
        } else {
            Err(LibError::NotFound)
        }
    }

    fn parent_device(&self, mig: DeviceHandle) -> LibResult<DeviceHandle> {
        self.check("parent_device")?;
        match mig {
            DeviceHandle::Mig { parent, .. } => Ok(DeviceHandle::Gpu { index: parent }),
            DeviceHandle::Gpu { .. } => Err(LibError::InvalidArgument),
        }
    }

    fn gpu_instance_profile_info(
        &self,
        device: DeviceHandle,
        profile: u32,
    ) -> LibResult<GpuInstanceProfileInfo> {
        self.check("gpu_instance_profile_info")?;
        let gpu = self.physical(device)?;
        if !gpu.mig_supported {
            return Err(LibError::NotSupported);
        }
        gpu.profiles
            .get(profile as usize)
            .copied()
            .ok_or(LibError::NotSupported)
    }

    fn mig_attributes(&self, mig: DeviceHandle) -> LibResult<MigAttributes> {
        self.check("mig_attributes")?;
        let device = self.mig(mig)?;
        Ok(MigAttributes {
            gpu_instance_slice_count: device.gpu_instance_slice_count,
            compute_instance_slice_count: device.compute_instance_slice_count,
            memory_size_mb: device.memory_size_mb,
        })
    }

    fn gpu_instance_id(&self, mig: DeviceHandle) -> LibResult<u32> {
        self.check("gpu_instance_id")?;
        Ok(self.mig(mig)?.gpu_instance_id)
    }

    fn compute_instance_id(&self, mig: DeviceHandle) -> LibResult<u32> {
        self.check("compute_instance_id")?;
        Ok(self.mig(mig)?.compute_instance_id)
    }

    fn topology_common_ancestor(
        &self,
        a: DeviceHandle,
        b: DeviceHandle,
    ) -> LibResult<TopologyLevel> {
        self.check("topology_common_ancestor")?;
        Ok(self.link(a, b)?.level)
    }

    fn nvlink_count(&self, a: DeviceHandle, b: DeviceHandle) -> LibResult<u32> {
        self.check("nvlink_count")?;
        match self.link(a, b) {
            Ok(link) => Ok(link.nvlinks),
            Err(LibError::NotSupported) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn new_event_set(&self) -> LibResult<Box<dyn EventSet>> {
        self.check("new_event_set")?;
        self.state.open_event_sets.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEventSet {
            library: self.clone(),
            registered: HashSet::new(),
        }))
    }
}

// =============================================================================
// Events
// =============================================================================

struct FakeEventSet {
    library: FakeLibrary,
    registered: HashSet<u32>,
}

impl EventSet for FakeEventSet {
    fn register(&mut self, device: DeviceHandle, _event_types: u64) -> LibResult<()> {
        self.library.check("register_events")?;
        self.library.physical(device)?;
        self.registered.insert(device.physical_index());
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> LibResult<RawEvent> {
        self.library.check("wait")?;
        let state = &self.library.state;
        let deadline = Instant::now() + timeout;

        let mut events = state.events.lock().map_err(|_| LibError::Uninitialized)?;
        loop {
            if let Some(pos) = events
                .iter()
                .position(|e| self.registered.contains(&e.device.physical_index()))
            {
                if let Some(event) = events.remove(pos) {
                    return Ok(event);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LibError::Timeout);
            }
            let (guard, _) = state
                .event_ready
                .wait_timeout(events, deadline - now)
                .map_err(|_| LibError::Uninitialized)?;
            events = guard;
        }
    }
}

impl Drop for FakeEventSet {
    fn drop(&mut self) {
        self.library
            .state
            .open_event_sets
            .fetch_sub(1, Ordering::SeqCst);
    }
}
