//! NVML backend.
//!
//! Loads `libnvidia-ml.so.1` at runtime through the raw bindings. Device
//! handles are re-resolved from their enumeration position on every call so
//! no library pointer ever crosses the [`DeviceLibrary`] boundary.

use std::ffi::{c_char, c_uint};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use nvml_wrapper_sys::bindings::{
    nvmlDeviceAttributes_t, nvmlDevice_t, nvmlEventData_t, nvmlEventSet_t,
    nvmlGpuInstanceProfileInfo_t, nvmlGpuTopologyLevel_t, nvmlPciInfo_t, nvmlReturn_t, NvmlLib,
};
use tracing::debug;

use crate::error::{LibError, LibResult};
use crate::library::{
    DeviceHandle, DeviceLibrary, EventSet, GpuInstanceProfileInfo, MigAttributes, MigMode,
    RawEvent, TopologyLevel, INVALID_INSTANCE_ID, SYMBOL_IS_MIG_DEVICE_HANDLE, SYMBOL_MIG_MODE,
};

/// Soname loaded when no explicit path is given.
pub const DEFAULT_LIBRARY: &str = "libnvidia-ml.so.1";

const NVML_SUCCESS: nvmlReturn_t = 0;
const NVML_ERROR_UNINITIALIZED: nvmlReturn_t = 1;
const NVML_ERROR_INVALID_ARGUMENT: nvmlReturn_t = 2;
const NVML_ERROR_NOT_SUPPORTED: nvmlReturn_t = 3;
const NVML_ERROR_NOT_FOUND: nvmlReturn_t = 6;
const NVML_ERROR_TIMEOUT: nvmlReturn_t = 10;
const NVML_ERROR_LIBRARY_NOT_FOUND: nvmlReturn_t = 12;

const NVML_DEVICE_MIG_ENABLE: c_uint = 1;
const NVML_NVLINK_MAX_LINKS: c_uint = 18;
const NVML_FEATURE_ENABLED: c_uint = 1;
const UUID_BUFFER_SIZE: usize = 96;

/// [`DeviceLibrary`] over the vendor management library.
pub struct NvmlLibrary {
    lib: Arc<NvmlLib>,
}

impl NvmlLibrary {
    /// Load the library from the default soname.
    pub fn load() -> LibResult<Self> {
        Self::load_from(DEFAULT_LIBRARY)
    }

    pub fn load_from(path: &str) -> LibResult<Self> {
        // SAFETY: loading runs the library's initializers; NVML has none with
        // preconditions on the caller.
        let lib = unsafe { NvmlLib::new(path) }.map_err(|e| {
            debug!(path, error = %e, "Failed to load NVML");
            LibError::LibraryNotFound
        })?;
        Ok(Self { lib: Arc::new(lib) })
    }

    fn gpu(&self, index: u32) -> LibResult<nvmlDevice_t> {
        let mut device: nvmlDevice_t = ptr::null_mut();
        // SAFETY: out-pointer is valid for the duration of the call.
        check(unsafe { self.lib.nvmlDeviceGetHandleByIndex_v2(index, &mut device) })?;
        Ok(device)
    }

    fn raw(&self, handle: DeviceHandle) -> LibResult<nvmlDevice_t> {
        match handle {
            DeviceHandle::Gpu { index } => self.gpu(index),
            DeviceHandle::Mig { parent, slot } => {
                let gpu = self.gpu(parent)?;
                let mut mig: nvmlDevice_t = ptr::null_mut();
                // SAFETY: `gpu` is a live handle from this session.
                check(unsafe { self.lib.nvmlDeviceGetMigDeviceHandleByIndex(gpu, slot, &mut mig) })?;
                Ok(mig)
            }
        }
    }

    fn physical(&self, handle: DeviceHandle) -> LibResult<nvmlDevice_t> {
        match handle {
            DeviceHandle::Gpu { .. } => self.raw(handle),
            DeviceHandle::Mig { .. } => Err(LibError::InvalidArgument),
        }
    }

    fn pci_info(&self, device: nvmlDevice_t) -> LibResult<nvmlPciInfo_t> {
        let mut info = MaybeUninit::<nvmlPciInfo_t>::zeroed();
        // SAFETY: the library fills the whole struct on success.
        check(unsafe { self.lib.nvmlDeviceGetPciInfo_v3(device, info.as_mut_ptr()) })?;
        // SAFETY: the call above succeeded, so `info` is initialized.
        Ok(unsafe { info.assume_init() })
    }

    fn u32_query(
        &self,
        f: impl FnOnce(&NvmlLib, *mut c_uint) -> nvmlReturn_t,
    ) -> LibResult<u32> {
        let mut value: c_uint = 0;
        check(f(&self.lib, &mut value))?;
        Ok(value)
    }
}

impl DeviceLibrary for NvmlLibrary {
    fn init(&self) -> LibResult<()> {
        // SAFETY: takes no arguments; the library is loaded for the lifetime of `self.lib`.
        check(unsafe { self.lib.nvmlInit_v2() })
    }

    fn shutdown(&self) -> LibResult<()> {
        // SAFETY: takes no arguments; handles are re-resolved per call, so none outlive the session.
        check(unsafe { self.lib.nvmlShutdown() })
    }

    fn has_symbol(&self, symbol: &str) -> bool {
        match symbol {
            SYMBOL_MIG_MODE => self.lib.nvmlDeviceGetMigMode.is_ok(),
            SYMBOL_IS_MIG_DEVICE_HANDLE => self.lib.nvmlDeviceIsMigDeviceHandle.is_ok(),
            _ => false,
        }
    }

    fn device_count(&self) -> LibResult<u32> {
        // SAFETY: `out` points at a live `c_uint` owned by `u32_query`.
        self.u32_query(|lib, out| unsafe { lib.nvmlDeviceGetCount_v2(out) })
    }

    fn device_by_index(&self, index: u32) -> LibResult<DeviceHandle> {
        self.gpu(index)?;
        Ok(DeviceHandle::Gpu { index })
    }

    fn uuid(&self, device: DeviceHandle) -> LibResult<String> {
        let raw = self.raw(device)?;
        let mut buf = [0 as c_char; UUID_BUFFER_SIZE];
        // SAFETY: `buf` is writable for `buf.len()` bytes and `raw` is a live handle.
        check(unsafe { self.lib.nvmlDeviceGetUUID(raw, buf.as_mut_ptr(), buf.len() as c_uint) })?;
        Ok(c_string(&buf))
    }

    fn minor_number(&self, device: DeviceHandle) -> LibResult<u32> {
        let raw = self.raw(device)?;
        // SAFETY: `raw` is a live handle and `out` points at a live `c_uint`.
        self.u32_query(|lib, out| unsafe { lib.nvmlDeviceGetMinorNumber(raw, out) })
    }

    fn pci_bus_id(&self, device: DeviceHandle) -> LibResult<String> {
        let info = self.pci_info(self.raw(device)?)?;
        Ok(c_string(&info.busId))
    }

    fn mig_mode(&self, device: DeviceHandle) -> LibResult<MigMode> {
        let raw = self.physical(device)?;
        let mut current: c_uint = 0;
        let mut pending: c_uint = 0;
        // SAFETY: `raw` is a live handle and both out-pointers are valid locals.
        check(unsafe { self.lib.nvmlDeviceGetMigMode(raw, &mut current, &mut pending) })?;
        Ok(if current == NVML_DEVICE_MIG_ENABLE {
            MigMode::Enabled
        } else {
            MigMode::Disabled
        })
    }

    fn is_mig_device_handle(&self, device: DeviceHandle) -> LibResult<bool> {
        let raw = self.raw(device)?;
        // SAFETY: `raw` is a live handle and `out` points at a live `c_uint`.
        let value = self.u32_query(|lib, out| unsafe { lib.nvmlDeviceIsMigDeviceHandle(raw, out) })?;
        Ok(value != 0)
    }

    fn max_mig_device_count(&self, device: DeviceHandle) -> LibResult<u32> {
        let raw = self.physical(device)?;
        // SAFETY: `raw` is a live handle and `out` points at a live `c_uint`.
        self.u32_query(|lib, out| unsafe { lib.nvmlDeviceGetMaxMigDeviceCount(raw, out) })
    }

    fn mig_device_by_index(&self, device: DeviceHandle, index: u32) -> LibResult<DeviceHandle> {
        let parent = device.physical_index();
        let handle = DeviceHandle::Mig {
            parent,
            slot: index,
        };
        self.raw(handle)?;
        Ok(handle)
    }

    fn parent_device(&self, mig: DeviceHandle) -> LibResult<DeviceHandle> {
        match mig {
            DeviceHandle::Mig { parent, .. } => {
                self.raw(mig)?;
                Ok(DeviceHandle::Gpu { index: parent })
            }
            DeviceHandle::Gpu { .. } => Err(LibError::InvalidArgument),
        }
    }

    fn gpu_instance_profile_info(
        &self,
        device: DeviceHandle,
        profile: u32,
    ) -> LibResult<GpuInstanceProfileInfo> {
        let raw = self.physical(device)?;
        let mut info = MaybeUninit::<nvmlGpuInstanceProfileInfo_t>::zeroed();
        // SAFETY: `raw` is a live handle and the out-pointer refers to a local `MaybeUninit`.
        check(unsafe {
            self.lib
                .nvmlDeviceGetGpuInstanceProfileInfo(raw, profile, info.as_mut_ptr())
        })?;
        // SAFETY: the call above succeeded, so `info` is initialized.
        let info = unsafe { info.assume_init() };
        Ok(GpuInstanceProfileInfo {
            slice_count: info.sliceCount,
            memory_size_mb: info.memorySizeMB,
        })
    }

    fn mig_attributes(&self, mig: DeviceHandle) -> LibResult<MigAttributes> {
        let raw = self.raw(mig)?;
        let mut attributes = MaybeUninit::<nvmlDeviceAttributes_t>::zeroed();
        // SAFETY: `raw` is a live handle and the out-pointer refers to a local `MaybeUninit`.
        check(unsafe { self.lib.nvmlDeviceGetAttributes_v2(raw, attributes.as_mut_ptr()) })?;
        // SAFETY: the call above succeeded, so `attributes` is initialized.
        let attributes = unsafe { attributes.assume_init() };
        Ok(MigAttributes {
            gpu_instance_slice_count: attributes.gpuInstanceSliceCount,
            compute_instance_slice_count: attributes.computeInstanceSliceCount,
            memory_size_mb: attributes.memorySizeMB,
        })
    }

    fn gpu_instance_id(&self, mig: DeviceHandle) -> LibResult<u32> {
        let raw = self.raw(mig)?;
        // SAFETY: `raw` is a live MIG handle and `out` points at a live `c_uint`.
        self.u32_query(|lib, out| unsafe { lib.nvmlDeviceGetGpuInstanceId(raw, out) })
    }

    fn compute_instance_id(&self, mig: DeviceHandle) -> LibResult<u32> {
        let raw = self.raw(mig)?;
        // SAFETY: `raw` is a live MIG handle and `out` points at a live `c_uint`.
        self.u32_query(|lib, out| unsafe { lib.nvmlDeviceGetComputeInstanceId(raw, out) })
    }

    fn topology_common_ancestor(
        &self,
        a: DeviceHandle,
        b: DeviceHandle,
    ) -> LibResult<TopologyLevel> {
        let (a, b) = (self.physical(a)?, self.physical(b)?);
        let mut level: nvmlGpuTopologyLevel_t = 0;
        // SAFETY: `a` and `b` are live handles and `level` is a valid local.
        check(unsafe { self.lib.nvmlDeviceGetTopologyCommonAncestor(a, b, &mut level) })?;
        Ok(match level {
            0 => TopologyLevel::Internal,
            10 => TopologyLevel::Single,
            20 => TopologyLevel::Multiple,
            30 => TopologyLevel::HostBridge,
            40 => TopologyLevel::Node,
            _ => TopologyLevel::System,
        })
    }

    fn nvlink_count(&self, a: DeviceHandle, b: DeviceHandle) -> LibResult<u32> {
        let raw_a = self.physical(a)?;
        let remote = c_string(&self.pci_info(self.physical(b)?)?.busId);

        let mut count = 0;
        for link in 0..NVML_NVLINK_MAX_LINKS {
            let mut state: c_uint = 0;
            // SAFETY: `raw_a` is a live handle and `state` is a valid local.
            match check(unsafe { self.lib.nvmlDeviceGetNvLinkState(raw_a, link, &mut state) }) {
                Ok(()) => {}
                Err(e) if e.is_tolerated() => continue,
                Err(e) => return Err(e),
            }
            if state != NVML_FEATURE_ENABLED {
                continue;
            }

            let mut info = MaybeUninit::<nvmlPciInfo_t>::zeroed();
            // SAFETY: `raw_a` is a live handle and `info` is a local `MaybeUninit`.
            match check(unsafe {
                self.lib
                    .nvmlDeviceGetNvLinkRemotePciInfo_v2(raw_a, link, info.as_mut_ptr())
            }) {
                Ok(()) => {}
                Err(e) if e.is_tolerated() => continue,
                Err(e) => return Err(e),
            }
            // SAFETY: the call above succeeded, so `info` is initialized.
            let info = unsafe { info.assume_init() };
            if c_string(&info.busId).eq_ignore_ascii_case(&remote) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn new_event_set(&self) -> LibResult<Box<dyn EventSet>> {
        let mut set: nvmlEventSet_t = ptr::null_mut();
        // SAFETY: `set` is a valid out-pointer; ownership moves into `NvmlEventSet`.
        check(unsafe { self.lib.nvmlEventSetCreate(&mut set) })?;
        Ok(Box::new(NvmlEventSet {
            library: NvmlLibrary {
                lib: Arc::clone(&self.lib),
            },
            set,
        }))
    }
}

struct NvmlEventSet {
    library: NvmlLibrary,
    set: nvmlEventSet_t,
}

// SAFETY: an NVML event set may be used from any thread, one at a time;
// `&mut self` on every method enforces the latter.
unsafe impl Send for NvmlEventSet {}

impl NvmlEventSet {
    /// Map the device pointer of an event back to an enumeration handle.
    fn resolve(&self, device: nvmlDevice_t, gi: u32, ci: u32) -> LibResult<DeviceHandle> {
        let library = &self.library;
        let count = library.device_count()?;
        for index in 0..count {
            if library.gpu(index)? != device {
                continue;
            }
            let gpu = DeviceHandle::Gpu { index };
            if gi == INVALID_INSTANCE_ID {
                return Ok(gpu);
            }
            let slots = match library.max_mig_device_count(gpu) {
                Ok(n) => n,
                Err(e) if e.is_tolerated() => return Ok(gpu),
                Err(e) => return Err(e),
            };
            for slot in 0..slots {
                let mig = DeviceHandle::Mig {
                    parent: index,
                    slot,
                };
                if library.raw(mig).is_err() {
                    continue;
                }
                if library.gpu_instance_id(mig)? == gi && library.compute_instance_id(mig)? == ci {
                    return Ok(mig);
                }
            }
            return Ok(gpu);
        }
        Err(LibError::NotFound)
    }
}

impl EventSet for NvmlEventSet {
    fn register(&mut self, device: DeviceHandle, event_types: u64) -> LibResult<()> {
        let raw = self.library.physical(device)?;
        // SAFETY: `raw` is a live handle and `self.set` is owned by this event set.
        check(unsafe {
            self.library
                .lib
                .nvmlDeviceRegisterEvents(raw, event_types, self.set)
        })
    }

    fn wait(&mut self, timeout: Duration) -> LibResult<RawEvent> {
        let millis = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;
        let mut data = MaybeUninit::<nvmlEventData_t>::zeroed();
        // SAFETY: `self.set` is live and `data` is a local `MaybeUninit`.
        check(unsafe {
            self.library
                .lib
                .nvmlEventSetWait_v2(self.set, data.as_mut_ptr(), millis)
        })?;
        // SAFETY: the wait above succeeded, so `data` is initialized.
        let data = unsafe { data.assume_init() };

        let device = self.resolve(data.device, data.gpuInstanceId, data.computeInstanceId)?;
        Ok(RawEvent {
            device,
            event_type: data.eventType,
            event_data: data.eventData,
            gpu_instance_id: data.gpuInstanceId,
            compute_instance_id: data.computeInstanceId,
        })
    }
}

impl Drop for NvmlEventSet {
    fn drop(&mut self) {
        // SAFETY: `self.set` was created by `nvmlEventSetCreate` and is freed only here.
        let ret = unsafe { self.library.lib.nvmlEventSetFree(self.set) };
        if ret != NVML_SUCCESS {
            debug!(code = ret, "Failed to free NVML event set");
        }
    }
}

fn check(ret: nvmlReturn_t) -> LibResult<()> {
    match ret {
        NVML_SUCCESS => Ok(()),
        NVML_ERROR_UNINITIALIZED => Err(LibError::Uninitialized),
        NVML_ERROR_INVALID_ARGUMENT => Err(LibError::InvalidArgument),
        NVML_ERROR_NOT_SUPPORTED => Err(LibError::NotSupported),
        NVML_ERROR_NOT_FOUND => Err(LibError::NotFound),
        NVML_ERROR_TIMEOUT => Err(LibError::Timeout),
        NVML_ERROR_LIBRARY_NOT_FOUND => Err(LibError::LibraryNotFound),
        code => Err(LibError::Unknown {
            code,
            message: format!("NVML return code {code}"),
        }),
    }
}

fn c_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
