//! Hardware health events.
//!
//! [`HealthEventMonitor`] wraps one library event set: callers subscribe
//! devices by id and block in [`HealthEventMonitor::wait`]. Waits are meant
//! to run on a dedicated thread; [`check_health`] is the loop endpoints run
//! there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::walk_gpu_devices;
use crate::device::{Device, DeviceSet};
use crate::error::{GpuError, LibError, LibResultExt};
use crate::library::{DeviceLibrary, EventSet, EVENT_TYPE_XID_CRITICAL_ERROR};

/// XIDs caused by applications rather than hardware faults.
pub const APPLICATION_XIDS: &[u64] = &[13, 31, 43, 45, 68];

/// Pause after a failed wait before waiting again.
const WAIT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// A decoded hardware event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareEvent {
    /// Id of the reporting device; empty if the library could not tell.
    pub uuid: String,
    /// Set only when the reporting handle is a partition.
    pub gpu_instance_id: Option<u32>,
    /// Set only when the reporting handle is a partition.
    pub compute_instance_id: Option<u32>,
    pub event_type: u64,
    pub event_data: u64,
}

impl HardwareEvent {
    /// Whether the event concerns `device`, directly or through its parent.
    pub fn affects(&self, device: &Device) -> bool {
        self.uuid.is_empty()
            || device.id == self.uuid
            || device.parent_id.as_deref() == Some(self.uuid.as_str())
    }
}

/// One subscription set on the device library.
///
/// The library resource is released when the monitor is dropped.
pub struct HealthEventMonitor {
    library: Arc<dyn DeviceLibrary>,
    events: Box<dyn EventSet>,
}

impl HealthEventMonitor {
    pub fn new(library: Arc<dyn DeviceLibrary>) -> Result<Self, GpuError> {
        let events = library
            .new_event_set()
            .context_lib(|| "error creating event set")?;
        Ok(Self { library, events })
    }

    /// Register interest in `event_types` on the physical device `device_id`.
    pub fn subscribe(&mut self, device_id: &str, event_types: u64) -> Result<(), GpuError> {
        let library = self.library.as_ref();
        let mut handle = None;
        walk_gpu_devices(library, |i, device| {
            if handle.is_some() {
                return Ok(());
            }
            let uuid = library
                .uuid(device)
                .context_lib(|| format!("error getting UUID of GPU with index '{i}'"))?;
            if uuid == device_id {
                handle = Some(device);
            }
            Ok(())
        })?;

        let handle = handle.ok_or_else(|| GpuError::DeviceNotFound(device_id.to_string()))?;
        self.events
            .register(handle, event_types)
            .context_lib(|| format!("error registering events for '{device_id}'"))
    }

    /// Block until an event arrives or `timeout` elapses.
    ///
    /// A timeout yields [`GpuError::Timeout`], which callers retry.
    pub fn wait(&mut self, timeout: Duration) -> Result<HardwareEvent, GpuError> {
        let raw = match self.events.wait(timeout) {
            Ok(raw) => raw,
            Err(LibError::Timeout) => return Err(GpuError::Timeout),
            Err(e) => return Err(GpuError::library("error waiting for event", e)),
        };

        let library = self.library.as_ref();
        let uuid = library
            .uuid(raw.device)
            .context_lib(|| "error getting UUID of event device")?;
        let is_mig = library
            .is_mig_device_handle(raw.device)
            .context_lib(|| "error checking if event device is a MIG device")?;

        let (gpu_instance_id, compute_instance_id) = if is_mig {
            (Some(raw.gpu_instance_id), Some(raw.compute_instance_id))
        } else {
            (None, None)
        };

        Ok(HardwareEvent {
            uuid,
            gpu_instance_id,
            compute_instance_id,
            event_type: raw.event_type,
            event_data: raw.event_data,
        })
    }
}

/// Settings for the health-check loop.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub wait_timeout: Duration,
    pub skipped_xids: Vec<u64>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            skipped_xids: APPLICATION_XIDS.to_vec(),
        }
    }
}

/// Watch `devices` for critical XID errors until `stop` is set.
///
/// Blocks the calling thread. `on_unhealthy` is called for every device an
/// event marks unhealthy.
pub fn check_health<F>(
    library: Arc<dyn DeviceLibrary>,
    devices: &DeviceSet,
    config: &HealthCheckConfig,
    stop: &AtomicBool,
    mut on_unhealthy: F,
) -> Result<(), GpuError>
where
    F: FnMut(&Device, &HardwareEvent),
{
    let mut monitor = HealthEventMonitor::new(library)?;

    for id in devices.physical_ids() {
        match monitor.subscribe(&id, EVENT_TYPE_XID_CRITICAL_ERROR) {
            Ok(()) => {}
            Err(GpuError::Library { source, .. }) if source.is_tolerated() => {
                warn!(device = %id, error = %source, "Health events not supported, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    info!(devices = devices.len(), "Health checks started");

    while !stop.load(Ordering::SeqCst) {
        let event = match monitor.wait(config.wait_timeout) {
            Ok(event) => event,
            Err(GpuError::Timeout) => continue,
            Err(e) => {
                warn!(error = %e, "Error waiting for health event, retrying");
                std::thread::sleep(WAIT_ERROR_DELAY);
                continue;
            }
        };

        if event.event_type != EVENT_TYPE_XID_CRITICAL_ERROR {
            continue;
        }
        if config.skipped_xids.contains(&event.event_data) {
            debug!(xid = event.event_data, uuid = %event.uuid, "Skipping application XID");
            continue;
        }

        for device in devices.iter().filter(|d| event.affects(d)) {
            warn!(
                device = %device.id,
                xid = event.event_data,
                gpu_instance_id = ?event.gpu_instance_id,
                compute_instance_id = ?event.compute_instance_id,
                "Critical XID error, marking device unhealthy"
            );
            on_unhealthy(device, &event);
        }
    }

    debug!("Health checks stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeGpu, FakeLibrary, FakeMigDevice, FakeTopology};
    use crate::library::{DeviceHandle, RawEvent, INVALID_INSTANCE_ID};

    fn library() -> FakeLibrary {
        FakeLibrary::new(
            FakeTopology::new()
                .with_gpu(FakeGpu::new("GPU-a", 0, "00000000:3B:00.0"))
                .with_gpu(
                    FakeGpu::new("GPU-b", 1, "00000000:5E:00.0")
                        .with_mig_enabled()
                        .with_mig_device(FakeMigDevice::new(0, "MIG-1", 1, 1, 4864).with_ids(7, 0)),
                ),
        )
    }

    fn xid(device: DeviceHandle, xid: u64, gi: u32, ci: u32) -> RawEvent {
        RawEvent {
            device,
            event_type: EVENT_TYPE_XID_CRITICAL_ERROR,
            event_data: xid,
            gpu_instance_id: gi,
            compute_instance_id: ci,
        }
    }

    #[test]
    fn test_subscribe_unknown_device() {
        let library = library();
        let mut monitor = HealthEventMonitor::new(Arc::new(library)).unwrap();
        let err = monitor
            .subscribe("GPU-missing", EVENT_TYPE_XID_CRITICAL_ERROR)
            .unwrap_err();
        assert!(matches!(err, GpuError::DeviceNotFound(_)));
    }

    #[test]
    fn test_wait_times_out() {
        let library = library();
        let mut monitor = HealthEventMonitor::new(Arc::new(library)).unwrap();
        monitor
            .subscribe("GPU-a", EVENT_TYPE_XID_CRITICAL_ERROR)
            .unwrap();

        let err = monitor.wait(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_full_device_event_has_no_instance_ids() {
        let library = library();
        let mut monitor = HealthEventMonitor::new(Arc::new(library.clone())).unwrap();
        monitor
            .subscribe("GPU-a", EVENT_TYPE_XID_CRITICAL_ERROR)
            .unwrap();

        library.inject_event(xid(
            DeviceHandle::Gpu { index: 0 },
            79,
            INVALID_INSTANCE_ID,
            INVALID_INSTANCE_ID,
        ));
        let event = monitor.wait(Duration::from_millis(50)).unwrap();
        assert_eq!(event.uuid, "GPU-a");
        assert_eq!(event.gpu_instance_id, None);
        assert_eq!(event.compute_instance_id, None);
        assert_eq!(event.event_data, 79);
    }

    #[test]
    fn test_partition_event_carries_instance_ids() {
        let library = library();
        let mut monitor = HealthEventMonitor::new(Arc::new(library.clone())).unwrap();
        monitor
            .subscribe("GPU-b", EVENT_TYPE_XID_CRITICAL_ERROR)
            .unwrap();

        library.inject_event(xid(DeviceHandle::Mig { parent: 1, slot: 0 }, 48, 0, 0));
        let event = monitor.wait(Duration::from_millis(50)).unwrap();
        assert_eq!(event.uuid, "MIG-1");
        // Instance id 0 is a real id, not a placeholder.
        assert_eq!(event.gpu_instance_id, Some(0));
        assert_eq!(event.compute_instance_id, Some(0));
    }

    #[test]
    fn test_event_set_released_on_drop() {
        let library = library();
        let monitor = HealthEventMonitor::new(Arc::new(library.clone())).unwrap();
        assert_eq!(library.open_event_sets(), 1);
        drop(monitor);
        assert_eq!(library.open_event_sets(), 0);
    }

    #[test]
    fn test_check_health_marks_devices() {
        let library = library();
        let devices = DeviceSet::new(vec![
            Device {
                id: "GPU-a".to_string(),
                index: "0".to_string(),
                parent_id: None,
                profile: String::new(),
                paths: vec![],
                numa_node: None,
                handle: DeviceHandle::Gpu { index: 0 },
            },
            Device {
                id: "MIG-1".to_string(),
                index: "1:0".to_string(),
                parent_id: Some("GPU-b".to_string()),
                profile: "1g.5gb".to_string(),
                paths: vec![],
                numa_node: None,
                handle: DeviceHandle::Mig { parent: 1, slot: 0 },
            },
        ]);

        // Application XID is skipped, the hardware one marks the partition.
        library.inject_event(xid(DeviceHandle::Gpu { index: 0 }, 13, 0, 0));
        library.inject_event(xid(DeviceHandle::Gpu { index: 1 }, 79, 0, 0));

        let stop = AtomicBool::new(false);
        let config = HealthCheckConfig {
            wait_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let mut marked = Vec::new();
        check_health(Arc::new(library), &devices, &config, &stop, |device, _| {
            marked.push(device.id.clone());
            stop.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(marked, vec!["MIG-1"]);
    }

    #[test]
    fn test_wait_error_does_not_end_health_checks() {
        let library = library();
        library.fail(
            "wait",
            LibError::Unknown {
                code: 999,
                message: "transient".to_string(),
            },
        );
        let devices = DeviceSet::new(vec![Device {
            id: "GPU-a".to_string(),
            index: "0".to_string(),
            parent_id: None,
            profile: String::new(),
            paths: vec![],
            numa_node: None,
            handle: DeviceHandle::Gpu { index: 0 },
        }]);

        let injector = {
            let library = library.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                library.clear_failure("wait");
                library.inject_event(xid(DeviceHandle::Gpu { index: 0 }, 79, 0, 0));
            })
        };

        let stop = AtomicBool::new(false);
        let config = HealthCheckConfig {
            wait_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let mut marked = Vec::new();
        check_health(Arc::new(library), &devices, &config, &stop, |device, _| {
            marked.push(device.id.clone());
            stop.store(true, Ordering::SeqCst);
        })
        .unwrap();
        injector.join().unwrap();

        assert_eq!(marked, vec!["GPU-a"]);
    }
}
