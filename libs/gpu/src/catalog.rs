//! Device discovery.
//!
//! The catalog walks every physical device the library reports and, for
//! devices with MIG enabled, every instantiated partition. It produces a
//! point-in-time [`CatalogSnapshot`]; any hardware query failure outside the
//! tolerated codes aborts the build and no partial snapshot is returned.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::device::{Device, DeviceSet};
use crate::error::{GpuError, LibError, LibResultExt};
use crate::library::{
    DeviceHandle, DeviceLibrary, MigMode, GPU_INSTANCE_PROFILE_COUNT, SYMBOL_MIG_MODE,
};
use crate::numa::NumaResolver;
use crate::paths::PartitionPathResolver;
use crate::profile::MigProfile;
use crate::topology::{Link, LinkMatrix};

// =============================================================================
// Walkers
// =============================================================================

/// Partitioning support of one physical device, checked once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigCapability {
    pub capable: bool,
    pub enabled: bool,
}

/// Check MIG support for a physical device.
///
/// A library without the mode query, or a device answering "not supported",
/// is simply not capable.
pub fn mig_capability(
    library: &dyn DeviceLibrary,
    device: DeviceHandle,
) -> Result<MigCapability, GpuError> {
    if !library.has_symbol(SYMBOL_MIG_MODE) {
        return Ok(MigCapability::default());
    }

    match library.mig_mode(device) {
        Ok(mode) => Ok(MigCapability {
            capable: true,
            enabled: mode == MigMode::Enabled,
        }),
        Err(LibError::NotSupported) => Ok(MigCapability::default()),
        Err(e) => Err(GpuError::library("error getting MIG mode", e)),
    }
}

/// Call `f` for every physical device.
pub fn walk_gpu_devices<F>(library: &dyn DeviceLibrary, mut f: F) -> Result<(), GpuError>
where
    F: FnMut(u32, DeviceHandle) -> Result<(), GpuError>,
{
    let count = library
        .device_count()
        .context_lib(|| "error getting device count")?;

    for i in 0..count {
        let device = library
            .device_by_index(i)
            .context_lib(|| format!("error getting device handle for index '{i}'"))?;
        f(i, device)?;
    }
    Ok(())
}

/// Call `f` for every instantiated partition of one physical device.
///
/// Empty slots ("not found" / "invalid argument") are skipped.
pub fn walk_mig_devices_on<F>(
    library: &dyn DeviceLibrary,
    gpu: DeviceHandle,
    mut f: F,
) -> Result<(), GpuError>
where
    F: FnMut(u32, DeviceHandle) -> Result<(), GpuError>,
{
    let count = library
        .max_mig_device_count(gpu)
        .context_lib(|| "error getting max MIG device count")?;

    for j in 0..count {
        let mig = match library.mig_device_by_index(gpu, j) {
            Ok(mig) => mig,
            Err(e) if e.is_tolerated() => continue,
            Err(e) => {
                return Err(GpuError::library(
                    format!("error getting MIG device handle at index '{j}'"),
                    e,
                ))
            }
        };
        f(j, mig)?;
    }
    Ok(())
}

/// Call `f` for every partition on every MIG-enabled physical device.
pub fn walk_mig_devices<F>(library: &dyn DeviceLibrary, mut f: F) -> Result<(), GpuError>
where
    F: FnMut(u32, u32, DeviceHandle) -> Result<(), GpuError>,
{
    walk_gpu_devices(library, |i, gpu| {
        let capability = mig_capability(library, gpu).map_err(|e| {
            with_context(e, format!("error checking if MIG is enabled on GPU with index '{i}'"))
        })?;
        if !capability.enabled {
            return Ok(());
        }
        walk_mig_devices_on(library, gpu, |j, mig| f(i, j, mig))
    })
}

/// Call `f` once for every distinct profile any MIG-capable device could offer.
pub fn walk_mig_profiles<F>(library: &dyn DeviceLibrary, mut f: F) -> Result<(), GpuError>
where
    F: FnMut(MigProfile) -> Result<(), GpuError>,
{
    let mut visited = HashSet::new();
    walk_gpu_devices(library, |i, gpu| {
        let capability = mig_capability(library, gpu)?;
        if !capability.capable {
            return Ok(());
        }
        for p in 0..GPU_INSTANCE_PROFILE_COUNT {
            let info = match library.gpu_instance_profile_info(gpu, p) {
                Ok(info) => info,
                Err(e) if e.is_tolerated() => continue,
                Err(e) => {
                    return Err(GpuError::library(
                        format!("error getting GPU instance profile info for '{p}' on GPU '{i}'"),
                        e,
                    ))
                }
            };
            let profile = MigProfile::from_gpu_instance(&info);
            if visited.insert(profile.to_string()) {
                f(profile)?;
            }
        }
        Ok(())
    })
}

// =============================================================================
// Snapshot
// =============================================================================

/// A physical device and what the catalog learned about it.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    pub device: Device,
    pub mig: MigCapability,
    pub partitions: Vec<Device>,
}

/// Point-in-time inventory. Immutable once built; rebuilt every cycle.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub gpus: Vec<PhysicalDevice>,
    /// Every distinct profile the fleet could offer.
    pub profiles: Vec<MigProfile>,
    /// Locality between full physical devices.
    pub links: LinkMatrix,
}

impl CatalogSnapshot {
    /// Every physical device as a full device.
    pub fn full_devices(&self) -> DeviceSet {
        self.gpus.iter().map(|g| g.device.clone()).collect()
    }

    /// Every instantiated partition.
    pub fn partitions(&self) -> DeviceSet {
        self.gpus
            .iter()
            .flat_map(|g| g.partitions.iter().cloned())
            .collect()
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Builds catalog snapshots from the device library.
#[derive(Clone)]
pub struct DeviceCatalog {
    library: Arc<dyn DeviceLibrary>,
    paths: Arc<dyn PartitionPathResolver>,
    numa: NumaResolver,
}

impl DeviceCatalog {
    pub fn new(
        library: Arc<dyn DeviceLibrary>,
        paths: Arc<dyn PartitionPathResolver>,
        numa: NumaResolver,
    ) -> Self {
        Self {
            library,
            paths,
            numa,
        }
    }

    pub fn library(&self) -> &Arc<dyn DeviceLibrary> {
        &self.library
    }

    /// Enumerate devices, partitions, profiles and links.
    pub fn build(&self) -> Result<CatalogSnapshot, GpuError> {
        let library = self.library.as_ref();
        let mut gpus = Vec::new();

        walk_gpu_devices(library, |i, handle| {
            let mig = mig_capability(library, handle)
                .map_err(|e| with_context(e, format!("error checking if GPU {i} is MIG capable")))?;
            let device = self.full_device(i, handle)?;

            let mut partitions = Vec::new();
            if mig.enabled {
                walk_mig_devices_on(library, handle, |j, mig_handle| {
                    partitions.push(self.partition_device(i, j, mig_handle, &device)?);
                    Ok(())
                })
                .map_err(|e| {
                    with_context(e, format!("error walking MIG devices on GPU with index '{i}'"))
                })?;
            }

            debug!(
                index = i,
                uuid = %device.id,
                mig_capable = mig.capable,
                mig_enabled = mig.enabled,
                partitions = partitions.len(),
                "Discovered GPU"
            );

            gpus.push(PhysicalDevice {
                device,
                mig,
                partitions,
            });
            Ok(())
        })?;

        let mut profiles = Vec::new();
        walk_mig_profiles(library, |profile| {
            profiles.push(profile);
            Ok(())
        })?;

        let links = self.build_links(&gpus)?;

        info!(
            gpus = gpus.len(),
            partitions = gpus.iter().map(|g| g.partitions.len()).sum::<usize>(),
            profiles = profiles.len(),
            "Device catalog built"
        );

        Ok(CatalogSnapshot {
            gpus,
            profiles,
            links,
        })
    }

    fn full_device(&self, index: u32, handle: DeviceHandle) -> Result<Device, GpuError> {
        let library = self.library.as_ref();
        let id = library
            .uuid(handle)
            .context_lib(|| format!("error getting UUID of GPU with index '{index}'"))?;
        let minor = library
            .minor_number(handle)
            .context_lib(|| format!("error getting minor number of GPU '{id}'"))?;
        let numa_node = self.numa_node(handle, &id)?;

        Ok(Device {
            id,
            index: index.to_string(),
            parent_id: None,
            profile: String::new(),
            paths: vec![PathBuf::from(format!("/dev/nvidia{minor}"))],
            numa_node,
            handle,
        })
    }

    fn partition_device(
        &self,
        gpu_index: u32,
        slot: u32,
        handle: DeviceHandle,
        parent: &Device,
    ) -> Result<Device, GpuError> {
        let library = self.library.as_ref();
        let id = library
            .uuid(handle)
            .context_lib(|| format!("error getting UUID of MIG device {gpu_index}:{slot}"))?;
        let attributes = library
            .mig_attributes(handle)
            .context_lib(|| format!("error getting MIG device attributes of '{id}'"))?;
        let profile = MigProfile::from_attributes(&attributes).to_string();
        let paths = self.paths.resolve(&id)?;
        let numa_node = self.numa_node(handle, &id)?;

        Ok(Device {
            id,
            index: format!("{gpu_index}:{slot}"),
            parent_id: Some(parent.id.clone()),
            profile,
            paths,
            numa_node,
            handle,
        })
    }

    /// NUMA node of a device; partitions use their parent's bus address.
    fn numa_node(&self, handle: DeviceHandle, id: &str) -> Result<Option<u32>, GpuError> {
        let library = self.library.as_ref();
        let physical = match handle {
            DeviceHandle::Gpu { .. } => handle,
            DeviceHandle::Mig { .. } => library
                .parent_device(handle)
                .context_lib(|| format!("error getting parent GPU of MIG device '{id}'"))?,
        };
        let bus_id = library
            .pci_bus_id(physical)
            .context_lib(|| format!("error getting PCI bus info of device '{id}'"))?;
        self.numa.numa_node(&bus_id)
    }

    fn build_links(&self, gpus: &[PhysicalDevice]) -> Result<LinkMatrix, GpuError> {
        let library = self.library.as_ref();
        let mut links = LinkMatrix::new();

        for (i, a) in gpus.iter().enumerate() {
            for b in &gpus[i + 1..] {
                let level = match library.topology_common_ancestor(a.device.handle, b.device.handle)
                {
                    Ok(level) => level,
                    Err(e) if e.is_tolerated() => continue,
                    Err(e) => {
                        return Err(GpuError::library(
                            format!(
                                "error getting topology between '{}' and '{}'",
                                a.device.id, b.device.id
                            ),
                            e,
                        ))
                    }
                };
                let nvlinks = match library.nvlink_count(a.device.handle, b.device.handle) {
                    Ok(n) => n,
                    Err(e) if e.is_tolerated() => 0,
                    Err(e) => {
                        return Err(GpuError::library(
                            format!(
                                "error getting NVLink count between '{}' and '{}'",
                                a.device.id, b.device.id
                            ),
                            e,
                        ))
                    }
                };
                links.insert(&a.device.id, &b.device.id, Link { level, nvlinks });
            }
        }

        Ok(links)
    }
}

/// Prefix the context of a library error, leaving other errors alone.
fn with_context(e: GpuError, prefix: String) -> GpuError {
    match e {
        GpuError::Library { context, source } => GpuError::Library {
            context: format!("{prefix}: {context}"),
            source,
        },
        other => other,
    }
}
