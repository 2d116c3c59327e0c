//! Device node resolution for MIG partitions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::walk_mig_devices;
use crate::error::{GpuError, LibResultExt};
use crate::library::{DeviceHandle, DeviceLibrary};

/// Resolves the device nodes a container needs to use a partition.
pub trait PartitionPathResolver: Send + Sync {
    fn resolve(&self, partition_id: &str) -> Result<Vec<PathBuf>, GpuError>;
}

/// Fixed id-to-paths table. Unknown ids resolve to no paths.
#[derive(Debug, Clone, Default)]
pub struct StaticPathResolver {
    paths: HashMap<String, Vec<PathBuf>>,
}

impl StaticPathResolver {
    pub fn insert(&mut self, partition_id: impl Into<String>, paths: Vec<PathBuf>) {
        self.paths.insert(partition_id.into(), paths);
    }
}

impl PartitionPathResolver for StaticPathResolver {
    fn resolve(&self, partition_id: &str) -> Result<Vec<PathBuf>, GpuError> {
        Ok(self.paths.get(partition_id).cloned().unwrap_or_default())
    }
}

/// Resolves partition device nodes through the driver's capability files.
///
/// For a partition on GPU minor `m` with GPU instance `gi` and compute
/// instance `ci`, the minors of the `nvidia-cap` nodes are read from
/// `proc/driver/nvidia/capabilities/gpu{m}/mig/gi{gi}[/ci{ci}]/access`
/// below the driver root.
pub struct CapabilityPathResolver {
    library: Arc<dyn DeviceLibrary>,
    driver_root: PathBuf,
}

impl CapabilityPathResolver {
    pub fn new(library: Arc<dyn DeviceLibrary>, driver_root: impl Into<PathBuf>) -> Self {
        Self {
            library,
            driver_root: driver_root.into(),
        }
    }

    fn find_partition(&self, partition_id: &str) -> Result<DeviceHandle, GpuError> {
        let library = self.library.as_ref();
        let mut found = None;
        walk_mig_devices(library, |_, _, mig| {
            if found.is_none() {
                let uuid = library
                    .uuid(mig)
                    .context_lib(|| "error getting UUID of MIG device")?;
                if uuid == partition_id {
                    found = Some(mig);
                }
            }
            Ok(())
        })?;
        found.ok_or_else(|| GpuError::DeviceNotFound(partition_id.to_string()))
    }
}

impl PartitionPathResolver for CapabilityPathResolver {
    fn resolve(&self, partition_id: &str) -> Result<Vec<PathBuf>, GpuError> {
        let library = self.library.as_ref();
        let mig = self.find_partition(partition_id)?;

        let parent = library
            .parent_device(mig)
            .context_lib(|| format!("error getting parent GPU of '{partition_id}'"))?;
        let minor = library
            .minor_number(parent)
            .context_lib(|| format!("error getting minor number of parent of '{partition_id}'"))?;
        let gi = library
            .gpu_instance_id(mig)
            .context_lib(|| format!("error getting GPU instance id of '{partition_id}'"))?;
        let ci = library
            .compute_instance_id(mig)
            .context_lib(|| format!("error getting compute instance id of '{partition_id}'"))?;

        let gi_dir = self
            .driver_root
            .join("proc/driver/nvidia/capabilities")
            .join(format!("gpu{minor}"))
            .join("mig")
            .join(format!("gi{gi}"));
        let gi_minor = read_device_file_minor(&gi_dir.join("access"))?;
        let ci_minor = read_device_file_minor(&gi_dir.join(format!("ci{ci}")).join("access"))?;

        Ok(vec![
            PathBuf::from(format!("/dev/nvidia{minor}")),
            PathBuf::from(format!("/dev/nvidia-caps/nvidia-cap{gi_minor}")),
            PathBuf::from(format!("/dev/nvidia-caps/nvidia-cap{ci_minor}")),
        ])
    }
}

/// Extract the `DeviceFileMinor` value from a capability access file.
fn read_device_file_minor(path: &Path) -> Result<u32, GpuError> {
    let contents = std::fs::read_to_string(path).map_err(|e| GpuError::DeviceNodes {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    contents
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "DeviceFileMinor").then(|| value.trim().parse().ok())?
        })
        .ok_or_else(|| GpuError::DeviceNodes {
            path: path.to_path_buf(),
            detail: "no DeviceFileMinor entry".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeGpu, FakeLibrary, FakeMigDevice, FakeTopology};
    use tempfile::tempdir;

    fn write_access(path: &Path, minor: u32) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            path,
            format!("DeviceFileMinor: {minor}\nDeviceFileMode: 292\nDeviceFileModify: 1\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_static_resolver_unknown_id_is_empty() {
        let mut resolver = StaticPathResolver::default();
        resolver.insert("MIG-1", vec![PathBuf::from("/dev/nvidia0")]);

        assert_eq!(resolver.resolve("MIG-1").unwrap().len(), 1);
        assert!(resolver.resolve("MIG-2").unwrap().is_empty());
    }

    #[test]
    fn test_capability_resolver_reads_minors() {
        let root = tempdir().unwrap();
        let caps = root.path().join("proc/driver/nvidia/capabilities/gpu2/mig");
        write_access(&caps.join("gi3/access"), 30);
        write_access(&caps.join("gi3/ci0/access"), 31);

        let library = FakeLibrary::new(
            FakeTopology::new().with_gpu(
                FakeGpu::new("GPU-a", 2, "00000000:3B:00.0")
                    .with_max_mig_devices(7)
                    .with_mig_enabled()
                    .with_mig_device(FakeMigDevice::new(1, "MIG-1", 1, 1, 4864).with_ids(3, 0)),
            ),
        );
        let resolver = CapabilityPathResolver::new(Arc::new(library), root.path());

        let paths = resolver.resolve("MIG-1").unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/dev/nvidia2"),
                PathBuf::from("/dev/nvidia-caps/nvidia-cap30"),
                PathBuf::from("/dev/nvidia-caps/nvidia-cap31"),
            ]
        );
    }

    #[test]
    fn test_capability_resolver_unknown_partition() {
        let root = tempdir().unwrap();
        let library = FakeLibrary::new(
            FakeTopology::new().with_gpu(FakeGpu::new("GPU-a", 0, "00000000:3B:00.0")),
        );
        let resolver = CapabilityPathResolver::new(Arc::new(library), root.path());

        let err = resolver.resolve("MIG-x").unwrap_err();
        assert!(matches!(err, GpuError::DeviceNotFound(_)));
    }

    #[test]
    fn test_access_file_without_minor() {
        let root = tempdir().unwrap();
        let path = root.path().join("access");
        std::fs::write(&path, "DeviceFileMode: 292\n").unwrap();

        assert!(matches!(
            read_device_file_minor(&path),
            Err(GpuError::DeviceNodes { .. })
        ));
    }
}
