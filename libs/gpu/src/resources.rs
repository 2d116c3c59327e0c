//! Resource strategies.
//!
//! A strategy maps a catalog snapshot onto the named resources the node
//! advertises. Each resource gets its own serving endpoint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::CatalogSnapshot;
use crate::device::DeviceSet;
use crate::error::GpuError;
use crate::topology::LinkMatrix;

/// Vendor prefix of every resource name.
pub const RESOURCE_PREFIX: &str = "nvidia.com";

/// Resource name for full devices (and partitions under `single`).
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// How partitions are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    /// Only full devices are exposed.
    #[default]
    None,
    /// All partitions share one profile and are exposed as `nvidia.com/gpu`.
    Single,
    /// One resource per partition profile.
    Mixed,
}

impl MigStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Single => "single",
            Self::Mixed => "mixed",
        }
    }

    /// Compute the resources this strategy advertises for `snapshot`.
    pub fn resources(&self, snapshot: &CatalogSnapshot) -> Result<Vec<Resource>, GpuError> {
        let resources = match self {
            Self::None => vec![Resource::new(GPU_RESOURCE, snapshot.full_devices(), snapshot)],
            Self::Single => single(snapshot)?,
            Self::Mixed => mixed(snapshot),
        };

        for resource in &resources {
            debug!(
                strategy = self.as_str(),
                resource = %resource.name,
                devices = resource.devices.len(),
                "Computed resource"
            );
        }
        Ok(resources)
    }
}

impl fmt::Display for MigStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigStrategy {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "single" => Ok(Self::Single),
            "mixed" => Ok(Self::Mixed),
            other => Err(GpuError::InvalidStrategy(format!(
                "unknown MIG strategy '{other}'"
            ))),
        }
    }
}

/// A named resource and the devices that serve it.
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub devices: DeviceSet,
    /// Locality between the snapshot's full devices.
    pub links: LinkMatrix,
}

impl Resource {
    fn new(name: impl Into<String>, devices: DeviceSet, snapshot: &CatalogSnapshot) -> Self {
        Self {
            name: name.into(),
            devices,
            links: snapshot.links.clone(),
        }
    }

    /// The part of the name after the vendor prefix, e.g. `mig-1g.5gb`.
    pub fn suffix(&self) -> &str {
        self.name
            .strip_prefix(RESOURCE_PREFIX)
            .and_then(|s| s.strip_prefix('/'))
            .unwrap_or(&self.name)
    }
}

fn single(snapshot: &CatalogSnapshot) -> Result<Vec<Resource>, GpuError> {
    let enabled = snapshot.gpus.iter().filter(|g| g.mig.enabled).count();
    if enabled == 0 {
        return Ok(vec![Resource::new(
            GPU_RESOURCE,
            snapshot.full_devices(),
            snapshot,
        )]);
    }

    if enabled != snapshot.gpus.len() {
        return Err(GpuError::InvalidStrategy(
            "all devices on the node must be configured with the same MIG enabled value"
                .to_string(),
        ));
    }

    if let Some(empty) = snapshot.gpus.iter().find(|g| g.partitions.is_empty()) {
        return Err(GpuError::InvalidStrategy(format!(
            "MIG is enabled on device '{}' but it has no MIG devices",
            empty.device.id
        )));
    }

    let partitions = snapshot.partitions();
    let mut profiles: Vec<&str> = partitions.iter().map(|d| d.profile.as_str()).collect();
    profiles.sort_unstable();
    profiles.dedup();
    if profiles.len() > 1 {
        return Err(GpuError::InvalidStrategy(format!(
            "more than one MIG device type present on node: {}",
            profiles.join(", ")
        )));
    }

    Ok(vec![Resource::new(GPU_RESOURCE, partitions, snapshot)])
}

fn mixed(snapshot: &CatalogSnapshot) -> Vec<Resource> {
    let full: DeviceSet = snapshot
        .gpus
        .iter()
        .filter(|g| !g.mig.enabled)
        .map(|g| g.device.clone())
        .collect();

    let mut resources = vec![Resource::new(GPU_RESOURCE, full, snapshot)];

    let partitions = snapshot.partitions();
    for profile in &snapshot.profiles {
        let profile = profile.to_string();
        let devices: DeviceSet = partitions
            .iter()
            .filter(|d| d.profile == profile)
            .cloned()
            .collect();
        resources.push(Resource::new(
            format!("{RESOURCE_PREFIX}/mig-{profile}"),
            devices,
            snapshot,
        ));
    }
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MigCapability, PhysicalDevice};
    use crate::device::Device;
    use crate::library::DeviceHandle;
    use crate::profile::MigProfile;

    fn gpu(id: &str, index: u32, enabled: bool, partitions: &[(&str, &str)]) -> PhysicalDevice {
        PhysicalDevice {
            device: Device {
                id: id.to_string(),
                index: index.to_string(),
                parent_id: None,
                profile: String::new(),
                paths: vec![],
                numa_node: None,
                handle: DeviceHandle::Gpu { index },
            },
            mig: MigCapability {
                capable: true,
                enabled,
            },
            partitions: partitions
                .iter()
                .enumerate()
                .map(|(slot, (pid, profile))| Device {
                    id: pid.to_string(),
                    index: format!("{index}:{slot}"),
                    parent_id: Some(id.to_string()),
                    profile: profile.to_string(),
                    paths: vec![],
                    numa_node: None,
                    handle: DeviceHandle::Mig {
                        parent: index,
                        slot: slot as u32,
                    },
                })
                .collect(),
        }
    }

    fn snapshot(gpus: Vec<PhysicalDevice>) -> CatalogSnapshot {
        CatalogSnapshot {
            gpus,
            profiles: vec![MigProfile::new(1, 1, 4864), MigProfile::new(3, 3, 19968)],
            links: LinkMatrix::new(),
        }
    }

    fn names(resources: &[Resource]) -> Vec<&str> {
        resources.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_none_ignores_partitions() {
        let snapshot = snapshot(vec![
            gpu("GPU-a", 0, true, &[("MIG-1", "1g.5gb")]),
            gpu("GPU-b", 1, false, &[]),
        ]);

        let resources = MigStrategy::None.resources(&snapshot).unwrap();
        assert_eq!(names(&resources), vec!["nvidia.com/gpu"]);
        assert_eq!(resources[0].devices.ids(), vec!["GPU-a", "GPU-b"]);
    }

    #[test]
    fn test_single_without_mig_is_none() {
        let snapshot = snapshot(vec![gpu("GPU-a", 0, false, &[])]);
        let resources = MigStrategy::Single.resources(&snapshot).unwrap();
        assert_eq!(resources[0].devices.ids(), vec!["GPU-a"]);
    }

    #[test]
    fn test_single_serves_partitions() {
        let snapshot = snapshot(vec![
            gpu("GPU-a", 0, true, &[("MIG-1", "1g.5gb"), ("MIG-2", "1g.5gb")]),
            gpu("GPU-b", 1, true, &[("MIG-3", "1g.5gb")]),
        ]);
        let resources = MigStrategy::Single.resources(&snapshot).unwrap();
        assert_eq!(names(&resources), vec!["nvidia.com/gpu"]);
        assert_eq!(resources[0].devices.ids(), vec!["MIG-1", "MIG-2", "MIG-3"]);
    }

    #[test]
    fn test_single_rejects_mixed_enablement() {
        let snapshot = snapshot(vec![
            gpu("GPU-a", 0, true, &[("MIG-1", "1g.5gb")]),
            gpu("GPU-b", 1, false, &[]),
        ]);
        let err = MigStrategy::Single.resources(&snapshot).unwrap_err();
        assert!(matches!(err, GpuError::InvalidStrategy(_)));
    }

    #[test]
    fn test_single_rejects_enabled_without_partitions() {
        let snapshot = snapshot(vec![gpu("GPU-a", 0, true, &[])]);
        let err = MigStrategy::Single.resources(&snapshot).unwrap_err();
        assert!(err.to_string().contains("no MIG devices"));
    }

    #[test]
    fn test_single_rejects_multiple_profiles() {
        let snapshot = snapshot(vec![gpu(
            "GPU-a",
            0,
            true,
            &[("MIG-1", "1g.5gb"), ("MIG-2", "3g.20gb")],
        )]);
        let err = MigStrategy::Single.resources(&snapshot).unwrap_err();
        assert!(err.to_string().contains("more than one MIG device type"));
    }

    #[test]
    fn test_mixed_splits_by_profile() {
        let snapshot = snapshot(vec![
            gpu("GPU-a", 0, true, &[("MIG-1", "1g.5gb"), ("MIG-2", "1g.5gb")]),
            gpu("GPU-b", 1, false, &[]),
        ]);

        let resources = MigStrategy::Mixed.resources(&snapshot).unwrap();
        assert_eq!(
            names(&resources),
            vec![
                "nvidia.com/gpu",
                "nvidia.com/mig-1g.5gb",
                "nvidia.com/mig-3g.20gb"
            ]
        );
        assert_eq!(resources[0].devices.ids(), vec!["GPU-b"]);
        assert_eq!(resources[1].devices.ids(), vec!["MIG-1", "MIG-2"]);
        // Possible but not instantiated: produced empty.
        assert!(resources[2].devices.is_empty());
        assert_eq!(resources[1].suffix(), "mig-1g.5gb");
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("mixed".parse::<MigStrategy>().unwrap(), MigStrategy::Mixed);
        assert!("bogus".parse::<MigStrategy>().is_err());
    }
}
