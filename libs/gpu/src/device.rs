//! Device inventory types.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::library::DeviceHandle;

/// Separator between a device id and its annotation.
pub const ANNOTATION_SEPARATOR: &str = "::";

/// A hardware-allocatable unit: a full physical device or one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable unique id (the device UUID).
    pub id: String,

    /// Enumeration position, `"{gpu}"` or `"{gpu}:{slot}"` for partitions.
    /// Only stable within one hardware session.
    pub index: String,

    /// Id of the owning physical device; set iff this is a partition.
    pub parent_id: Option<String>,

    /// Partition profile, e.g. `1g.10gb`. Empty for full devices.
    pub profile: String,

    /// Device nodes granting access to this unit.
    pub paths: Vec<PathBuf>,

    /// NUMA node of the (parent) physical device, if reported.
    pub numa_node: Option<u32>,

    /// Library handle, valid for the session that produced the snapshot.
    pub handle: DeviceHandle,
}

impl Device {
    pub fn is_partition(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Immutable, order-preserving collection of devices keyed by id.
///
/// All operations return new sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<Device>,
    by_id: HashMap<String, usize>,
}

impl DeviceSet {
    /// Build a set, keeping the first device for any repeated id.
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut set = Self::default();
        for device in devices {
            if set.by_id.contains_key(&device.id) {
                continue;
            }
            set.by_id.insert(device.id.clone(), set.devices.len());
            set.devices.push(device);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.by_id.get(id).map(|&i| &self.devices[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Devices whose id appears in `ids`, in the order of `ids`.
    /// Unknown ids are skipped.
    pub fn subset<S: AsRef<str>>(&self, ids: &[S]) -> DeviceSet {
        DeviceSet::new(ids.iter().filter_map(|id| self.get(id.as_ref()).cloned()))
    }

    /// Devices of `self` that are not in `other`, in the order of `self`.
    pub fn difference(&self, other: &DeviceSet) -> DeviceSet {
        DeviceSet::new(
            self.devices
                .iter()
                .filter(|d| !other.contains(&d.id))
                .cloned(),
        )
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id.clone()).collect()
    }

    /// Whether any device in the set is a partition.
    pub fn contains_partitions(&self) -> bool {
        self.devices.iter().any(Device::is_partition)
    }

    /// Ids of the physical devices backing this set, deduplicated.
    pub fn physical_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.devices
            .iter()
            .map(|d| d.parent_id.clone().unwrap_or_else(|| d.id.clone()))
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }
}

impl FromIterator<Device> for DeviceSet {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl<'a> IntoIterator for &'a DeviceSet {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

/// A device id as supplied by the orchestrator, optionally carrying an
/// annotation after `::` (e.g. `GPU-1234::2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotatedId(String);

impl AnnotatedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build `{id}::{annotation}`.
    pub fn with_annotation(id: &str, annotation: &str) -> Self {
        Self(format!("{id}{ANNOTATION_SEPARATOR}{annotation}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id without its annotation.
    pub fn base_id(&self) -> &str {
        self.split().0
    }

    /// The annotation, if a non-empty one is present.
    pub fn annotation(&self) -> Option<&str> {
        self.split().1
    }

    pub fn has_annotation(&self) -> bool {
        self.annotation().is_some()
    }

    fn split(&self) -> (&str, Option<&str>) {
        match self.0.split_once(ANNOTATION_SEPARATOR) {
            Some((id, annotation)) if !annotation.is_empty() => (id, Some(annotation)),
            Some((id, _)) => (id, None),
            None => (&self.0, None),
        }
    }
}

impl fmt::Display for AnnotatedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnnotatedId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AnnotatedId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for AnnotatedId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether any id in the list carries an annotation.
pub fn any_has_annotations(ids: &[AnnotatedId]) -> bool {
    ids.iter().any(AnnotatedId::has_annotation)
}
