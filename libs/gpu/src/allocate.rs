//! Allocation decisions.
//!
//! The engine chooses between two policies per request:
//!
//! - **Topology-aware**: only when the fleet holds no partitions and no
//!   requested id carries an annotation. Prefers sets of devices that are
//!   close on the interconnect.
//! - **Fallback**: required ids first, then the remaining available ids in
//!   request order.
//!
//! Both policies are pure functions of the request and the snapshot the
//! engine was built from. An engine is never mutated after construction;
//! a new one is built for every supervisor cycle.

use std::collections::HashSet;

use tracing::debug;

use crate::device::{any_has_annotations, AnnotatedId, DeviceSet};
use crate::error::GpuError;
use crate::topology::LinkMatrix;

/// Largest number of combinations the placement search enumerates before
/// switching to greedy extension.
const EXHAUSTIVE_SEARCH_LIMIT: u64 = 20_000;

/// The policy a request was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    TopologyAware,
    Fallback,
}

// =============================================================================
// Best-effort placement
// =============================================================================

/// Stateless locality-maximizing placement over full devices.
///
/// Among all sets of `size` devices that contain `required`, picks the one
/// with the highest summed pairwise link score. Ties go to the set whose
/// devices come first in `available` order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestEffortPolicy;

impl BestEffortPolicy {
    pub fn allocate(
        &self,
        available: &DeviceSet,
        required: &DeviceSet,
        size: usize,
        links: &LinkMatrix,
    ) -> Result<Vec<String>, GpuError> {
        if required.len() > size {
            return Err(GpuError::Placement(format!(
                "{} required devices exceed requested size {size}",
                required.len()
            )));
        }
        if let Some(missing) = required.iter().find(|d| !available.contains(&d.id)) {
            return Err(GpuError::Placement(format!(
                "required device {} is not available",
                missing.id
            )));
        }

        let committed = required.ids();
        let candidates = available.difference(required).ids();
        let need = size - committed.len();

        if candidates.len() < need {
            return Err(GpuError::Placement(format!(
                "no combination of {size} devices among {} available",
                available.len()
            )));
        }

        let chosen = if combinations(candidates.len(), need) <= EXHAUSTIVE_SEARCH_LIMIT {
            exhaustive(&committed, &candidates, need, links)
        } else {
            greedy(&committed, &candidates, need, links)
        };

        let mut result = committed;
        result.extend(chosen.into_iter().map(|i| candidates[i].clone()));
        Ok(result)
    }
}

/// Summed link score of `picked` against each other and `committed`.
fn score(committed: &[String], candidates: &[String], picked: &[usize], links: &LinkMatrix) -> u64 {
    let mut total = 0u64;
    for (n, &i) in picked.iter().enumerate() {
        let id = &candidates[i];
        for c in committed {
            total += u64::from(links.score(c, id));
        }
        for &j in &picked[..n] {
            total += u64::from(links.score(&candidates[j], id));
        }
    }
    total
}

/// Try every combination in lexicographic index order; keep the first best.
fn exhaustive(
    committed: &[String],
    candidates: &[String],
    need: usize,
    links: &LinkMatrix,
) -> Vec<usize> {
    let mut current: Vec<usize> = (0..need).collect();
    let mut best = current.clone();
    let mut best_score = score(committed, candidates, &current, links);

    let n = candidates.len();
    loop {
        // Advance to the next combination.
        let mut i = need;
        loop {
            if i == 0 {
                return best;
            }
            i -= 1;
            if current[i] != i + n - need {
                break;
            }
        }
        current[i] += 1;
        for j in i + 1..need {
            current[j] = current[j - 1] + 1;
        }

        let s = score(committed, candidates, &current, links);
        if s > best_score {
            best_score = s;
            best = current.clone();
        }
    }
}

/// Extend the committed set one device at a time, taking the closest.
fn greedy(committed: &[String], candidates: &[String], need: usize, links: &LinkMatrix) -> Vec<usize> {
    let mut picked: Vec<usize> = Vec::with_capacity(need);
    while picked.len() < need {
        let mut best: Option<(usize, u64)> = None;
        for i in 0..candidates.len() {
            if picked.contains(&i) {
                continue;
            }
            let gain: u64 = committed
                .iter()
                .chain(picked.iter().map(|&p| &candidates[p]))
                .map(|other| u64::from(links.score(other, &candidates[i])))
                .sum();
            if best.map_or(true, |(_, g)| gain > g) {
                best = Some((i, gain));
            }
        }
        match best {
            Some((i, _)) => picked.push(i),
            None => break,
        }
    }
    picked.sort_unstable();
    picked
}

/// `n choose k`, saturating.
fn combinations(n: usize, k: usize) -> u64 {
    let k = k.min(n - k.min(n));
    let mut result: u64 = 1;
    for i in 0..k {
        result = result.saturating_mul((n - i) as u64) / (i as u64 + 1);
        if result > EXHAUSTIVE_SEARCH_LIMIT {
            return u64::MAX;
        }
    }
    result
}

// =============================================================================
// Engine
// =============================================================================

/// Allocation decisions for one resource's device set.
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    devices: DeviceSet,
    links: LinkMatrix,
    placement: BestEffortPolicy,
}

impl AllocationEngine {
    pub fn new(devices: DeviceSet, links: LinkMatrix) -> Self {
        Self {
            devices,
            links,
            placement: BestEffortPolicy,
        }
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Which policy a request with this available list is routed to.
    pub fn policy_for(&self, available: &[AnnotatedId]) -> Policy {
        if !self.devices.contains_partitions() && !any_has_annotations(available) {
            Policy::TopologyAware
        } else {
            Policy::Fallback
        }
    }

    /// Choose `size` ids from `available`, always including `required`.
    pub fn decide(
        &self,
        available: &[AnnotatedId],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, GpuError> {
        let policy = self.policy_for(available);
        debug!(
            ?policy,
            available = available.len(),
            required = required.len(),
            size,
            "Computing preferred allocation"
        );

        match policy {
            Policy::TopologyAware => self.aligned_alloc(available, required, size),
            Policy::Fallback => self.alloc(available, required, size),
        }
    }

    fn aligned_alloc(
        &self,
        available: &[AnnotatedId],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, GpuError> {
        let available = self.resolve(available.iter().map(AnnotatedId::as_str))?;
        let required = self.resolve(required.iter().map(String::as_str))?;
        self.placement
            .allocate(&available, &required, size, &self.links)
    }

    fn alloc(
        &self,
        available: &[AnnotatedId],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, GpuError> {
        let mut seen = HashSet::new();
        let mut devices: Vec<String> = required
            .iter()
            .filter(|id| seen.insert(AnnotatedId::new(id.as_str()).base_id().to_string()))
            .cloned()
            .collect();

        for id in available {
            if self.devices.contains(id.base_id()) && seen.insert(id.base_id().to_string()) {
                devices.push(id.as_str().to_string());
            }
        }

        if devices.len() < size {
            return Err(GpuError::InsufficientDevices {
                requested: size,
                available: devices.len(),
            });
        }
        devices.truncate(size);
        Ok(devices)
    }

    fn resolve<'a>(&self, ids: impl Iterator<Item = &'a str>) -> Result<DeviceSet, GpuError> {
        ids.map(|id| {
            self.devices
                .get(id)
                .cloned()
                .ok_or_else(|| GpuError::UnknownDevice(id.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(DeviceSet::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::library::{DeviceHandle, TopologyLevel};
    use crate::topology::Link;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn gpu(id: &str, index: u32) -> Device {
        Device {
            id: id.to_string(),
            index: index.to_string(),
            parent_id: None,
            profile: String::new(),
            paths: vec![PathBuf::from(format!("/dev/nvidia{index}"))],
            numa_node: None,
            handle: DeviceHandle::Gpu { index },
        }
    }

    fn partition(id: &str, parent: &str) -> Device {
        Device {
            parent_id: Some(parent.to_string()),
            profile: "1g.10gb".to_string(),
            index: "0:0".to_string(),
            handle: DeviceHandle::Mig { parent: 0, slot: 0 },
            ..gpu(id, 0)
        }
    }

    fn fleet(n: u32) -> DeviceSet {
        (0..n).map(|i| gpu(&format!("GPU-{i}"), i)).collect()
    }

    fn ids(list: &[&str]) -> Vec<AnnotatedId> {
        list.iter().map(|s| AnnotatedId::new(*s)).collect()
    }

    fn link(level: TopologyLevel, nvlinks: u32) -> Link {
        Link { level, nvlinks }
    }

    #[test]
    fn test_policy_selection() {
        let engine = AllocationEngine::new(fleet(2), LinkMatrix::new());
        assert_eq!(
            engine.policy_for(&ids(&["GPU-0", "GPU-1"])),
            Policy::TopologyAware
        );
        assert_eq!(
            engine.policy_for(&ids(&["GPU-0", "GPU-1::2"])),
            Policy::Fallback
        );

        let mut devices: Vec<Device> = fleet(2).iter().cloned().collect();
        devices.push(partition("MIG-0", "GPU-0"));
        let engine = AllocationEngine::new(DeviceSet::new(devices), LinkMatrix::new());
        assert_eq!(
            engine.policy_for(&ids(&["GPU-0", "GPU-1"])),
            Policy::Fallback
        );
    }

    #[test]
    fn test_topology_aware_prefers_nvlink_pair() {
        let mut links = LinkMatrix::new();
        links.insert("GPU-0", "GPU-1", link(TopologyLevel::System, 0));
        links.insert("GPU-0", "GPU-2", link(TopologyLevel::System, 0));
        links.insert("GPU-0", "GPU-3", link(TopologyLevel::System, 0));
        links.insert("GPU-1", "GPU-2", link(TopologyLevel::Single, 0));
        links.insert("GPU-1", "GPU-3", link(TopologyLevel::System, 0));
        links.insert("GPU-2", "GPU-3", link(TopologyLevel::Single, 4));

        let engine = AllocationEngine::new(fleet(4), links);
        let result = engine
            .decide(&ids(&["GPU-0", "GPU-1", "GPU-2", "GPU-3"]), &[], 2)
            .unwrap();
        assert_eq!(result, vec!["GPU-2", "GPU-3"]);
    }

    #[test]
    fn test_topology_aware_extends_required() {
        let mut links = LinkMatrix::new();
        links.insert("GPU-0", "GPU-1", link(TopologyLevel::System, 0));
        links.insert("GPU-0", "GPU-2", link(TopologyLevel::Single, 2));
        links.insert("GPU-1", "GPU-2", link(TopologyLevel::Single, 0));

        let engine = AllocationEngine::new(fleet(3), links);
        let result = engine
            .decide(
                &ids(&["GPU-0", "GPU-1", "GPU-2"]),
                &["GPU-0".to_string()],
                2,
            )
            .unwrap();
        assert_eq!(result, vec!["GPU-0", "GPU-2"]);
    }

    #[test]
    fn test_topology_aware_ties_break_by_order() {
        let engine = AllocationEngine::new(fleet(4), LinkMatrix::new());
        let result = engine
            .decide(&ids(&["GPU-3", "GPU-1", "GPU-2", "GPU-0"]), &[], 2)
            .unwrap();
        assert_eq!(result, vec!["GPU-3", "GPU-1"]);
    }

    #[test]
    fn test_topology_aware_fails_instead_of_under_allocating() {
        let engine = AllocationEngine::new(fleet(2), LinkMatrix::new());
        let err = engine
            .decide(&ids(&["GPU-0", "GPU-1"]), &[], 3)
            .unwrap_err();
        assert!(matches!(err, GpuError::Placement(_)));
    }

    #[test]
    fn test_topology_aware_rejects_unknown_id() {
        let engine = AllocationEngine::new(fleet(2), LinkMatrix::new());
        let err = engine
            .decide(&ids(&["GPU-0", "GPU-9"]), &[], 1)
            .unwrap_err();
        assert!(matches!(err, GpuError::UnknownDevice(id) if id == "GPU-9"));
    }

    #[test]
    fn test_greedy_on_large_fleet() {
        let mut links = LinkMatrix::new();
        links.insert("GPU-30", "GPU-31", link(TopologyLevel::Internal, 12));
        let engine = AllocationEngine::new(fleet(32), links);
        let available: Vec<AnnotatedId> =
            (0..32).map(|i| AnnotatedId::new(format!("GPU-{i}"))).collect();

        let result = engine
            .decide(&available, &["GPU-30".to_string()], 8)
            .unwrap();
        assert_eq!(result.len(), 8);
        assert_eq!(result[0], "GPU-30");
        assert!(result.contains(&"GPU-31".to_string()));
    }

    #[test]
    fn test_fallback_required_first() {
        let mut devices: Vec<Device> = fleet(3).iter().cloned().collect();
        devices.push(partition("MIG-0", "GPU-0"));
        let engine = AllocationEngine::new(DeviceSet::new(devices), LinkMatrix::new());

        let result = engine
            .decide(
                &ids(&["GPU-0", "GPU-1", "GPU-2"]),
                &["GPU-2".to_string()],
                2,
            )
            .unwrap();
        assert_eq!(result, vec!["GPU-2", "GPU-0"]);
    }

    #[test]
    fn test_fallback_keeps_annotated_ids() {
        let engine = AllocationEngine::new(fleet(2), LinkMatrix::new());
        let err = engine
            .decide(&ids(&["GPU-0::1", "GPU-1::1", "GPU-9::1"]), &[], 3)
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::InsufficientDevices {
                requested: 3,
                available: 2
            }
        ));

        let result = engine
            .decide(&ids(&["GPU-0::1", "GPU-1::1"]), &[], 2)
            .unwrap();
        assert_eq!(result, vec!["GPU-0::1", "GPU-1::1"]);
    }

    #[test]
    fn test_fallback_dedupes_by_base_id() {
        let engine = engine(3);

        // A plain required id and its annotated form are the same device.
        let result = engine
            .decide(&ids(&["GPU-0::1", "GPU-1::1"]), &["GPU-0".to_string()], 2)
            .unwrap();
        assert_eq!(result, vec!["GPU-0", "GPU-1::1"]);

        let result = engine
            .decide(
                &ids(&["GPU-2", "GPU-2::1", "GPU-0::1"]),
                &["GPU-0::2".to_string()],
                2,
            )
            .unwrap();
        assert_eq!(result, vec!["GPU-0::2", "GPU-2"]);

        let err = engine
            .decide(&ids(&["GPU-0::1", "GPU-0::2"]), &["GPU-0".to_string()], 2)
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::InsufficientDevices {
                requested: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn test_combinations_saturates() {
        assert_eq!(combinations(4, 2), 6);
        assert_eq!(combinations(5, 0), 1);
        assert_eq!(combinations(64, 32), u64::MAX);
    }

    fn engine(n: u32) -> AllocationEngine {
        AllocationEngine::new(fleet(n), LinkMatrix::new())
    }

    proptest! {
        #[test]
        fn prop_fallback_contract(
            n in 1u32..10,
            picks in proptest::collection::vec(any::<bool>(), 10),
            size_seed in 0usize..10,
        ) {
            let engine = engine(n);
            // Annotating the available ids routes to the fallback policy.
            let available: Vec<AnnotatedId> = (0..n)
                .map(|i| AnnotatedId::with_annotation(&format!("GPU-{i}"), "0"))
                .collect();
            let required: Vec<String> = available
                .iter()
                .zip(&picks)
                .filter(|(_, p)| **p)
                .map(|(a, _)| a.as_str().to_string())
                .collect();
            let size = required.len() + size_seed % (available.len() - required.len() + 1);

            prop_assert_eq!(engine.policy_for(&available), Policy::Fallback);
            let result = engine.decide(&available, &required, size).unwrap();

            prop_assert_eq!(result.len(), size);
            prop_assert_eq!(&result[..required.len()], &required[..]);
            let unique: HashSet<&String> = result.iter().collect();
            prop_assert_eq!(unique.len(), result.len());
        }

        #[test]
        fn prop_fallback_insufficient(n in 1u32..10, extra in 1usize..5) {
            let engine = engine(n);
            let available: Vec<AnnotatedId> = (0..n)
                .map(|i| AnnotatedId::with_annotation(&format!("GPU-{i}"), "0"))
                .collect();
            let err = engine
                .decide(&available, &[], available.len() + extra)
                .unwrap_err();
            let is_insufficient = matches!(err, GpuError::InsufficientDevices { .. });
            prop_assert!(is_insufficient);
        }
    }
}
