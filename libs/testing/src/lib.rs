//! Canned fleets for tests.
//!
//! Each fixture returns a [`FakeTopology`]; wrap it in a
//! [`plfm_gpu::FakeLibrary`] to get a capability API.

use std::path::PathBuf;

use plfm_gpu::library::GpuInstanceProfileInfo;
use plfm_gpu::{FakeGpu, FakeMigDevice, FakeTopology, TopologyLevel};

/// GPU instance profiles of a 40GB A100, indexed by profile id.
pub fn a100_profiles() -> Vec<GpuInstanceProfileInfo> {
    [(1, 4864), (2, 9856), (3, 19968), (4, 19968), (7, 40192)]
        .into_iter()
        .map(|(slice_count, memory_size_mb)| GpuInstanceProfileInfo {
            slice_count,
            memory_size_mb,
        })
        .collect()
}

/// Two full GPUs joined by NVLink.
pub fn two_gpus() -> FakeTopology {
    FakeTopology::new()
        .with_gpu(FakeGpu::new("GPU-a", 0, "00000000:3B:00.0"))
        .with_gpu(FakeGpu::new("GPU-b", 1, "00000000:5E:00.0"))
        .with_link("GPU-a", "GPU-b", TopologyLevel::Single, 4)
}

/// Four full GPUs: two NVLink pairs, pairs joined only through the host.
pub fn four_gpus() -> FakeTopology {
    FakeTopology::new()
        .with_gpu(FakeGpu::new("GPU-0", 0, "00000000:1A:00.0"))
        .with_gpu(FakeGpu::new("GPU-1", 1, "00000000:1B:00.0"))
        .with_gpu(FakeGpu::new("GPU-2", 2, "00000000:8A:00.0"))
        .with_gpu(FakeGpu::new("GPU-3", 3, "00000000:8B:00.0"))
        .with_link("GPU-0", "GPU-1", TopologyLevel::Single, 12)
        .with_link("GPU-2", "GPU-3", TopologyLevel::Single, 12)
        .with_link("GPU-0", "GPU-2", TopologyLevel::System, 0)
        .with_link("GPU-0", "GPU-3", TopologyLevel::System, 0)
        .with_link("GPU-1", "GPU-2", TopologyLevel::System, 0)
        .with_link("GPU-1", "GPU-3", TopologyLevel::System, 0)
}

/// A MIG partition in `slot` with its capability device nodes.
pub fn mig_device(slot: u32, uuid: &str, gpu_slices: u32, compute_slices: u32, memory_mb: u64) -> FakeMigDevice {
    FakeMigDevice::new(slot, uuid, gpu_slices, compute_slices, memory_mb).with_paths(vec![
        PathBuf::from("/dev/nvidia0"),
        PathBuf::from(format!("/dev/nvidia-caps/nvidia-cap{}", 10 + slot * 2)),
        PathBuf::from(format!("/dev/nvidia-caps/nvidia-cap{}", 11 + slot * 2)),
    ])
}

/// One MIG-enabled A100 split into two `3g.20gb` partitions.
pub fn single_profile_mig() -> FakeTopology {
    FakeTopology::new().with_gpu(
        FakeGpu::new("GPU-mig", 0, "00000000:3B:00.0")
            .with_profiles(a100_profiles())
            .with_mig_enabled()
            .with_max_mig_devices(7)
            .with_mig_device(mig_device(1, "MIG-1", 3, 3, 19968))
            .with_mig_device(mig_device(2, "MIG-2", 3, 3, 19968)),
    )
}

/// A full GPU next to a MIG-enabled A100 with `1g.5gb` and `3g.20gb` partitions.
pub fn mixed_fleet() -> FakeTopology {
    FakeTopology::new()
        .with_gpu(FakeGpu::new("GPU-full", 0, "00000000:3B:00.0").with_profiles(a100_profiles()))
        .with_gpu(
            FakeGpu::new("GPU-mig", 1, "00000000:5E:00.0")
                .with_profiles(a100_profiles())
                .with_mig_enabled()
                .with_max_mig_devices(7)
                .with_mig_device(mig_device(0, "MIG-small", 1, 1, 4864))
                .with_mig_device(mig_device(1, "MIG-large", 3, 3, 19968)),
        )
}

/// Render a fleet as the JSON the fake backend reads.
pub fn topology_json(topology: &FakeTopology) -> String {
    serde_json::to_string_pretty(topology).unwrap_or_default()
}
