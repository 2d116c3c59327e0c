//! MIG profile naming.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::library::{GpuInstanceProfileInfo, MigAttributes};

/// Shape of a partition: slice counts and memory rounded up to whole GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigProfile {
    pub gpu_slices: u32,
    pub compute_slices: u32,
    pub memory_gb: u64,
}

impl MigProfile {
    pub fn new(gpu_slices: u32, compute_slices: u32, memory_mb: u64) -> Self {
        Self {
            gpu_slices,
            compute_slices,
            memory_gb: memory_mb.div_ceil(1024),
        }
    }

    /// Profile of an instantiated partition.
    pub fn from_attributes(attributes: &MigAttributes) -> Self {
        Self::new(
            attributes.gpu_instance_slice_count,
            attributes.compute_instance_slice_count,
            attributes.memory_size_mb,
        )
    }

    /// Profile a whole GPU instance of this shape would expose.
    pub fn from_gpu_instance(info: &GpuInstanceProfileInfo) -> Self {
        Self::new(info.slice_count, info.slice_count, info.memory_size_mb)
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.gpu_slices == self.compute_slices {
            write!(f, "{}g.{}gb", self.gpu_slices, self.memory_gb)
        } else {
            write!(
                f,
                "{}c.{}g.{}gb",
                self.compute_slices, self.gpu_slices, self.memory_gb
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1, 10240, "1g.10gb")]
    #[case(2, 1, 20480, "1c.2g.20gb")]
    #[case(1, 1, 10241, "1g.11gb")]
    #[case(7, 7, 40192, "7g.40gb")]
    #[case(3, 3, 1, "3g.1gb")]
    fn test_profile_name(
        #[case] g: u32,
        #[case] c: u32,
        #[case] memory_mb: u64,
        #[case] expected: &str,
    ) {
        assert_eq!(MigProfile::new(g, c, memory_mb).to_string(), expected);
    }

    #[test]
    fn test_gpu_instance_profile_uses_equal_slices() {
        let info = GpuInstanceProfileInfo {
            slice_count: 2,
            memory_size_mb: 9856,
        };
        assert_eq!(MigProfile::from_gpu_instance(&info).to_string(), "2g.10gb");
    }
}
