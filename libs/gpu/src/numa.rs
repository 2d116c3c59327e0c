//! NUMA affinity lookup through the host's PCI topology in sysfs.

use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

use crate::error::GpuError;

/// A PCI address split into its domain and the `bus:device.function` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u32,
    /// Lowercase `bus:device.function`, e.g. `3b:00.0`.
    pub address: String,
}

impl PciAddress {
    /// Parse a bus id as reported by the device library.
    ///
    /// The leading domain (4 or 8 hex digits) is stripped and the remainder
    /// case-folded. A missing or unparsable domain is treated as domain 0.
    pub fn parse(bus_id: &str) -> Self {
        let bus_id = bus_id.trim().trim_end_matches('\0');
        match bus_id.split_once(':') {
            Some((domain, rest)) if rest.contains(':') => Self {
                domain: u32::from_str_radix(domain, 16).unwrap_or(0),
                address: rest.to_lowercase(),
            },
            _ => Self {
                domain: 0,
                address: bus_id.to_lowercase(),
            },
        }
    }

    /// The directory name sysfs uses for this address.
    pub fn sysfs_name(&self) -> String {
        format!("{:04x}:{}", self.domain, self.address)
    }
}

/// Reads `numa_node` files below a sysfs root.
#[derive(Debug, Clone)]
pub struct NumaResolver {
    sysfs_root: PathBuf,
}

impl Default for NumaResolver {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl NumaResolver {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    /// Path of the topology file for a bus id.
    pub fn numa_node_path(&self, bus_id: &str) -> PathBuf {
        let address = PciAddress::parse(bus_id);
        self.sysfs_root
            .join("bus/pci/devices")
            .join(address.sysfs_name())
            .join("numa_node")
    }

    /// NUMA node of the device at `bus_id`.
    ///
    /// A missing file or a negative value means the host reports no
    /// affinity. Failing to read or parse a present file is an error.
    pub fn numa_node(&self, bus_id: &str) -> Result<Option<u32>, GpuError> {
        let path = self.numa_node_path(bus_id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No NUMA topology file");
                return Ok(None);
            }
            Err(source) => return Err(GpuError::Numa { path, source }),
        };

        let value = contents.trim();
        let node: i64 = value.parse().map_err(|_| GpuError::NumaParse {
            path: path.clone(),
            value: value.to_string(),
        })?;

        if node < 0 {
            return Ok(None);
        }

        u32::try_from(node).map(Some).map_err(|_| GpuError::NumaParse {
            path,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_numa(root: &Path, sysfs_name: &str, value: &str) {
        let dir = root.join("bus/pci/devices").join(sysfs_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("numa_node"), value).unwrap();
    }

    #[test]
    fn test_parse_strips_domain_and_case_folds() {
        let address = PciAddress::parse("0000:3B:00.0");
        assert_eq!(address.address, "3b:00.0");
        assert_eq!(address.domain, 0);

        let address = PciAddress::parse("00000001:AF:00.0");
        assert_eq!(address.address, "af:00.0");
        assert_eq!(address.domain, 1);
        assert_eq!(address.sysfs_name(), "0001:af:00.0");
    }

    #[test]
    fn test_parse_without_domain() {
        let address = PciAddress::parse("3B:00.0");
        assert_eq!(address.address, "3b:00.0");
        assert_eq!(address.sysfs_name(), "0000:3b:00.0");
    }

    #[test]
    fn test_numa_node_present() {
        let dir = tempdir().unwrap();
        write_numa(dir.path(), "0000:3b:00.0", "1\n");

        let resolver = NumaResolver::new(dir.path());
        assert_eq!(resolver.numa_node("00000000:3B:00.0").unwrap(), Some(1));
    }

    #[test]
    fn test_numa_node_missing_file_is_absent() {
        let dir = tempdir().unwrap();
        let resolver = NumaResolver::new(dir.path());
        assert_eq!(resolver.numa_node("0000:3B:00.0").unwrap(), None);
    }

    #[test]
    fn test_numa_node_negative_is_absent() {
        let dir = tempdir().unwrap();
        write_numa(dir.path(), "0000:3b:00.0", "-1\n");

        let resolver = NumaResolver::new(dir.path());
        assert_eq!(resolver.numa_node("0000:3B:00.0").unwrap(), None);
    }

    #[test]
    fn test_numa_node_corrupt_file_fails() {
        let dir = tempdir().unwrap();
        write_numa(dir.path(), "0000:3b:00.0", "garbage");

        let resolver = NumaResolver::new(dir.path());
        let err = resolver.numa_node("0000:3B:00.0").unwrap_err();
        assert!(matches!(err, GpuError::NumaParse { .. }));
    }

    #[test]
    fn test_numa_node_unreadable_file_fails() {
        let dir = tempdir().unwrap();
        // A directory where the file should be fails to read with an error
        // other than NotFound.
        let path = dir.path().join("bus/pci/devices/0000:3b:00.0/numa_node");
        std::fs::create_dir_all(&path).unwrap();

        let resolver = NumaResolver::new(dir.path());
        let err = resolver.numa_node("0000:3B:00.0").unwrap_err();
        assert!(matches!(err, GpuError::Numa { .. }));
    }
}
