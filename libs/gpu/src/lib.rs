//! Accelerator discovery and allocation for the device plugin.
//!
//! This crate provides:
//! - The hardware capability API seam ([`DeviceLibrary`]) with an in-memory
//!   [`FakeLibrary`] and, behind the `nvml` feature, the NVML backend
//! - Device discovery ([`DeviceCatalog`]) with MIG profile naming, NUMA and
//!   device-node resolution
//! - Allocation decisions ([`AllocationEngine`])
//! - Health event subscription ([`HealthEventMonitor`])
//! - Resource strategies ([`MigStrategy`])

pub mod allocate;
pub mod catalog;
pub mod device;
pub mod error;
pub mod fake;
pub mod health;
pub mod library;
pub mod numa;
#[cfg(feature = "nvml")]
pub mod nvml;
pub mod paths;
pub mod profile;
pub mod resources;
pub mod topology;

pub use allocate::{AllocationEngine, BestEffortPolicy, Policy};
pub use catalog::{CatalogSnapshot, DeviceCatalog, MigCapability, PhysicalDevice};
pub use device::{any_has_annotations, AnnotatedId, Device, DeviceSet};
pub use error::{GpuError, LibError, LibResult};
pub use fake::{FakeGpu, FakeLibrary, FakeMigDevice, FakeTopology};
pub use health::{check_health, HardwareEvent, HealthCheckConfig, HealthEventMonitor};
pub use library::{DeviceHandle, DeviceLibrary, EventSet, TopologyLevel};
pub use numa::NumaResolver;
pub use paths::{CapabilityPathResolver, PartitionPathResolver, StaticPathResolver};
pub use profile::MigProfile;
pub use resources::{MigStrategy, Resource, GPU_RESOURCE};
pub use topology::{Link, LinkMatrix};
