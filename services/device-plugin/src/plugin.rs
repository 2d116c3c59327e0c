//! Endpoint factory backed by the device catalog.
//!
//! Every Starting cycle reloads the configuration, opens a hardware session,
//! builds a fresh catalog snapshot and turns each resource of the configured
//! MIG strategy into a [`PluginEndpoint`]. Draining closes the session.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use plfm_gpu::{
    CapabilityPathResolver, DeviceCatalog, DeviceLibrary, FakeLibrary, FakeTopology, LibError,
    NumaResolver, PartitionPathResolver, StaticPathResolver,
};
use tracing::{error, info, warn};

use crate::config::{Backend, Config, Flags};
use crate::endpoint::{Endpoint, EndpointSettings, PluginEndpoint};
use crate::supervisor::{EndpointFactory, StartError};

/// Where partition device-node paths come from.
#[derive(Clone)]
enum PathSource {
    Static(StaticPathResolver),
    /// The driver's capability files under the driver root.
    Capabilities,
}

/// A loaded hardware library and its partition path source.
#[derive(Clone)]
struct Hardware {
    library: Arc<dyn DeviceLibrary>,
    paths: PathSource,
}

/// Builds [`PluginEndpoint`]s for the supervisor.
pub struct PluginFactory {
    flags: Flags,
    numa: NumaResolver,
    /// Loaded on the first cycle; the backend is fixed for the process lifetime.
    hardware: Option<Hardware>,
    session_open: bool,
}

impl PluginFactory {
    pub fn new(flags: Flags, numa: NumaResolver) -> Self {
        Self {
            flags,
            numa,
            hardware: None,
            session_open: false,
        }
    }

    /// Factory over an already loaded fake library.
    pub fn with_library(flags: Flags, numa: NumaResolver, library: FakeLibrary) -> Self {
        let paths = PathSource::Static(library.path_resolver());
        Self {
            flags,
            numa,
            hardware: Some(Hardware {
                library: Arc::new(library),
                paths,
            }),
            session_open: false,
        }
    }

    fn hardware(&mut self, config: &Config) -> Result<Hardware, StartError> {
        if let Some(hardware) = &self.hardware {
            return Ok(hardware.clone());
        }
        let hardware = load_hardware(config)?;
        self.hardware = Some(hardware.clone());
        Ok(hardware)
    }
}

#[async_trait]
impl EndpointFactory for PluginFactory {
    async fn create(&mut self) -> Result<Vec<Box<dyn Endpoint>>, StartError> {
        let config = Config::load(&self.flags).context("unable to load config")?;
        log_config(&config);

        let hardware = self.hardware(&config)?;
        let library = Arc::clone(&hardware.library);

        if let Err(source) = library.init() {
            log_init_hints(&source);
            return Err(StartError::Init {
                source,
                fail_fast: config.fail_on_init_error,
            });
        }
        self.session_open = true;
        info!("Hardware library initialized");

        let paths: Arc<dyn PartitionPathResolver> = match hardware.paths {
            PathSource::Static(resolver) => Arc::new(resolver),
            PathSource::Capabilities => Arc::new(CapabilityPathResolver::new(
                Arc::clone(&library),
                config.nvidia_driver_root.clone(),
            )),
        };

        let catalog = DeviceCatalog::new(Arc::clone(&library), paths, self.numa.clone());
        let snapshot = catalog.build().context("error building device catalog")?;
        let resources = config
            .mig_strategy
            .resources(&snapshot)
            .with_context(|| format!("error applying MIG strategy '{}'", config.mig_strategy))?;

        let settings = EndpointSettings::from_config(&config);
        let endpoints = resources
            .into_iter()
            .map(|resource| {
                info!(
                    resource = %resource.name,
                    devices = resource.devices.len(),
                    "Resource discovered"
                );
                Box::new(PluginEndpoint::new(
                    resource,
                    settings.clone(),
                    Arc::clone(&library),
                )) as Box<dyn Endpoint>
            })
            .collect();

        Ok(endpoints)
    }

    async fn release(&mut self) -> Result<()> {
        if !self.session_open {
            return Ok(());
        }
        self.session_open = false;

        if let Some(hardware) = &self.hardware {
            hardware
                .library
                .shutdown()
                .context("error shutting down hardware library")?;
            info!("Hardware library shut down");
        }
        Ok(())
    }
}

fn load_hardware(config: &Config) -> Result<Hardware, StartError> {
    match config.backend {
        Backend::Fake => {
            let path = config
                .fake_topology
                .as_deref()
                .context("the fake backend requires a topology file")?;
            let library = FakeLibrary::new(read_topology(path)?);
            info!(path = %path.display(), gpus = library.topology().gpus.len(), "Loaded fake topology");
            Ok(Hardware {
                paths: PathSource::Static(library.path_resolver()),
                library: Arc::new(library),
            })
        }
        Backend::Nvml => load_nvml(config),
    }
}

#[cfg(feature = "nvml")]
fn load_nvml(config: &Config) -> Result<Hardware, StartError> {
    match plfm_gpu::nvml::NvmlLibrary::load() {
        Ok(library) => Ok(Hardware {
            library: Arc::new(library),
            paths: PathSource::Capabilities,
        }),
        Err(source) => {
            log_init_hints(&source);
            Err(StartError::Init {
                source,
                fail_fast: config.fail_on_init_error,
            })
        }
    }
}

#[cfg(not(feature = "nvml"))]
fn load_nvml(config: &Config) -> Result<Hardware, StartError> {
    error!("This binary was built without NVML support, rebuild with the 'nvml' feature or use --backend fake");
    Err(StartError::Init {
        source: LibError::LibraryNotFound,
        fail_fast: config.fail_on_init_error,
    })
}

fn read_topology(path: &Path) -> Result<FakeTopology> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("invalid topology file: {}", path.display()))
}

fn log_config(config: &Config) {
    match serde_json::to_string_pretty(config) {
        Ok(rendered) => info!("Running with config:\n{rendered}"),
        Err(e) => warn!(error = %e, "Unable to render config"),
    }
}

fn log_init_hints(source: &LibError) {
    error!(error = %source, "Failed to initialize NVML");
    error!("If this is a GPU node, did you set the container runtime's default runtime to 'nvidia'?");
    error!("You can check the prerequisites at the device plugin's documentation");
    if matches!(source, LibError::LibraryNotFound) {
        error!("If this is not a GPU node, you should set up a toleration or node selector to only deploy this plugin on GPU nodes");
    }
}
