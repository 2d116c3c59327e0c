//! Per-resource serving endpoints.
//!
//! An [`Endpoint`] is what the supervisor starts and stops. The concrete
//! [`PluginEndpoint`] binds `nvidia-{resource}.sock` in the plugin directory
//! and answers newline-delimited JSON requests:
//!
//! ```text
//! {"type":"list"}
//! {"type":"preferred_allocation","available":["GPU-a","GPU-b"],"required":[],"size":1}
//! {"type":"allocate","devices":["GPU-a"]}
//! ```
//!
//! While running it also watches its devices for critical hardware errors on
//! a dedicated blocking thread.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use plfm_gpu::{
    check_health, AllocationEngine, AnnotatedId, DeviceLibrary, DeviceSet, HealthCheckConfig,
    Resource,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DeviceIdStrategy, DeviceListStrategy};

/// File name of the kubelet registration socket.
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Environment variable the container runtime reads the device list from.
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

/// Container directory holding one entry per device under `volume-mounts`.
pub const DEVICE_LIST_CONTAINER_PATH: &str = "/var/run/nvidia-container-devices";

/// Control nodes every container with a device needs.
const CONTROL_DEVICES: &[&str] = &[
    "/dev/nvidiactl",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-modeset",
];

// =============================================================================
// Endpoint trait
// =============================================================================

/// A serving unit for one resource name.
#[async_trait]
pub trait Endpoint: Send {
    fn resource_name(&self) -> &str;

    /// Ids of the devices this endpoint serves.
    fn devices(&self) -> Vec<String>;

    async fn start(&mut self) -> Result<()>;

    /// Stop serving. Safe to call on an endpoint that never started.
    async fn stop(&mut self) -> Result<()>;
}

// =============================================================================
// Protocol
// =============================================================================

/// A request from the kubelet side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    List,
    PreferredAllocation {
        available: Vec<AnnotatedId>,
        #[serde(default)]
        required: Vec<String>,
        size: usize,
    },
    Allocate {
        devices: Vec<String>,
    },
}

/// Health as advertised for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: String,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa_node: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

/// What the container runtime needs to expose the allocated devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAllocation {
    pub envs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Devices { devices: Vec<DeviceStatus> },
    PreferredAllocation { devices: Vec<String> },
    Allocate(ContainerAllocation),
    Error { message: String },
}

// =============================================================================
// Plugin endpoint
// =============================================================================

/// Settings shared by every endpoint of one cycle.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub driver_root: PathBuf,
    pub device_list_strategy: DeviceListStrategy,
    pub device_id_strategy: DeviceIdStrategy,
    pub pass_device_specs: bool,
    pub health: HealthCheckConfig,
}

impl EndpointSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            plugin_dir: config.plugin_dir.clone(),
            kubelet_socket: config.kubelet_socket(),
            driver_root: config.nvidia_driver_root.clone(),
            device_list_strategy: config.device_list_strategy,
            device_id_strategy: config.device_id_strategy,
            pass_device_specs: config.pass_device_specs,
            health: HealthCheckConfig::default(),
        }
    }
}

/// State shared between the serving task and connection handlers.
struct Service {
    resource_name: String,
    /// Resource name without the vendor prefix, used in the socket name.
    suffix: String,
    engine: AllocationEngine,
    settings: EndpointSettings,
    unhealthy: Arc<Mutex<HashSet<String>>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    health_stop: Arc<AtomicBool>,
    health: JoinHandle<()>,
}

/// Unix-socket endpoint serving one resource.
pub struct PluginEndpoint {
    service: Arc<Service>,
    library: Arc<dyn DeviceLibrary>,
    running: Option<Running>,
}

impl PluginEndpoint {
    pub fn new(
        resource: Resource,
        settings: EndpointSettings,
        library: Arc<dyn DeviceLibrary>,
    ) -> Self {
        let engine = AllocationEngine::new(resource.devices.clone(), resource.links.clone());
        let service = Service {
            resource_name: resource.name.clone(),
            suffix: resource.suffix().to_string(),
            engine,
            settings,
            unhealthy: Arc::new(Mutex::new(HashSet::new())),
        };
        Self {
            service: Arc::new(service),
            library,
            running: None,
        }
    }

    /// Socket path, `nvidia-{suffix}.sock` in the plugin directory.
    pub fn socket_path(&self) -> PathBuf {
        self.service
            .settings
            .plugin_dir
            .join(format!("nvidia-{}.sock", self.service.suffix))
    }

    fn spawn_health_worker(&self, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let library = Arc::clone(&self.library);
        let service = Arc::clone(&self.service);

        tokio::task::spawn_blocking(move || {
            let devices = service.engine.devices();
            let result = check_health(
                library,
                devices,
                &service.settings.health,
                &stop,
                |device, _| {
                    if let Ok(mut unhealthy) = service.unhealthy.lock() {
                        unhealthy.insert(device.id.clone());
                    }
                },
            );
            if let Err(e) = result {
                error!(
                    resource = %service.resource_name,
                    error = %e,
                    "Health checks failed, devices will not be marked unhealthy"
                );
            }
        })
    }
}

#[async_trait]
impl Endpoint for PluginEndpoint {
    fn resource_name(&self) -> &str {
        &self.service.resource_name
    }

    fn devices(&self) -> Vec<String> {
        self.service.engine.devices().ids()
    }

    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let kubelet = &self.service.settings.kubelet_socket;
        if !tokio::fs::try_exists(kubelet).await.unwrap_or(false) {
            bail!(
                "kubelet socket {} not found; is the DevicePlugins feature gate enabled?",
                kubelet.display()
            );
        }

        let socket = self.socket_path();
        remove_socket(&socket).await?;
        let listener = UnixListener::bind(&socket)
            .with_context(|| format!("failed to bind {}", socket.display()))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::clone(&self.service), shutdown_rx));

        let health_stop = Arc::new(AtomicBool::new(false));
        let health = self.spawn_health_worker(Arc::clone(&health_stop));

        info!(
            resource = %self.service.resource_name,
            socket = %socket.display(),
            devices = self.service.engine.devices().len(),
            "Endpoint started"
        );

        self.running = Some(Running {
            shutdown,
            server,
            health_stop,
            health,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        running.health_stop.store(true, Ordering::SeqCst);

        if let Err(e) = running.server.await {
            warn!(resource = %self.service.resource_name, error = %e, "Serving task panicked");
        }
        if let Err(e) = running.health.await {
            warn!(resource = %self.service.resource_name, error = %e, "Health worker panicked");
        }

        remove_socket(&self.socket_path()).await?;
        info!(resource = %self.service.resource_name, "Endpoint stopped");
        Ok(())
    }
}

async fn remove_socket(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

// =============================================================================
// Serving
// =============================================================================

async fn serve(listener: UnixListener, service: Arc<Service>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let service = Arc::clone(&service);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &service, shutdown).await {
                            debug!(resource = %service.resource_name, error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(resource = %service.resource_name, error = %e, "Failed to accept connection");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    service: &Service,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read request")?,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => service.handle(request),
            Err(e) => Response::Error {
                message: format!("invalid request: {e}"),
            },
        };

        let mut json = serde_json::to_string(&response).context("failed to serialize response")?;
        json.push('\n');
        write.write_all(json.as_bytes()).await?;
        write.flush().await?;
    }
}

impl Service {
    fn handle(&self, request: Request) -> Response {
        match request {
            Request::List => Response::Devices {
                devices: self.list(),
            },
            Request::PreferredAllocation {
                available,
                required,
                size,
            } => match self.engine.decide(&available, &required, size) {
                Ok(devices) => Response::PreferredAllocation { devices },
                Err(e) => Response::Error {
                    message: format!("error getting preferred allocation: {e}"),
                },
            },
            Request::Allocate { devices } => match self.allocate(&devices) {
                Ok(allocation) => Response::Allocate(allocation),
                Err(e) => Response::Error {
                    message: format!("{e:#}"),
                },
            },
        }
    }

    fn list(&self) -> Vec<DeviceStatus> {
        let unhealthy = match self.unhealthy.lock() {
            Ok(set) => set.clone(),
            Err(_) => HashSet::new(),
        };
        self.engine
            .devices()
            .iter()
            .map(|device| DeviceStatus {
                id: device.id.clone(),
                health: if unhealthy.contains(&device.id) {
                    Health::Unhealthy
                } else {
                    Health::Healthy
                },
                numa_node: device.numa_node,
            })
            .collect()
    }

    fn allocate(&self, ids: &[String]) -> Result<ContainerAllocation> {
        let fleet = self.engine.devices();
        let base_ids: Vec<&str> = ids
            .iter()
            .map(|id| {
                let annotated = AnnotatedId::new(id.as_str());
                fleet
                    .get(annotated.base_id())
                    .map(|d| d.id.as_str())
                    .with_context(|| {
                        format!(
                            "invalid allocation request for '{}': unknown device: {id}",
                            self.resource_name
                        )
                    })
            })
            .collect::<Result<_>>()?;
        let devices: DeviceSet = fleet.subset(&base_ids);

        let settings = &self.settings;
        let names: Vec<String> = devices
            .iter()
            .map(|d| match settings.device_id_strategy {
                DeviceIdStrategy::Uuid => d.id.clone(),
                DeviceIdStrategy::Index => d.index.clone(),
            })
            .collect();

        let mut allocation = ContainerAllocation::default();
        match settings.device_list_strategy {
            DeviceListStrategy::Envvar => {
                allocation
                    .envs
                    .insert(VISIBLE_DEVICES_ENV.to_string(), names.join(","));
            }
            DeviceListStrategy::VolumeMounts => {
                allocation.envs.insert(
                    VISIBLE_DEVICES_ENV.to_string(),
                    DEVICE_LIST_CONTAINER_PATH.to_string(),
                );
                allocation.mounts = names
                    .iter()
                    .map(|name| Mount {
                        container_path: format!("{DEVICE_LIST_CONTAINER_PATH}/{name}"),
                        host_path: "/dev/null".to_string(),
                        read_only: true,
                    })
                    .collect();
            }
        }

        if settings.pass_device_specs {
            let mut seen = HashSet::new();
            let paths = CONTROL_DEVICES
                .iter()
                .map(|p| PathBuf::from(*p))
                .chain(devices.iter().flat_map(|d| d.paths.iter().cloned()));
            for path in paths {
                if !seen.insert(path.clone()) {
                    continue;
                }
                let relative = path.strip_prefix("/").unwrap_or(&path);
                allocation.devices.push(DeviceSpec {
                    container_path: path.display().to_string(),
                    host_path: settings.driver_root.join(relative).display().to_string(),
                    permissions: "rw".to_string(),
                });
            }
        }

        debug!(
            resource = %self.resource_name,
            devices = ?devices.ids(),
            "Allocated devices"
        );
        Ok(allocation)
    }
}
