//! Configuration for the device plugin.
//!
//! Every setting can come from a command-line flag, its environment variable,
//! or the `[flags]` table of an optional TOML config file. A flag or
//! environment variable wins over the file, which wins over the default.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use plfm_gpu::MigStrategy;
use serde::{Deserialize, Serialize};

use crate::endpoint::KUBELET_SOCKET;

/// Directory the kubelet watches for plugin sockets.
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

// =============================================================================
// Raw flags
// =============================================================================

/// Settings as given on the command line or in the config file.
///
/// Every field is optional so an unset flag can fall through to the file.
#[derive(Debug, Clone, Default, Parser, Deserialize)]
#[command(name = "device-plugin", version, about = "GPU device plugin node agent")]
#[serde(default, rename_all = "snake_case")]
pub struct Flags {
    /// Strategy for exposing MIG devices: none, single or mixed.
    #[arg(long, env = "MIG_STRATEGY")]
    pub mig_strategy: Option<MigStrategy>,

    /// Fail if the hardware library cannot be initialized instead of blocking.
    #[arg(long, env = "FAIL_ON_INIT_ERROR")]
    pub fail_on_init_error: Option<bool>,

    /// Root path of the driver installation.
    #[arg(long, env = "NVIDIA_DRIVER_ROOT")]
    pub nvidia_driver_root: Option<PathBuf>,

    /// Pass the device nodes of allocated devices in allocate responses.
    #[arg(long, env = "PASS_DEVICE_SPECS")]
    pub pass_device_specs: Option<bool>,

    /// How allocated devices are passed to the container runtime: envvar or volume-mounts.
    #[arg(long, env = "DEVICE_LIST_STRATEGY")]
    pub device_list_strategy: Option<String>,

    /// How allocated devices are identified: uuid or index.
    #[arg(long, env = "DEVICE_ID_STRATEGY")]
    pub device_id_strategy: Option<String>,

    /// Directory holding the kubelet registration socket.
    #[arg(long, env = "DEVICE_PLUGIN_PATH")]
    pub plugin_dir: Option<PathBuf>,

    /// Hardware backend.
    #[arg(long, env = "DEVICE_BACKEND", value_enum)]
    pub backend: Option<Backend>,

    /// JSON fleet description used by the fake backend.
    #[arg(long, env = "FAKE_TOPOLOGY")]
    pub fake_topology: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// TOML config file with a [flags] table.
    #[arg(long, env = "CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl Flags {
    /// Fill every unset field from `file`.
    fn or(self, file: Flags) -> Flags {
        Flags {
            mig_strategy: self.mig_strategy.or(file.mig_strategy),
            fail_on_init_error: self.fail_on_init_error.or(file.fail_on_init_error),
            nvidia_driver_root: self.nvidia_driver_root.or(file.nvidia_driver_root),
            pass_device_specs: self.pass_device_specs.or(file.pass_device_specs),
            device_list_strategy: self.device_list_strategy.or(file.device_list_strategy),
            device_id_strategy: self.device_id_strategy.or(file.device_id_strategy),
            plugin_dir: self.plugin_dir.or(file.plugin_dir),
            backend: self.backend.or(file.backend),
            fake_topology: self.fake_topology.or(file.fake_topology),
            log_level: self.log_level.or(file.log_level),
            config_file: self.config_file,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    flags: Flags,
}

// =============================================================================
// Strategies
// =============================================================================

/// Hardware backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The vendor management library.
    #[default]
    Nvml,
    /// In-memory fleet read from a JSON file.
    Fake,
}

/// How allocated devices reach the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceListStrategy {
    /// `NVIDIA_VISIBLE_DEVICES` lists the device ids.
    #[default]
    Envvar,
    /// One mount per device under the container device list directory.
    VolumeMounts,
}

impl FromStr for DeviceListStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "envvar" => Ok(Self::Envvar),
            "volume-mounts" => Ok(Self::VolumeMounts),
            other => bail!(
                "invalid device list strategy '{other}': must be one of 'envvar', 'volume-mounts'"
            ),
        }
    }
}

/// How allocated devices are named towards the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIdStrategy {
    #[default]
    Uuid,
    Index,
}

impl FromStr for DeviceIdStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uuid" => Ok(Self::Uuid),
            "index" => Ok(Self::Index),
            other => bail!("invalid device id strategy '{other}': must be one of 'uuid', 'index'"),
        }
    }
}

// =============================================================================
// Effective configuration
// =============================================================================

/// Device plugin configuration with defaults applied.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub mig_strategy: MigStrategy,
    pub fail_on_init_error: bool,
    pub nvidia_driver_root: PathBuf,
    pub pass_device_specs: bool,
    pub device_list_strategy: DeviceListStrategy,
    pub device_id_strategy: DeviceIdStrategy,
    pub plugin_dir: PathBuf,
    pub backend: Backend,
    pub fake_topology: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Resolve `flags` against the config file they name, then validate.
    pub fn load(flags: &Flags) -> Result<Self> {
        let file = match &flags.config_file {
            Some(path) => read_config_file(path)?,
            None => Flags::default(),
        };
        let flags = flags.clone().or(file);

        let device_list_strategy: DeviceListStrategy = flags
            .device_list_strategy
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();
        let device_id_strategy: DeviceIdStrategy = flags
            .device_id_strategy
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();

        let backend = flags.backend.unwrap_or_default();
        if backend == Backend::Fake && flags.fake_topology.is_none() {
            bail!("the fake backend requires a topology file (--fake-topology)");
        }

        Ok(Self {
            mig_strategy: flags.mig_strategy.unwrap_or_default(),
            fail_on_init_error: flags.fail_on_init_error.unwrap_or(true),
            nvidia_driver_root: flags
                .nvidia_driver_root
                .unwrap_or_else(|| PathBuf::from("/")),
            pass_device_specs: flags.pass_device_specs.unwrap_or(false),
            device_list_strategy,
            device_id_strategy,
            plugin_dir: flags
                .plugin_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_DIR)),
            backend,
            fake_topology: flags.fake_topology,
            log_level: flags.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Path of the kubelet registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.plugin_dir.join(KUBELET_SOCKET)
    }
}

fn read_config_file(path: &Path) -> Result<Flags> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let file: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(file.flags)
}
