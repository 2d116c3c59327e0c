//! plfm-vt Device Plugin
//!
//! Discovers the node's GPUs and MIG partitions and serves one endpoint per
//! resource to the kubelet, restarting every endpoint when the kubelet
//! restarts or on SIGHUP.

use anyhow::Result;
use clap::Parser;
use plfm_device_plugin::config::{Config, Flags};
use plfm_device_plugin::watch::{watch_plugin_dir, watch_signals};
use plfm_device_plugin::{PluginFactory, Supervisor};
use plfm_gpu::NumaResolver;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();
    let config = Config::load(&flags)?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting plfm-vt device plugin");

    // Arm the trigger sources once for the process lifetime
    let (tx, rx) = mpsc::channel(16);
    let _watcher = watch_plugin_dir(&config.plugin_dir, tx.clone())?;
    let _signals = watch_signals(tx)?;

    let factory = PluginFactory::new(flags, NumaResolver::default());
    if let Err(e) = Supervisor::new(factory, rx).run().await {
        error!(error = %format!("{e:#}"), "Device plugin exited with error");
        return Err(e);
    }

    info!("Device plugin shut down");
    Ok(())
}
