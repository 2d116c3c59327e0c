//! plfm-vt Device Plugin Library
//!
//! The device plugin runs on each GPU node and exposes its GPUs and MIG
//! partitions to the kubelet, one resource name per serving endpoint.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── PluginFactory        (config reload, hardware session, catalog)
//! └── PluginEndpoint(res)  (socket server + health worker per resource)
//! ```
//!
//! ## Modules
//!
//! - `config`: Flags, environment and config file resolution
//! - `endpoint`: The endpoint trait and the Unix-socket endpoint
//! - `plugin`: Endpoint factory backed by the device catalog
//! - `supervisor`: Endpoint lifecycle state machine
//! - `watch`: Kubelet socket and OS signal triggers

pub mod config;
pub mod endpoint;
pub mod plugin;
pub mod supervisor;
pub mod watch;

pub use config::{Config, Flags};
pub use endpoint::{Endpoint, PluginEndpoint};
pub use plugin::PluginFactory;
pub use supervisor::{EndpointFactory, StartError, Supervisor, Trigger, RESTART_BACKOFF};
