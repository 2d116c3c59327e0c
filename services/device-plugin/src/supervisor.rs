//! Endpoint lifecycle supervisor.
//!
//! The supervisor owns every running endpoint and rebuilds the whole set when
//! the kubelet restarts, on SIGHUP, or after a failed start. It is a single
//! loop over an explicit [`State`]:
//!
//! ```text
//! Idle ──> Starting ──> Running ──┐
//!   ^         │                   │ trigger
//!   │         └──> BackingOff ────┤
//!   │                             v
//!   └──────────────────────── Draining ──> exit (termination signal)
//! ```
//!
//! A cycle always stops every endpoint of the previous cycle before the next
//! one starts.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use plfm_gpu::LibError;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;

/// Delay before retrying after an endpoint failed to start.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(30);

/// Asynchronous events the supervisor reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The kubelet registration socket was (re)created.
    KubeletRestart,
    /// Hang-up signal: restart with reloaded configuration.
    Hangup,
    /// Termination-class signal, by name.
    Shutdown(String),
}

/// Why a cycle could not produce endpoints.
#[derive(Debug, Error)]
pub enum StartError {
    /// The hardware session could not be opened.
    #[error("failed to initialize hardware library: {source}")]
    Init {
        #[source]
        source: LibError,
        /// Exit instead of waiting for a termination signal.
        fail_fast: bool,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Builds the endpoints of one cycle and owns the hardware session.
#[async_trait]
pub trait EndpointFactory: Send {
    /// Open the hardware session and build one endpoint per resource.
    async fn create(&mut self) -> Result<Vec<Box<dyn Endpoint>>, StartError>;

    /// Close the hardware session opened by `create`, if any.
    async fn release(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Starting,
    Running,
    /// A start failed; waiting out the backoff.
    BackingOff,
    /// The hardware session failed to open; waiting for a termination signal.
    Blocked,
    Draining(AfterDrain),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterDrain {
    Restart,
    Exit,
}

/// The control loop.
pub struct Supervisor<F> {
    factory: F,
    triggers: mpsc::Receiver<Trigger>,
    endpoints: Vec<Box<dyn Endpoint>>,
    backoff: Duration,
    fatal: Option<anyhow::Error>,
}

impl<F: EndpointFactory> Supervisor<F> {
    pub fn new(factory: F, triggers: mpsc::Receiver<Trigger>) -> Self {
        Self {
            factory,
            triggers,
            endpoints: Vec::new(),
            backoff: RESTART_BACKOFF,
            fatal: None,
        }
    }

    /// Run until a termination signal, or until a start fails fatally.
    pub async fn run(mut self) -> Result<()> {
        let mut state = State::Idle;

        loop {
            debug!(?state, "Supervisor state");
            state = match state {
                State::Idle => State::Starting,
                State::Starting => self.start().await,
                State::Running => self.wait(None).await,
                State::BackingOff => self.wait(Some(self.backoff)).await,
                State::Blocked => self.block().await,
                State::Draining(after) => {
                    let result = self.drain().await;
                    match after {
                        AfterDrain::Restart => {
                            if let Err(e) = result {
                                error!(error = %format!("{e:#}"), "Error while stopping endpoints");
                            }
                            State::Idle
                        }
                        AfterDrain::Exit => {
                            return match self.fatal.take() {
                                Some(e) => {
                                    if let Err(drain) = result {
                                        error!(error = %format!("{drain:#}"), "Error while stopping endpoints");
                                    }
                                    Err(e)
                                }
                                None => {
                                    info!("Supervisor stopped");
                                    result
                                }
                            };
                        }
                    }
                }
            };
        }
    }

    async fn start(&mut self) -> State {
        info!("Starting endpoints");

        let endpoints = match self.factory.create().await {
            Ok(endpoints) => endpoints,
            Err(StartError::Init {
                source,
                fail_fast: true,
            }) => {
                self.fatal = Some(anyhow!("failed to initialize hardware library: {source}"));
                return State::Draining(AfterDrain::Exit);
            }
            Err(StartError::Init { source, .. }) => {
                error!(error = %source, "Failed to initialize hardware library");
                info!("Waiting indefinitely instead of exiting");
                return State::Blocked;
            }
            Err(StartError::Other(e)) => {
                self.fatal = Some(e.context("error starting endpoints"));
                return State::Draining(AfterDrain::Exit);
            }
        };

        for mut endpoint in endpoints {
            if endpoint.devices().is_empty() {
                info!(resource = endpoint.resource_name(), "No devices found, skipping resource");
                continue;
            }

            let result = endpoint.start().await;
            let resource = endpoint.resource_name().to_string();
            self.endpoints.push(endpoint);

            if let Err(e) = result {
                error!(resource = %resource, error = %format!("{e:#}"), "Failed to start endpoint");
                error!("Could not contact the kubelet, did you enable the device plugin feature gate?");
                if let Err(e) = self.stop_endpoints().await {
                    warn!(error = %format!("{e:#}"), "Error while stopping endpoints after failed start");
                }
                info!(
                    backoff_secs = self.backoff.as_secs(),
                    "Retrying after backoff"
                );
                return State::BackingOff;
            }
        }

        if self.endpoints.is_empty() {
            info!("No devices found. Waiting indefinitely.");
        }
        State::Running
    }

    async fn wait(&mut self, backoff: Option<Duration>) -> State {
        let timer = async {
            match backoff {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = timer => {
                info!("Restart backoff elapsed, restarting");
                State::Draining(AfterDrain::Restart)
            }
            trigger = self.triggers.recv() => on_trigger(trigger),
        }
    }

    async fn block(&mut self) -> State {
        loop {
            match self.triggers.recv().await {
                trigger @ (Some(Trigger::Shutdown(_)) | None) => return on_trigger(trigger),
                Some(trigger) => debug!(?trigger, "Ignoring trigger while blocked"),
            }
        }
    }

    /// Stop every endpoint, then release the hardware session.
    async fn drain(&mut self) -> Result<()> {
        info!(endpoints = self.endpoints.len(), "Stopping endpoints");
        let mut first_error = self.stop_endpoints().await.err();

        if let Err(e) = self.factory.release().await {
            warn!(error = %format!("{e:#}"), "Error releasing hardware session");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every owned endpoint, returning the first failure.
    async fn stop_endpoints(&mut self) -> Result<()> {
        let mut first_error = None;

        for mut endpoint in std::mem::take(&mut self.endpoints) {
            if let Err(e) = endpoint.stop().await {
                let resource = endpoint.resource_name().to_string();
                warn!(resource = %resource, error = %format!("{e:#}"), "Failed to stop endpoint");
                first_error.get_or_insert(e.context(format!("error stopping endpoint for '{resource}'")));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn on_trigger(trigger: Option<Trigger>) -> State {
    match trigger {
        Some(Trigger::KubeletRestart) => {
            info!("Kubelet socket created, restarting");
            State::Draining(AfterDrain::Restart)
        }
        Some(Trigger::Hangup) => {
            info!("Received SIGHUP, restarting");
            State::Draining(AfterDrain::Restart)
        }
        Some(Trigger::Shutdown(signal)) => {
            info!(signal = %signal, "Received signal, shutting down");
            State::Draining(AfterDrain::Exit)
        }
        None => {
            warn!("Trigger channel closed, shutting down");
            State::Draining(AfterDrain::Exit)
        }
    }
}
