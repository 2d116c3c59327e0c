//! Process-lifetime trigger sources.
//!
//! Both watchers are armed once at startup and feed [`Trigger`]s into the
//! supervisor's channel until the process exits.

use std::path::Path;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::KUBELET_SOCKET;
use crate::supervisor::Trigger;

/// Watch `plugin_dir` for the kubelet socket being (re)created.
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_plugin_dir(plugin_dir: &Path, tx: mpsc::Sender<Trigger>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if is_kubelet_restart(&event) {
                info!("Kubelet socket created");
                if tx.blocking_send(Trigger::KubeletRestart).is_err() {
                    debug!("Supervisor gone, dropping kubelet restart");
                }
            }
        }
        Err(e) => warn!(error = %e, "Filesystem watch error"),
    })
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(plugin_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", plugin_dir.display()))?;

    info!(path = %plugin_dir.display(), "Watching plugin directory");
    Ok(watcher)
}

fn is_kubelet_restart(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|name| name == KUBELET_SOCKET))
}

/// Forward OS signals as triggers.
///
/// SIGHUP restarts; SIGINT, SIGTERM and SIGQUIT shut down.
pub fn watch_signals(tx: mpsc::Sender<Trigger>) -> Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let trigger = tokio::select! {
                _ = sighup.recv() => Trigger::Hangup,
                _ = sigint.recv() => Trigger::Shutdown("SIGINT".to_string()),
                _ = sigterm.recv() => Trigger::Shutdown("SIGTERM".to_string()),
                _ = sigquit.recv() => Trigger::Shutdown("SIGQUIT".to_string()),
            };

            debug!(?trigger, "Signal received");
            if tx.send(trigger).await.is_err() {
                break;
            }
        }
    }))
}
