//! Update notifications delivered to subscribers.
//!
//! [`EventBus`] fans every [`UpdateEvent`] out to all live subscribers. Each
//! subscriber sees events in emission order; a subscriber that falls more than
//! the channel capacity behind skips the oldest events.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::manager::{UpdateInfo, UpdateState};
use crate::transfer::DownloadProgress;

/// Events buffered per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Step of the update pipeline an event or error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Check,
    Downloading,
    Backup,
    Migrating,
    Installing,
    Cleanup,
    Complete,
    Rollback,
    Restart,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Check => "check",
            Phase::Downloading => "downloading",
            Phase::Backup => "backup",
            Phase::Migrating => "migrating",
            Phase::Installing => "installing",
            Phase::Cleanup => "cleanup",
            Phase::Complete => "complete",
            Phase::Rollback => "rollback",
            Phase::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// Notification published by the update manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum UpdateEvent {
    /// A newer release was found
    UpdateAvailable(UpdateInfo),
    /// Package download progress
    DownloadProgress(DownloadProgress),
    /// Package is on disk
    #[serde(rename_all = "camelCase")]
    DownloadComplete { file_path: PathBuf },
    /// Install step progress
    InstallProgress {
        phase: Phase,
        progress: u8,
        message: String,
    },
    /// New version installed; a restart follows
    UpdateComplete { version: String },
    /// A pipeline step failed
    UpdateError { phase: Phase, error: String },
    UpdateCancelled,
    /// A backup was restored
    UpdateRolledBack,
    StateChanged {
        previous: UpdateState,
        current: UpdateState,
    },
    ConfigChanged(crate::config::UpdateConfig),
}

impl UpdateEvent {
    /// Event name used on the subscription surface.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::UpdateAvailable(_) => "update-available",
            UpdateEvent::DownloadProgress(_) => "download-progress",
            UpdateEvent::DownloadComplete { .. } => "download-complete",
            UpdateEvent::InstallProgress { .. } => "install-progress",
            UpdateEvent::UpdateComplete { .. } => "update-complete",
            UpdateEvent::UpdateError { .. } => "update-error",
            UpdateEvent::UpdateCancelled => "update-cancelled",
            UpdateEvent::UpdateRolledBack => "update-rolled-back",
            UpdateEvent::StateChanged { .. } => "state-changed",
            UpdateEvent::ConfigChanged(_) => "config-changed",
        }
    }
}

/// Broadcast hub for [`UpdateEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UpdateEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Deliver `event` to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: UpdateEvent) {
        trace!("Publishing {}", event.name());
        let _ = self.sender.send(event);
    }

    /// New subscription; only events published afterwards are received.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
