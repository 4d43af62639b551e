//! Notifier plugin contract and the start-up registry of enabled plugins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use pulse_common::types::NotificationConfig;

use crate::task_data::TaskData;

/// Errors a notifier may return. The dispatcher logs them and moves on.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },

    #[error("{url} answered with HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Snapshot(#[from] crate::task_data::SnapshotError),
}

/// A back-end able to deliver a notification through one channel.
///
/// Plugins are built once at start-up and shared across messages, so they
/// must not keep per-message state.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Stable identifier, matching the name tasks use in `plugins`.
    fn name(&self) -> &str;

    /// Deliver the notification for `task` using the identity's resolved
    /// `config`.
    async fn notify(&self, task: &TaskData, config: &NotificationConfig) -> Result<(), NotifierError>;
}

/// Enabled plugins by name. Read-only once built.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: HashMap<String, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its own name, replacing any previous one.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        let name = notifier.name().to_string();
        if self.notifiers.insert(name.clone(), notifier).is_some() {
            tracing::warn!(plugin = %name, "Plugin registered twice, keeping the latest");
        } else {
            tracing::info!(plugin = %name, "Plugin initialized");
        }
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.register(notifier);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Notifier>> {
        self.notifiers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.notifiers.contains_key(name)
    }

    /// Registered plugin names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.notifiers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl std::fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("notifiers", &self.names())
            .finish()
    }
}
