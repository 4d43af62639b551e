//! Configuration resolver: who gets notified, and how, for one task status.
//!
//! For a fetched task definition and the message's status:
//! 1. Read `extra.notifications[status]` as a typed `NotificationConfig`
//! 2. Select every registry identity named in its `ids`, plus `default`
//! 3. Merge each selected identity's overrides on top of the status config

use thiserror::Error;

use pulse_common::identities::{DEFAULT_IDENTITY, IdentityRegistry};
use pulse_common::types::{NotificationConfig, TaskDefinition};

/// Reasons a task yields no notification configurations. None of these are
/// failures of the service: most tasks are simply not instrumented.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("task has no notifications section")]
    NotConfigured,

    #[error("no notification configuration for status \"{0}\"")]
    StatusNotConfigured(String),

    #[error("notification configuration for status \"{status}\" is invalid: {reason}")]
    InvalidConfiguration { status: String, reason: String },
}

/// A configuration resolved for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNotification {
    pub identity: String,
    pub config: NotificationConfig,
}

/// Resolve the per-identity notification configurations of `definition` for
/// `status`, in registry order.
pub fn resolve(
    definition: &TaskDefinition,
    status: &str,
    identities: &IdentityRegistry,
) -> Result<Vec<ResolvedNotification>, ResolveError> {
    let notifications = definition
        .extra
        .get("notifications")
        .and_then(|n| n.as_object())
        .ok_or(ResolveError::NotConfigured)?;

    let raw = notifications
        .get(status)
        .ok_or_else(|| ResolveError::StatusNotConfigured(status.to_string()))?;

    if !raw.is_object() {
        return Err(ResolveError::InvalidConfiguration {
            status: status.to_string(),
            reason: format!("expected an object, found {}", json_kind(raw)),
        });
    }

    let status_config: NotificationConfig =
        serde_json::from_value(raw.clone()).map_err(|e| ResolveError::InvalidConfiguration {
            status: status.to_string(),
            reason: e.to_string(),
        })?;

    Ok(identities
        .iter()
        .filter(|(name, _)| *name == DEFAULT_IDENTITY || status_config.opts_in(name))
        .map(|(name, overrides)| {
            let mut config = status_config.merged_with(overrides);
            config.ids = None;
            ResolvedNotification {
                identity: name.to_string(),
                config,
            }
        })
        .collect())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
