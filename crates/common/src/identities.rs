//! Identity registry: named recipient profiles loaded once at start-up.
//!
//! Each identity maps to a partial `NotificationConfig` that is merged over a
//! task's per-status configuration when the task opts the identity in. The
//! registry always starts with an implicit `default` identity with no
//! overrides, so a task that configures everything inline still resolves to
//! one configuration.

use std::path::Path;

use crate::error::AppError;
use crate::types::NotificationConfig;

/// Name of the implicit identity that is always resolved.
pub const DEFAULT_IDENTITY: &str = "default";

/// Read-only, insertion-ordered mapping of identity name to overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRegistry {
    entries: Vec<(String, NotificationConfig)>,
}

impl IdentityRegistry {
    /// Build a registry from `(name, overrides)` pairs, keeping their order.
    ///
    /// `default` is always first. If the pairs contain `default` its overrides
    /// replace the empty ones but its position does not move. A repeated name
    /// replaces the earlier entry in place.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, NotificationConfig)>,
    {
        let mut registry = Self {
            entries: vec![(DEFAULT_IDENTITY.to_string(), NotificationConfig::default())],
        };

        for (name, overrides) in entries {
            match registry.entries.iter_mut().find(|(n, _)| *n == name) {
                Some(existing) => existing.1 = overrides,
                None => registry.entries.push((name, overrides)),
            }
        }

        registry
    }

    /// Parse a YAML document of the form `name: {emails: [...], ...}`.
    ///
    /// An empty document yields a registry holding only `default`. An identity
    /// with no body (`alice:`) gets empty overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AppError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let mapping: Option<serde_yaml::Mapping> = serde_yaml::from_str(yaml)?;

        let mut entries = Vec::new();
        for (key, value) in mapping.unwrap_or_default() {
            let name = match key {
                serde_yaml::Value::String(name) => name,
                other => {
                    return Err(AppError::Validation(format!(
                        "identity names must be strings, found {:?}",
                        other
                    )));
                }
            };
            let overrides: Option<NotificationConfig> = serde_yaml::from_value(value)?;
            entries.push((name, overrides.unwrap_or_default()));
        }

        Ok(Self::from_entries(entries))
    }

    /// Load the registry from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let registry = Self::from_yaml_str(&contents)?;

        tracing::info!(
            path = %path.display(),
            identities = %registry.names().collect::<Vec<_>>().join(", "),
            "Identity registry loaded"
        );
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&NotificationConfig> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, overrides)| overrides)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NotificationConfig)> {
        self.entries
            .iter()
            .map(|(name, overrides)| (name.as_str(), overrides))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: `default` is present in every registry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::from_entries(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identity_always_present() {
        let registry = IdentityRegistry::default();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(DEFAULT_IDENTITY), Some(&NotificationConfig::default()));
    }

    #[test]
    fn test_yaml_order_preserved_after_default() {
        let registry = IdentityRegistry::from_yaml_str(
            r##"
zed:
  emails: ["zed@x.com"]
alice:
  emails: ["alice@x.com"]
releng:
  channels: ["#releng"]
  nicks: ["sheriff"]
"##,
        )
        .unwrap();

        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["default", "zed", "alice", "releng"]);
        assert_eq!(
            registry.get("releng").unwrap().nicks,
            Some(vec!["sheriff".to_string()])
        );
    }

    #[test]
    fn test_yaml_default_overrides_keep_first_position() {
        let registry = IdentityRegistry::from_yaml_str(
            r#"
alice: {}
default:
  subject: "fallback"
"#,
        )
        .unwrap();

        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["default", "alice"]);
        assert_eq!(
            registry.get("default").unwrap().subject.as_deref(),
            Some("fallback")
        );
    }

    #[test]
    fn test_yaml_identity_with_both_spellings() {
        let registry = IdentityRegistry::from_yaml_str(
            "releng:\n  message: modern\n  body: legacy\n  emails: [a@x.com]\n  recipients: [b@x.com]\n",
        )
        .unwrap();

        let releng = registry.get("releng").unwrap();
        assert_eq!(releng.message.as_deref(), Some("modern"));
        assert_eq!(releng.emails, Some(vec!["a@x.com".to_string()]));
    }

    #[test]
    fn test_empty_yaml_and_bare_identity() {
        let empty = IdentityRegistry::from_yaml_str("").unwrap();
        assert_eq!(empty, IdentityRegistry::default());

        let bare = IdentityRegistry::from_yaml_str("alice:\n").unwrap();
        assert_eq!(bare.get("alice"), Some(&NotificationConfig::default()));
    }

    #[test]
    fn test_non_string_identity_name_rejected() {
        let err = IdentityRegistry::from_yaml_str("42: {}\n").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
