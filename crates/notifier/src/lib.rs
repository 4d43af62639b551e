//! Notifier back-ends and their construction from configuration.
//!
//! `build_registry` turns the enabled plugin names into a `NotifierRegistry`:
//! - `email` (also `smtp`, `ses`): HTTP email API
//! - `topic` (also `sns`): HTTP pub/sub publishing
//! - `irc`: plain TCP IRC session
//! - `log_collect`: task log archival to S3
//!
//! A name that is unknown, or whose settings are missing, is skipped with a
//! warning so the worker still starts with the remaining plugins.

pub mod email;
pub mod irc;
pub mod log_collect;
pub mod render;
pub mod topic;
pub mod transport;

use std::future::Future;
use std::sync::Arc;

use pulse_common::config::AppConfig;
use pulse_engine::plugin::{Notifier, NotifierError, NotifierRegistry};
use pulse_engine::retry::{RetryError, RetryPolicy, no_bypass, retry};

use crate::email::EmailNotifier;
use crate::irc::IrcNotifier;
use crate::log_collect::LogCollectNotifier;
use crate::topic::TopicNotifier;
use crate::transport::{Outbound, ReqwestOutbound};

/// Build every enabled plugin.
pub fn build_registry(config: &AppConfig, client: reqwest::Client) -> NotifierRegistry {
    let outbound: Arc<dyn Outbound> = Arc::new(ReqwestOutbound::new(client));
    registry_with(config, outbound)
}

fn registry_with(config: &AppConfig, outbound: Arc<dyn Outbound>) -> NotifierRegistry {
    let mut registry = NotifierRegistry::new();

    for name in &config.enabled_plugins {
        match build_notifier(name, config, outbound.clone()) {
            Ok(Some(notifier)) => registry.register(notifier),
            Ok(None) => {
                tracing::warn!(plugin = %name, "Unknown plugin, skipping");
            }
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Plugin not configured, skipping");
            }
        }
    }

    if registry.is_empty() {
        tracing::warn!("No notifier plugins enabled, messages will only be acknowledged");
    }
    registry
}

/// `Ok(None)` for names no back-end answers to.
fn build_notifier(
    name: &str,
    config: &AppConfig,
    outbound: Arc<dyn Outbound>,
) -> Result<Option<Arc<dyn Notifier>>, NotifierError> {
    let policy = RetryPolicy::new(config.retry_interval());

    let notifier: Arc<dyn Notifier> = match name {
        "email" | "smtp" | "ses" => Arc::new(EmailNotifier::new(
            name,
            outbound,
            required(&config.email_api_url, "EMAIL_API_URL")?,
            required(&config.email_api_key, "EMAIL_API_KEY")?,
            required(&config.email_from, "EMAIL_FROM")?,
            policy,
        )),
        "topic" | "sns" => Arc::new(TopicNotifier::new(
            name,
            outbound,
            required(&config.topic_api_url, "TOPIC_API_URL")?,
            config.topic_api_key.clone(),
            policy,
        )),
        "irc" => Arc::new(IrcNotifier::new(
            required(&config.irc_host, "IRC_HOST")?,
            config.irc_port,
            required(&config.irc_nick, "IRC_NICK")?,
            policy,
        )),
        "log_collect" => Arc::new(LogCollectNotifier::new(
            outbound,
            required(&config.s3_bucket, "S3_BUCKET")?,
            policy,
        )),
        _ => return Ok(None),
    };

    Ok(Some(notifier))
}

fn required(value: &Option<String>, var: &str) -> Result<String, NotifierError> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NotifierError::MissingConfig(format!("{} is not set", var)))
}

/// Run one delivery attempt up to the policy's limit, then give up with
/// `DeliveryFailed` carrying the last error.
pub(crate) async fn deliver<F, Fut>(policy: &RetryPolicy, operation: &str, op: F) -> Result<(), NotifierError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), NotifierError>>,
{
    retry(policy, operation, no_bypass, op)
        .await
        .map_err(|e| give_up(policy, e))
}

fn give_up(policy: &RetryPolicy, err: RetryError<NotifierError>) -> NotifierError {
    let reason = match err.last_error() {
        Some(last) => last.to_string(),
        None => err.to_string(),
    };
    NotifierError::DeliveryFailed {
        attempts: policy.max_attempts,
        reason,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingOutbound;
    use super::*;

    fn config(plugins: &[&str]) -> AppConfig {
        AppConfig {
            pulse_host: "pulse.test".to_string(),
            pulse_port: 5671,
            pulse_login: "tester".to_string(),
            pulse_password: "secret".to_string(),
            pulse_ssl: true,
            pulse_queue_name: "pulse-notify".to_string(),
            routing_keys: vec!["#".to_string()],
            enabled_plugins: plugins.iter().map(|p| p.to_string()).collect(),
            id_config_path: "id_configs/test.yml".to_string(),
            queue_base_url: "https://queue.test".to_string(),
            retry_interval_secs: 0,
            http_timeout_secs: 10,
            s3_bucket: Some("logs".to_string()),
            email_api_url: Some("https://mail.test/emails".to_string()),
            email_api_key: Some("key".to_string()),
            email_from: Some("pulse@example.com".to_string()),
            topic_api_url: None,
            topic_api_key: None,
            irc_host: Some("irc.test".to_string()),
            irc_port: 6667,
            irc_nick: Some("pulse".to_string()),
        }
    }

    #[test]
    fn test_registry_from_enabled_names() {
        let registry = registry_with(
            &config(&["email", "irc", "log_collect"]),
            Arc::new(RecordingOutbound::default()),
        );
        assert_eq!(registry.names(), vec!["email", "irc", "log_collect"]);
    }

    #[test]
    fn test_legacy_names_answer_as_themselves() {
        let registry = registry_with(&config(&["smtp"]), Arc::new(RecordingOutbound::default()));
        assert_eq!(registry.get("smtp").unwrap().name(), "smtp");
    }

    #[test]
    fn test_unknown_and_unconfigured_plugins_skipped() {
        // topic has no TOPIC_API_URL in this config
        let registry = registry_with(
            &config(&["pager", "topic", "irc"]),
            Arc::new(RecordingOutbound::default()),
        );
        assert_eq!(registry.names(), vec!["irc"]);
    }

    #[test]
    fn test_required_rejects_blank() {
        assert!(required(&Some("x".to_string()), "X").is_ok());
        assert!(matches!(
            required(&Some(String::new()), "X"),
            Err(NotifierError::MissingConfig(_))
        ));
        assert!(required(&None, "X").is_err());
    }

    #[tokio::test]
    async fn test_give_up_reports_last_error() {
        let policy = super::testing::fast_policy();
        let err = deliver(&policy, "op", || async {
            Err(NotifierError::Protocol("nope".to_string()))
        })
        .await
        .unwrap_err();

        match err {
            NotifierError::DeliveryFailed { attempts, reason } => {
                assert_eq!(attempts, 5);
                assert_eq!(reason, "protocol error: nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
