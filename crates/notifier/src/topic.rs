//! Pub/sub topic publishing over HTTP.
//!
//! Each configured topic gets its own message and its own retry budget. A
//! topic that cannot be reached does not stop publishing to the others.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use pulse_common::types::NotificationConfig;
use pulse_engine::plugin::{Notifier, NotifierError};
use pulse_engine::retry::RetryPolicy;
use pulse_engine::task_data::TaskData;

use crate::deliver;
use crate::render;
use crate::transport::{Outbound, ensure_success};

pub struct TopicNotifier {
    name: String,
    outbound: Arc<dyn Outbound>,
    api_url: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl TopicNotifier {
    pub fn new(
        name: impl Into<String>,
        outbound: Arc<dyn Outbound>,
        api_url: impl Into<String>,
        api_key: Option<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            outbound,
            api_url: api_url.into(),
            api_key,
            policy,
        }
    }

    async fn publish(&self, topic: &str, task: &TaskData, config: &NotificationConfig) -> Result<(), NotifierError> {
        let payload = json!({
            "topic": topic,
            "subject": render::subject(task, config),
            "message": render::short_message(task, config),
            "task_id": task.id(),
            "status": task.status(),
            "routing_key": task.envelope().routing_key,
            "published_at": Utc::now().to_rfc3339(),
        });
        let payload = &payload;

        deliver(&self.policy, "publish", || async move {
            let status = self
                .outbound
                .post_json(&self.api_url, self.api_key.as_deref(), payload)
                .await?;
            ensure_success(&self.api_url, status)
        })
        .await
    }
}

#[async_trait]
impl Notifier for TopicNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, task: &TaskData, config: &NotificationConfig) -> Result<(), NotifierError> {
        let topics = config
            .topics
            .as_deref()
            .filter(|topics| !topics.is_empty())
            .ok_or_else(|| NotifierError::MissingConfig("no topics".to_string()))?;

        let mut failed = Vec::new();
        for topic in topics {
            match self.publish(topic, task, config).await {
                Ok(()) => {
                    tracing::info!(task = %task, plugin = %self.name, topic = %topic, "Published to topic");
                }
                Err(e) => {
                    tracing::error!(
                        task = %task,
                        plugin = %self.name,
                        topic = %topic,
                        error = %e,
                        "Could not publish to topic"
                    );
                    failed.push(topic.as_str());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(NotifierError::DeliveryFailed {
                attempts: self.policy.max_attempts,
                reason: format!("topics not published: {}", failed.join(", ")),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingOutbound, fast_policy, task};

    fn notifier(outbound: Arc<RecordingOutbound>) -> TopicNotifier {
        TopicNotifier::new(
            "topic",
            outbound,
            "https://pubsub.test/publish",
            None,
            fast_policy(),
        )
    }

    #[tokio::test]
    async fn test_publishes_each_topic() {
        let outbound = Arc::new(RecordingOutbound::default());
        let config = NotificationConfig {
            topics: Some(vec!["releng".to_string(), "qa".to_string()]),
            message: Some("signed".to_string()),
            ..Default::default()
        };

        notifier(outbound.clone())
            .notify(&task("task-completed"), &config)
            .await
            .unwrap();

        let sent = outbound.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|r| r.bearer.is_none()));

        let first = sent[0].json.as_ref().unwrap();
        assert_eq!(first["topic"], "releng");
        assert_eq!(first["message"], "signed");
        assert_eq!(first["task_id"], "abc");
        assert_eq!(first["status"], "task-completed");
        assert_eq!(first["routing_key"], "primary.abc");
        assert!(first["published_at"].is_string());
        assert_eq!(sent[1].json.as_ref().unwrap()["topic"], "qa");
    }

    #[tokio::test]
    async fn test_failed_topic_does_not_stop_others() {
        // first topic burns five failures, the second succeeds
        let outbound = Arc::new(RecordingOutbound::with_statuses(vec![500, 500, 500, 500, 500, 200]));
        let config = NotificationConfig {
            topics: Some(vec!["broken".to_string(), "ok".to_string()]),
            ..Default::default()
        };

        let err = notifier(outbound.clone())
            .notify(&task("task-exception"), &config)
            .await
            .unwrap_err();

        assert!(matches!(err, NotifierError::DeliveryFailed { ref reason, .. } if reason.contains("broken")));
        let sent = outbound.sent();
        assert_eq!(sent.len(), 6);
        assert_eq!(sent[5].json.as_ref().unwrap()["topic"], "ok");
    }

    #[tokio::test]
    async fn test_missing_topics() {
        let outbound = Arc::new(RecordingOutbound::default());
        let err = notifier(outbound)
            .notify(&task("task-completed"), &NotificationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifierError::MissingConfig(_)));
    }
}
