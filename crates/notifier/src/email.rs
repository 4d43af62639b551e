//! Email through an HTTP delivery API.
//!
//! One JSON request per notification: `{from, to, subject, text}`, sent with
//! a bearer key. Recipients come from the resolved `emails`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use pulse_common::types::NotificationConfig;
use pulse_engine::plugin::{Notifier, NotifierError};
use pulse_engine::retry::RetryPolicy;
use pulse_engine::task_data::TaskData;

use crate::deliver;
use crate::render;
use crate::transport::{Outbound, ensure_success};

pub struct EmailNotifier {
    name: String,
    outbound: Arc<dyn Outbound>,
    api_url: String,
    api_key: String,
    from: String,
    policy: RetryPolicy,
}

impl EmailNotifier {
    pub fn new(
        name: impl Into<String>,
        outbound: Arc<dyn Outbound>,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            outbound,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            policy,
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, task: &TaskData, config: &NotificationConfig) -> Result<(), NotifierError> {
        let recipients = config
            .emails
            .as_deref()
            .filter(|emails| !emails.is_empty())
            .ok_or_else(|| NotifierError::MissingConfig("no email recipients".to_string()))?;

        let payload = json!({
            "from": self.from,
            "to": recipients,
            "subject": render::subject(task, config),
            "text": render::body(task, config),
        });

        let payload = &payload;
        deliver(&self.policy, "send_email", || async move {
            let status = self
                .outbound
                .post_json(&self.api_url, Some(&self.api_key), payload)
                .await?;
            ensure_success(&self.api_url, status)
        })
        .await?;

        tracing::info!(
            task = %task,
            plugin = %self.name,
            recipients = recipients.len(),
            "Notified by email"
        );
        Ok(())
    }
}
