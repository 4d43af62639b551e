use serde::{Deserialize, Serialize};

/// Broker metadata for a single delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Exchange the message was published on, e.g.
    /// `exchange/taskcluster-queue/v1/task-completed`.
    pub exchange: String,
    pub routing_key: String,
    /// Tag used to acknowledge the delivery.
    pub delivery_tag: u64,
    /// Opaque AMQP properties, carried along for logging only.
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl Envelope {
    /// Task status keyword: the exchange name after its last `/`.
    pub fn status(&self) -> &str {
        self.exchange.rsplit('/').next().unwrap_or_default()
    }
}

/// One message as handed over by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// Decoded message body published on the queue exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub status: TaskStatusBody,
}

/// The `status` object of a queue event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusBody {
    pub task_id: String,
    pub provisioner_id: String,
    pub task_group_id: String,
    pub runs: Vec<RunRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: u32,
}

/// Authoritative task document returned by `GET /v1/task/{taskId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub extra: serde_json::Value,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub name: String,
}

/// Notification parameters for one task status, or one identity's overrides
/// of them.
///
/// All fields are optional; unknown keys are dropped when parsing. `body` and
/// `recipients` are accepted as legacy spellings of `message` and `emails`,
/// alone or alongside them; the modern key wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawNotificationConfig")]
pub struct NotificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emails: Option<Vec<String>>,

    /// Chat channels to post in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,

    /// Chat nicks to message directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nicks: Option<Vec<String>>,

    /// Pub/sub topics to publish to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,

    /// Plugin names to invoke, in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,

    /// Identity names opted into this notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
}

/// Wire shape of `NotificationConfig`, with the legacy keys kept apart.
#[derive(Deserialize)]
struct RawNotificationConfig {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    emails: Option<Vec<String>>,
    #[serde(default)]
    recipients: Option<Vec<String>>,
    #[serde(default)]
    channels: Option<Vec<String>>,
    #[serde(default)]
    nicks: Option<Vec<String>>,
    #[serde(default)]
    topics: Option<Vec<String>>,
    #[serde(default)]
    plugins: Option<Vec<String>>,
    #[serde(default)]
    ids: Option<Vec<String>>,
}

impl From<RawNotificationConfig> for NotificationConfig {
    fn from(raw: RawNotificationConfig) -> Self {
        Self {
            message: raw.message.or(raw.body),
            subject: raw.subject,
            emails: raw.emails.or(raw.recipients),
            channels: raw.channels,
            nicks: raw.nicks,
            topics: raw.topics,
            plugins: raw.plugins,
            ids: raw.ids,
        }
    }
}

impl NotificationConfig {
    /// Merge `overrides` on top of `self`. A field set in `overrides` replaces
    /// the base value; unset fields keep the base value.
    pub fn merged_with(&self, overrides: &NotificationConfig) -> NotificationConfig {
        NotificationConfig {
            message: overrides.message.clone().or_else(|| self.message.clone()),
            subject: overrides.subject.clone().or_else(|| self.subject.clone()),
            emails: overrides.emails.clone().or_else(|| self.emails.clone()),
            channels: overrides.channels.clone().or_else(|| self.channels.clone()),
            nicks: overrides.nicks.clone().or_else(|| self.nicks.clone()),
            topics: overrides.topics.clone().or_else(|| self.topics.clone()),
            plugins: overrides.plugins.clone().or_else(|| self.plugins.clone()),
            ids: overrides.ids.clone().or_else(|| self.ids.clone()),
        }
    }

    /// Whether `identity` is listed in `ids`. Exact, case-sensitive match.
    pub fn opts_in(&self, identity: &str) -> bool {
        self.ids
            .as_deref()
            .is_some_and(|ids| ids.iter().any(|id| id == identity))
    }
}
