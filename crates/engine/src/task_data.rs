//! Task snapshot: everything known about the task behind one message.
//!
//! `TaskData` is built from a delivery (parsing fails fast), then
//! `fetch_and_analyze` pulls the authoritative definition and, for
//! log-bearing provisioners, the log of every run. `log_data` turns the
//! fetched logs into upload-ready artifacts on demand.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use pulse_common::types::{Delivery, Envelope, EventBody, RunRecord, TaskDefinition};

use crate::fetch::FetchError;
use crate::queue::{LogSource, QueueClient};
use crate::retry::{Emptiness, RetryError};

const INSPECTOR_URL: &str = "https://tools.taskcluster.net/task-inspector/#";

/// Errors raised while building or analyzing a task snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed message body: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not fetch task {task_id}: {source}")]
    FetchFailed {
        task_id: String,
        #[source]
        source: RetryError<FetchError>,
    },

    #[error("task {task_id} has a malformed definition: {source}")]
    MalformedDefinition {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("task {0} has not been fetched yet")]
    NotFetched(String),
}

/// Log content retrieved for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    pub run_id: u32,
    pub data: Vec<u8>,
}

/// One log ready to be archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogArtifact<'a> {
    pub run_id: u32,
    pub data: &'a [u8],
    /// Object key inside the bucket.
    pub key: String,
    pub destination_url: String,
}

/// Snapshot of a task for the duration of one dispatch.
#[derive(Debug, Clone)]
pub struct TaskData {
    envelope: Envelope,
    body: EventBody,
    status: String,
    definition: Option<TaskDefinition>,
    logs: Option<Vec<RunLog>>,
}

impl TaskData {
    /// Parse a delivery. Fails on malformed JSON or missing keys.
    pub fn new(delivery: &Delivery) -> Result<Self, SnapshotError> {
        Self::from_parts(delivery.envelope.clone(), &delivery.body)
    }

    pub fn from_parts(envelope: Envelope, body: &[u8]) -> Result<Self, SnapshotError> {
        let body: EventBody = serde_json::from_slice(body)?;
        let status = envelope.status().to_string();

        Ok(Self {
            envelope,
            body,
            status,
            definition: None,
            logs: None,
        })
    }

    /// Attach a definition and logs obtained elsewhere, skipping the fetch.
    pub fn with_fetched(mut self, definition: TaskDefinition, logs: Vec<RunLog>) -> Self {
        self.definition = Some(definition);
        self.logs = Some(logs);
        self
    }

    pub fn id(&self) -> &str {
        &self.body.status.task_id
    }

    pub fn provisioner_id(&self) -> &str {
        &self.body.status.provisioner_id
    }

    pub fn task_group_id(&self) -> &str {
        &self.body.status.task_group_id
    }

    /// Status keyword derived from the exchange, e.g. `task-completed`.
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn runs(&self) -> &[RunRecord] {
        &self.body.status.runs
    }

    /// Broker metadata the task arrived with.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The fetched definition, `None` before `fetch_and_analyze` succeeds.
    pub fn definition(&self) -> Option<&TaskDefinition> {
        self.definition.as_ref()
    }

    /// Logs retrieved per run. Empty for provisioners without logs.
    pub fn logs(&self) -> Result<&[RunLog], SnapshotError> {
        self.logs
            .as_deref()
            .ok_or_else(|| SnapshotError::NotFetched(self.id().to_string()))
    }

    pub fn inspector_url(&self) -> String {
        format!("{}{}", INSPECTOR_URL, self.id())
    }

    /// Fetch the task definition, then the logs of every run when the
    /// provisioner publishes them.
    ///
    /// Only the definition fetch is fatal. A run whose log is confirmed
    /// missing, or keeps failing, is skipped with a warning.
    pub async fn fetch_and_analyze(&mut self, queue: &QueueClient) -> Result<(), SnapshotError> {
        let raw = queue
            .fetch_task(self.id())
            .await
            .map_err(|source| SnapshotError::FetchFailed {
                task_id: self.id().to_string(),
                source,
            })?;

        let definition: TaskDefinition =
            serde_json::from_value(raw).map_err(|source| SnapshotError::MalformedDefinition {
                task_id: self.id().to_string(),
                source,
            })?;
        self.definition = Some(definition);

        let Some(source) = LogSource::for_provisioner(self.provisioner_id()) else {
            tracing::debug!(
                task = %self,
                provisioner_id = self.provisioner_id(),
                "Provisioner has no supported logs, skipping log retrieval"
            );
            self.logs = Some(Vec::new());
            return Ok(());
        };

        let mut logs = Vec::new();
        for run in self.runs() {
            match queue.fetch_log(source, self.id(), run.run_id).await {
                Ok(data) => logs.push(RunLog {
                    run_id: run.run_id,
                    data,
                }),
                Err(RetryError::Bypassed(e)) => {
                    tracing::warn!(
                        task = %self,
                        run_id = run.run_id,
                        reason = %e,
                        "Could not fetch logs"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        task = %self,
                        run_id = run.run_id,
                        error = %e,
                        "Could not retrieve log for run"
                    );
                }
            }
        }

        tracing::debug!(task = %self, runs = logs.len(), "Logs retrieved");
        self.logs = Some(logs);
        Ok(())
    }

    /// Upload-ready artifacts for the retrieved logs.
    ///
    /// The iterator is lazy and can be cloned to start over. It is empty when
    /// the task carries no build properties.
    pub fn log_data(&self, bucket: &str) -> Result<LogArtifacts<'_>, SnapshotError> {
        let logs = self.logs()?;
        let definition = self
            .definition
            .as_ref()
            .ok_or_else(|| SnapshotError::NotFetched(self.id().to_string()))?;

        let naming = self.build_properties(definition).map(|props| KeyNaming {
            task_id: self.id().to_string(),
            name: definition.metadata.name.replace(['/', '\\'], "_"),
            props,
        });

        let runs = if naming.is_some() {
            logs.iter()
        } else {
            logs[..0].iter()
        };

        Ok(LogArtifacts {
            bucket: bucket.to_string(),
            naming,
            runs,
        })
    }

    /// Build properties from `extra.build_props`, falling back to
    /// `payload.properties`.
    fn build_properties(&self, definition: &TaskDefinition) -> Option<BuildProperties> {
        let raw = [
            definition.extra.get("build_props"),
            definition.payload.get("properties"),
        ]
        .into_iter()
        .flatten()
        .find(|v| !v.is_empty_value())?;

        match BuildProperties::deserialize(raw) {
            Ok(props) => Some(props),
            Err(e) => {
                tracing::warn!(
                    task = %self,
                    error = %e,
                    "Incomplete build properties, logs will not be archived"
                );
                None
            }
        }
    }
}

impl fmt::Display for TaskData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task(id={}, status={})", self.id(), self.status)
    }
}

/// Build properties used to name archived logs. Values may be strings or
/// numbers in task definitions.
#[derive(Debug, Clone, Deserialize)]
struct BuildProperties {
    branch: serde_json::Value,
    product: serde_json::Value,
    version: serde_json::Value,
    build_number: serde_json::Value,
    #[serde(default)]
    platform: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct KeyNaming {
    task_id: String,
    name: String,
    props: BuildProperties,
}

impl KeyNaming {
    /// `{branch}/{product}-{version}/build{build_number}/{name}-{platform}-{task_id}-{run_id}`
    /// with spaces replaced by underscores.
    fn key(&self, run_id: u32) -> String {
        let platform = match &self.props.platform {
            None | Some(serde_json::Value::Null) => "all".to_string(),
            Some(value) => match render(value) {
                p if p.is_empty() => "all".to_string(),
                p => p,
            },
        };

        format!(
            "{}/{}-{}/build{}/{}-{}-{}-{}",
            render(&self.props.branch),
            render(&self.props.product),
            render(&self.props.version),
            render(&self.props.build_number),
            self.name,
            platform,
            self.task_id,
            run_id
        )
        .replace(' ', "_")
    }
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lazy sequence of `LogArtifact`s; see `TaskData::log_data`.
#[derive(Debug, Clone)]
pub struct LogArtifacts<'a> {
    bucket: String,
    naming: Option<KeyNaming>,
    runs: std::slice::Iter<'a, RunLog>,
}

impl<'a> Iterator for LogArtifacts<'a> {
    type Item = LogArtifact<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let naming = self.naming.as_ref()?;
        let run = self.runs.next()?;
        let key = naming.key(run.run_id);

        Some(LogArtifact {
            run_id: run.run_id,
            data: &run.data,
            destination_url: format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
            key,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.naming {
            Some(_) => self.runs.size_hint(),
            None => (0, Some(0)),
        }
    }
}
