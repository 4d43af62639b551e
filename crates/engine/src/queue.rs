//! Queue service client: task definitions and per-run logs.
//!
//! Log retrieval depends on the provisioner that ran the task:
//! - `aws-provisioner-v1` serves the live log directly.
//! - `buildbot-bridge` serves a `properties.json` whose `log_url[0]` points at
//!   the real log, which must be fetched in a second request.
//!
//! An artifact that will never exist (e.g. the run was cancelled before it
//! started) is reported as `FetchError::NoLogsExist`, which the retry helper
//! does not retry.

use std::sync::Arc;

use crate::fetch::{FetchError, HttpFetch, HttpResponse};
use crate::retry::{RetryError, RetryPolicy, retry_non_empty};

pub const AWS_PROVISIONER: &str = "aws-provisioner-v1";
pub const BUILDBOT_BRIDGE: &str = "buildbot-bridge";

/// How a provisioner exposes the log of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// The artifact URL returns the log itself.
    LiveLog,
    /// The artifact URL returns JSON pointing at the log.
    PropertiesPointer,
}

impl LogSource {
    /// Log source for a provisioner, `None` when it does not publish logs we
    /// know how to read.
    pub fn for_provisioner(provisioner_id: &str) -> Option<Self> {
        match provisioner_id {
            AWS_PROVISIONER => Some(LogSource::LiveLog),
            BUILDBOT_BRIDGE => Some(LogSource::PropertiesPointer),
            _ => None,
        }
    }

    fn artifact_path(&self) -> &'static str {
        match self {
            LogSource::LiveLog => "public/logs/live.log",
            LogSource::PropertiesPointer => "public/properties.json",
        }
    }
}

/// Client for the Taskcluster queue service.
#[derive(Clone)]
pub struct QueueClient {
    http: Arc<dyn HttpFetch>,
    base_url: String,
    policy: RetryPolicy,
}

impl QueueClient {
    pub fn new(http: Arc<dyn HttpFetch>, base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            policy,
        }
    }

    pub fn task_url(&self, task_id: &str) -> String {
        format!("{}/v1/task/{}", self.base_url, task_id)
    }

    pub fn log_url(&self, source: LogSource, task_id: &str, run_id: u32) -> String {
        format!(
            "{}/v1/task/{}/runs/{}/artifacts/{}",
            self.base_url,
            task_id,
            run_id,
            source.artifact_path()
        )
    }

    /// Fetch a task definition as raw JSON, retrying transient failures.
    ///
    /// A well-formed 4xx answer (unknown or malformed task id) is returned as
    /// `FetchError::Rejected` on the first attempt.
    pub async fn fetch_task(&self, task_id: &str) -> Result<serde_json::Value, RetryError<FetchError>> {
        tracing::info!(task_id, "Fetching task from Taskcluster");
        let url = self.task_url(task_id);
        let url = url.as_str();

        retry_non_empty(&self.policy, "fetch_task", FetchError::is_permanent, || {
            self.get_task_json(url)
        })
        .await
    }

    /// Fetch the log of one run.
    pub async fn fetch_log(
        &self,
        source: LogSource,
        task_id: &str,
        run_id: u32,
    ) -> Result<Vec<u8>, RetryError<FetchError>> {
        let url = self.log_url(source, task_id, run_id);
        let url = url.as_str();

        retry_non_empty(&self.policy, "get_log", FetchError::is_permanent, || async move {
            match source {
                LogSource::LiveLog => self.get_live_log(url).await,
                LogSource::PropertiesPointer => self.get_pointed_log(url).await,
            }
        })
        .await
    }

    async fn get_task_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let response = self.http.get(url).await?;

        if response.is_success() {
            return response.json().ok_or_else(|| FetchError::Malformed {
                url: url.to_string(),
                reason: "task definition is not JSON".to_string(),
            });
        }

        if (400..500).contains(&response.status)
            && let Some(body) = response.json()
        {
            return Err(FetchError::Rejected {
                url: url.to_string(),
                status: response.status,
                message: error_message(&body),
            });
        }

        Err(FetchError::Status {
            url: url.to_string(),
            status: response.status,
        })
    }

    async fn get_live_log(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.http.get(url).await?;
        check_log_response(url, response)
    }

    async fn get_pointed_log(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.http.get(url).await?;
        if !response.is_success() && !artifact_missing(&response) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }

        let pointer = response.json().ok_or_else(|| FetchError::Malformed {
            url: url.to_string(),
            reason: "buildbot-bridge properties are not JSON".to_string(),
        })?;

        let log_url = pointer
            .get("log_url")
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                FetchError::NoLogsExist(format!(
                    "missing key 'log_url' in buildbot-bridge properties at {}",
                    url
                ))
            })?;

        tracing::debug!(url, log_url, "Following buildbot-bridge log pointer");
        let log_response = self.http.get(log_url).await?;
        check_log_response(log_url, log_response)
    }
}

/// Accept a log response, or classify why it is not a log.
fn check_log_response(url: &str, response: HttpResponse) -> Result<Vec<u8>, FetchError> {
    if artifact_missing(&response) {
        return Err(FetchError::NoLogsExist(format!("artifact not found at {}", url)));
    }
    if !response.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status,
        });
    }
    Ok(response.body)
}

/// Whether the body is the queue's structured "artifact not found" error.
fn artifact_missing(response: &HttpResponse) -> bool {
    let Some(body) = response.json() else {
        return false;
    };

    body.get("message").and_then(|m| m.as_str()) == Some("Artifact not found")
        || body.get("code").and_then(|c| c.as_str()) == Some("ResourceNotFound")
}

fn error_message(body: &serde_json::Value) -> String {
    body.get("message")
        .or_else(|| body.get("code"))
        .and_then(|m| m.as_str())
        .unwrap_or("no message")
        .to_string()
}
