//! Archive task logs to S3.
//!
//! Every artifact from `TaskData::log_data` is gzipped and uploaded with a
//! `PUT` to its destination URL. Tasks without build properties have no
//! artifacts and are skipped.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;

use pulse_common::types::NotificationConfig;
use pulse_engine::plugin::{Notifier, NotifierError};
use pulse_engine::retry::RetryPolicy;
use pulse_engine::task_data::TaskData;

use crate::deliver;
use crate::transport::{Outbound, ensure_success};

const UPLOAD_HEADERS: [(&str, &str); 2] = [("Content-Type", "text/plain"), ("Content-Encoding", "gzip")];

pub struct LogCollectNotifier {
    outbound: Arc<dyn Outbound>,
    bucket: String,
    policy: RetryPolicy,
}

impl LogCollectNotifier {
    pub fn new(outbound: Arc<dyn Outbound>, bucket: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            outbound,
            bucket: bucket.into(),
            policy,
        }
    }
}

#[async_trait]
impl Notifier for LogCollectNotifier {
    fn name(&self) -> &str {
        "log_collect"
    }

    async fn notify(&self, task: &TaskData, _config: &NotificationConfig) -> Result<(), NotifierError> {
        let artifacts = task.log_data(&self.bucket)?;

        let mut uploaded = 0;
        let mut failed = Vec::new();
        for artifact in artifacts {
            let url = artifact.destination_url.as_str();
            let compressed = gzip(artifact.data)?;
            let data = compressed.as_slice();
            let result = deliver(&self.policy, "upload_log", || async move {
                let status = self.outbound.put(url, &UPLOAD_HEADERS, data.to_vec()).await?;
                ensure_success(url, status)
            })
            .await;

            match result {
                Ok(()) => {
                    uploaded += 1;
                    tracing::info!(
                        task = %task,
                        run_id = artifact.run_id,
                        key = %artifact.key,
                        "Log uploaded to S3"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        task = %task,
                        run_id = artifact.run_id,
                        key = %artifact.key,
                        error = %e,
                        "Could not upload log"
                    );
                    failed.push(artifact.run_id.to_string());
                }
            }
        }

        if uploaded == 0 && failed.is_empty() {
            tracing::debug!(task = %task, "No logs to archive");
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(NotifierError::DeliveryFailed {
                attempts: self.policy.max_attempts,
                reason: format!("logs not uploaded for runs: {}", failed.join(", ")),
            })
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, NotifierError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
