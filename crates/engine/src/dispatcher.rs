//! Message dispatcher: one delivery in, one acknowledgement out.
//!
//! For every delivery:
//! 1. Parse it into a `TaskData` snapshot
//! 2. Fetch the task definition (and logs) from the queue service
//! 3. Resolve per-identity notification configurations
//! 4. Invoke each configured plugin in order, isolating plugin failures
//! 5. Acknowledge the delivery, whatever happened above
//!
//! Nothing in steps 1 to 4 can stop step 5: errors are logged and classified in
//! the returned `DispatchOutcome`, and panics are trapped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

use pulse_common::identities::IdentityRegistry;
use pulse_common::types::Delivery;

use crate::plugin::NotifierRegistry;
use crate::queue::QueueClient;
use crate::resolver::{ResolveError, ResolvedNotification, resolve};
use crate::task_data::TaskData;

#[derive(Debug, Error)]
#[error("acknowledgement of delivery {delivery_tag} failed: {reason}")]
pub struct AckError {
    pub delivery_tag: u64,
    pub reason: String,
}

/// Broker-side acknowledgement of a delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AckError>;
}

/// Which path a delivery took through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Configurations were resolved; `invoked` plugin calls succeeded and
    /// `failed` returned an error or panicked.
    Notified { invoked: usize, failed: usize },
    ParseFailed,
    FetchFailed,
    NotConfigured,
    StatusNotConfigured,
    InvalidConfiguration,
    /// Something outside the known failure kinds, caught by the generic trap.
    Unclassified,
}

/// Result of dispatching one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub acknowledged: bool,
}

/// Stateless per-message orchestrator. Shared, read-only, across deliveries.
pub struct Dispatcher {
    queue: QueueClient,
    identities: Arc<IdentityRegistry>,
    notifiers: NotifierRegistry,
}

impl Dispatcher {
    pub fn new(queue: QueueClient, identities: Arc<IdentityRegistry>, notifiers: NotifierRegistry) -> Self {
        tracing::info!(
            identities = identities.len(),
            plugins = ?notifiers.names(),
            "Dispatcher initialized"
        );
        Self {
            queue,
            identities,
            notifiers,
        }
    }

    /// Process one delivery and acknowledge it exactly once.
    pub async fn dispatch(&self, delivery: &Delivery, acker: &dyn Acknowledger) -> DispatchReport {
        let started = Instant::now();
        let delivery_tag = delivery.envelope.delivery_tag;

        let outcome = match AssertUnwindSafe(self.process(delivery)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                tracing::error!(
                    delivery_tag,
                    exchange = %delivery.envelope.exchange,
                    panic = %panic_message(panic.as_ref()),
                    "Exception caught by generic exception trap"
                );
                DispatchOutcome::Unclassified
            }
        };

        tracing::info!(
            delivery_tag,
            exchange = %delivery.envelope.exchange,
            outcome = ?outcome,
            "Acknowledging consumption"
        );
        let acknowledged = match acker.ack(delivery_tag).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(delivery_tag, error = %e, "Could not acknowledge delivery");
                false
            }
        };

        tracing::debug!(
            delivery_tag,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch finished"
        );

        DispatchReport {
            outcome,
            acknowledged,
        }
    }

    async fn process(&self, delivery: &Delivery) -> DispatchOutcome {
        let mut task = match TaskData::new(delivery) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(
                    delivery_tag = delivery.envelope.delivery_tag,
                    exchange = %delivery.envelope.exchange,
                    error = %e,
                    "Could not parse message body"
                );
                return DispatchOutcome::ParseFailed;
            }
        };

        if let Err(e) = task.fetch_and_analyze(&self.queue).await {
            tracing::error!(task = %task, error = %e, "Could not fetch task");
            return DispatchOutcome::FetchFailed;
        }

        let Some(definition) = task.definition() else {
            tracing::error!(task = %task, "Task definition missing after fetch");
            return DispatchOutcome::FetchFailed;
        };

        let resolved = match resolve(definition, task.status(), &self.identities) {
            Ok(resolved) => resolved,
            Err(ResolveError::NotConfigured) => {
                tracing::debug!(task = %task, "Task has no notifications section");
                return DispatchOutcome::NotConfigured;
            }
            Err(e @ ResolveError::StatusNotConfigured(_)) => {
                tracing::info!(task = %task, reason = %e, "Skipping notification");
                return DispatchOutcome::StatusNotConfigured;
            }
            Err(e @ ResolveError::InvalidConfiguration { .. }) => {
                tracing::warn!(task = %task, reason = %e, "Skipping notification");
                return DispatchOutcome::InvalidConfiguration;
            }
        };

        self.notify_all(&task, &resolved).await
    }

    async fn notify_all(&self, task: &TaskData, resolved: &[ResolvedNotification]) -> DispatchOutcome {
        let mut invoked = 0;
        let mut failed = 0;

        for notification in resolved {
            let Some(plugins) = notification.config.plugins.as_deref() else {
                tracing::debug!(
                    task = %task,
                    identity = %notification.identity,
                    "No plugins section found"
                );
                continue;
            };

            for plugin_name in plugins {
                let Some(notifier) = self.notifiers.get(plugin_name) else {
                    tracing::warn!(
                        task = %task,
                        identity = %notification.identity,
                        plugin = %plugin_name,
                        "No plugin registered under this name"
                    );
                    continue;
                };

                let started = Instant::now();
                let result = AssertUnwindSafe(notifier.notify(task, &notification.config))
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => invoked += 1,
                    Ok(Err(e)) => {
                        failed += 1;
                        tracing::error!(
                            task = %task,
                            identity = %notification.identity,
                            plugin = %plugin_name,
                            error = %e,
                            "Plugin failed to notify"
                        );
                    }
                    Err(panic) => {
                        failed += 1;
                        tracing::error!(
                            task = %task,
                            identity = %notification.identity,
                            plugin = %plugin_name,
                            panic = %panic_message(panic.as_ref()),
                            "Plugin panicked while notifying"
                        );
                    }
                }

                tracing::debug!(
                    plugin = %plugin_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "notify call finished"
                );
            }
        }

        DispatchOutcome::Notified { invoked, failed }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::fetch::HttpResponse;
    use crate::plugin::{Notifier, NotifierError};
    use crate::queue::tests::{CannedHttp, client};
    use pulse_common::types::{Envelope, NotificationConfig};

    #[derive(Default)]
    struct CountingAcker {
        tags: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self, delivery_tag: u64) -> Result<(), AckError> {
            self.tags.lock().unwrap().push(delivery_tag);
            Ok(())
        }
    }

    struct FailingAcker;

    #[async_trait]
    impl Acknowledger for FailingAcker {
        async fn ack(&self, delivery_tag: u64) -> Result<(), AckError> {
            Err(AckError {
                delivery_tag,
                reason: "channel closed".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<NotificationConfig>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn name(&self) -> &str {
            "smtp"
        }

        async fn notify(&self, _: &TaskData, config: &NotificationConfig) -> Result<(), NotifierError> {
            self.seen.lock().unwrap().push(config.clone());
            Ok(())
        }
    }

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            envelope: Envelope {
                exchange: "exchange/taskcluster-queue/v1/task-completed".to_string(),
                routing_key: "primary.abc".to_string(),
                delivery_tag: 42,
                properties: serde_json::Value::Null,
            },
            body: body.to_vec(),
        }
    }

    fn status_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "status": {
                "taskId": "abc",
                "provisionerId": "scriptworker-prov-v1",
                "taskGroupId": "grp",
                "runs": [{"runId": 0}]
            }
        }))
        .unwrap()
    }

    fn dispatcher(http: Arc<CannedHttp>, recorder: Arc<Recorder>) -> Dispatcher {
        Dispatcher::new(
            client(http),
            Arc::new(IdentityRegistry::default()),
            NotifierRegistry::new().with(recorder),
        )
    }

    #[tokio::test]
    async fn test_parse_failure_is_acknowledged() {
        let http = Arc::new(CannedHttp::default());
        let recorder = Arc::new(Recorder::default());
        let acker = CountingAcker::default();

        let report = dispatcher(http.clone(), recorder)
            .dispatch(&delivery(b"{not json"), &acker)
            .await;

        assert_eq!(report.outcome, DispatchOutcome::ParseFailed);
        assert!(report.acknowledged);
        assert_eq!(*acker.tags.lock().unwrap(), vec![42]);
        assert!(http.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_configured_task_notifies_default_identity() {
        let http = Arc::new(CannedHttp::default());
        http.respond(
            "https://queue.test/v1/task/abc",
            Ok(HttpResponse::new(
                200,
                serde_json::to_vec(&json!({
                    "metadata": {"name": "build"},
                    "extra": {"notifications": {"task-completed": {
                        "message": "hi", "subject": "done", "plugins": ["smtp"], "ids": []
                    }}}
                }))
                .unwrap(),
            )),
        );
        let recorder = Arc::new(Recorder::default());
        let acker = CountingAcker::default();

        let report = dispatcher(http, recorder.clone())
            .dispatch(&delivery(&status_body()), &acker)
            .await;

        assert_eq!(report.outcome, DispatchOutcome::Notified { invoked: 1, failed: 0 });
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message.as_deref(), Some("hi"));
        assert_eq!(seen[0].subject.as_deref(), Some("done"));
        assert!(seen[0].ids.is_none());
        assert_eq!(acker.tags.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ack_failure_is_reported() {
        let http = Arc::new(CannedHttp::default());
        let report = dispatcher(http, Arc::new(Recorder::default()))
            .dispatch(&delivery(b"[]"), &FailingAcker)
            .await;

        assert_eq!(report.outcome, DispatchOutcome::ParseFailed);
        assert!(!report.acknowledged);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
