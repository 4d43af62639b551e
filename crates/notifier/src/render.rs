//! Default subject and body text for notifications.

use pulse_common::types::NotificationConfig;
use pulse_engine::task_data::TaskData;

/// `Task {id} has achieved status {status}`
pub fn status_line(task: &TaskData) -> String {
    format!("Task {} has achieved status {}", task.id(), task.status())
}

pub fn subject(task: &TaskData, config: &NotificationConfig) -> String {
    config
        .subject
        .clone()
        .unwrap_or_else(|| format!("[pulse-notify] {}", status_line(task)))
}

/// The configured message (or the status line), followed by a link to the
/// task inspector.
pub fn body(task: &TaskData, config: &NotificationConfig) -> String {
    let message = config.message.clone().unwrap_or_else(|| status_line(task));
    format!("{}\n\nTask inspector: {}", message, task.inspector_url())
}

/// Short single-line text for chat back-ends.
pub fn short_message(task: &TaskData, config: &NotificationConfig) -> String {
    config.message.clone().unwrap_or_else(|| status_line(task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::task;

    #[test]
    fn test_defaults_use_status_line() {
        let task = task("task-failed");
        let config = NotificationConfig::default();

        assert_eq!(status_line(&task), "Task abc has achieved status task-failed");
        assert_eq!(
            subject(&task, &config),
            "[pulse-notify] Task abc has achieved status task-failed"
        );
        assert_eq!(
            body(&task, &config),
            "Task abc has achieved status task-failed\n\n\
             Task inspector: https://tools.taskcluster.net/task-inspector/#abc"
        );
    }

    #[test]
    fn test_configured_values_win() {
        let task = task("task-completed");
        let config = NotificationConfig {
            subject: Some("Beta signed".to_string()),
            message: Some("All good".to_string()),
            ..Default::default()
        };

        assert_eq!(subject(&task, &config), "Beta signed");
        assert!(body(&task, &config).starts_with("All good\n\n"));
        assert_eq!(short_message(&task, &config), "All good");
    }
}
