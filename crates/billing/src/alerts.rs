//! Operator alert channel
//!
//! Dead-lettered events and invariant violations are pushed here for manual
//! review. Delivery is best effort: a failed alert is logged and never
//! changes the outcome of the event that raised it.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorAlert {
    pub severity: AlertSeverity,
    pub title: String,
    pub detail: String,
    pub event_id: Option<String>,
    pub subscriber_id: Option<Uuid>,
}

impl OperatorAlert {
    /// An event moved to the dead-letter status
    pub fn rejected_event(event_id: &str, subscriber_id: Option<Uuid>, reason: &str) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            title: "Billing event rejected for manual review".to_string(),
            detail: reason.to_string(),
            event_id: Some(event_id.to_string()),
            subscriber_id,
        }
    }

    fn to_slack_text(&self) -> String {
        let icon = match self.severity {
            AlertSeverity::Warning => ":warning:",
            AlertSeverity::Critical => ":rotating_light:",
        };
        let mut text = format!("{} *{}*\n{}", icon, self.title, self.detail);
        if let Some(event_id) = &self.event_id {
            text.push_str(&format!("\nEvent: `{}`", event_id));
        }
        if let Some(subscriber_id) = &self.subscriber_id {
            text.push_str(&format!("\nSubscriber: `{}`", subscriber_id));
        }
        text
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &OperatorAlert) -> Result<(), AlertError>;
}

/// Writes alerts to the log only
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &OperatorAlert) -> Result<(), AlertError> {
        match alert.severity {
            AlertSeverity::Warning => tracing::warn!(
                event_id = ?alert.event_id,
                subscriber_id = ?alert.subscriber_id,
                detail = %alert.detail,
                "OPERATOR ALERT: {}",
                alert.title
            ),
            AlertSeverity::Critical => tracing::error!(
                event_id = ?alert.event_id,
                subscriber_id = ?alert.subscriber_id,
                detail = %alert.detail,
                "OPERATOR ALERT: {}",
                alert.title
            ),
        }
        Ok(())
    }
}

/// Posts alerts to a Slack incoming webhook
#[derive(Debug, Clone)]
pub struct SlackAlertSink {
    http: reqwest::Client,
    webhook_url: String,
}

impl SlackAlertSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for SlackAlertSink {
    async fn send(&self, alert: &OperatorAlert) -> Result<(), AlertError> {
        let body = serde_json::json!({ "text": alert.to_slack_text() });
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError::Delivery(format!(
                "Slack responded with {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Pick the configured sink
pub fn sink_from_config(slack_webhook_url: Option<&str>) -> std::sync::Arc<dyn AlertSink> {
    match slack_webhook_url {
        Some(url) => std::sync::Arc::new(SlackAlertSink::new(url)),
        None => std::sync::Arc::new(LogAlertSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slack_text_includes_references() {
        let subscriber_id = Uuid::new_v4();
        let alert = OperatorAlert::rejected_event(
            "evt_42",
            Some(subscriber_id),
            "unknown plan metadata 'Enterprise'",
        );
        let text = alert.to_slack_text();

        assert!(text.starts_with(":warning:"));
        assert!(text.contains("unknown plan metadata 'Enterprise'"));
        assert!(text.contains("`evt_42`"));
        assert!(text.contains(&subscriber_id.to_string()));
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        let alert = OperatorAlert::rejected_event("evt_1", None, "bad");
        assert!(LogAlertSink.send(&alert).await.is_ok());
    }
}
