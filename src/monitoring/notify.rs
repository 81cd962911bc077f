use super::alerts::{Alert, AlertSeverity};
use crate::error::{MonitorError, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Delivery target for newly created alerts.
///
/// Called synchronously while an alert is being raised; implementations that
/// do I/O should hand the work off rather than block. Errors and panics are
/// contained by the caller and never reach the monitored operation.
pub trait AlertNotifier: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical => error!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "CRITICAL ALERT: {} - {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::High => warn!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "HIGH ALERT: {} - {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::Medium | AlertSeverity::Low => info!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "{} ALERT: {} - {}",
                alert.severity,
                alert.title,
                alert.message
            ),
        }
        Ok(())
    }
}

/// Forwards alerts into a tokio channel for in-process consumers.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Alert>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AlertNotifier for ChannelNotifier {
    fn name(&self) -> &str {
        "channel"
    }

    fn notify(&self, alert: &Alert) -> Result<()> {
        self.sender
            .send(alert.clone())
            .map_err(|_| MonitorError::Notification {
                notifier: self.name().to_string(),
                message: "receiver dropped".to_string(),
            })
    }
}

/// POSTs alerts as JSON to a webhook. Delivery runs on the current tokio
/// runtime so raising an alert never waits on the network.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    min_severity: AlertSeverity,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, min_severity: AlertSeverity) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MonitorError::Notification {
                notifier: "webhook".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            url: url.into(),
            min_severity,
            client,
        })
    }
}

impl AlertNotifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify(&self, alert: &Alert) -> Result<()> {
        if alert.severity < self.min_severity {
            return Ok(());
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| MonitorError::Notification {
                notifier: self.name().to_string(),
                message: e.to_string(),
            })?;

        let payload = serde_json::to_value(alert)?;
        let client = self.client.clone();
        let url = self.url.clone();
        let alert_id = alert.id;

        runtime.spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Webhook delivered alert {}", alert_id)
                }
                Ok(response) => warn!(
                    "Webhook returned {} for alert {}",
                    response.status(),
                    alert_id
                ),
                Err(e) => warn!("Webhook delivery failed for alert {}: {}", alert_id, e),
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{AlertContext, AlertType};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn sample_alert(severity: AlertSeverity) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            alert_type: AlertType::Deadlock,
            severity,
            title: "Database Deadlock Detected".to_string(),
            message: "1 deadlocks".to_string(),
            triggered_at: Utc::now(),
            resolved_at: None,
            cooldown_until: None,
            context: AlertContext {
                window_seconds: 300,
                value: 1.0,
                threshold: 1.0,
                ratio: 1.0,
                metadata: BTreeMap::new(),
            },
            resolution_note: None,
        }
    }

    #[test]
    fn test_channel_notifier_forwards() {
        let (notifier, mut receiver) = ChannelNotifier::new();
        let alert = sample_alert(AlertSeverity::High);
        notifier.notify(&alert).unwrap();
        assert_eq!(receiver.try_recv().unwrap().id, alert.id);
    }

    #[test]
    fn test_channel_notifier_errors_when_closed() {
        let (notifier, receiver) = ChannelNotifier::new();
        drop(receiver);
        assert!(notifier.notify(&sample_alert(AlertSeverity::Low)).is_err());
    }

    #[test]
    fn test_webhook_without_runtime_reports_error() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/alerts", AlertSeverity::Low).unwrap();
        let result = notifier.notify(&sample_alert(AlertSeverity::Critical));
        assert!(matches!(result, Err(MonitorError::Notification { .. })));
    }

    #[test]
    fn test_webhook_skips_low_severity() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/alerts", AlertSeverity::High).unwrap();
        assert!(notifier.notify(&sample_alert(AlertSeverity::Low)).is_ok());
    }
}
