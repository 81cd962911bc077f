use super::alerts::Alert;
use super::clock::{Clock, SystemClock};
use super::errors::{ErrorSummary, ErrorTracker};
use super::exporter::PrometheusExporter;
use super::instrumentation::{InstrumentedSession, Instrumentation};
use super::metrics::{MetricsCollector, MetricsSnapshot, PoolTrend, QueryPerformanceStats, SlowQueryReport};
use super::notify::{AlertNotifier, LogNotifier, WebhookNotifier};
use super::sampler::{PoolSampler, PoolSource};
use super::{AlertType, PoolSample};
use crate::config::MonitorConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub generated_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub errors: ErrorSummary,
    pub active_alerts: Vec<Alert>,
    pub recent_alerts: Vec<Alert>,
}

/// Wires the collector, tracker and instrumentation together around one
/// clock and one configuration.
#[derive(Debug, Clone)]
pub struct DatabaseMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    errors: Arc<ErrorTracker>,
    instrumentation: Instrumentation,
}

impl DatabaseMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(MetricsCollector::with_clock(
            config.collector_config(),
            clock.clone(),
        ));
        let errors = Arc::new(ErrorTracker::with_clock(
            config.tracker_config(),
            metrics.clone(),
            clock.clone(),
        ));
        let instrumentation = Instrumentation::new(metrics.clone(), errors.clone(), clock.clone());

        Self {
            config,
            clock,
            metrics,
            errors,
            instrumentation,
        }
    }

    /// Build a monitor and attach the notifiers named in the configuration.
    pub fn from_config(config: MonitorConfig) -> Result<Self> {
        let monitor = Self::new(config);
        if monitor.config.notifications.log {
            monitor.add_notifier(Arc::new(LogNotifier));
        }
        if let Some(url) = &monitor.config.notifications.webhook_url {
            monitor.add_notifier(Arc::new(WebhookNotifier::new(
                url.clone(),
                monitor.config.notifications.webhook_min_severity,
            )?));
        }
        Ok(monitor)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn session(&self, session_id: impl Into<String>) -> InstrumentedSession {
        self.instrumentation.session(session_id)
    }

    pub fn add_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        self.errors.add_notifier(notifier);
    }

    pub fn pool_sampler(&self, source: Arc<dyn PoolSource>) -> PoolSampler {
        PoolSampler::new(
            source,
            self.metrics.clone(),
            self.errors.clone(),
            self.clock.clone(),
            Duration::from_secs(self.config.sampler.interval_seconds),
        )
        .with_history_capacity(self.config.sampler.health_history_capacity)
        .with_metrics_reset(
            self.config
                .sampler
                .metrics_reset_seconds
                .map(Duration::from_secs),
        )
    }

    /// Record an externally taken pool sample and check for saturation.
    pub fn record_pool_sample(&self, sample: PoolSample) -> Option<Alert> {
        self.metrics.record_pool_sample(sample);
        self.errors.evaluate(AlertType::PoolSaturation)
    }

    pub fn get_query_performance_stats(&self, window: Duration) -> QueryPerformanceStats {
        self.metrics.get_query_performance_stats(window)
    }

    pub fn detect_slow_queries(&self, window: Duration, threshold: Duration) -> SlowQueryReport {
        self.metrics.detect_slow_queries(window, threshold)
    }

    pub fn get_pool_trend(&self, window: Duration) -> PoolTrend {
        self.metrics.get_pool_trend(window)
    }

    pub fn get_error_summary(&self, window: Duration) -> ErrorSummary {
        self.errors.get_error_summary(window)
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.errors.get_active_alerts()
    }

    pub fn get_alert_history(&self, limit: Option<usize>) -> Vec<Alert> {
        self.errors.get_alert_history(limit)
    }

    pub fn resolve_alert(&self, id: Uuid, note: Option<String>) -> Result<Alert> {
        self.errors.resolve_alert(id, note)
    }

    pub fn evaluate_alerts(&self) -> Vec<Alert> {
        self.errors.evaluate_all()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            generated_at: self.clock.now(),
            metrics: self.metrics.get_comprehensive_snapshot(),
            errors: self.errors.summary(),
            active_alerts: self.errors.get_active_alerts(),
            recent_alerts: self.errors.get_alert_history(Some(20)),
        }
    }

    pub fn export_prometheus(&self) -> Result<String> {
        PrometheusExporter::new()?.render(&self.metrics, &self.errors)
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn reset_errors(&self) {
        self.errors.reset();
        info!("Error tracking and alert state reset");
    }
}
