use super::alerts::AlertType;
use super::errors::ErrorTracker;
use super::metrics::MetricsCollector;
use crate::error::Result;
use prometheus::{Gauge, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

/// Renders collector state in the Prometheus text format. Values are
/// refreshed from the collectors on every render rather than maintained
/// incrementally.
pub struct PrometheusExporter {
    registry: Registry,
    queries_total: IntGaugeVec,
    query_failures_total: IntGaugeVec,
    query_duration_max_ms: GaugeVec,
    query_duration_quantile_ms: GaugeVec,
    errors_total: IntGaugeVec,
    pool_utilization: Gauge,
    pool_peak_utilization: Gauge,
    active_alerts: IntGaugeVec,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("querywatch".to_string()), None)?;

        let queries_total = IntGaugeVec::new(
            Opts::new("queries_total", "Queries recorded per signature"),
            &["kind", "target"],
        )?;
        let query_failures_total = IntGaugeVec::new(
            Opts::new("query_failures_total", "Failed queries per signature"),
            &["kind", "target"],
        )?;
        let query_duration_max_ms = GaugeVec::new(
            Opts::new("query_duration_max_ms", "Slowest query per signature"),
            &["kind", "target"],
        )?;
        let query_duration_quantile_ms = GaugeVec::new(
            Opts::new(
                "query_duration_ms",
                "Query duration quantiles over the report window",
            ),
            &["quantile"],
        )?;
        let errors_total = IntGaugeVec::new(
            Opts::new("errors_total", "Database errors recorded per kind"),
            &["kind"],
        )?;
        let pool_utilization = Gauge::with_opts(Opts::new(
            "pool_utilization",
            "Most recent connection pool utilization",
        ))?;
        let pool_peak_utilization = Gauge::with_opts(Opts::new(
            "pool_peak_utilization",
            "Peak connection pool utilization over the report window",
        ))?;
        let active_alerts = IntGaugeVec::new(
            Opts::new("active_alerts", "Active alerts per type"),
            &["alert_type", "severity"],
        )?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(query_failures_total.clone()))?;
        registry.register(Box::new(query_duration_max_ms.clone()))?;
        registry.register(Box::new(query_duration_quantile_ms.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(pool_utilization.clone()))?;
        registry.register(Box::new(pool_peak_utilization.clone()))?;
        registry.register(Box::new(active_alerts.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            query_failures_total,
            query_duration_max_ms,
            query_duration_quantile_ms,
            errors_total,
            pool_utilization,
            pool_peak_utilization,
            active_alerts,
        })
    }

    fn refresh(&self, metrics: &MetricsCollector, errors: &ErrorTracker) {
        self.queries_total.reset();
        self.query_failures_total.reset();
        self.query_duration_max_ms.reset();
        self.errors_total.reset();
        self.active_alerts.reset();

        for aggregate in metrics.signature_aggregates() {
            let kind = aggregate.signature.kind.as_str();
            let target = aggregate.signature.target_label();
            let labels = [kind, target];
            self.queries_total
                .with_label_values(&labels)
                .set(aggregate.count as i64);
            self.query_failures_total
                .with_label_values(&labels)
                .set(aggregate.failure_count() as i64);
            self.query_duration_max_ms
                .with_label_values(&labels)
                .set(aggregate.max_duration.as_nanos() as f64 / 1_000_000.0);
        }

        let window = metrics.config().report_window();
        let stats = metrics.get_query_performance_stats(window);
        for (quantile, value) in [
            ("0.5", stats.durations.median_ms),
            ("0.95", stats.durations.p95_ms),
            ("0.99", stats.durations.p99_ms),
        ] {
            self.query_duration_quantile_ms
                .with_label_values(&[quantile])
                .set(value);
        }

        for (kind, count) in errors.error_counts_by_kind() {
            self.errors_total
                .with_label_values(&[kind.as_str()])
                .set(count as i64);
        }

        self.pool_utilization.set(
            metrics
                .latest_pool_sample()
                .map(|s| s.utilization)
                .unwrap_or(0.0),
        );
        self.pool_peak_utilization
            .set(metrics.peak_pool_utilization(window).unwrap_or(0.0));

        let mut by_type: BTreeMap<(AlertType, String), i64> = BTreeMap::new();
        for alert in errors.get_active_alerts() {
            *by_type
                .entry((alert.alert_type, alert.severity.to_string()))
                .or_insert(0) += 1;
        }
        for ((alert_type, severity), count) in by_type {
            self.active_alerts
                .with_label_values(&[alert_type.as_str(), severity.as_str()])
                .set(count);
        }
    }

    pub fn render(&self, metrics: &MetricsCollector, errors: &ErrorTracker) -> Result<String> {
        self.refresh(metrics, errors);
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}
