use crate::monitoring::{AlertSeverity, AlertThresholds, AlertType, CollectorConfig, ErrorTrackerConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// PostgreSQL URL for the `ping` command; the library itself never connects
    pub database_url: Option<String>,

    /// Ring buffer capacities
    pub history: HistoryConfig,

    /// Queries slower than this are reported as slow
    pub slow_query_threshold_ms: u64,

    /// Window used by snapshots and the Prometheus export
    pub report_window_seconds: u64,

    /// Pool utilization above this is logged as high
    pub high_pool_utilization: f64,

    pub sampler: SamplerConfig,

    pub alerts: AlertThresholds,

    pub notifications: NotificationConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub query_capacity: usize,
    pub pool_capacity: usize,
    pub error_capacity: usize,
    pub alert_capacity: usize,
    /// Query signatures with running totals
    pub signature_capacity: usize,
    /// Operations with a tracked failure streak
    pub operation_capacity: usize,
    /// Closed connections kept for inspection
    pub connection_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Health checks kept by the sampler
    pub health_history_capacity: usize,
    /// Reset query and pool metrics on this period; unset disables it
    pub metrics_reset_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Write alerts to the log
    pub log: bool,
    pub webhook_url: Option<String>,
    pub webhook_min_severity: AlertSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            history: HistoryConfig::default(),
            slow_query_threshold_ms: 1000,
            report_window_seconds: 3600,
            high_pool_utilization: 0.8,
            sampler: SamplerConfig::default(),
            alerts: AlertThresholds::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            query_capacity: 1000,
            pool_capacity: 288, // 24h of 5-minute samples
            error_capacity: 1000,
            alert_capacity: 500,
            signature_capacity: 1000,
            operation_capacity: 1000,
            connection_capacity: 1000,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            health_history_capacity: 100,
            metrics_reset_seconds: None,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url: None,
            webhook_min_severity: AlertSeverity::High,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}

impl MonitorConfig {
    /// Parse TOML. Alert rules listed in the file replace the default rule
    /// for their type; other defaults are kept.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: MonitorConfig =
            toml::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid configuration file: {e}"))?;
        let overrides = std::mem::take(&mut config.alerts.rules);
        config.alerts = AlertThresholds {
            rules: AlertThresholds::with_overrides(overrides).rules,
            ..config.alerts
        };
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
        Self::from_toml_str(&raw)
    }

    /// Load configuration from `QUERYWATCH_CONFIG` (if set) and environment
    /// overrides
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let mut config = match env::var("QUERYWATCH_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(url) = env::var("QUERYWATCH_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
            config.database_url = Some(url);
        }

        // History buffers
        if let Some(n) = parse_env("QUERYWATCH_QUERY_HISTORY")? {
            config.history.query_capacity = n;
        }
        if let Some(n) = parse_env("QUERYWATCH_POOL_HISTORY")? {
            config.history.pool_capacity = n;
        }
        if let Some(n) = parse_env("QUERYWATCH_ERROR_HISTORY")? {
            config.history.error_capacity = n;
        }
        if let Some(n) = parse_env("QUERYWATCH_ALERT_HISTORY")? {
            config.history.alert_capacity = n;
        }
        if let Some(n) = parse_env("QUERYWATCH_SIGNATURE_LIMIT")? {
            config.history.signature_capacity = n;
        }
        if let Some(n) = parse_env("QUERYWATCH_OPERATION_LIMIT")? {
            config.history.operation_capacity = n;
        }
        if let Some(n) = parse_env("QUERYWATCH_CONNECTION_HISTORY")? {
            config.history.connection_capacity = n;
        }

        if let Some(ms) = parse_env("QUERYWATCH_SLOW_QUERY_MS")? {
            config.slow_query_threshold_ms = ms;
        }
        if let Some(secs) = parse_env("QUERYWATCH_REPORT_WINDOW_SECONDS")? {
            config.report_window_seconds = secs;
        }
        if let Some(ratio) = parse_env("QUERYWATCH_HIGH_POOL_UTILIZATION")? {
            config.high_pool_utilization = ratio;
        }

        // Sampler
        if let Some(enabled) = parse_env("QUERYWATCH_SAMPLER_ENABLED")? {
            config.sampler.enabled = enabled;
        }
        if let Some(secs) = parse_env("QUERYWATCH_SAMPLE_INTERVAL_SECONDS")? {
            config.sampler.interval_seconds = secs;
        }
        if let Some(n) = parse_env("QUERYWATCH_HEALTH_HISTORY")? {
            config.sampler.health_history_capacity = n;
        }
        if let Some(secs) = parse_env("QUERYWATCH_METRICS_RESET_SECONDS")? {
            config.sampler.metrics_reset_seconds = Some(secs);
        }

        // Alerting
        if let Some(rate) = parse_env::<f64>("QUERYWATCH_ERROR_RATE_THRESHOLD")? {
            if let Some(window) = config
                .alerts
                .rule_mut(AlertType::HighErrorRate)
                .and_then(|rule| rule.windows.first_mut())
            {
                window.threshold = rate;
            }
        }
        if let Some(n) = parse_env("QUERYWATCH_MIN_OPERATIONS")? {
            config.alerts.min_operations_for_rate = n;
        }
        if let Ok(url) = env::var("QUERYWATCH_WEBHOOK_URL") {
            config.notifications.webhook_url = Some(url);
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = parse_env("QUERYWATCH_LOG_JSON")? {
            config.logging.json = json;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let history = &self.history;
        if history.query_capacity == 0
            || history.pool_capacity == 0
            || history.error_capacity == 0
            || history.alert_capacity == 0
            || history.signature_capacity == 0
            || history.operation_capacity == 0
            || history.connection_capacity == 0
            || self.sampler.health_history_capacity == 0
        {
            return Err(anyhow::anyhow!("History capacities must be greater than 0"));
        }

        if self.slow_query_threshold_ms == 0 {
            return Err(anyhow::anyhow!("Slow query threshold must be greater than 0"));
        }

        if self.report_window_seconds == 0 {
            return Err(anyhow::anyhow!("Report window must be greater than 0"));
        }

        if !(self.high_pool_utilization > 0.0 && self.high_pool_utilization <= 1.0) {
            return Err(anyhow::anyhow!(
                "High pool utilization must be between 0.0 and 1.0"
            ));
        }

        if self.sampler.enabled && self.sampler.interval_seconds == 0 {
            return Err(anyhow::anyhow!("Sampler interval must be greater than 0"));
        }

        if self.sampler.metrics_reset_seconds == Some(0) {
            return Err(anyhow::anyhow!("Metrics reset period must be greater than 0"));
        }

        if let Some(url) = &self.notifications.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!("Webhook URL must be http(s): {}", url));
            }
        }

        self.alerts.validate()?;
        Ok(())
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            query_capacity: self.history.query_capacity,
            pool_capacity: self.history.pool_capacity,
            slow_query_threshold_ms: self.slow_query_threshold_ms,
            report_window_seconds: self.report_window_seconds,
            high_utilization_threshold: self.high_pool_utilization,
            signature_capacity: self.history.signature_capacity,
            connection_capacity: self.history.connection_capacity,
        }
    }

    pub fn tracker_config(&self) -> ErrorTrackerConfig {
        ErrorTrackerConfig {
            error_capacity: self.history.error_capacity,
            alert_capacity: self.history.alert_capacity,
            summary_window_seconds: self.report_window_seconds,
            operation_capacity: self.history.operation_capacity,
            thresholds: self.alerts.clone(),
            ..ErrorTrackerConfig::default()
        }
    }

    /// Generate a safe connection string for logging (masks password)
    pub fn safe_database_url(&self) -> Option<String> {
        let raw = self.database_url.as_ref()?;
        match url::Url::parse(raw) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                Some(parsed.to_string())
            }
            Err(_) => Some("[unparseable database url]".to_string()),
        }
    }

    pub fn create_diagnostic_report(&self) -> String {
        let mut report = String::new();
        report.push_str("=== querywatch Configuration Report ===\n\n");

        report.push_str("Database:\n");
        report.push_str(&format!(
            "  Connection: {}\n",
            self.safe_database_url()
                .unwrap_or_else(|| "Not set".to_string())
        ));

        report.push_str("\nHistory:\n");
        report.push_str(&format!("  Queries: {}\n", self.history.query_capacity));
        report.push_str(&format!("  Pool samples: {}\n", self.history.pool_capacity));
        report.push_str(&format!("  Errors: {}\n", self.history.error_capacity));
        report.push_str(&format!("  Alerts: {}\n", self.history.alert_capacity));
        report.push_str(&format!("  Signatures: {}\n", self.history.signature_capacity));
        report.push_str(&format!("  Operation streaks: {}\n", self.history.operation_capacity));
        report.push_str(&format!("  Closed connections: {}\n", self.history.connection_capacity));

        report.push_str("\nMetrics:\n");
        report.push_str(&format!(
            "  Slow query threshold: {}ms\n",
            self.slow_query_threshold_ms
        ));
        report.push_str(&format!("  Report window: {}s\n", self.report_window_seconds));
        report.push_str(&format!(
            "  High pool utilization: {:.0}%\n",
            self.high_pool_utilization * 100.0
        ));
        report.push_str(&format!(
            "  Pool sampler: {}\n",
            if self.sampler.enabled {
                format!("every {}s", self.sampler.interval_seconds)
            } else {
                "disabled".to_string()
            }
        ));
        report.push_str(&format!(
            "  Health history: {}\n",
            self.sampler.health_history_capacity
        ));
        report.push_str(&format!(
            "  Metrics reset: {}\n",
            self.sampler
                .metrics_reset_seconds
                .map(|secs| format!("every {secs}s"))
                .unwrap_or_else(|| "never".to_string())
        ));

        report.push_str("\nAlert Rules:\n");
        for rule in &self.alerts.rules {
            let windows: Vec<String> = rule
                .windows
                .iter()
                .map(|w| format!("{}@{}s", w.threshold, w.window_seconds))
                .collect();
            report.push_str(&format!(
                "  {}: {} [{}] cooldown {}s base {}\n",
                rule.alert_type,
                if rule.enabled { "enabled" } else { "disabled" },
                windows.join(", "),
                rule.cooldown_seconds,
                rule.base_severity
            ));
        }
        report.push_str(&format!(
            "  Minimum operations for error rate: {}\n",
            self.alerts.min_operations_for_rate
        ));

        report.push_str("\nNotifications:\n");
        report.push_str(&format!("  Log: {}\n", self.notifications.log));
        report.push_str(&format!(
            "  Webhook: {}\n",
            self.notifications
                .webhook_url
                .as_deref()
                .unwrap_or("Not set")
        ));

        report.push_str("\nValidation Results:\n");
        match self.validate() {
            Ok(_) => report.push_str("  ✅ All configuration checks passed\n"),
            Err(e) => report.push_str(&format!("  ❌ Configuration error: {e}\n")),
        }

        report.push_str("\n=== End Configuration Report ===\n");
        report
    }
}
