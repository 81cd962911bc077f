use super::alerts::{Alert, AlertEngine, AlertThresholds, AlertType, WindowObservation};
use super::clock::{window_start, Clock, SystemClock};
use super::metrics::MetricsCollector;
use super::notify::AlertNotifier;
use super::ring_buffer::RingBuffer;
use super::{read_lock, write_lock, DatabaseError, ErrorKind};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const RECENT_ERROR_LIMIT: usize = 10;
const MESSAGE_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTrackerConfig {
    pub error_capacity: usize,
    pub alert_capacity: usize,
    pub summary_window_seconds: u64,
    pub top_patterns: usize,
    /// Operations with a tracked failure streak; the shortest streak is
    /// dropped beyond this
    pub operation_capacity: usize,
    pub thresholds: AlertThresholds,
}

impl Default for ErrorTrackerConfig {
    fn default() -> Self {
        Self {
            error_capacity: 1000,
            alert_capacity: 500,
            summary_window_seconds: 3600,
            top_patterns: 10,
            operation_capacity: 1000,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Repeated failures of one operation with one error kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub operation_name: String,
    pub kind: ErrorKind,
    pub count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDigest {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub operation_name: String,
    pub message: String,
}

impl From<&DatabaseError> for ErrorDigest {
    fn from(error: &DatabaseError) -> Self {
        Self {
            id: error.id,
            timestamp: error.timestamp,
            kind: error.kind,
            operation_name: error.operation_name.clone(),
            message: error.message.chars().take(MESSAGE_PREVIEW_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub window_seconds: u64,
    pub total_errors: usize,
    pub successful_operations: u64,
    pub error_rate: f64,
    pub errors_per_minute: f64,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub lifetime_by_kind: BTreeMap<ErrorKind, u64>,
    pub top_patterns: Vec<ErrorPattern>,
    pub recent_errors: Vec<ErrorDigest>,
    pub consecutive_failures: BTreeMap<String, u32>,
    /// Successful operations that exceeded the slow-query threshold. Not
    /// part of `total_errors` or `error_rate`.
    pub slow_operations: usize,
    pub active_alerts: usize,
}

#[derive(Debug, Default)]
struct ErrorCounters {
    by_kind: HashMap<ErrorKind, u64>,
    consecutive: HashMap<String, u32>,
}

/// Keeps a bounded history of classified failures and turns the rates and
/// counts derived from it into alerts.
#[derive(Debug)]
pub struct ErrorTracker {
    config: ErrorTrackerConfig,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    errors: RwLock<RingBuffer<DatabaseError>>,
    slow_operations: RwLock<RingBuffer<DatabaseError>>,
    counters: RwLock<ErrorCounters>,
    engine: AlertEngine,
}

impl ErrorTracker {
    pub fn new(config: ErrorTrackerConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self::with_clock(config, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ErrorTrackerConfig,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            errors: RwLock::new(RingBuffer::new(config.error_capacity)),
            slow_operations: RwLock::new(RingBuffer::new(config.error_capacity)),
            counters: RwLock::new(ErrorCounters::default()),
            engine: AlertEngine::new(config.thresholds.clone(), config.alert_capacity),
            config,
            metrics,
            clock,
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        self.engine.thresholds()
    }

    pub fn add_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        self.engine.add_notifier(notifier);
    }

    /// Store a failure and evaluate every rule it can affect. Returns the
    /// alerts created as a result.
    pub fn record_error(&self, error: DatabaseError) -> Vec<Alert> {
        match error.kind {
            ErrorKind::ConnectionFailure | ErrorKind::PoolExhaustion | ErrorKind::Deadlock => error!(
                "Database {} in {}: {}",
                error.kind, error.operation_name, error.message
            ),
            _ => warn!(
                "Database {} in {}: {}",
                error.kind, error.operation_name, error.message
            ),
        }

        let kind = error.kind;
        let operation = error.operation_name.clone();
        let consecutive = {
            let mut counters = write_lock(&self.counters);
            *counters.by_kind.entry(kind).or_insert(0) += 1;
            if !counters.consecutive.contains_key(&operation)
                && counters.consecutive.len() >= self.config.operation_capacity.max(1)
            {
                let shortest = counters
                    .consecutive
                    .iter()
                    .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
                    .map(|(op, _)| op.clone());
                if let Some(op) = shortest {
                    debug!("Dropping failure streak of {}", op);
                    counters.consecutive.remove(&op);
                }
            }
            let streak = counters.consecutive.entry(operation.clone()).or_insert(0);
            *streak = streak.saturating_add(1);
            *streak
        };
        write_lock(&self.errors).push(error);

        let mut raised = Vec::new();
        raised.extend(self.evaluate(AlertType::HighErrorRate));
        raised.extend(self.evaluate_consecutive(&operation, consecutive));
        if let Some(alert_type) = alert_type_for(kind) {
            raised.extend(self.evaluate(alert_type));
        }
        raised
    }

    /// Store a successful operation that ran past the slow-query threshold
    /// and evaluate the slow query rule. It does not count toward the error
    /// rate and leaves failure streaks alone.
    pub fn record_performance_issue(&self, issue: DatabaseError) -> Option<Alert> {
        warn!("Performance issue in {}: {}", issue.operation_name, issue.message);
        *write_lock(&self.counters)
            .by_kind
            .entry(ErrorKind::SlowQuery)
            .or_insert(0) += 1;
        write_lock(&self.slow_operations).push(issue);
        self.evaluate(AlertType::SlowQueries)
    }

    /// A success ends the failure streak of its operation.
    pub fn record_success(&self, operation_name: &str) {
        if write_lock(&self.counters)
            .consecutive
            .remove(operation_name)
            .is_some()
        {
            debug!("Failure streak cleared for {}", operation_name);
        }
    }

    fn evaluate_consecutive(&self, operation: &str, streak: u32) -> Option<Alert> {
        let rule = self.thresholds().rule(AlertType::ConsecutiveFailures)?;
        let observations: Vec<WindowObservation> = rule
            .windows
            .iter()
            .map(|window| WindowObservation {
                window: *window,
                value: streak as f64,
            })
            .collect();

        let metadata = BTreeMap::from([("operation".to_string(), operation.to_string())]);
        self.engine.evaluate(
            AlertType::ConsecutiveFailures,
            &observations,
            metadata,
            self.clock.now(),
        )
    }

    /// Evaluate one rule against current state.
    pub fn evaluate(&self, alert_type: AlertType) -> Option<Alert> {
        if alert_type == AlertType::ConsecutiveFailures {
            let worst = read_lock(&self.counters)
                .consecutive
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(op, streak)| (op.clone(), *streak));
            return worst.and_then(|(op, streak)| self.evaluate_consecutive(&op, streak));
        }

        let rule = self.thresholds().rule(alert_type)?;
        let mut metadata = BTreeMap::new();
        let observations: Vec<WindowObservation> = rule
            .windows
            .iter()
            .filter_map(|window| {
                let value = self.observe(alert_type, window.window(), &mut metadata)?;
                Some(WindowObservation {
                    window: *window,
                    value,
                })
            })
            .collect();

        self.engine
            .evaluate(alert_type, &observations, metadata, self.clock.now())
    }

    pub fn evaluate_all(&self) -> Vec<Alert> {
        AlertType::ALL
            .iter()
            .filter_map(|alert_type| self.evaluate(*alert_type))
            .collect()
    }

    /// Current value of the metric an alert type watches, or `None` when
    /// there is not enough data to judge.
    fn observe(
        &self,
        alert_type: AlertType,
        window: Duration,
        metadata: &mut BTreeMap<String, String>,
    ) -> Option<f64> {
        match alert_type {
            AlertType::HighErrorRate => {
                let errors = self.errors_in_window(window);
                let successes = self.metrics.count_outcomes(window).successes;
                let total = errors as u64 + successes;
                if total == 0 || total < self.thresholds().min_operations_for_rate {
                    return None;
                }
                metadata
                    .entry(format!("errors_{}s", window.as_secs()))
                    .or_insert_with(|| errors.to_string());
                metadata
                    .entry(format!("operations_{}s", window.as_secs()))
                    .or_insert_with(|| total.to_string());
                Some(errors as f64 / total as f64)
            }
            AlertType::PoolSaturation => self.metrics.peak_pool_utilization(window),
            AlertType::SlowQueries => Some(self.metrics.slow_query_count(window) as f64),
            AlertType::ConnectionFailure => {
                Some(self.errors_of_kind(ErrorKind::ConnectionFailure, window) as f64)
            }
            AlertType::PoolExhaustion => {
                Some(self.errors_of_kind(ErrorKind::PoolExhaustion, window) as f64)
            }
            AlertType::Deadlock => Some(self.errors_of_kind(ErrorKind::Deadlock, window) as f64),
            AlertType::QueryTimeout => Some(self.errors_of_kind(ErrorKind::Timeout, window) as f64),
            AlertType::ConsecutiveFailures => None,
        }
    }

    fn errors_in_window(&self, window: Duration) -> usize {
        let cutoff = window_start(self.clock.now(), window);
        read_lock(&self.errors)
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .count()
    }

    fn errors_of_kind(&self, kind: ErrorKind, window: Duration) -> usize {
        let cutoff = window_start(self.clock.now(), window);
        read_lock(&self.errors)
            .iter()
            .filter(|e| e.kind == kind && e.timestamp >= cutoff)
            .count()
    }

    /// Lifetime error counts by kind. Not affected by history eviction.
    pub fn error_counts_by_kind(&self) -> BTreeMap<ErrorKind, u64> {
        read_lock(&self.counters)
            .by_kind
            .iter()
            .map(|(kind, count)| (*kind, *count))
            .collect()
    }

    pub fn consecutive_failures(&self, operation_name: &str) -> u32 {
        read_lock(&self.counters)
            .consecutive
            .get(operation_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn get_error_summary(&self, window: Duration) -> ErrorSummary {
        let cutoff = window_start(self.clock.now(), window);
        let in_window: Vec<DatabaseError> = read_lock(&self.errors)
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect();

        let mut by_kind: BTreeMap<ErrorKind, usize> = BTreeMap::new();
        let mut patterns: HashMap<(String, ErrorKind), ErrorPattern> = HashMap::new();
        for error in &in_window {
            *by_kind.entry(error.kind).or_insert(0) += 1;
            patterns
                .entry((error.operation_name.clone(), error.kind))
                .and_modify(|p| {
                    p.count += 1;
                    p.first_seen = p.first_seen.min(error.timestamp);
                    p.last_seen = p.last_seen.max(error.timestamp);
                })
                .or_insert_with(|| ErrorPattern {
                    operation_name: error.operation_name.clone(),
                    kind: error.kind,
                    count: 1,
                    first_seen: error.timestamp,
                    last_seen: error.timestamp,
                    sample_message: error.message.chars().take(MESSAGE_PREVIEW_CHARS).collect(),
                });
        }

        let mut top_patterns: Vec<ErrorPattern> = patterns.into_values().collect();
        top_patterns.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        top_patterns.truncate(self.config.top_patterns);

        let total_errors = in_window.len();
        let successful_operations = self.metrics.count_outcomes(window).successes;
        let total = total_errors as u64 + successful_operations;
        let minutes = window.as_secs_f64() / 60.0;

        let (lifetime_by_kind, consecutive_failures) = {
            let counters = read_lock(&self.counters);
            (
                counters
                    .by_kind
                    .iter()
                    .map(|(kind, count)| (*kind, *count))
                    .collect(),
                counters
                    .consecutive
                    .iter()
                    .map(|(op, streak)| (op.clone(), *streak))
                    .collect(),
            )
        };

        ErrorSummary {
            window_seconds: window.as_secs(),
            total_errors,
            successful_operations,
            error_rate: if total > 0 {
                total_errors as f64 / total as f64
            } else {
                0.0
            },
            errors_per_minute: if minutes > 0.0 {
                total_errors as f64 / minutes
            } else {
                0.0
            },
            by_kind,
            lifetime_by_kind,
            top_patterns,
            recent_errors: in_window
                .iter()
                .rev()
                .take(RECENT_ERROR_LIMIT)
                .map(ErrorDigest::from)
                .collect(),
            consecutive_failures,
            slow_operations: read_lock(&self.slow_operations)
                .iter()
                .filter(|e| e.timestamp >= cutoff)
                .count(),
            active_alerts: self.engine.active_count(),
        }
    }

    /// Summary over the configured default window.
    pub fn summary(&self) -> ErrorSummary {
        self.get_error_summary(Duration::from_secs(self.config.summary_window_seconds))
    }

    /// Slow successful operations, newest first.
    pub fn recent_slow_operations(&self, limit: usize) -> Vec<DatabaseError> {
        read_lock(&self.slow_operations)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<DatabaseError> {
        read_lock(&self.errors)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn resolve_alert(&self, id: Uuid, note: Option<String>) -> Result<Alert> {
        self.engine.resolve(id, note, self.clock.now())
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.engine.active_alerts()
    }

    pub fn get_alert_history(&self, limit: Option<usize>) -> Vec<Alert> {
        self.engine.history(limit)
    }

    /// Clear errors, streaks and alerts. Thresholds and notifiers are kept.
    pub fn reset(&self) {
        write_lock(&self.errors).clear();
        write_lock(&self.slow_operations).clear();
        *write_lock(&self.counters) = ErrorCounters::default();
        self.engine.reset();
    }
}

fn alert_type_for(kind: ErrorKind) -> Option<AlertType> {
    match kind {
        ErrorKind::ConnectionFailure => Some(AlertType::ConnectionFailure),
        ErrorKind::PoolExhaustion => Some(AlertType::PoolExhaustion),
        ErrorKind::Deadlock => Some(AlertType::Deadlock),
        ErrorKind::Timeout => Some(AlertType::QueryTimeout),
        ErrorKind::SlowQuery | ErrorKind::Cancelled | ErrorKind::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{
        AlertSeverity, CollectorConfig, ManualClock, OperationKind, Outcome, QueryMetric,
        QuerySignature,
    };
    use approx::assert_relative_eq;

    fn tracker() -> (ErrorTracker, Arc<MetricsCollector>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(MetricsCollector::with_clock(
            CollectorConfig::default(),
            clock.clone(),
        ));
        let tracker =
            ErrorTracker::with_clock(ErrorTrackerConfig::default(), metrics.clone(), clock.clone());
        (tracker, metrics, clock)
    }

    fn failure(clock: &ManualClock, op: &str, message: &str) -> DatabaseError {
        DatabaseError::classified(clock.now(), op, message)
    }

    #[test]
    fn test_consecutive_failures_alert_at_threshold() {
        let (tracker, _, clock) = tracker();

        for _ in 0..4 {
            let raised = tracker.record_error(failure(&clock, "save_order", "syntax error"));
            assert!(raised
                .iter()
                .all(|a| a.alert_type != AlertType::ConsecutiveFailures));
        }
        let raised = tracker.record_error(failure(&clock, "save_order", "syntax error"));
        let alert = raised
            .iter()
            .find(|a| a.alert_type == AlertType::ConsecutiveFailures)
            .expect("streak of five should alert");
        assert_eq!(alert.severity, AlertSeverity::High);
        assert_eq!(
            alert.context.metadata.get("operation").map(String::as_str),
            Some("save_order")
        );
        assert_eq!(tracker.consecutive_failures("save_order"), 5);
    }

    #[test]
    fn test_success_resets_streak() {
        let (tracker, _, clock) = tracker();
        for _ in 0..4 {
            tracker.record_error(failure(&clock, "load_menu", "boom"));
        }
        tracker.record_success("load_menu");
        assert_eq!(tracker.consecutive_failures("load_menu"), 0);

        for _ in 0..4 {
            tracker.record_error(failure(&clock, "load_menu", "boom"));
        }
        assert!(tracker
            .get_active_alerts()
            .iter()
            .all(|a| a.alert_type != AlertType::ConsecutiveFailures));
    }

    #[test]
    fn test_deadlock_raises_kind_alert() {
        let (tracker, _, clock) = tracker();
        let raised = tracker.record_error(failure(
            &clock,
            "transfer",
            "ERROR: deadlock detected",
        ));
        assert!(raised.iter().any(|a| a.alert_type == AlertType::Deadlock));
        assert_eq!(
            tracker.error_counts_by_kind().get(&ErrorKind::Deadlock),
            Some(&1)
        );
    }

    #[test]
    fn test_error_rate_needs_minimum_operations() {
        let (tracker, _, clock) = tracker();
        for i in 0..3 {
            tracker.record_error(failure(&clock, &format!("op{i}"), "boom"));
        }
        assert!(tracker.evaluate(AlertType::HighErrorRate).is_none());
    }

    #[test]
    fn test_summary_counts_and_truncates() {
        let (tracker, metrics, clock) = tracker();
        let signature = QuerySignature::new(OperationKind::Select, Some("users".to_string()));
        for _ in 0..6 {
            metrics.record_query(QueryMetric::new(
                clock.now(),
                signature.clone(),
                Duration::from_millis(3),
                Outcome::Success,
            ));
        }

        let long_message = "x".repeat(500);
        for _ in 0..12 {
            tracker.record_error(failure(&clock, "load_users", &long_message));
        }
        tracker.record_error(failure(&clock, "transfer", "deadlock detected"));

        let summary = tracker.get_error_summary(Duration::from_secs(3600));
        assert_eq!(summary.total_errors, 13);
        assert_eq!(summary.successful_operations, 6);
        assert_eq!(summary.recent_errors.len(), 10);
        assert_eq!(summary.recent_errors[0].operation_name, "transfer");
        assert!(summary
            .recent_errors
            .iter()
            .all(|e| e.message.chars().count() <= 200));
        assert_eq!(summary.top_patterns[0].operation_name, "load_users");
        assert_eq!(summary.top_patterns[0].count, 12);
        assert_eq!(summary.by_kind.get(&ErrorKind::Unknown), Some(&12));
        assert_eq!(summary.consecutive_failures.get("load_users"), Some(&12));
    }

    #[test]
    fn test_performance_issue_is_not_an_error() {
        let (tracker, metrics, clock) = tracker();
        let signature = QuerySignature::new(OperationKind::Select, Some("reports".to_string()));
        for _ in 0..19 {
            metrics.record_query(QueryMetric::new(
                clock.now(),
                signature.clone(),
                Duration::from_millis(3),
                Outcome::Success,
            ));
        }
        tracker.record_error(failure(&clock, "load_users", "boom"));
        tracker.record_error(failure(&clock, "load_users", "boom"));

        let issue = DatabaseError::slow_operation(
            clock.now(),
            "monthly_report",
            Duration::from_millis(2500),
            Duration::from_secs(1),
        )
        .with_signature(signature);
        assert!(tracker.record_performance_issue(issue).is_none());

        let summary = tracker.get_error_summary(Duration::from_secs(3600));
        assert_eq!(summary.total_errors, 2);
        assert_eq!(summary.slow_operations, 1);
        assert_relative_eq!(summary.error_rate, 2.0 / 21.0);
        assert_eq!(summary.by_kind.get(&ErrorKind::SlowQuery), None);
        assert_eq!(summary.lifetime_by_kind.get(&ErrorKind::SlowQuery), Some(&1));
        assert_eq!(tracker.consecutive_failures("load_users"), 2);
        assert_eq!(tracker.consecutive_failures("monthly_report"), 0);

        let recorded = tracker.recent_slow_operations(5);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].operation_name, "monthly_report");
        assert_eq!(tracker.recent_errors(1)[0].operation_name, "load_users");
    }

    #[test]
    fn test_streak_map_drops_shortest_streak_when_full() {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(MetricsCollector::with_clock(
            CollectorConfig::default(),
            clock.clone(),
        ));
        let tracker = ErrorTracker::with_clock(
            ErrorTrackerConfig {
                operation_capacity: 2,
                ..ErrorTrackerConfig::default()
            },
            metrics,
            clock.clone(),
        );

        for _ in 0..3 {
            tracker.record_error(failure(&clock, "checkout", "boom"));
        }
        tracker.record_error(failure(&clock, "search", "boom"));
        tracker.record_error(failure(&clock, "login", "boom"));

        assert_eq!(tracker.consecutive_failures("checkout"), 3);
        assert_eq!(tracker.consecutive_failures("search"), 0);
        assert_eq!(tracker.consecutive_failures("login"), 1);
        assert_eq!(tracker.summary().consecutive_failures.len(), 2);
    }

    #[test]
    fn test_reset_clears_alerts_and_history() {
        let (tracker, _, clock) = tracker();
        tracker.record_error(failure(&clock, "transfer", "deadlock detected"));
        assert!(!tracker.get_active_alerts().is_empty());

        tracker.reset();
        assert!(tracker.get_active_alerts().is_empty());
        assert!(tracker.get_alert_history(None).is_empty());
        assert_eq!(tracker.summary().total_errors, 0);
    }
}
