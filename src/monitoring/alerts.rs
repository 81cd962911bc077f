use super::notify::AlertNotifier;
use super::ring_buffer::RingBuffer;
use super::{read_lock, write_lock};
use crate::error::{MonitorError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighErrorRate,
    ConsecutiveFailures,
    PoolSaturation,
    SlowQueries,
    ConnectionFailure,
    PoolExhaustion,
    Deadlock,
    QueryTimeout,
}

impl AlertType {
    pub const ALL: [AlertType; 8] = [
        AlertType::HighErrorRate,
        AlertType::ConsecutiveFailures,
        AlertType::PoolSaturation,
        AlertType::SlowQueries,
        AlertType::ConnectionFailure,
        AlertType::PoolExhaustion,
        AlertType::Deadlock,
        AlertType::QueryTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::ConsecutiveFailures => "consecutive_failures",
            AlertType::PoolSaturation => "pool_saturation",
            AlertType::SlowQueries => "slow_queries",
            AlertType::ConnectionFailure => "connection_failure",
            AlertType::PoolExhaustion => "pool_exhaustion",
            AlertType::Deadlock => "deadlock",
            AlertType::QueryTimeout => "query_timeout",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// Raise the severity by `steps` tiers, saturating at `Critical`.
    pub fn escalate(self, steps: usize) -> Self {
        const LADDER: [AlertSeverity; 4] = [
            AlertSeverity::Low,
            AlertSeverity::Medium,
            AlertSeverity::High,
            AlertSeverity::Critical,
        ];
        let index = LADDER.iter().position(|s| *s == self).unwrap_or(0);
        LADDER[(index + steps).min(LADDER.len() - 1)]
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
            AlertSeverity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Which threshold was crossed, and by how much.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertContext {
    pub window_seconds: u64,
    pub value: f64,
    pub threshold: f64,
    pub ratio: f64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub context: AlertContext,
    pub resolution_note: Option<String>,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Threshold for one evaluation window. `window_seconds == 0` marks a metric
/// that is not windowed (e.g. consecutive failures).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowThreshold {
    pub window_seconds: u64,
    pub threshold: f64,
}

impl WindowThreshold {
    pub fn new(window_seconds: u64, threshold: f64) -> Self {
        Self {
            window_seconds,
            threshold,
        }
    }

    pub fn window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub alert_type: AlertType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub windows: Vec<WindowThreshold>,
    pub cooldown_seconds: u64,
    pub base_severity: AlertSeverity,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn new(
        alert_type: AlertType,
        windows: Vec<WindowThreshold>,
        cooldown_seconds: u64,
        base_severity: AlertSeverity,
    ) -> Self {
        Self {
            alert_type,
            enabled: true,
            windows,
            cooldown_seconds,
            base_severity,
        }
    }
}

/// Longest accepted window or cooldown: ten years.
pub const MAX_RULE_SECONDS: u64 = 10 * 365 * 24 * 3600;

/// Process-wide alert thresholds, read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub rules: Vec<AlertRule>,
    /// Value/threshold ratios at which severity is raised one more tier.
    pub escalation_multipliers: Vec<f64>,
    /// Error rates are not evaluated until a window holds this many operations.
    pub min_operations_for_rate: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        use AlertSeverity::*;
        use AlertType::*;

        Self {
            rules: vec![
                AlertRule::new(
                    HighErrorRate,
                    vec![
                        WindowThreshold::new(300, 0.10),
                        WindowThreshold::new(900, 0.05),
                        WindowThreshold::new(3600, 0.02),
                    ],
                    900,
                    Medium,
                ),
                AlertRule::new(ConsecutiveFailures, vec![WindowThreshold::new(0, 5.0)], 300, High),
                AlertRule::new(PoolSaturation, vec![WindowThreshold::new(300, 0.9)], 600, High),
                AlertRule::new(SlowQueries, vec![WindowThreshold::new(300, 10.0)], 900, Medium),
                AlertRule::new(ConnectionFailure, vec![WindowThreshold::new(300, 1.0)], 300, Critical),
                AlertRule::new(PoolExhaustion, vec![WindowThreshold::new(300, 1.0)], 600, High),
                AlertRule::new(Deadlock, vec![WindowThreshold::new(300, 1.0)], 180, High),
                AlertRule::new(QueryTimeout, vec![WindowThreshold::new(300, 3.0)], 300, Medium),
            ],
            escalation_multipliers: vec![2.0, 3.0, 5.0],
            min_operations_for_rate: 20,
        }
    }
}

impl AlertThresholds {
    pub fn rule(&self, alert_type: AlertType) -> Option<&AlertRule> {
        self.rules.iter().find(|r| r.alert_type == alert_type)
    }

    pub fn rule_mut(&mut self, alert_type: AlertType) -> Option<&mut AlertRule> {
        self.rules.iter_mut().find(|r| r.alert_type == alert_type)
    }

    /// Add or replace the rule for its alert type.
    pub fn set_rule(&mut self, rule: AlertRule) {
        match self.rule_mut(rule.alert_type) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    /// Default rules with `overrides` applied by alert type.
    pub fn with_overrides(overrides: Vec<AlertRule>) -> Self {
        let mut thresholds = Self::default();
        for rule in overrides {
            thresholds.set_rule(rule);
        }
        thresholds
    }

    pub fn escalation_steps(&self, ratio: f64) -> usize {
        self.escalation_multipliers
            .iter()
            .filter(|m| ratio >= **m)
            .count()
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            if rule.cooldown_seconds > MAX_RULE_SECONDS {
                return Err(MonitorError::Configuration(format!(
                    "Alert rule {} cooldown {}s exceeds {}s",
                    rule.alert_type, rule.cooldown_seconds, MAX_RULE_SECONDS
                )));
            }
            if let Some(bad) = rule
                .windows
                .iter()
                .find(|w| w.window_seconds > MAX_RULE_SECONDS)
            {
                return Err(MonitorError::Configuration(format!(
                    "Alert rule {} window {}s exceeds {}s",
                    rule.alert_type, bad.window_seconds, MAX_RULE_SECONDS
                )));
            }
            if rule.enabled && rule.windows.is_empty() {
                return Err(MonitorError::Configuration(format!(
                    "Alert rule {} has no windows",
                    rule.alert_type
                )));
            }
            if let Some(bad) = rule
                .windows
                .iter()
                .find(|w| !(w.threshold.is_finite() && w.threshold > 0.0))
            {
                return Err(MonitorError::Configuration(format!(
                    "Alert rule {} has invalid threshold {}",
                    rule.alert_type, bad.threshold
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.rules.iter().find(|r| !seen.insert(r.alert_type)) {
            return Err(MonitorError::Configuration(format!(
                "Duplicate alert rule for {}",
                dup.alert_type
            )));
        }

        if self
            .escalation_multipliers
            .windows(2)
            .any(|pair| pair[0] > pair[1])
        {
            return Err(MonitorError::Configuration(
                "Escalation multipliers must be ascending".to_string(),
            ));
        }
        Ok(())
    }
}

/// Current metric value for one window, ready for threshold comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowObservation {
    pub window: WindowThreshold,
    pub value: f64,
}

#[derive(Debug)]
struct AlertState {
    active: HashMap<AlertType, Alert>,
    history: RingBuffer<Alert>,
}

/// Threshold and cooldown state machine. At most one active alert exists per
/// type; a breach while that alert is inside its cooldown is suppressed.
pub struct AlertEngine {
    thresholds: AlertThresholds,
    state: RwLock<AlertState>,
    notifiers: RwLock<Vec<Arc<dyn AlertNotifier>>>,
}

impl fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEngine")
            .field("thresholds", &self.thresholds)
            .field("notifiers", &read_lock(&self.notifiers).len())
            .finish()
    }
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds, history_capacity: usize) -> Self {
        Self {
            thresholds,
            state: RwLock::new(AlertState {
                active: HashMap::new(),
                history: RingBuffer::new(history_capacity),
            }),
            notifiers: RwLock::new(Vec::new()),
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn add_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        info!("Registered alert notifier: {}", notifier.name());
        write_lock(&self.notifiers).push(notifier);
    }

    /// Compare observations against the rule for `alert_type` and create an
    /// alert if a window is breached and no active alert is cooling down.
    ///
    /// Windows are checked in configured order; the first breached window
    /// triggers the alert and its ratio sets the severity.
    pub fn evaluate(
        &self,
        alert_type: AlertType,
        observations: &[WindowObservation],
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let rule = self.thresholds.rule(alert_type)?;
        if !rule.enabled {
            return None;
        }

        let breach = observations
            .iter()
            .find(|o| o.window.threshold > 0.0 && o.value >= o.window.threshold)?;
        let ratio = breach.value / breach.window.threshold;

        let alert = {
            let mut state = write_lock(&self.state);

            if let Some(active) = state.active.get(&alert_type) {
                if active.cooldown_until.is_some_and(|until| now < until) {
                    debug!(
                        "Suppressed {} alert: active alert {} cooling down",
                        alert_type, active.id
                    );
                    return None;
                }
                info!(
                    "Cooldown elapsed for {}; alert {} superseded by a new alert",
                    alert_type, active.id
                );
            }

            let severity = rule
                .base_severity
                .escalate(self.thresholds.escalation_steps(ratio));
            let alert = Alert {
                id: Uuid::new_v4(),
                alert_type,
                severity,
                title: format_title(alert_type, breach.window.window_seconds),
                message: format_message(alert_type, breach),
                triggered_at: now,
                resolved_at: None,
                cooldown_until: Some(cooldown_deadline(now, rule.cooldown_seconds)),
                context: AlertContext {
                    window_seconds: breach.window.window_seconds,
                    value: breach.value,
                    threshold: breach.window.threshold,
                    ratio,
                    metadata,
                },
                resolution_note: None,
            };

            state.active.insert(alert_type, alert.clone());
            state.history.push(alert.clone());
            alert
        };

        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => {
                error!("ALERT [{}] {}: {}", alert.severity, alert.title, alert.message)
            }
            AlertSeverity::Medium | AlertSeverity::Low => {
                warn!("ALERT [{}] {}: {}", alert.severity, alert.title, alert.message)
            }
        }

        self.dispatch(&alert);
        Some(alert)
    }

    /// Deliver to every notifier; failures and panics are logged and dropped.
    fn dispatch(&self, alert: &Alert) {
        let notifiers: Vec<Arc<dyn AlertNotifier>> = read_lock(&self.notifiers).clone();

        for notifier in notifiers {
            match catch_unwind(AssertUnwindSafe(|| notifier.notify(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Failed to send alert {} via {}: {}",
                    alert.id,
                    notifier.name(),
                    e
                ),
                Err(_) => warn!(
                    "Notifier {} panicked while sending alert {}",
                    notifier.name(),
                    alert.id
                ),
            }
        }
    }

    /// Mark an alert resolved and clear its cooldown so the condition may
    /// retrigger immediately. Resolving twice is a no-op.
    pub fn resolve(&self, id: Uuid, note: Option<String>, now: DateTime<Utc>) -> Result<Alert> {
        let mut state = write_lock(&self.state);

        let active_type = state
            .active
            .iter()
            .find(|(_, alert)| alert.id == id)
            .map(|(alert_type, _)| *alert_type);

        let mut resolved = match active_type {
            Some(alert_type) => state.active.remove(&alert_type),
            None => state.history.iter().find(|a| a.id == id).cloned(),
        }
        .ok_or(MonitorError::AlertNotFound { id })?;

        if resolved.resolved_at.is_some() {
            return Ok(resolved);
        }

        resolved.resolved_at = Some(now);
        resolved.cooldown_until = None;
        resolved.resolution_note = note;

        let existing = state.history.iter_mut().find(|a| a.id == id);
        match existing {
            Some(entry) => *entry = resolved.clone(),
            // evicted from history while still active
            None => {
                state.history.push(resolved.clone());
            }
        }

        info!("Alert resolved: {} ({})", resolved.id, resolved.alert_type);
        Ok(resolved)
    }

    /// Active alerts, newest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = read_lock(&self.state).active.values().cloned().collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        alerts
    }

    pub fn active_count(&self) -> usize {
        read_lock(&self.state).active.len()
    }

    /// Every retained alert, resolved or not, newest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<Alert> {
        let state = read_lock(&self.state);
        let limit = limit.unwrap_or(state.history.len());
        state.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn reset(&self) {
        let mut state = write_lock(&self.state);
        state.active.clear();
        state.history.clear();
    }
}

/// End of a cooldown, saturating at the latest representable time.
fn cooldown_deadline(now: DateTime<Utc>, cooldown_seconds: u64) -> DateTime<Utc> {
    i64::try_from(cooldown_seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|cooldown| now.checked_add_signed(cooldown))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn format_window(window_seconds: u64) -> String {
    match window_seconds {
        0 => "current".to_string(),
        s if s % 3600 == 0 => format!("{} h", s / 3600),
        s if s % 60 == 0 => format!("{} min", s / 60),
        s => format!("{s} s"),
    }
}

fn format_title(alert_type: AlertType, window_seconds: u64) -> String {
    let window = format_window(window_seconds);
    match alert_type {
        AlertType::HighErrorRate => format!("High Error Rate Detected ({window} window)"),
        AlertType::ConsecutiveFailures => "Consecutive Operation Failures".to_string(),
        AlertType::PoolSaturation => format!("Connection Pool Saturated ({window} window)"),
        AlertType::SlowQueries => format!("Slow Queries Detected ({window} window)"),
        AlertType::ConnectionFailure => "Database Connection Failure".to_string(),
        AlertType::PoolExhaustion => "Connection Pool Exhausted".to_string(),
        AlertType::Deadlock => "Database Deadlock Detected".to_string(),
        AlertType::QueryTimeout => "Database Operations Timing Out".to_string(),
    }
}

fn format_message(alert_type: AlertType, breach: &WindowObservation) -> String {
    let window = format_window(breach.window.window_seconds);
    let value = breach.value;
    let threshold = breach.window.threshold;
    match alert_type {
        AlertType::HighErrorRate => format!(
            "Database error rate is {:.2}% over the last {window}, exceeding threshold of {:.2}%",
            value * 100.0,
            threshold * 100.0
        ),
        AlertType::ConsecutiveFailures => format!(
            "Detected {value:.0} consecutive failures (threshold: {threshold:.0})"
        ),
        AlertType::PoolSaturation => format!(
            "Connection pool utilization peaked at {:.1}% over the last {window} (threshold: {:.1}%)",
            value * 100.0,
            threshold * 100.0
        ),
        AlertType::SlowQueries => format!(
            "{value:.0} slow queries over the last {window} (threshold: {threshold:.0})"
        ),
        AlertType::ConnectionFailure => format!(
            "{value:.0} connection failures over the last {window} (threshold: {threshold:.0})"
        ),
        AlertType::PoolExhaustion => format!(
            "{value:.0} pool exhaustion errors over the last {window} (threshold: {threshold:.0})"
        ),
        AlertType::Deadlock => format!(
            "{value:.0} deadlocks over the last {window} (threshold: {threshold:.0})"
        ),
        AlertType::QueryTimeout => format!(
            "{value:.0} timed out operations over the last {window} (threshold: {threshold:.0})"
        ),
    }
}
