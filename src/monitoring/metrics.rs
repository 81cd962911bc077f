use super::clock::{window_start, Clock, SystemClock};
use super::ring_buffer::RingBuffer;
use super::{read_lock, write_lock, PoolSample, QueryMetric, QuerySignature};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the metrics collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub query_capacity: usize,
    pub pool_capacity: usize,
    pub slow_query_threshold_ms: u64,
    pub report_window_seconds: u64,
    pub high_utilization_threshold: f64,
    /// Distinct query signatures with running totals; the least recently
    /// seen is dropped beyond this
    pub signature_capacity: usize,
    /// Closed connections kept for inspection
    pub connection_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            query_capacity: 1000,
            pool_capacity: 288,
            slow_query_threshold_ms: 1000,
            report_window_seconds: 3600,
            high_utilization_threshold: 0.8,
            signature_capacity: 1000,
            connection_capacity: 1000,
        }
    }
}

impl CollectorConfig {
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_secs(self.report_window_seconds)
    }
}

/// Running totals per query signature. These outlive the query history;
/// only `reset` or the signature cap removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureAggregate {
    pub signature: QuerySignature,
    pub count: u64,
    pub success_count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub last_seen: DateTime<Utc>,
}

impl SignatureAggregate {
    fn new(metric: &QueryMetric) -> Self {
        Self {
            signature: metric.signature.clone(),
            count: 0,
            success_count: 0,
            total_duration: Duration::ZERO,
            min_duration: metric.duration,
            max_duration: metric.duration,
            last_seen: metric.timestamp,
        }
    }

    fn record(&mut self, metric: &QueryMetric) {
        self.count += 1;
        if metric.is_success() {
            self.success_count += 1;
        }
        self.total_duration = self.total_duration.saturating_add(metric.duration);
        self.min_duration = self.min_duration.min(metric.duration);
        self.max_duration = self.max_duration.max(metric.duration);
        self.last_seen = self.last_seen.max(metric.timestamp);
    }

    pub fn failure_count(&self) -> u64 {
        self.count - self.success_count
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_duration.as_nanos() as f64 / 1_000_000.0 / self.count as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.count as f64
    }
}

/// Duration distribution in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationSummary {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
}

impl DurationSummary {
    pub fn from_millis(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(|a, b| a.total_cmp(b));

        let total_ms: f64 = values.iter().sum();
        Self {
            mean_ms: total_ms / values.len() as f64,
            median_ms: percentile(&values, 50.0),
            p95_ms: percentile(&values, 95.0),
            p99_ms: percentile(&values, 99.0),
            min_ms: values[0],
            max_ms: values[values.len() - 1],
            total_ms,
        }
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureStats {
    pub signature: QuerySignature,
    pub count: usize,
    pub success_rate: f64,
    pub durations: DurationSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPerformanceStats {
    pub window_seconds: u64,
    pub total_queries: usize,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub success_rate: f64,
    pub error_rate: f64,
    pub queries_per_minute: f64,
    pub slow_queries: usize,
    pub durations: DurationSummary,
    pub by_signature: Vec<SignatureStats>,
}

impl QueryPerformanceStats {
    fn empty(window: Duration) -> Self {
        Self {
            window_seconds: window.as_secs(),
            total_queries: 0,
            successful_queries: 0,
            failed_queries: 0,
            success_rate: 0.0,
            error_rate: 0.0,
            queries_per_minute: 0.0,
            slow_queries: 0,
            durations: DurationSummary::default(),
            by_signature: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowSignature {
    pub signature: QuerySignature,
    pub count: usize,
    pub max_ms: f64,
    pub mean_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryReport {
    pub window_seconds: u64,
    pub threshold_ms: f64,
    pub total_slow: usize,
    /// Slowest first.
    pub queries: Vec<QueryMetric>,
    /// Most frequent offender first.
    pub by_signature: Vec<SlowSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolTrend {
    pub window_seconds: u64,
    pub data_points: usize,
    pub current_utilization: f64,
    pub peak_utilization: f64,
    pub average_utilization: f64,
    pub min_utilization: f64,
    pub high_utilization_samples: usize,
    pub trend: TrendDirection,
    pub lifetime_peak_utilization: f64,
    pub lifetime_average_utilization: f64,
    pub samples: Vec<PoolSample>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub successes: u64,
    pub failures: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Lifecycle event of a connection, identified by its session id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionEvent {
    Created,
    Used { duration: Duration, success: bool },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub total_duration: Duration,
    pub is_active: bool,
}

impl ConnectionMetrics {
    fn new(connection_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            created_at: now,
            last_used: None,
            closed_at: None,
            total_operations: 0,
            failed_operations: 0,
            total_duration: Duration::ZERO,
            is_active: true,
        }
    }

    pub fn mean_ms(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.total_duration.as_nanos() as f64 / 1_000_000.0 / self.total_operations as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub active: usize,
    pub total_created: u64,
    pub total_closed: u64,
    pub retained_closed: usize,
}

#[derive(Debug)]
struct ConnectionRegistry {
    active: HashMap<String, ConnectionMetrics>,
    closed: RingBuffer<ConnectionMetrics>,
    created: u64,
    closed_total: u64,
}

impl ConnectionRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            closed: RingBuffer::new(capacity),
            created: 0,
            closed_total: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub report_window_seconds: u64,
    pub query_performance: QueryPerformanceStats,
    pub slow_queries: SlowQueryReport,
    pub pool_trend: PoolTrend,
    pub signatures: Vec<SignatureAggregate>,
    pub retained_queries: usize,
    pub query_capacity: usize,
    pub evicted_queries: u64,
    pub retained_pool_samples: usize,
    pub pool_capacity: usize,
    pub connections: ConnectionStats,
}

#[derive(Debug)]
struct PoolHistory {
    samples: RingBuffer<PoolSample>,
    peak: f64,
    sum: f64,
    count: u64,
}

impl PoolHistory {
    fn new(capacity: usize) -> Self {
        Self {
            samples: RingBuffer::new(capacity),
            peak: 0.0,
            sum: 0.0,
            count: 0,
        }
    }
}

/// Bounded, thread-safe store of query timings and pool samples.
#[derive(Debug)]
pub struct MetricsCollector {
    config: CollectorConfig,
    clock: Arc<dyn Clock>,
    queries: RwLock<RingBuffer<QueryMetric>>,
    aggregates: RwLock<HashMap<QuerySignature, SignatureAggregate>>,
    pool: RwLock<PoolHistory>,
    connections: RwLock<ConnectionRegistry>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl MetricsCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CollectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            queries: RwLock::new(RingBuffer::new(config.query_capacity)),
            aggregates: RwLock::new(HashMap::new()),
            pool: RwLock::new(PoolHistory::new(config.pool_capacity)),
            connections: RwLock::new(ConnectionRegistry::new(config.connection_capacity)),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn slow_query_threshold(&self) -> Duration {
        self.config.slow_query_threshold()
    }

    pub fn record_query(&self, metric: QueryMetric) {
        if metric.duration > self.config.slow_query_threshold() {
            warn!(
                "Slow query detected: {} took {:.2}ms",
                metric.operation_name,
                metric.duration_ms()
            );
        }

        {
            let mut aggregates = write_lock(&self.aggregates);
            if !aggregates.contains_key(&metric.signature)
                && aggregates.len() >= self.config.signature_capacity.max(1)
            {
                let stalest = aggregates
                    .values()
                    .min_by_key(|a| a.last_seen)
                    .map(|a| a.signature.clone());
                if let Some(signature) = stalest {
                    debug!("Dropping running totals for {}", signature);
                    aggregates.remove(&signature);
                }
            }
            aggregates
                .entry(metric.signature.clone())
                .or_insert_with(|| SignatureAggregate::new(&metric))
                .record(&metric);
        }

        write_lock(&self.queries).push(metric);
    }

    pub fn record_pool_sample(&self, sample: PoolSample) {
        if sample.utilization > self.config.high_utilization_threshold {
            warn!(
                "High connection pool utilization: {:.1}% ({}/{} connections)",
                sample.utilization * 100.0,
                sample.checked_out,
                sample.capacity()
            );
        }

        let mut pool = write_lock(&self.pool);
        pool.peak = pool.peak.max(sample.utilization);
        pool.sum += sample.utilization;
        pool.count += 1;
        pool.samples.push(sample);
    }

    /// Track a connection through creation, use and close. Use of a
    /// connection that is not open is ignored.
    pub fn record_connection_event(&self, connection_id: &str, event: ConnectionEvent) {
        let now = self.clock.now();
        let mut registry = write_lock(&self.connections);
        match event {
            ConnectionEvent::Created => {
                registry.created += 1;
                registry
                    .active
                    .insert(connection_id.to_string(), ConnectionMetrics::new(connection_id, now));
                debug!("Connection opened: {}", connection_id);
            }
            ConnectionEvent::Used { duration, success } => {
                if let Some(connection) = registry.active.get_mut(connection_id) {
                    connection.last_used = Some(now);
                    connection.total_operations += 1;
                    connection.total_duration = connection.total_duration.saturating_add(duration);
                    if !success {
                        connection.failed_operations += 1;
                    }
                }
            }
            ConnectionEvent::Closed => {
                if let Some(mut connection) = registry.active.remove(connection_id) {
                    connection.is_active = false;
                    connection.closed_at = Some(now);
                    registry.closed_total += 1;
                    registry.closed.push(connection);
                    debug!("Connection closed: {}", connection_id);
                }
            }
        }
    }

    /// Open connections, oldest first.
    pub fn active_connections(&self) -> Vec<ConnectionMetrics> {
        let mut connections: Vec<ConnectionMetrics> =
            read_lock(&self.connections).active.values().cloned().collect();
        connections.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        connections
    }

    /// Closed connections, most recently closed first.
    pub fn connection_history(&self, limit: Option<usize>) -> Vec<ConnectionMetrics> {
        let registry = read_lock(&self.connections);
        let limit = limit.unwrap_or(registry.closed.len());
        registry.closed.iter().rev().take(limit).cloned().collect()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let registry = read_lock(&self.connections);
        ConnectionStats {
            active: registry.active.len(),
            total_created: registry.created,
            total_closed: registry.closed_total,
            retained_closed: registry.closed.len(),
        }
    }

    fn queries_in_window(&self, window: Duration) -> Vec<QueryMetric> {
        let cutoff = window_start(self.clock.now(), window);
        read_lock(&self.queries)
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn pool_samples_in_window(&self, window: Duration) -> Vec<PoolSample> {
        let cutoff = window_start(self.clock.now(), window);
        read_lock(&self.pool)
            .samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn get_query_performance_stats(&self, window: Duration) -> QueryPerformanceStats {
        let metrics = self.queries_in_window(window);
        if metrics.is_empty() {
            return QueryPerformanceStats::empty(window);
        }

        let total = metrics.len();
        let successful = metrics.iter().filter(|m| m.is_success()).count();
        let threshold = self.config.slow_query_threshold();
        let slow = metrics.iter().filter(|m| m.duration > threshold).count();

        let mut grouped: HashMap<&QuerySignature, Vec<&QueryMetric>> = HashMap::new();
        for metric in &metrics {
            grouped.entry(&metric.signature).or_default().push(metric);
        }

        let mut by_signature: Vec<SignatureStats> = grouped
            .into_iter()
            .map(|(signature, group)| SignatureStats {
                signature: signature.clone(),
                count: group.len(),
                success_rate: group.iter().filter(|m| m.is_success()).count() as f64
                    / group.len() as f64,
                durations: DurationSummary::from_millis(
                    group.iter().map(|m| m.duration_ms()).collect(),
                ),
            })
            .collect();
        by_signature.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.signature.to_string().cmp(&b.signature.to_string()))
        });

        let minutes = window.as_secs_f64() / 60.0;
        QueryPerformanceStats {
            window_seconds: window.as_secs(),
            total_queries: total,
            successful_queries: successful,
            failed_queries: total - successful,
            success_rate: successful as f64 / total as f64,
            error_rate: (total - successful) as f64 / total as f64,
            queries_per_minute: if minutes > 0.0 {
                total as f64 / minutes
            } else {
                0.0
            },
            slow_queries: slow,
            durations: DurationSummary::from_millis(
                metrics.iter().map(|m| m.duration_ms()).collect(),
            ),
            by_signature,
        }
    }

    pub fn detect_slow_queries(&self, window: Duration, threshold: Duration) -> SlowQueryReport {
        let mut slow: Vec<QueryMetric> = self
            .queries_in_window(window)
            .into_iter()
            .filter(|m| m.duration > threshold)
            .collect();
        slow.sort_by(|a, b| b.duration.cmp(&a.duration));

        let mut grouped: HashMap<&QuerySignature, Vec<f64>> = HashMap::new();
        for metric in &slow {
            grouped
                .entry(&metric.signature)
                .or_default()
                .push(metric.duration_ms());
        }

        let mut by_signature: Vec<SlowSignature> = grouped
            .into_iter()
            .map(|(signature, durations)| SlowSignature {
                signature: signature.clone(),
                count: durations.len(),
                max_ms: durations.iter().copied().fold(0.0, f64::max),
                mean_ms: durations.iter().sum::<f64>() / durations.len() as f64,
            })
            .collect();
        by_signature.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.max_ms.total_cmp(&a.max_ms))
        });

        SlowQueryReport {
            window_seconds: window.as_secs(),
            threshold_ms: threshold.as_nanos() as f64 / 1_000_000.0,
            total_slow: slow.len(),
            queries: slow,
            by_signature,
        }
    }

    /// Queries in the window slower than the configured threshold.
    pub fn slow_query_count(&self, window: Duration) -> usize {
        let cutoff = window_start(self.clock.now(), window);
        let threshold = self.config.slow_query_threshold();
        read_lock(&self.queries)
            .iter()
            .filter(|m| m.timestamp >= cutoff && m.duration > threshold)
            .count()
    }

    pub fn count_outcomes(&self, window: Duration) -> OutcomeCounts {
        let cutoff = window_start(self.clock.now(), window);
        read_lock(&self.queries)
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .fold(OutcomeCounts::default(), |mut counts, m| {
                if m.is_success() {
                    counts.successes += 1;
                } else {
                    counts.failures += 1;
                }
                counts
            })
    }

    pub fn peak_pool_utilization(&self, window: Duration) -> Option<f64> {
        let cutoff = window_start(self.clock.now(), window);
        read_lock(&self.pool)
            .samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .map(|s| s.utilization)
            .reduce(f64::max)
    }

    pub fn latest_pool_sample(&self) -> Option<PoolSample> {
        read_lock(&self.pool).samples.latest().cloned()
    }

    pub fn get_pool_trend(&self, window: Duration) -> PoolTrend {
        let samples = self.pool_samples_in_window(window);
        let (lifetime_peak, lifetime_average) = {
            let pool = read_lock(&self.pool);
            let average = if pool.count > 0 {
                pool.sum / pool.count as f64
            } else {
                0.0
            };
            (pool.peak, average)
        };

        let utilizations: Vec<f64> = samples.iter().map(|s| s.utilization).collect();
        let data_points = utilizations.len();
        let (peak, min, average) = if data_points == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (
                utilizations.iter().copied().fold(f64::MIN, f64::max),
                utilizations.iter().copied().fold(f64::MAX, f64::min),
                utilizations.iter().sum::<f64>() / data_points as f64,
            )
        };

        PoolTrend {
            window_seconds: window.as_secs(),
            data_points,
            current_utilization: utilizations.last().copied().unwrap_or(0.0),
            peak_utilization: peak,
            average_utilization: average,
            min_utilization: min,
            high_utilization_samples: utilizations
                .iter()
                .filter(|u| **u > self.config.high_utilization_threshold)
                .count(),
            trend: calculate_trend(&utilizations),
            lifetime_peak_utilization: lifetime_peak,
            lifetime_average_utilization: lifetime_average,
            samples,
        }
    }

    /// Running per-signature totals, busiest first.
    pub fn signature_aggregates(&self) -> Vec<SignatureAggregate> {
        let mut aggregates: Vec<SignatureAggregate> =
            read_lock(&self.aggregates).values().cloned().collect();
        aggregates.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.signature.to_string().cmp(&b.signature.to_string()))
        });
        aggregates
    }

    pub fn get_comprehensive_snapshot(&self) -> MetricsSnapshot {
        let window = self.config.report_window();
        let (retained_queries, evicted_queries) = {
            let queries = read_lock(&self.queries);
            (queries.len(), queries.evicted())
        };

        MetricsSnapshot {
            generated_at: self.clock.now(),
            report_window_seconds: window.as_secs(),
            query_performance: self.get_query_performance_stats(window),
            slow_queries: self.detect_slow_queries(window, self.config.slow_query_threshold()),
            pool_trend: self.get_pool_trend(window),
            signatures: self.signature_aggregates(),
            retained_queries,
            query_capacity: self.config.query_capacity.max(1),
            evicted_queries,
            retained_pool_samples: read_lock(&self.pool).samples.len(),
            pool_capacity: self.config.pool_capacity.max(1),
            connections: self.connection_stats(),
        }
    }

    pub fn reset(&self) {
        write_lock(&self.queries).clear();
        write_lock(&self.aggregates).clear();
        *write_lock(&self.pool) = PoolHistory::new(self.config.pool_capacity);
        {
            // open connections stay registered with fresh counters
            let mut registry = write_lock(&self.connections);
            let now = self.clock.now();
            let active = std::mem::take(&mut registry.active);
            *registry = ConnectionRegistry::new(self.config.connection_capacity);
            registry.created = active.len() as u64;
            registry.active = active
                .into_keys()
                .map(|id| {
                    let connection = ConnectionMetrics::new(&id, now);
                    (id, connection)
                })
                .collect();
        }
        info!("Database metrics reset");
    }
}

/// Least-squares slope over sample order; |slope| <= 0.01 counts as stable.
pub fn calculate_trend(values: &[f64]) -> TrendDirection {
    if values.len() < 2 {
        return TrendDirection::InsufficientData;
    }

    let n = values.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n;

    let (numerator, denominator) = values.iter().enumerate().fold(
        (0.0, 0.0),
        |(num, den), (i, y)| {
            let dx = i as f64 - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        },
    );

    if denominator == 0.0 {
        return TrendDirection::Stable;
    }

    let slope = numerator / denominator;
    if slope > 0.01 {
        TrendDirection::Increasing
    } else if slope < -0.01 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{ManualClock, OperationKind, Outcome};
    use approx::assert_relative_eq;
    use tracing_test::traced_test;

    fn collector_at(clock: Arc<ManualClock>) -> MetricsCollector {
        MetricsCollector::with_clock(CollectorConfig::default(), clock)
    }

    fn select(target: &str) -> QuerySignature {
        QuerySignature::new(OperationKind::Select, Some(target.to_string()))
    }

    #[test]
    fn test_percentiles_ten_to_hundred() {
        let clock = Arc::new(ManualClock::default());
        let collector = collector_at(clock.clone());

        for ms in (10..=100).step_by(10) {
            collector.record_query(QueryMetric::new(
                clock.now(),
                select("users"),
                Duration::from_millis(ms),
                Outcome::Success,
            ));
        }

        let stats = collector.get_query_performance_stats(Duration::from_secs(300));
        assert_eq!(stats.total_queries, 10);
        assert_relative_eq!(stats.durations.mean_ms, 55.0);
        assert_relative_eq!(stats.durations.median_ms, 50.0);
        assert_relative_eq!(stats.durations.p95_ms, 100.0);
        assert_relative_eq!(stats.durations.max_ms, 100.0);
        assert_relative_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.by_signature.len(), 1);
    }

    #[test]
    fn test_empty_window_yields_zeroed_stats() {
        let collector = MetricsCollector::default();
        let stats = collector.get_query_performance_stats(Duration::from_secs(60));
        assert_eq!(stats.total_queries, 0);
        assert_eq!(stats.durations, DurationSummary::default());

        let trend = collector.get_pool_trend(Duration::from_secs(60));
        assert_eq!(trend.data_points, 0);
        assert_eq!(trend.trend, TrendDirection::InsufficientData);
    }

    #[test]
    fn test_window_excludes_old_queries() {
        let clock = Arc::new(ManualClock::default());
        let collector = collector_at(clock.clone());

        collector.record_query(QueryMetric::new(
            clock.now(),
            select("users"),
            Duration::from_millis(5),
            Outcome::Failure,
        ));
        clock.advance(chrono::Duration::minutes(10));
        collector.record_query(QueryMetric::new(
            clock.now(),
            select("users"),
            Duration::from_millis(5),
            Outcome::Success,
        ));

        let counts = collector.count_outcomes(Duration::from_secs(300));
        assert_eq!(counts, OutcomeCounts { successes: 1, failures: 0 });

        let aggregates = collector.signature_aggregates();
        assert_eq!(aggregates[0].count, 2);
        assert_eq!(aggregates[0].failure_count(), 1);
    }

    #[test]
    fn test_slow_queries_grouped_by_signature() {
        let clock = Arc::new(ManualClock::default());
        let collector = collector_at(clock.clone());

        for (target, ms) in [("orders", 1500), ("orders", 2500), ("users", 1200), ("users", 10)] {
            collector.record_query(QueryMetric::new(
                clock.now(),
                select(target),
                Duration::from_millis(ms),
                Outcome::Success,
            ));
        }

        let report =
            collector.detect_slow_queries(Duration::from_secs(300), Duration::from_millis(1000));
        assert_eq!(report.total_slow, 3);
        assert_eq!(report.queries[0].duration, Duration::from_millis(2500));
        assert_eq!(report.by_signature[0].signature, select("orders"));
        assert_eq!(report.by_signature[0].count, 2);
        assert_relative_eq!(report.by_signature[0].max_ms, 2500.0);
        assert_eq!(collector.slow_query_count(Duration::from_secs(300)), 3);
    }

    #[test]
    fn test_pool_trend_direction() {
        let clock = Arc::new(ManualClock::default());
        let collector = collector_at(clock.clone());

        for checked_out in [2, 4, 6, 8, 10] {
            collector.record_pool_sample(PoolSample::new(clock.now(), 10, checked_out, 0));
            clock.advance(chrono::Duration::seconds(30));
        }

        let trend = collector.get_pool_trend(Duration::from_secs(3600));
        assert_eq!(trend.data_points, 5);
        assert_eq!(trend.trend, TrendDirection::Increasing);
        assert_relative_eq!(trend.peak_utilization, 1.0);
        assert_relative_eq!(trend.average_utilization, 0.6, epsilon = 1e-9);
        assert_relative_eq!(trend.current_utilization, 1.0);
        assert_eq!(trend.high_utilization_samples, 1);
    }

    #[test]
    #[traced_test]
    fn test_slow_query_and_high_utilization_are_logged() {
        let collector = MetricsCollector::default();
        collector.record_query(
            QueryMetric::new(
                Utc::now(),
                select("reports"),
                Duration::from_millis(1500),
                Outcome::Success,
            )
            .with_operation("monthly_report"),
        );
        collector.record_pool_sample(PoolSample::new(Utc::now(), 10, 9, 0));

        assert!(logs_contain("Slow query detected: monthly_report"));
        assert!(logs_contain("High connection pool utilization: 90.0%"));
    }

    #[test]
    fn test_calculate_trend() {
        assert_eq!(calculate_trend(&[0.5]), TrendDirection::InsufficientData);
        assert_eq!(calculate_trend(&[0.5, 0.5, 0.5]), TrendDirection::Stable);
        assert_eq!(calculate_trend(&[0.9, 0.6, 0.3]), TrendDirection::Decreasing);
        assert_eq!(calculate_trend(&[0.50, 0.505, 0.51]), TrendDirection::Stable);
    }

    #[test]
    fn test_reset_clears_history_and_aggregates() {
        let collector = MetricsCollector::default();
        collector.record_query(QueryMetric::new(
            Utc::now(),
            select("users"),
            Duration::from_millis(5),
            Outcome::Success,
        ));
        collector.record_pool_sample(PoolSample::new(Utc::now(), 5, 1, 0));

        collector.reset();
        let snapshot = collector.get_comprehensive_snapshot();
        assert_eq!(snapshot.retained_queries, 0);
        assert_eq!(snapshot.retained_pool_samples, 0);
        assert!(snapshot.signatures.is_empty());
        assert_eq!(snapshot.pool_trend.lifetime_peak_utilization, 0.0);
    }

    #[test]
    fn test_signature_cap_drops_least_recently_seen() {
        let clock = Arc::new(ManualClock::default());
        let collector = MetricsCollector::with_clock(
            CollectorConfig {
                signature_capacity: 2,
                ..CollectorConfig::default()
            },
            clock.clone(),
        );

        for target in ["users", "orders", "users", "items"] {
            collector.record_query(QueryMetric::new(
                clock.now(),
                select(target),
                Duration::from_millis(5),
                Outcome::Success,
            ));
            clock.advance(chrono::Duration::seconds(1));
        }

        let aggregates = collector.signature_aggregates();
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].signature, select("users"));
        assert_eq!(aggregates[0].count, 2);
        assert_eq!(aggregates[1].signature, select("items"));
        assert_eq!(collector.get_comprehensive_snapshot().retained_queries, 4);
    }

    #[test]
    fn test_connection_lifecycle() {
        let clock = Arc::new(ManualClock::default());
        let collector = MetricsCollector::with_clock(
            CollectorConfig {
                connection_capacity: 1,
                ..CollectorConfig::default()
            },
            clock.clone(),
        );

        collector.record_connection_event("conn-1", ConnectionEvent::Created);
        collector.record_connection_event("conn-2", ConnectionEvent::Created);
        clock.advance(chrono::Duration::seconds(5));
        for (ms, success) in [(10, true), (30, false)] {
            collector.record_connection_event(
                "conn-1",
                ConnectionEvent::Used {
                    duration: Duration::from_millis(ms),
                    success,
                },
            );
        }
        collector.record_connection_event(
            "ghost",
            ConnectionEvent::Used {
                duration: Duration::from_millis(1),
                success: true,
            },
        );

        let active = collector.active_connections();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].connection_id, "conn-1");
        assert_eq!(active[0].total_operations, 2);
        assert_eq!(active[0].failed_operations, 1);
        assert_eq!(active[0].last_used, Some(clock.now()));
        assert_relative_eq!(active[0].mean_ms(), 20.0);

        collector.record_connection_event("conn-1", ConnectionEvent::Closed);
        collector.record_connection_event("conn-2", ConnectionEvent::Closed);
        collector.record_connection_event("conn-2", ConnectionEvent::Closed);

        let history = collector.connection_history(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].connection_id, "conn-2");
        assert!(!history[0].is_active);
        assert_eq!(
            collector.connection_stats(),
            ConnectionStats {
                active: 0,
                total_created: 2,
                total_closed: 2,
                retained_closed: 1,
            }
        );
    }

    #[test]
    fn test_reset_keeps_open_connections() {
        let collector = MetricsCollector::default();
        collector.record_connection_event("open", ConnectionEvent::Created);
        collector.record_connection_event(
            "open",
            ConnectionEvent::Used {
                duration: Duration::from_millis(3),
                success: true,
            },
        );
        collector.record_connection_event("gone", ConnectionEvent::Created);
        collector.record_connection_event("gone", ConnectionEvent::Closed);

        collector.reset();

        let active = collector.active_connections();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].total_operations, 0);
        assert!(collector.connection_history(None).is_empty());
        assert_eq!(collector.connection_stats().total_closed, 0);
    }

    #[test]
    fn test_concurrent_recording_keeps_every_metric() {
        let collector = Arc::new(MetricsCollector::new(CollectorConfig {
            query_capacity: 2000,
            ..CollectorConfig::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..125 {
                        collector.record_query(QueryMetric::new(
                            Utc::now(),
                            select(&format!("t{t}")),
                            Duration::from_millis(i),
                            Outcome::Success,
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.get_comprehensive_snapshot();
        assert_eq!(snapshot.retained_queries, 1000);
        assert_eq!(snapshot.signatures.len(), 8);
        assert!(snapshot.signatures.iter().all(|s| s.count == 125));
    }
}
