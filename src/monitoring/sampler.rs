use super::alerts::{Alert, AlertSeverity};
use super::clock::Clock;
use super::errors::ErrorTracker;
use super::metrics::MetricsCollector;
use super::ring_buffer::RingBuffer;
use super::{read_lock, write_lock, AlertType, PoolSample};
use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Raw pool occupancy as reported by a pool implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_size: u32,
    pub checked_out: u32,
    pub overflow: u32,
}

#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn pool_status(&self) -> Result<PoolStatus>;
}

#[async_trait]
impl PoolSource for sqlx::PgPool {
    async fn pool_status(&self) -> Result<PoolStatus> {
        let open = self.size();
        let idle = u32::try_from(self.num_idle()).unwrap_or(open);
        Ok(PoolStatus {
            pool_size: self.options().get_max_connections(),
            checked_out: open.saturating_sub(idle),
            overflow: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// The pool could not be read.
    Error,
}

/// Outcome of one sampler tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub pool: Option<PoolSample>,
    pub active_alerts: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerStatus {
    pub is_running: bool,
    pub interval_seconds: f64,
    pub metrics_reset_seconds: Option<u64>,
    pub last_metrics_reset: DateTime<Utc>,
    pub health_history_size: usize,
    pub max_history_size: usize,
    pub last_status: Option<HealthStatus>,
}

/// Unhealthy on a full pool or a critical alert, degraded on high
/// utilization or any other active alert.
pub fn assess_health(sample: &PoolSample, active: &[Alert], high_utilization: f64) -> HealthStatus {
    if sample.utilization >= 1.0 || active.iter().any(|a| a.severity == AlertSeverity::Critical) {
        HealthStatus::Unhealthy
    } else if sample.utilization > high_utilization || !active.is_empty() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug)]
struct SamplerState {
    history: RingBuffer<HealthCheck>,
    last_metrics_reset: DateTime<Utc>,
}

/// Periodically samples a pool into the metrics collector, evaluates pool
/// saturation and keeps a short history of health checks. Optionally
/// resets the metrics collector on a fixed period.
#[derive(Clone)]
pub struct PoolSampler {
    source: Arc<dyn PoolSource>,
    metrics: Arc<MetricsCollector>,
    errors: Arc<ErrorTracker>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    metrics_reset: Option<Duration>,
    state: Arc<RwLock<SamplerState>>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for PoolSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSampler")
            .field("interval", &self.interval)
            .field("metrics_reset", &self.metrics_reset)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl PoolSampler {
    pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

    pub fn new(
        source: Arc<dyn PoolSource>,
        metrics: Arc<MetricsCollector>,
        errors: Arc<ErrorTracker>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        let state = SamplerState {
            history: RingBuffer::new(Self::DEFAULT_HISTORY_CAPACITY),
            last_metrics_reset: clock.now(),
        };
        Self {
            source,
            metrics,
            errors,
            clock,
            interval: interval.max(Duration::from_millis(10)),
            metrics_reset: None,
            state: Arc::new(RwLock::new(state)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_history_capacity(self, capacity: usize) -> Self {
        {
            let mut state = write_lock(&self.state);
            let kept = state.history.to_vec();
            state.history = RingBuffer::new(capacity);
            for check in kept {
                state.history.push(check);
            }
        }
        self
    }

    /// Reset the metrics collector whenever `period` has passed since the
    /// last reset. Checked after every tick.
    pub fn with_metrics_reset(mut self, period: Option<Duration>) -> Self {
        self.metrics_reset = period.filter(|p| !p.is_zero());
        self
    }

    pub async fn sample_once(&self) -> Result<PoolSample> {
        let status = self.source.pool_status().await?;
        let sample = PoolSample::new(
            self.clock.now(),
            status.pool_size,
            status.checked_out,
            status.overflow,
        );
        debug!(
            "Pool sample: {}/{} connections checked out ({:.1}%)",
            sample.checked_out,
            sample.capacity(),
            sample.utilization * 100.0
        );

        self.metrics.record_pool_sample(sample.clone());
        self.errors.evaluate(AlertType::PoolSaturation);
        Ok(sample)
    }

    /// Sample the pool, store the resulting health check and apply the
    /// periodic metrics reset. A failed read is stored as an error check.
    pub async fn tick(&self) -> HealthCheck {
        let check = match self.sample_once().await {
            Ok(sample) => {
                let active = self.errors.get_active_alerts();
                HealthCheck {
                    timestamp: sample.timestamp,
                    status: assess_health(
                        &sample,
                        &active,
                        self.metrics.config().high_utilization_threshold,
                    ),
                    pool: Some(sample),
                    active_alerts: active.len(),
                    error: None,
                }
            }
            Err(e) => HealthCheck {
                timestamp: self.clock.now(),
                status: HealthStatus::Error,
                pool: None,
                active_alerts: self.errors.get_active_alerts().len(),
                error: Some(e.to_string()),
            },
        };

        match check.status {
            HealthStatus::Unhealthy => error!(
                "🚨 Database pool unhealthy: {} active alerts",
                check.active_alerts
            ),
            HealthStatus::Degraded => warn!(
                "⚠️ Database pool degraded: {} active alerts",
                check.active_alerts
            ),
            HealthStatus::Healthy => debug!("Database pool health check passed"),
            HealthStatus::Error => error!(
                "Pool health check failed: {}",
                check.error.as_deref().unwrap_or("unknown error")
            ),
        }

        write_lock(&self.state).history.push(check.clone());
        self.apply_metrics_reset();
        check
    }

    fn apply_metrics_reset(&self) {
        let Some(period) = self.metrics_reset else {
            return;
        };
        let now = self.clock.now();
        let mut state = write_lock(&self.state);
        let since = (now - state.last_metrics_reset)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if since >= period {
            info!("Resetting database metrics after {:?}", period);
            self.metrics.reset();
            state.last_metrics_reset = now;
        }
    }

    /// Stored health checks, newest first.
    pub fn health_history(&self, limit: Option<usize>) -> Vec<HealthCheck> {
        let state = read_lock(&self.state);
        let limit = limit.unwrap_or(state.history.len());
        state.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn status(&self) -> SamplerStatus {
        let state = read_lock(&self.state);
        SamplerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            interval_seconds: self.interval.as_secs_f64(),
            metrics_reset_seconds: self.metrics_reset.map(|p| p.as_secs()),
            last_metrics_reset: state.last_metrics_reset,
            health_history_size: state.history.len(),
            max_history_size: state.history.capacity(),
            last_status: state.history.latest().map(|c| c.status),
        }
    }

    /// Start sampling on the current runtime until the handle is shut down.
    /// Only one loop may run per sampler and its clones.
    pub fn spawn(self) -> Result<SamplerHandle> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::SamplerRunning);
        }
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            info!("🔍 Starting connection pool sampler (every {:?})", self.interval);
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Connection pool sampler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            self.running.store(false, Ordering::SeqCst);
        });

        Ok(SamplerHandle {
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

pub struct SamplerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("Pool sampler task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{CollectorConfig, ErrorTrackerConfig, ManualClock, SystemClock};
    use std::sync::atomic::AtomicU32;

    struct StepSource {
        checked_out: AtomicU32,
    }

    #[async_trait]
    impl PoolSource for StepSource {
        async fn pool_status(&self) -> Result<PoolStatus> {
            let checked_out = self.checked_out.fetch_add(1, Ordering::SeqCst);
            if checked_out > 10 {
                return Err(MonitorError::PoolSampling("pool gone".to_string()));
            }
            Ok(PoolStatus {
                pool_size: 10,
                checked_out,
                overflow: 0,
            })
        }
    }

    fn sampler_with_clock(
        start: u32,
        clock: Arc<dyn Clock>,
    ) -> (PoolSampler, Arc<MetricsCollector>, Arc<ErrorTracker>) {
        let metrics = Arc::new(MetricsCollector::with_clock(
            CollectorConfig::default(),
            clock.clone(),
        ));
        let errors = Arc::new(ErrorTracker::with_clock(
            ErrorTrackerConfig::default(),
            metrics.clone(),
            clock.clone(),
        ));
        let source = Arc::new(StepSource {
            checked_out: AtomicU32::new(start),
        });
        (
            PoolSampler::new(
                source,
                metrics.clone(),
                errors.clone(),
                clock,
                Duration::from_millis(10),
            ),
            metrics,
            errors,
        )
    }

    fn sampler(start: u32) -> (PoolSampler, Arc<MetricsCollector>, Arc<ErrorTracker>) {
        sampler_with_clock(start, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_sample_once_records_and_alerts() {
        let (sampler, metrics, errors) = sampler(9);

        let sample = sampler.sample_once().await.unwrap();
        assert_eq!(sample.checked_out, 9);
        assert_eq!(metrics.latest_pool_sample(), Some(sample));

        let alerts = errors.get_active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::PoolSaturation);
    }

    #[tokio::test]
    async fn test_source_error_propagates() {
        let (sampler, metrics, _) = sampler(11);
        assert!(sampler.sample_once().await.is_err());
        assert!(metrics.latest_pool_sample().is_none());
    }

    #[tokio::test]
    async fn test_ticks_build_health_history() {
        let (idle, _, _) = sampler(0);
        assert_eq!(idle.tick().await.status, HealthStatus::Healthy);

        let (busy, _, _) = sampler(9);
        let check = busy.tick().await;
        assert_eq!(check.status, HealthStatus::Degraded);
        assert_eq!(check.active_alerts, 1);
        assert_eq!(busy.tick().await.status, HealthStatus::Unhealthy);
        let failed = busy.tick().await;
        assert_eq!(failed.status, HealthStatus::Error);
        assert!(failed.pool.is_none());
        assert!(failed.error.as_deref().unwrap().contains("pool gone"));

        let history = busy.health_history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].status, HealthStatus::Error);
        assert_eq!(history[2].status, HealthStatus::Degraded);
        assert_eq!(busy.health_history(Some(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_health_history_is_bounded() {
        let (sampler, _, _) = sampler(0);
        let sampler = sampler.with_history_capacity(2);
        for _ in 0..5 {
            sampler.tick().await;
        }

        let status = sampler.status();
        assert_eq!(status.health_history_size, 2);
        assert_eq!(status.max_history_size, 2);
        assert_eq!(status.last_status, Some(HealthStatus::Healthy));
        assert_eq!(sampler.health_history(None)[0].pool.as_ref().unwrap().checked_out, 4);
    }

    #[tokio::test]
    async fn test_metrics_reset_after_period() {
        let clock = Arc::new(ManualClock::default());
        let (sampler, metrics, _) = sampler_with_clock(0, clock.clone());
        let sampler = sampler.with_metrics_reset(Some(Duration::from_secs(60)));
        let started = sampler.status().last_metrics_reset;

        sampler.tick().await;
        assert!(metrics.latest_pool_sample().is_some());
        assert_eq!(sampler.status().last_metrics_reset, started);

        clock.advance(chrono::Duration::seconds(61));
        sampler.tick().await;
        assert!(metrics.latest_pool_sample().is_none());

        let status = sampler.status();
        assert_eq!(status.last_metrics_reset, clock.now());
        assert_eq!(status.metrics_reset_seconds, Some(60));
        assert_eq!(status.health_history_size, 2);
    }

    #[tokio::test]
    async fn test_spawned_sampler_stops_on_shutdown() {
        let (sampler, metrics, _) = sampler(0);
        let handle = sampler.clone().spawn().unwrap();
        assert!(sampler.status().is_running);
        assert!(matches!(
            sampler.clone().spawn(),
            Err(MonitorError::SamplerRunning)
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;

        let trend = metrics.get_pool_trend(Duration::from_secs(60));
        assert!(trend.data_points >= 1);
        assert!(!sampler.status().is_running);
        assert!(!sampler.health_history(None).is_empty());

        let again = sampler.spawn().unwrap();
        again.shutdown().await;
    }

    #[test]
    fn test_assess_health_thresholds() {
        let now = Utc::now();
        assert_eq!(
            assess_health(&PoolSample::new(now, 10, 5, 0), &[], 0.8),
            HealthStatus::Healthy
        );
        assert_eq!(
            assess_health(&PoolSample::new(now, 10, 9, 0), &[], 0.8),
            HealthStatus::Degraded
        );
        assert_eq!(
            assess_health(&PoolSample::new(now, 10, 10, 0), &[], 0.8),
            HealthStatus::Unhealthy
        );
    }
}
