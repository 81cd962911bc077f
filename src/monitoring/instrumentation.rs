//! Wraps database operations so that every exit path, including errors,
//! timeouts, cancellation and panics, is recorded exactly once.

use super::classifier::{classify_error, classify_query};
use super::clock::Clock;
use super::errors::ErrorTracker;
use super::metrics::{ConnectionEvent, MetricsCollector};
use super::{AlertType, DatabaseError, ErrorKind, OperationKind, Outcome, QueryMetric, QuerySignature};
use crate::error::MonitorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::error::Elapsed;
use tracing::debug;

/// An error that can be classified into an `ErrorKind`.
pub trait ObservedError: fmt::Display {
    fn error_kind(&self) -> ErrorKind {
        classify_error(&self.to_string())
    }
}

impl ObservedError for sqlx::Error {
    fn error_kind(&self) -> ErrorKind {
        match self {
            sqlx::Error::PoolTimedOut => ErrorKind::PoolExhaustion,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                ErrorKind::ConnectionFailure
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("40P01") => ErrorKind::Deadlock,
                Some("57014") => ErrorKind::Timeout,
                Some("53300") => ErrorKind::PoolExhaustion,
                Some(code) if code.starts_with("08") => ErrorKind::ConnectionFailure,
                _ => classify_error(db.message()),
            },
            other => classify_error(&other.to_string()),
        }
    }
}

impl ObservedError for anyhow::Error {}

impl ObservedError for std::io::Error {}

impl ObservedError for String {}

impl ObservedError for MonitorError {}

impl ObservedError for Elapsed {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

/// Who is running an operation and against what.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    pub operation_name: String,
    pub signature: QuerySignature,
    pub session_id: Option<String>,
}

impl OperationContext {
    pub fn new(operation_name: impl Into<String>, kind: OperationKind, target: Option<&str>) -> Self {
        Self {
            operation_name: operation_name.into(),
            signature: QuerySignature::new(kind, target.map(str::to_string)),
            session_id: None,
        }
    }

    /// Derive the signature from the statement text.
    pub fn from_sql(operation_name: impl Into<String>, sql: &str) -> Self {
        Self {
            operation_name: operation_name.into(),
            signature: classify_query(sql),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Default)]
pub struct SessionCounters {
    queries: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
}

impl SessionCounters {
    fn record(&self, elapsed: Duration, failed: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Records the operation on drop unless `succeed` or `fail` ran first.
/// Dropping an unfinished guard counts as cancellation, or as a failure
/// when the thread is unwinding.
pub struct OperationGuard {
    instrumentation: Instrumentation,
    context: Option<OperationContext>,
    session: Option<Arc<SessionCounters>>,
    started: Instant,
}

impl OperationGuard {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn succeed(mut self) {
        if let Some(context) = self.context.take() {
            self.finish(context, None);
        }
    }

    pub fn fail(mut self, kind: ErrorKind, message: impl Into<String>) {
        if let Some(context) = self.context.take() {
            self.finish(context, Some((kind, message.into())));
        }
    }

    fn finish(&self, context: OperationContext, failure: Option<(ErrorKind, String)>) {
        let elapsed = self.started.elapsed();
        if let Some(session) = &self.session {
            session.record(elapsed, failure.is_some());
        }
        self.instrumentation.complete(context, elapsed, failure);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            let failure = if std::thread::panicking() {
                (ErrorKind::Unknown, "operation panicked".to_string())
            } else {
                (
                    ErrorKind::Cancelled,
                    "operation cancelled before completion".to_string(),
                )
            };
            self.finish(context, Some(failure));
        }
    }
}

/// Entry point for timing database operations.
#[derive(Debug, Clone)]
pub struct Instrumentation {
    metrics: Arc<MetricsCollector>,
    errors: Arc<ErrorTracker>,
    clock: Arc<dyn Clock>,
}

impl Instrumentation {
    pub fn new(
        metrics: Arc<MetricsCollector>,
        errors: Arc<ErrorTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metrics,
            errors,
            clock,
        }
    }

    pub fn start(&self, context: OperationContext) -> OperationGuard {
        self.start_with(context, None)
    }

    fn start_with(
        &self,
        context: OperationContext,
        session: Option<Arc<SessionCounters>>,
    ) -> OperationGuard {
        OperationGuard {
            instrumentation: self.clone(),
            context: Some(context),
            session,
            started: Instant::now(),
        }
    }

    /// Run `operation`, recording its duration and outcome. The result is
    /// returned untouched.
    pub async fn observe<T, E, F>(&self, context: OperationContext, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: ObservedError,
    {
        let guard = self.start(context);
        let result = operation.await;
        settle(guard, &result);
        result
    }

    /// Like `observe`, but abandons the operation after `limit`. A timeout is
    /// recorded as `ErrorKind::Timeout` and surfaces as the outer `Err`.
    pub async fn observe_with_timeout<T, E, F>(
        &self,
        context: OperationContext,
        limit: Duration,
        operation: F,
    ) -> Result<Result<T, E>, Elapsed>
    where
        F: Future<Output = Result<T, E>>,
        E: ObservedError,
    {
        let guard = self.start(context);
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => {
                settle(guard, &result);
                Ok(result)
            }
            Err(elapsed) => {
                guard.fail(
                    ErrorKind::Timeout,
                    format!("operation timed out after {}ms", limit.as_millis()),
                );
                Err(elapsed)
            }
        }
    }

    pub fn observe_sync<T, E, F>(&self, context: OperationContext, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: ObservedError,
    {
        let guard = self.start(context);
        let result = operation();
        settle(guard, &result);
        result
    }

    /// Open a session. Its id is tracked as a connection until `close` runs
    /// or the last clone is dropped.
    pub fn session(&self, session_id: impl Into<String>) -> InstrumentedSession {
        let id = session_id.into();
        self.metrics
            .record_connection_event(&id, ConnectionEvent::Created);
        InstrumentedSession {
            lifecycle: Arc::new(SessionLifecycle {
                id: id.clone(),
                metrics: self.metrics.clone(),
                closed: AtomicBool::new(false),
            }),
            id,
            instrumentation: self.clone(),
            created_at: self.clock.now(),
            counters: Arc::new(SessionCounters::default()),
        }
    }

    fn complete(
        &self,
        context: OperationContext,
        elapsed: Duration,
        failure: Option<(ErrorKind, String)>,
    ) {
        let now = self.clock.now();
        let outcome = if failure.is_some() {
            Outcome::Failure
        } else {
            Outcome::Success
        };

        let mut metric = QueryMetric::new(now, context.signature.clone(), elapsed, outcome)
            .with_operation(context.operation_name.clone());
        if let Some(session_id) = &context.session_id {
            metric = metric.with_session(session_id.clone());
        }
        let threshold = self.metrics.slow_query_threshold();
        let slow = elapsed > threshold;
        self.metrics.record_query(metric);
        if let Some(session_id) = &context.session_id {
            self.metrics.record_connection_event(
                session_id,
                ConnectionEvent::Used {
                    duration: elapsed,
                    success: failure.is_none(),
                },
            );
        }

        match failure {
            None => {
                debug!(
                    "{} completed in {:.2}ms",
                    context.operation_name,
                    elapsed.as_secs_f64() * 1000.0
                );
                self.errors.record_success(&context.operation_name);
                if slow {
                    let mut issue = DatabaseError::slow_operation(
                        now,
                        context.operation_name,
                        elapsed,
                        threshold,
                    )
                    .with_signature(context.signature);
                    if let Some(session_id) = context.session_id {
                        issue = issue.with_session(session_id);
                    }
                    self.errors.record_performance_issue(issue);
                }
            }
            Some((kind, message)) => {
                let mut error = DatabaseError::new(now, kind, context.operation_name, message)
                    .with_signature(context.signature)
                    .with_elapsed(elapsed);
                if let Some(session_id) = context.session_id {
                    error = error.with_session(session_id);
                }
                self.errors.record_error(error);
                if slow {
                    self.errors.evaluate(AlertType::SlowQueries);
                }
            }
        }
    }
}

fn settle<T, E: ObservedError>(guard: OperationGuard, result: &Result<T, E>) {
    match result {
        Ok(_) => guard.succeed(),
        Err(e) => guard.fail(e.error_kind(), e.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub query_count: u64,
    pub error_count: u64,
    pub total_execution_ms: f64,
    pub avg_query_ms: f64,
    pub success_rate: f64,
}

/// Records the connection close once, on `close` or when the last session
/// clone goes away.
#[derive(Debug)]
struct SessionLifecycle {
    id: String,
    metrics: Arc<MetricsCollector>,
    closed: AtomicBool,
}

impl SessionLifecycle {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.metrics
                .record_connection_event(&self.id, ConnectionEvent::Closed);
        }
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Instrumentation bound to one logical session. Operations are tagged with
/// the session id and tallied in per-session counters.
#[derive(Debug, Clone)]
pub struct InstrumentedSession {
    id: String,
    instrumentation: Instrumentation,
    created_at: DateTime<Utc>,
    counters: Arc<SessionCounters>,
    lifecycle: Arc<SessionLifecycle>,
}

impl InstrumentedSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mark the session's connection closed. Later operations are still
    /// recorded but no longer counted against the connection.
    pub fn close(&self) {
        self.lifecycle.close();
    }

    pub fn start(&self, context: OperationContext) -> OperationGuard {
        self.instrumentation
            .start_with(context.with_session(self.id.clone()), Some(self.counters.clone()))
    }

    pub async fn observe<T, E, F>(&self, context: OperationContext, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: ObservedError,
    {
        let guard = self.start(context);
        let result = operation.await;
        settle(guard, &result);
        result
    }

    /// Classify `sql` and observe the operation under `operation_name`.
    pub async fn execute<T, E, F>(&self, operation_name: &str, sql: &str, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: ObservedError,
    {
        self.observe(OperationContext::from_sql(operation_name, sql), operation)
            .await
    }

    pub fn stats(&self) -> SessionStats {
        let queries = self.counters.queries.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);
        let total_ms = self.counters.total_micros.load(Ordering::Relaxed) as f64 / 1000.0;
        let age = self.instrumentation.clock.now() - self.created_at;

        SessionStats {
            session_id: self.id.clone(),
            created_at: self.created_at,
            duration_seconds: age.num_milliseconds() as f64 / 1000.0,
            query_count: queries,
            error_count: errors,
            total_execution_ms: total_ms,
            avg_query_ms: if queries > 0 {
                total_ms / queries as f64
            } else {
                0.0
            },
            success_rate: if queries > 0 {
                (queries - errors) as f64 / queries as f64
            } else {
                1.0
            },
        }
    }
}
