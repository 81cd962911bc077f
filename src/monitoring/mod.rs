pub mod alerts;
pub mod classifier;
pub mod clock;
pub mod errors;
pub mod exporter;
pub mod instrumentation;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod ring_buffer;
pub mod sampler;

pub use alerts::*;
pub use classifier::{classify_error, classify_query};
pub use clock::{window_start, Clock, ManualClock, SystemClock};
pub use errors::*;
pub use exporter::PrometheusExporter;
pub use instrumentation::*;
pub use metrics::*;
pub use monitor::{DatabaseMonitor, MonitorSnapshot};
pub use notify::*;
pub use ring_buffer::RingBuffer;
pub use sampler::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

/// Lock access that recovers the guard from a poisoned lock.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Select,
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Select => "SELECT",
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(operation_kind, target_name)` pair used to group similar operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuerySignature {
    pub kind: OperationKind,
    pub target: Option<String>,
}

impl QuerySignature {
    /// Blank or control-character targets fall into the `None` bucket.
    pub fn new(kind: OperationKind, target: Option<String>) -> Self {
        let target = target
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && !t.chars().any(char::is_control));
        Self { kind, target }
    }

    pub fn other() -> Self {
        Self {
            kind: OperationKind::Other,
            target: None,
        }
    }

    pub fn target_label(&self) -> &str {
        self.target.as_deref().unwrap_or("-")
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target_label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Timing and outcome of one completed database operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetric {
    pub timestamp: DateTime<Utc>,
    pub signature: QuerySignature,
    pub operation_name: String,
    pub duration: Duration,
    pub outcome: Outcome,
    pub session_id: Option<String>,
}

impl QueryMetric {
    pub fn new(
        timestamp: DateTime<Utc>,
        signature: QuerySignature,
        duration: Duration,
        outcome: Outcome,
    ) -> Self {
        let operation_name = signature.to_string();
        Self {
            timestamp,
            signature,
            operation_name,
            duration,
            outcome,
            session_id: None,
        }
    }

    pub fn with_operation(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = operation_name.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_nanos() as f64 / 1_000_000.0
    }
}

/// Point-in-time connection pool occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSample {
    pub timestamp: DateTime<Utc>,
    pub pool_size: u32,
    pub checked_out: u32,
    pub overflow: u32,
    pub utilization: f64,
}

impl PoolSample {
    pub fn new(timestamp: DateTime<Utc>, pool_size: u32, checked_out: u32, overflow: u32) -> Self {
        let capacity = pool_size as u64 + overflow as u64;
        let utilization = if capacity > 0 {
            checked_out as f64 / capacity as f64
        } else {
            0.0
        };
        Self {
            timestamp,
            pool_size,
            checked_out,
            overflow,
            utilization,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.pool_size as u64 + self.overflow as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionFailure,
    PoolExhaustion,
    Timeout,
    Deadlock,
    SlowQuery,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailure => "connection_failure",
            ErrorKind::PoolExhaustion => "pool_exhaustion",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::SlowQuery => "slow_query",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one database operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseError {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub operation_name: String,
    pub message: String,
    pub session_id: Option<String>,
    pub signature: Option<QuerySignature>,
    pub elapsed: Option<Duration>,
}

impl DatabaseError {
    pub fn new(
        timestamp: DateTime<Utc>,
        kind: ErrorKind,
        operation_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            kind,
            operation_name: operation_name.into(),
            message: message.into(),
            session_id: None,
            signature: None,
            elapsed: None,
        }
    }

    /// Build an error whose kind is inferred from the message text.
    pub fn classified(
        timestamp: DateTime<Utc>,
        operation_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let kind = classify_error(&message);
        Self::new(timestamp, kind, operation_name, message)
    }

    /// Record of an operation that succeeded but ran past `threshold`.
    pub fn slow_operation(
        timestamp: DateTime<Utc>,
        operation_name: impl Into<String>,
        elapsed: Duration,
        threshold: Duration,
    ) -> Self {
        let operation_name = operation_name.into();
        let message = format!(
            "{} took {:.3}s (threshold: {}s)",
            operation_name,
            elapsed.as_secs_f64(),
            threshold.as_secs_f64()
        );
        Self::new(timestamp, ErrorKind::SlowQuery, operation_name, message).with_elapsed(elapsed)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_signature(mut self, signature: QuerySignature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}
