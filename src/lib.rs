pub mod config;
pub mod error;
pub mod monitoring;

pub use config::MonitorConfig;
pub use error::{MonitorError, Result};

// Re-export monitoring types
pub use monitoring::{
    classify_error, classify_query, Alert, AlertSeverity, AlertThresholds, AlertType,
    DatabaseError, DatabaseMonitor, ErrorKind, ErrorTracker, InstrumentedSession,
    Instrumentation, MetricsCollector, MonitorSnapshot, ObservedError, OperationContext,
    OperationKind, PoolSample, PoolSampler, PrometheusExporter, QueryMetric, QuerySignature,
};
