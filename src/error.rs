use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Alert not found: {id}")]
    AlertNotFound { id: Uuid },

    #[error("Notifier '{notifier}' failed: {message}")]
    Notification { notifier: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pool sampling failed: {0}")]
    PoolSampling(String),

    #[error("Pool sampler is already running")]
    SamplerRunning,

    #[error("Metrics export error: {0}")]
    Export(#[from] prometheus::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
