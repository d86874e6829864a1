use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the dnsgate filtering engine
#[derive(Debug, Clone, Error)]
pub enum GateError {
    // IO errors
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    // Domain index errors
    #[error("index error: {0}")]
    Storage(String),
    #[error("staging index missing at {0}")]
    StagingMissing(String),

    // List ingestion errors
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out")]
    Timeout,
    #[error("download already in progress")]
    DownloadBusy,

    // Config / inventory errors
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),

    // Query path errors
    #[error("no next handler configured for plugin {0}")]
    NoNextHandler(String),
    #[error("metrics error: {0}")]
    Metrics(String),

    // Server state errors
    #[error("server is shutting down")]
    ServerShutdown,
}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::IoError(Arc::new(err))
    }
}

impl From<sled::Error> for GateError {
    fn from(err: sled::Error) -> Self {
        GateError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GateError::Timeout
        } else {
            GateError::Network(err.to_string())
        }
    }
}

impl From<prometheus::Error> for GateError {
    fn from(err: prometheus::Error) -> Self {
        GateError::Metrics(err.to_string())
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, GateError>;
