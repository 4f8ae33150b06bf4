use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Operation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Persistence error at {path}: {message}")]
    PersistenceError { path: String, message: String },

    #[error("Notification delivery failed: {message}")]
    NotificationError { message: String },

    #[error("Classification failed for {url}: {message}")]
    ClassificationError { url: String, message: String },

    #[error("Resource limit exceeded: {message}")]
    ResourceExhausted { message: String },

    #[error("Resource manager is shut down")]
    Shutdown,

    #[error("Worker panicked: {message}")]
    WorkerPanicked { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for {field} ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Persistence,
    Notification,
    Resource,
    Configuration,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl MonitorError {
    /// Default retry policy: connection-level failures, timeouts and 5xx
    /// responses are retried, 4xx responses never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            MonitorError::RequestError(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error()
                } else {
                    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
                }
            }
            MonitorError::HttpStatus { status, .. } => (500..600).contains(status),
            MonitorError::Timeout { .. } => true,
            MonitorError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            MonitorError::RequestError(_)
            | MonitorError::HttpStatus { .. }
            | MonitorError::Timeout { .. } => ErrorCategory::Network,
            MonitorError::IoError(_)
            | MonitorError::SerializationError(_)
            | MonitorError::PersistenceError { .. } => ErrorCategory::Persistence,
            MonitorError::NotificationError { .. } => ErrorCategory::Notification,
            MonitorError::ResourceExhausted { .. } | MonitorError::Shutdown => {
                ErrorCategory::Resource
            }
            MonitorError::ConfigError { .. }
            | MonitorError::InvalidConfigValueError { .. }
            | MonitorError::MissingConfigError { .. } => ErrorCategory::Configuration,
            MonitorError::Cancelled
            | MonitorError::ClassificationError { .. }
            | MonitorError::WorkerPanicked { .. } => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Notification => ErrorSeverity::Low,
            ErrorCategory::Network | ErrorCategory::Resource => ErrorSeverity::Medium,
            ErrorCategory::Persistence | ErrorCategory::Internal => ErrorSeverity::High,
            ErrorCategory::Configuration => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            MonitorError::HttpStatus { status, .. } if (400..500).contains(status) => {
                "Check that the target URL is still valid and publicly reachable"
            }
            MonitorError::RequestError(_)
            | MonitorError::HttpStatus { .. }
            | MonitorError::Timeout { .. } => {
                "Check network connectivity or raise retry.fetch_timeout_ms"
            }
            MonitorError::Cancelled | MonitorError::Shutdown => "The process is shutting down",
            MonitorError::IoError(_) | MonitorError::PersistenceError { .. } => {
                "Check that the state directory exists and is writable"
            }
            MonitorError::SerializationError(_) => {
                "The state file may be corrupt; a backup copy is kept next to it"
            }
            MonitorError::NotificationError { .. } => {
                "Check the notifier webhook URL and its credentials"
            }
            MonitorError::ClassificationError { .. } => {
                "Review the classifier patterns for this site"
            }
            MonitorError::ResourceExhausted { .. } => {
                "Raise resources.max_count or lower batch.concurrency"
            }
            MonitorError::WorkerPanicked { .. } => "This is a bug; please report it with logs",
            MonitorError::ConfigError { .. }
            | MonitorError::InvalidConfigValueError { .. }
            | MonitorError::MissingConfigError { .. } => {
                "Fix the configuration file and run again"
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Network => format!("Could not reach the product page: {}", self),
            ErrorCategory::Persistence => format!("Could not read or write state: {}", self),
            ErrorCategory::Notification => format!("Could not send notification: {}", self),
            ErrorCategory::Resource => format!("Resource problem: {}", self),
            ErrorCategory::Configuration => format!("Invalid configuration: {}", self),
            ErrorCategory::Internal => format!("Internal error: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
