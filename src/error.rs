use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisageError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl VisageError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the failing operation may succeed if attempted again
    pub fn is_recoverable(&self) -> bool {
        match self {
            VisageError::Capture(e) => e.is_transient(),
            VisageError::Detection(_) => true,
            VisageError::Storage(_) => true,
            VisageError::Notify(_) => true,
            VisageError::Io(_) => true,
            VisageError::Config(_)
            | VisageError::Stream(_)
            | VisageError::Serialization(_)
            | VisageError::System { .. }
            | VisageError::Component { .. } => false,
        }
    }
}

/// Invalid or unloadable configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn invalid<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Frame source failures
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("capture device unavailable: {details}")]
    DeviceUnavailable { details: String },

    #[error("capture device disconnected: {details}")]
    Disconnected { details: String },

    #[error("no frame within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("unexpected frame format: {details}")]
    BadFormat { details: String },

    #[error("frame source is not open")]
    NotOpen,

    #[error("capture pipeline error: {details}")]
    Pipeline { details: String },
}

impl CaptureError {
    /// Transient errors are retried in place before the source is reopened
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::Timeout { .. }
                | CaptureError::Disconnected { .. }
                | CaptureError::BadFormat { .. }
        )
    }
}

/// Classifier and motion analysis failures
#[derive(Error, Debug, Clone)]
pub enum DetectionError {
    #[error("malformed frame: {details}")]
    MalformedFrame { details: String },

    #[error("detector model error: {details}")]
    Model { details: String },

    #[error("detection task aborted: {details}")]
    Aborted { details: String },
}

/// Event persistence and snapshot failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to encode image: {details}")]
    Encode { details: String },

    #[error("failed to load overlay font '{path}': {details}")]
    Font { path: String, details: String },
}

/// Notifier delivery failures
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("event delivery failed: {details}")]
    Delivery { details: String },

    #[error("receiver lagged behind by {skipped} events")]
    Lagged { skipped: u64 },

    #[error("event bus closed")]
    Closed,
}

/// HTTP surface failures
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream server failed: {details}")]
    StartupFailed { details: String },

    #[error("frame {sequence} could not be prepared for streaming: {details}")]
    Encode { sequence: u64, details: String },
}

pub type Result<T> = std::result::Result<T, VisageError>;
