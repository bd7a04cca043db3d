//! Error types for the fuhlen-monitor daemon.
//!
//! Each component gets its own error enum. Nothing here is fatal to the
//! tick loop: the monitor turns these into counters and log lines.

use thiserror::Error;

/// Errors raised while locating the device in sysfs.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No device matching {vendor:04x}:{product:04x} found under '{root}'")]
    NotFound {
        vendor: u16,
        product: u16,
        root: String,
    },

    #[error("Failed to scan '{path}': {source}")]
    ScanFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed sysfs attribute '{path}': {value:?}")]
    MalformedAttribute { path: String, value: String },
}

/// Errors raised by a single battery probe.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Device discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to open USB device node '{path}': {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("USB {operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Device disappeared during {operation}")]
    DeviceGone { operation: &'static str },

    #[error("Transfer timed out")]
    Timeout,

    #[error("Malformed response frame: {0}")]
    MalformedFrame(String),

    #[error("No valid response after {attempts} attempts")]
    NoResponse { attempts: u32 },

    #[error("Raw battery byte {raw} maps outside 0-100%")]
    OutOfRange { raw: u8 },

    #[error("USB transport not available on this platform")]
    Unsupported,
}

impl ProbeError {
    /// Short stable label used for diagnostics counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Discovery(_) => "discovery",
            ProbeError::OpenFailed { .. }
            | ProbeError::Transport { .. }
            | ProbeError::DeviceGone { .. }
            | ProbeError::Unsupported => "transport",
            ProbeError::Timeout | ProbeError::NoResponse { .. } => "timeout",
            ProbeError::MalformedFrame(_) => "malformed",
            ProbeError::OutOfRange { .. } => "out_of_range",
        }
    }

    /// Whether the retry executor should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProbeError::Timeout | ProbeError::MalformedFrame(_) | ProbeError::Transport { .. }
        )
    }
}

/// Errors related to the status files.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to replace '{path}': {source}")]
    RenameFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize status record: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration '{path}': {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Errors related to logging initialization.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Could not determine the local data directory")]
    DataDirectoryNotFound,

    #[error("Failed to create log directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file appender: {0}")]
    AppenderCreationFailed(String),
}
