use fleet_worker::WorkerError;
use thiserror::Error;

/// Errors that can occur while preparing or running a fleet job.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Configuration error (missing descriptor, invalid selection, no devices)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device query tool failed or printed something unparseable
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Benchmark workload crashed, timed out or printed no time
    #[error("Benchmark error: {0}")]
    Benchmark(String),

    /// Resource creation failed (missing image, rejected device binding)
    #[error("Launch error: {0}")]
    Launch(String),

    /// Failure while the job is running (unit crash, runtime unreachable)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Operator interrupt
    #[error("Interrupted")]
    Interrupted,

    /// Capability registry error
    #[error("Registry error: {0}")]
    Registry(#[from] WorkerError),

    /// IO error occurred (file operations, process spawn, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, FleetError>;

impl From<toml::ser::Error> for FleetError {
    fn from(e: toml::ser::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(e: toml::de::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

impl From<bollard::errors::Error> for FleetError {
    fn from(e: bollard::errors::Error) -> Self {
        FleetError::Runtime(e.to_string())
    }
}
