//! Error handling for aistack.
use thiserror::Error;

/// Defines every error that can abort a stack operation.
///
/// Per-service problems (a binary that cannot be spawned, a service that never
/// becomes ready) are not errors: they are recorded as outcomes in the stack
/// report. These variants cover the controller's own failures.
#[derive(Debug, Error)]
pub enum StackError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A `${VAR}` reference in the stack file has no value in the environment.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A duration field could not be parsed.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),

    /// A `stop_pattern` is not a valid regular expression.
    #[error("Invalid stop pattern for service '{service}': {source}")]
    InvalidStopPattern {
        /// The service declaring the pattern.
        service: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Two services share a name.
    #[error("Service '{0}' is declared more than once")]
    DuplicateService(String),

    /// Two services claim the same port.
    #[error("Port {port} is claimed by both '{first}' and '{second}'")]
    DuplicatePort {
        /// The contested port.
        port: u16,
        /// The service that declared the port first.
        first: String,
        /// The service that declared it again.
        second: String,
    },

    /// A selection named a service the stack does not declare.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error serializing a report.
    #[error("Failed to render report: {0}")]
    ReportError(#[from] serde_json::Error),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing a PID file.
    #[error("Failed to access PID file: {0}")]
    Io(#[from] std::io::Error),

    /// The PID file does not contain a process id.
    #[error("PID file '{path}' does not contain a valid pid: '{contents}'")]
    Malformed {
        /// Path of the offending file.
        path: String,
        /// Trimmed file contents.
        contents: String,
    },
}
