//! Error types for the test runner
//!
//! Orchestration faults inside a running test are never raised as errors:
//! they end up as failed checklist items. This type covers the boundaries
//! (plan loading, bus setup, process launch, storage output).

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the test runner
#[derive(Error, Debug)]
pub enum Error {
    // === Run Errors ===
    #[error("Test run is already running")]
    RunAlreadyStarted,

    #[error("No test or scenario named '{0}' is registered")]
    UnknownTest(String),

    #[error("Test '{0}' is registered twice")]
    DuplicateTest(String),

    #[error("Invalid arguments for '{test}': {reason}")]
    InvalidArguments { test: String, reason: String },

    #[error("Invalid expected-failure pattern: {0}")]
    InvalidExpectedFailure(String),

    #[error("Monitor '{monitor}' does not apply to test '{test}'")]
    MonitorNotApplicable { monitor: String, test: String },

    // === Bus Errors ===
    #[error("Failed to create private bus at '{address}': {source}")]
    BusSetup {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to bus at '{address}': {source}")]
    BusConnect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Environment variable {0} is not set; this process must be launched by the test runner")]
    MissingEnvironment(&'static str),

    #[error("Bus protocol error: {0}")]
    BusProtocol(String),

    #[error("Remote call '{method}' failed: {message}")]
    RemoteCallFailed { method: String, message: String },

    // === Process Errors ===
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Launcher command is empty")]
    EmptyLauncher,

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Invalid run plan '{path}': {reason}")]
    PlanParse { path: String, reason: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("Failed to write file '{path}': {error}")]
    FileWrite { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid arguments error
    pub fn invalid_arguments(test: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            test: test.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a remote call failed error
    pub fn remote_call_failed(method: &str, message: &str) -> Self {
        Self::RemoteCallFailed {
            method: method.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a plan parse error
    pub fn plan_parse(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::PlanParse {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Bus-serializable error carried in failed method replies
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Error::BusProtocol(_) => "PROTOCOL_ERROR",
            Error::RemoteCallFailed { .. } => "CALL_FAILED",
            Error::SpawnFailed { .. } | Error::EmptyLauncher => "SPAWN_FAILED",
            Error::Io(_) | Error::FileRead { .. } | Error::FileWrite { .. } => "IO_ERROR",
            _ => "INTERNAL_ERROR",
        };

        Self::new(code, e.to_string())
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e.code.as_str() {
            "INVALID_ARGUMENTS" => Error::invalid_arguments("remote", e.message),
            "PROTOCOL_ERROR" => Error::BusProtocol(e.message),
            _ => Error::RemoteCallFailed {
                method: e.code,
                message: e.message,
            },
        }
    }
}
