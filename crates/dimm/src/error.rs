//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use dimm_config::ConfigError;
use dimm_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not connect to the DIMM at {addr}")]
    #[diagnostic(
        code(dimm::connection_failed),
        help(
            "Check that the device (or `dimm mock`) is listening.\n\
             Reason: {reason}"
        )
    )]
    ConnectionFailed { addr: String, reason: String },

    #[error("Connection to the DIMM was lost: {reason}")]
    #[diagnostic(code(dimm::connection_lost))]
    ConnectionLost { reason: String },

    #[error("Gave up after {attempts} recovery attempts")]
    #[diagnostic(
        code(dimm::recovery_exhausted),
        help("Last fault: {reason}\nRaise --max-retries or fix the link and run again.")
    )]
    RecoveryExhausted { attempts: u32, reason: String },

    // ── Authentication ───────────────────────────────────────────────

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(dimm::auth_failed),
        help(
            "Check astelco.user and the password source\n\
             (astelco.password_env, DIMM_PASSWORD, or astelco.password)."
        )
    )]
    AuthFailed { message: String },

    // ── Device ───────────────────────────────────────────────────────

    #[error("Command timed out after {elapsed}")]
    #[diagnostic(
        code(dimm::timeout),
        help("Increase astelco.command_timeout_secs or check device responsiveness.")
    )]
    Timeout { elapsed: String },

    #[error("Device rejected the command: {message}")]
    #[diagnostic(code(dimm::rejected))]
    Rejected { message: String },

    #[error("Device reported an unusable value for {name}: {reason}")]
    #[diagnostic(code(dimm::data_quality))]
    DataQuality { name: String, reason: String },

    #[error("Seeing store error: {message}")]
    #[diagnostic(code(dimm::store), help("Check soar.source."))]
    Store { message: String },

    #[error("'{command}' needs the astelco controller, but {controller} is configured")]
    #[diagnostic(
        code(dimm::unsupported),
        help("Set `controller = \"astelco\"` or DIMM_CONTROLLER=astelco.")
    )]
    Unsupported { command: String, controller: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(dimm::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration file not found")]
    #[diagnostic(code(dimm::no_config), help("Expected at: {path}"))]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(dimm::config))]
    Config(Box<figment::Error>),

    #[error("Internal error: {0}")]
    #[diagnostic(code(dimm::internal))]
    Internal(String),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render output: {0}")]
    #[diagnostic(code(dimm::render))]
    Render(String),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. }
            | Self::ConnectionLost { .. }
            | Self::RecoveryExhausted { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. }
            | Self::NoConfig { .. }
            | Self::Config(_)
            | Self::Unsupported { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { addr, reason } => Self::ConnectionFailed { addr, reason },
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::ConnectionLost { reason } => Self::ConnectionLost { reason },
            CoreError::NotRunning => Self::ConnectionLost {
                reason: "controller is not running".into(),
            },
            CoreError::Timeout { elapsed } => Self::Timeout {
                elapsed: humantime::format_duration(elapsed).to_string(),
            },
            CoreError::Rejected { message } => Self::Rejected { message },
            CoreError::Saturated { limit } => Self::Rejected {
                message: format!("{limit} commands already outstanding"),
            },
            CoreError::DataQuality { name, reason } => Self::DataQuality { name, reason },
            CoreError::Store(e) => Self::Store {
                message: e.to_string(),
            },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Internal(message) => Self::Internal(message),
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::NotFound { path } => Self::NoConfig {
                path: path.display().to_string(),
            },
            ConfigError::Figment(e) => Self::Config(e),
            ConfigError::Serialization(e) => Self::Render(e.to_string()),
            ConfigError::Io(e) => Self::Io(e),
        }
    }
}
