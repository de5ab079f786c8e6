//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError`, `ConfigError` and connection-spec failures into
//! user-facing errors with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use devbus_config::ConfigError;
use devbus_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFIG: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection spec ──────────────────────────────────────────────

    #[error("Invalid connection spec '{spec}'")]
    #[diagnostic(
        code(devbus::invalid_spec),
        help(
            "{reason}\n\
             Expected host:port or host:port,host:port (for example db:10000)."
        )
    )]
    InvalidSpec { spec: String, reason: String },

    #[error("No database configured")]
    #[diagnostic(
        code(devbus::no_database),
        help(
            "Set TANGO_HOST, pass a spec on the command line, or set tango_host\n\
             or file_database in {path}"
        )
    )]
    NoDatabase { path: String },

    #[error("No file database configured")]
    #[diagnostic(
        code(devbus::no_file_database),
        help(
            "Pass --file <path> or set file_database in {path}\n\
             Remote databases are not reachable from this tool."
        )
    )]
    NoFileDatabase { path: String },

    // ── Resources ────────────────────────────────────────────────────

    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(code(devbus::not_found), help("{hint}"))]
    NotFound {
        resource_type: String,
        identifier: String,
        hint: String,
    },

    // ── Runtime ──────────────────────────────────────────────────────

    #[error("{message}")]
    #[diagnostic(code(devbus::core), help("Reason: {reason}"))]
    Core {
        message: String,
        reason: String,
        exit: i32,
    },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(devbus::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration file already exists")]
    #[diagnostic(
        code(devbus::config_exists),
        help("Use --force to overwrite {path}")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(
        code(devbus::config),
        help("Check the configuration file and DEVBUS_* environment variables.")
    )]
    Config(Box<ConfigError>),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(devbus::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render YAML: {0}")]
    #[diagnostic(code(devbus::yaml))]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to render TOML: {0}")]
    #[diagnostic(code(devbus::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } => exit_code::USAGE,
            Self::InvalidSpec { .. }
            | Self::NoDatabase { .. }
            | Self::NoFileDatabase { .. }
            | Self::ConfigExists { .. }
            | Self::Config(_) => exit_code::CONFIG,
            Self::Core { exit, .. } => *exit,
            _ => exit_code::GENERAL,
        }
    }
}

// ── Library error mapping ────────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<devbus_api::Error> for CliError {
    fn from(err: devbus_api::Error) -> Self {
        match err {
            devbus_api::Error::InvalidSpec { spec, reason } => Self::InvalidSpec { spec, reason },
            other => CoreError::from(other).into(),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        let exit = if err.is_not_found() {
            exit_code::NOT_FOUND
        } else if err.is_config() {
            exit_code::CONFIG
        } else {
            exit_code::GENERAL
        };
        Self::Core {
            reason: err.reason().to_string(),
            message: err.to_string(),
            exit,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use devbus_api::Reason;

    use super::*;

    #[test]
    fn test_core_not_found_exits_with_4() {
        let err = CliError::from(CoreError::attr_not_found("Attribute speed not found"));
        assert_eq!(err.exit_code(), exit_code::NOT_FOUND);
        assert_eq!(err.to_string(), "Attribute speed not found");
    }

    #[test]
    fn test_core_config_exits_with_6() {
        let err = CliError::from(CoreError::config(
            Reason::BadConfigurationProperty,
            "odd number of elements",
        ));
        assert_eq!(err.exit_code(), exit_code::CONFIG);
    }

    #[test]
    fn test_spec_error_keeps_the_spec() {
        let api = "db".parse::<devbus_api::ConnectionSpec>().unwrap_err();
        let err = CliError::from(api);
        assert!(matches!(&err, CliError::InvalidSpec { spec, .. } if spec == "db"));
        assert_eq!(err.exit_code(), exit_code::CONFIG);
    }

    #[test]
    fn test_timeouts_are_general_failures() {
        let err = CliError::from(CoreError::timed_out("poll thread did not answer"));
        assert_eq!(err.exit_code(), exit_code::GENERAL);
    }
}
