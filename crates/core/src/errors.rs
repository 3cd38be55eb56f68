//! Error types and handling
//!
//! The error taxonomy follows the engine's layers: configuration, template
//! rendering, command execution. Each layer has its own enum and all of them
//! are wrapped in [`ShellresError`] for unified propagation.
//!
//! Line-decoding problems (bad base64, malformed JSON values) are not errors
//! at all: the output parser drops the offending line with a warning.

use crate::resource::AccessMode;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse provider configuration: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Provider configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read provider configuration")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Provider configuration not found: {path}")]
    NotFound { path: String },
}

/// Template-related errors
#[derive(Error, Debug)]
pub enum TemplateError {
    /// The template source could not be parsed
    #[error("Failed to parse template {name}: {message}")]
    Parse { name: String, message: String },

    /// The template parsed but evaluation failed
    #[error("Failed to render template {name}: {message}")]
    Render { name: String, message: String },

    /// The configured delimiters cannot be used
    #[error("Invalid template syntax: {message}")]
    Syntax { message: String },
}

/// Command execution errors
///
/// Every variant that involves a started or attempted process embeds the
/// command text and whatever output was captured, so the flat error message
/// is enough to diagnose a failure without the logs.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Interpreter argv resolved to nothing
    #[error("Interpreter is empty; cannot run `{command}`")]
    EmptyInterpreter { command: String },

    /// The interpreter process could not be started
    #[error("Failed to spawn `{command}`: {source}{}", format_output(.output))]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
        output: String,
    },

    /// The process ran and exited unsuccessfully
    #[error("Command `{command}` failed with {status}{}", format_output(.output))]
    Failed {
        command: String,
        status: String,
        output: String,
    },

    /// The process exceeded the configured timeout and was killed
    #[error("Command `{command}` timed out after {timeout_secs}s{}", format_output(.output))]
    Timeout {
        command: String,
        timeout_secs: u64,
        output: String,
    },

    /// Waiting on the process failed
    #[error("Failed to wait for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

fn format_output(output: &str) -> String {
    if output.trim().is_empty() {
        String::new()
    } else {
        format!("\noutput:\n{}", output.trim_end())
    }
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum ShellresError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Template-related errors
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Command execution errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// A host capability was requested from a variant that does not carry it
    #[error("{operation} is not supported during {mode}")]
    Unsupported {
        operation: &'static str,
        mode: AccessMode,
    },

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShellresError {
    /// Returns true for command execution failures (as opposed to template
    /// or configuration problems, which no retry can fix)
    pub fn is_command_failure(&self) -> bool {
        matches!(self, ShellresError::Command(_))
    }
}

/// Convenience type alias for Results with ShellresError
pub type Result<T> = std::result::Result<T, ShellresError>;
