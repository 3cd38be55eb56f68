//! Provider configuration
//!
//! Everything the engine needs that is shared by all resource instances of
//! one provider: command templates, interpreter, template syntax, output
//! encoding, probe markers, failure policies and logging. The structure is
//! plain serde so the host can load it from TOML (see
//! [`ProviderConfig::load`]) or build it in code.
//!
//! Every field has a default, so an empty document is a valid (idle)
//! provider.
//!
//! ```toml
//! interpreter = "/bin/bash -euo pipefail -c"
//! output_format = "base64"
//! delete_on_read_failure = true
//!
//! [commands]
//! create = "echo '{{ content }}' > {{ path }}"
//! read = "echo out=$(base64 -w0 < {{ path }})"
//! delete = "rm -f {{ path }}"
//! ```

use crate::errors::{ConfigError, Result};
use crate::redaction::RedactionConfig;
use crate::scoped_log::{JsonFileSink, LogLevel, LogSink, Logger, TracingSink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Default size of the buffer whose contents become a command's stdout
pub const DEFAULT_STDOUT_CAPTURE_BYTES: usize = 1024 * 1024;

/// Default size of the combined stdout/stderr tail kept for error messages
pub const DEFAULT_ERROR_CAPTURE_BYTES: usize = 8 * 1024;

/// Command templates for each lifecycle step
///
/// Every entry is optional; what is missing decides the fallback behaviour
/// of the lifecycle (for example update without an update command becomes
/// delete followed by create).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandTemplates {
    pub create: Option<String>,
    pub read: Option<String>,
    pub update: Option<String>,
    pub delete: Option<String>,
    pub exists: Option<String>,
    /// Stdout of this command becomes the resource id verbatim
    pub id: Option<String>,
    pub needs_update: Option<String>,
    pub needs_delete: Option<String>,
    /// Probe deciding whether create/update may run at all
    pub dependencies: Option<String>,
    /// Prepended to create and update commands
    pub modify_prefix: Option<String>,
}

/// Encoding of values in `key=value` output lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Value used verbatim
    #[default]
    Raw,
    /// Value is standard base64
    Base64,
    /// Value is a JSON document; strings are unwrapped, anything else is
    /// kept as compact JSON text
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::Base64 => "base64",
            OutputFormat::Json => "json",
        }
    }
}

/// Template delimiters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateSyntax {
    pub variable_start: String,
    pub variable_end: String,
    pub block_start: String,
    pub block_end: String,
    pub comment_start: String,
    pub comment_end: String,
}

impl Default for TemplateSyntax {
    fn default() -> Self {
        Self {
            variable_start: "{{".to_string(),
            variable_end: "}}".to_string(),
            block_start: "{%".to_string(),
            block_end: "%}".to_string(),
            comment_start: "{#".to_string(),
            comment_end: "#}".to_string(),
        }
    }
}

impl TemplateSyntax {
    /// Whether `text` contains anything the renderer would interpret
    ///
    /// Used to skip rendering of plain values.
    pub fn is_templated(&self, text: &str) -> bool {
        text.contains(self.variable_start.as_str())
            || text.contains(self.block_start.as_str())
            || text.contains(self.comment_start.as_str())
    }
}

/// Interpreter argv, as a list or a single shell-words string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InterpreterSpec {
    Argv(Vec<String>),
    Line(String),
}

/// Logging settings for the engine's scoped logger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// Minimum level forwarded to the tracing sink
    pub level: LogLevel,
    /// Optional JSON-lines log file
    pub file: Option<PathBuf>,
}

impl LogSettings {
    /// Root engine logger: a tracing sink plus the optional JSON file sink
    pub fn build_logger(&self) -> Result<Logger> {
        let mut sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(TracingSink::new(self.level))];
        if let Some(path) = &self.file {
            let sink = JsonFileSink::open(path, self.level).map_err(ConfigError::Io)?;
            sinks.push(Arc::new(sink));
        }
        Ok(Logger::new(sinks, RedactionConfig::default()))
    }
}

/// Provider-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub commands: CommandTemplates,
    /// Interpreter argv template; `None` selects the platform default
    pub interpreter: Option<InterpreterSpec>,
    /// Joins command fragments (modify prefix and command) into one script
    pub command_separator: String,
    pub syntax: TemplateSyntax,
    /// Seed the environment with the parent process environment
    pub inherit_environment: bool,
    /// Mirror every old environment entry under this prefix
    pub environment_old_prefix: Option<String>,
    /// Mirror every new environment entry under this prefix
    pub environment_new_prefix: Option<String>,
    pub output_format: OutputFormat,
    /// Only read-output lines starting with this prefix are parsed
    pub output_line_prefix: Option<String>,
    /// Exists-probe output meaning "the entity is gone"
    pub exists_missing_marker: String,
    pub needs_update_marker: String,
    pub needs_delete_marker: String,
    pub dependencies_met_marker: String,
    /// Treat a failing read as "the entity no longer exists"
    pub delete_on_read_failure: bool,
    /// Clear the resource when the exists probe says it is gone
    pub delete_on_not_exists: bool,
    /// Kill commands that run longer than this; no timeout when absent
    pub timeout_secs: Option<u64>,
    pub working_directory: Option<PathBuf>,
    pub stdout_capture_bytes: usize,
    pub error_capture_bytes: usize,
    /// Attach pid and resource id to forwarded command output lines
    pub annotate_processes: bool,
    pub log: LogSettings,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            commands: CommandTemplates::default(),
            interpreter: None,
            command_separator: "\n".to_string(),
            syntax: TemplateSyntax::default(),
            inherit_environment: true,
            environment_old_prefix: None,
            environment_new_prefix: None,
            output_format: OutputFormat::Raw,
            output_line_prefix: None,
            exists_missing_marker: "false".to_string(),
            needs_update_marker: "true".to_string(),
            needs_delete_marker: "true".to_string(),
            dependencies_met_marker: "true".to_string(),
            delete_on_read_failure: false,
            delete_on_not_exists: false,
            timeout_secs: None,
            working_directory: None,
            stdout_capture_bytes: DEFAULT_STDOUT_CAPTURE_BYTES,
            error_capture_bytes: DEFAULT_ERROR_CAPTURE_BYTES,
            annotate_processes: true,
            log: LogSettings::default(),
        }
    }
}

/// Platform default interpreter
pub fn default_interpreter() -> Vec<String> {
    if cfg!(target_os = "windows") {
        vec!["cmd".to_string(), "/C".to_string()]
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string()]
    }
}

impl ProviderConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ProviderConfig = toml::from_str(source).map_err(|e| ConfigError::Parsing {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let source = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config = Self::from_toml_str(&source)?;
        debug!("Loaded provider configuration");
        Ok(config)
    }

    /// Resolved interpreter argv template
    pub fn interpreter_argv(&self) -> Result<Vec<String>> {
        let argv = match &self.interpreter {
            None => default_interpreter(),
            Some(InterpreterSpec::Argv(argv)) => argv.clone(),
            Some(InterpreterSpec::Line(line)) => {
                shell_words::split(line).map_err(|e| ConfigError::Validation {
                    message: format!("interpreter '{}' cannot be split: {}", line, e),
                })?
            }
        };
        if argv.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ConfigError::Validation {
                message: "interpreter must name a program".to_string(),
            }
            .into());
        }
        Ok(argv)
    }

    /// Command timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.interpreter_argv()?;

        let syntax = &self.syntax;
        let delimiters = [
            ("variable_start", &syntax.variable_start),
            ("variable_end", &syntax.variable_end),
            ("block_start", &syntax.block_start),
            ("block_end", &syntax.block_end),
            ("comment_start", &syntax.comment_start),
            ("comment_end", &syntax.comment_end),
        ];
        for (name, value) in delimiters {
            if value.is_empty() {
                return Err(ConfigError::Validation {
                    message: format!("syntax.{} must not be empty", name),
                }
                .into());
            }
        }
        if syntax.variable_start == syntax.block_start
            || syntax.variable_start == syntax.comment_start
            || syntax.block_start == syntax.comment_start
        {
            return Err(ConfigError::Validation {
                message: "variable, block and comment delimiters must start differently"
                    .to_string(),
            }
            .into());
        }

        if self.stdout_capture_bytes == 0 || self.error_capture_bytes == 0 {
            return Err(ConfigError::Validation {
                message: "capture sizes must be greater than zero".to_string(),
            }
            .into());
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Validation {
                message: "timeout_secs must be greater than zero when set".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
