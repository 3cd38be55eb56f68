//! Command-line interface definition and dispatch

use crate::commands::{self, Action, ResourceArgs};
use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use shellres_core::state::Overrides;
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Manage one resource through shell command templates
#[derive(Debug, Parser)]
#[command(name = "shellres", version, about, long_about = None)]
pub struct Cli {
    /// Log output format (defaults to SHELLRES_LOG_FORMAT, then text)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level (SHELLRES_LOG or RUST_LOG take precedence when set)
    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision the resource
    Create(RecordArgs),
    /// Refresh state and output from the live resource
    Read(RecordArgs),
    /// Apply context or environment changes
    Update(RecordArgs),
    /// Tear the resource down
    Delete(RecordArgs),
    /// Check whether the resource still exists
    Exists(RecordArgs),
    /// Show the changes an update would make without applying them
    Plan(RecordArgs),
}

/// Arguments shared by every resource subcommand
#[derive(Debug, Clone, Args)]
pub struct RecordArgs {
    /// Provider configuration (TOML)
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Resource record (JSON); created on first apply
    #[arg(long, value_name = "PATH")]
    pub record: PathBuf,

    /// Set a context entry in the new snapshot
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Remove a context entry from the new snapshot
    #[arg(long = "unset", value_name = "KEY")]
    pub unset: Vec<String>,

    /// Declare an environment entry
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Declare a sensitive environment entry; its value is redacted in logs
    #[arg(long = "sensitive-env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub sensitive_env: Vec<(String, String)>,
}

impl RecordArgs {
    fn into_resource_args(self) -> ResourceArgs {
        ResourceArgs {
            config: self.config,
            record: self.record,
            overrides: Overrides {
                set: self.set.into_iter().collect(),
                unset: self.unset,
                environment: self.env.into_iter().collect(),
                sensitive_environment: self.sensitive_env.into_iter().collect(),
            },
        }
    }
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    pub fn dispatch(self) -> Result<()> {
        let log_format = self.log_format.map(|format| match format {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        });

        let filter = if std::env::var_os("SHELLRES_LOG").is_none()
            && std::env::var_os("RUST_LOG").is_none()
        {
            let level = self.log_level.as_str();
            Some(format!("shellres={},shellres_core={}", level, level))
        } else {
            None
        };
        shellres_core::logging::init(log_format, filter.as_deref())?;
        tracing::debug!("CLI initialized with log level: {}", self.log_level.as_str());

        match self.command {
            Commands::Create(args) => commands::apply(Action::Create, args.into_resource_args()),
            Commands::Read(args) => commands::apply(Action::Read, args.into_resource_args()),
            Commands::Update(args) => commands::apply(Action::Update, args.into_resource_args()),
            Commands::Delete(args) => commands::apply(Action::Delete, args.into_resource_args()),
            Commands::Exists(args) => commands::exists(args.into_resource_args()),
            Commands::Plan(args) => commands::plan(args.into_resource_args()),
        }
    }
}
