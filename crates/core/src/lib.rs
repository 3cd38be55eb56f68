//! Core library of shellres
//!
//! A command lifecycle engine: it manages an external entity entirely through
//! user-supplied shell command templates. The crate holds the change-tracking
//! context model, template rendering, environment assembly, command
//! execution with bounded capture, line-output parsing, the lifecycle state
//! machine and its scoped logging.

pub mod change_map;
pub mod command;
pub mod config;
pub mod context;
pub mod environment;
pub mod errors;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod output;
pub mod redaction;
pub mod resource;
pub mod scoped_log;
pub mod state;
pub mod templates;

pub use change_map::{ChangeMap, Epoch, StringMap};
pub use config::ProviderConfig;
pub use errors::{Result, ShellresError};
pub use lifecycle::Lifecycle;
pub use resource::{AccessMode, ApplyData, Field, PlanData, ResourceAccess};

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
