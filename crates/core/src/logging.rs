//! Process-wide tracing setup
//!
//! Installs one `tracing-subscriber` registry writing to stderr, in text or
//! JSON. Stdout stays reserved for command results. The engine's own scoped
//! logger reaches this subscriber through
//! [`TracingSink`](crate::scoped_log::TracingSink).
//!
//! ## Environment Variables
//!
//! * `SHELLRES_LOG` - filter directive (falls back to `RUST_LOG`, then `info`)
//! * `SHELLRES_LOG_FORMAT` - `json` or `text`
//! * `SHELLRES_LOG_SPAN_EVENTS` - comma or pipe separated span events
//!   (`new`, `close`, `enter`, `exit`, `active`, `full`, `none`)

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Output format of the process subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Anything other than `json` selects text
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Initialize logging; later calls are no-ops
///
/// `format` overrides `SHELLRES_LOG_FORMAT`; `filter` overrides
/// `SHELLRES_LOG` and `RUST_LOG`.
pub fn init(format: Option<&str>, filter: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = create_env_filter(filter);

        let env_format = std::env::var("SHELLRES_LOG_FORMAT").ok();
        let effective = LogFormat::parse(format.or(env_format.as_deref()).unwrap_or("text"));
        let span_events = span_events_for_format(effective);

        match effective {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(env_filter)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(env_filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {:?}", effective);
    });

    Ok(())
}

fn create_env_filter(spec: Option<&str>) -> EnvFilter {
    let spec = spec
        .map(str::to_string)
        .or_else(|| std::env::var("SHELLRES_LOG").ok());
    match spec {
        Some(spec) => EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            tracing::warn!("Invalid log filter '{}', using default 'info'", spec);
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

fn span_events_for_format(format: LogFormat) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    if let Ok(raw) = std::env::var("SHELLRES_LOG_SPAN_EVENTS") {
        return parse_span_events(&raw);
    }
    match format {
        LogFormat::Json => FmtSpan::NEW | FmtSpan::CLOSE,
        LogFormat::Text => FmtSpan::NONE,
    }
}

fn parse_span_events(raw: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    let mut acc = FmtSpan::NONE;
    for token in raw.split(&[',', '|'][..]).map(|t| t.trim().to_lowercase()) {
        acc |= match token.as_str() {
            "new" => FmtSpan::NEW,
            "close" => FmtSpan::CLOSE,
            "enter" => FmtSpan::ENTER,
            "exit" => FmtSpan::EXIT,
            "active" => FmtSpan::ACTIVE,
            "full" => FmtSpan::FULL,
            _ => FmtSpan::NONE,
        };
    }
    acc
}
