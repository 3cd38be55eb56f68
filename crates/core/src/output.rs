//! Line-oriented output parsing
//!
//! Command stdout is a sequence of `key=value` lines. Parsing is best effort:
//! malformed lines are dropped (with a warning when the value could not be
//! decoded) and the parse as a whole never fails.

use crate::change_map::StringMap;
use crate::config::OutputFormat;
use crate::scoped_log::{LogLevel, Logger};
use base64::Engine as _;

/// Filters and decoding for one parser pass
#[derive(Debug, Clone, Default)]
pub struct ParseOptions<'a> {
    /// Only lines starting with this prefix are parsed; the prefix is stripped
    pub prefix: Option<&'a str>,
    /// Lines starting with this prefix are skipped, even if they also match
    /// `prefix`
    pub except_prefix: Option<&'a str>,
    pub format: OutputFormat,
}

impl<'a> ParseOptions<'a> {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn prefix(mut self, prefix: &'a str) -> Self {
        if !prefix.is_empty() {
            self.prefix = Some(prefix);
        }
        self
    }

    pub fn except_prefix(mut self, prefix: &'a str) -> Self {
        if !prefix.is_empty() {
            self.except_prefix = Some(prefix);
        }
        self
    }
}

/// Parse `text` into a map; later lines overwrite earlier ones
pub fn parse_lines(text: &str, options: &ParseOptions<'_>, log: &Logger) -> StringMap {
    let mut values = StringMap::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if let Some(except) = options.except_prefix {
            if line.starts_with(except) {
                continue;
            }
        }
        let line = match options.prefix {
            Some(prefix) => match line.strip_prefix(prefix) {
                Some(rest) => rest,
                None => continue,
            },
            None => line,
        };
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };

        match decode_value(key, raw, options.format) {
            Ok(value) => {
                values.insert(key.to_string(), value);
            }
            Err(reason) => {
                log.log_with(
                    LogLevel::Warn,
                    "Dropping undecodable output line",
                    &[
                        ("key", key.to_string()),
                        ("format", options.format.as_str().to_string()),
                        ("reason", reason),
                    ],
                );
            }
        }
    }

    values
}

fn decode_value(key: &str, raw: &str, format: OutputFormat) -> Result<String, String> {
    match format {
        OutputFormat::Raw => Ok(raw.to_string()),
        OutputFormat::Base64 => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(raw.trim())
                .map_err(|e| format!("invalid base64 for {}: {}", key, e))?;
            String::from_utf8(bytes).map_err(|e| format!("invalid utf-8 for {}: {}", key, e))
        }
        OutputFormat::Json => {
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| format!("invalid json for {}: {}", key, e))?;
            Ok(match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
        }
    }
}
