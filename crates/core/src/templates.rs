//! Template rendering
//!
//! Commands, environment entries and interpreter arguments are templates
//! rendered with minijinja using the provider's configured delimiters.
//!
//! Rendering rules:
//! - a missing value renders as `<no value>` (not as an empty string), so a
//!   command can tell "never set" apart from "set to empty";
//! - nothing is auto-escaped;
//! - an error while rendering the old epoch may be degraded to a visible
//!   `<ERROR: ...>` placeholder when the caller allows it, an error while
//!   rendering the new epoch always propagates.
//!
//! ## Sentinel convention
//!
//! Create, update and read commands share one stdout with the engine. The
//! serialization format on that stream is line based:
//!
//! - `<state_prefix>key=value` sets a state entry;
//! - `<state_prefix>key=<empty>` (the value equals the empty marker) removes
//!   the entry from state;
//! - any other `key=value` line is output (read) or ignored (create/update).
//!
//! Both `state_prefix` and `empty` carry a random nonce generated per
//! [`Sentinels`] instance and are exposed to templates under those names,
//! e.g. `echo '{{ state_prefix }}token=abc'`.

use crate::change_map::{ChangeMap, Epoch, StringMap};
use crate::config::TemplateSyntax;
use crate::errors::{Result, TemplateError};
use base64::Engine as _;
use minijinja::syntax::SyntaxConfig;
use minijinja::value::Value;
use minijinja::{AutoEscape, Environment, Error, ErrorKind, UndefinedBehavior};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Text printed in place of a missing value
pub const NO_VALUE: &str = "<no value>";

const NONCE_LENGTH: usize = 16;

/// Marker strings that let rendered commands steer the output parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    /// Value meaning "remove this state entry"
    pub empty: String,
    /// Prefix of state lines in command stdout
    pub state_prefix: String,
    /// Prefix of output lines in read stdout; empty means every line
    pub output_prefix: String,
}

impl Sentinels {
    /// Generate fresh markers with a random nonce
    pub fn generate(output_prefix: Option<&str>) -> Self {
        let nonce: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(NONCE_LENGTH)
            .collect::<String>()
            .to_uppercase();
        Self {
            empty: format!("__SHELLRES_EMPTY_{}__", nonce),
            state_prefix: format!("__SHELLRES_STATE_{}__", nonce),
            output_prefix: output_prefix.unwrap_or_default().to_string(),
        }
    }
}

/// A state entry decoded from the sentinel convention
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue {
    Present(String),
    Absent,
}

impl StateValue {
    /// Decode a raw value written after the state prefix
    pub fn decode(raw: String, sentinels: &Sentinels) -> Self {
        if raw == sentinels.empty {
            StateValue::Absent
        } else {
            StateValue::Present(raw)
        }
    }
}

/// Values visible to one render call
///
/// Built per render and dropped afterwards. The epoch decides which
/// snapshot of context, state and environment appears as `cur` and at the
/// root of the template namespace.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub operation: &'a str,
    pub epoch: Epoch,
    pub context: &'a ChangeMap,
    pub state: &'a ChangeMap,
    pub output: &'a StringMap,
    pub sentinels: &'a Sentinels,
    environment: Option<&'a StringMap>,
    extra: StringMap,
}

impl<'a> TemplateContext<'a> {
    pub fn new(
        operation: &'a str,
        epoch: Epoch,
        context: &'a ChangeMap,
        state: &'a ChangeMap,
        output: &'a StringMap,
        sentinels: &'a Sentinels,
    ) -> Self {
        Self {
            operation,
            epoch,
            context,
            state,
            output,
            sentinels,
            environment: None,
            extra: StringMap::new(),
        }
    }

    /// Expose an already built environment view as `env`
    pub fn with_environment(mut self, environment: &'a StringMap) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Add a key that shadows everything else for this render only
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The same context viewed from another epoch
    pub fn at(&self, epoch: Epoch) -> Self {
        Self {
            epoch,
            ..self.clone()
        }
    }

    fn to_value(&self) -> Value {
        let mut root: BTreeMap<String, Value> = self
            .context
            .view(self.epoch)
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();

        root.insert("old".into(), Value::from_serialize(&self.context.old));
        root.insert("new".into(), Value::from_serialize(&self.context.new));
        root.insert(
            "cur".into(),
            Value::from_serialize(self.context.view(self.epoch)),
        );
        root.insert("op".into(), Value::from(self.operation));
        root.insert("output".into(), Value::from_serialize(self.output));

        let mut state = BTreeMap::new();
        state.insert("old", Value::from_serialize(&self.state.old));
        state.insert("new", Value::from_serialize(&self.state.new));
        state.insert("cur", Value::from_serialize(self.state.view(self.epoch)));
        root.insert("state".into(), Value::from_serialize(&state));

        if let Some(environment) = self.environment {
            root.insert("env".into(), Value::from_serialize(environment));
        }
        root.insert("empty".into(), Value::from(self.sentinels.empty.as_str()));
        root.insert(
            "state_prefix".into(),
            Value::from(self.sentinels.state_prefix.as_str()),
        );
        root.insert(
            "output_prefix".into(),
            Value::from(self.sentinels.output_prefix.as_str()),
        );

        for (key, value) in &self.extra {
            root.insert(key.clone(), Value::from(value.as_str()));
        }
        Value::from_serialize(&root)
    }
}

/// What to do when a render fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Propagate the error
    Fail,
    /// Substitute `<ERROR: ...>` when rendering the old epoch
    Placeholder,
}

/// Renders templates with the provider's syntax and function library
pub struct TemplateRenderer {
    env: Environment<'static>,
    syntax: TemplateSyntax,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer")
            .field("syntax", &self.syntax)
            .finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    pub fn new(syntax: &TemplateSyntax) -> Result<Self> {
        let syntax_config = SyntaxConfig::builder()
            .block_delimiters(syntax.block_start.clone(), syntax.block_end.clone())
            .variable_delimiters(syntax.variable_start.clone(), syntax.variable_end.clone())
            .comment_delimiters(syntax.comment_start.clone(), syntax.comment_end.clone())
            .build()
            .map_err(|e| TemplateError::Syntax {
                message: e.to_string(),
            })?;

        let mut env = Environment::new();
        env.set_syntax(syntax_config);
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_formatter(|out, state, value| {
            if value.is_undefined() {
                out.write_str(NO_VALUE)
                    .map_err(|_| Error::new(ErrorKind::WriteFailure, "failed to write value"))
            } else {
                minijinja::escape_formatter(out, state, value)
            }
        });
        register_functions(&mut env);

        Ok(Self {
            env,
            syntax: syntax.clone(),
        })
    }

    /// Whether `text` needs rendering at all
    pub fn is_templated(&self, text: &str) -> bool {
        self.syntax.is_templated(text)
    }

    /// Render `source`, failing on any error
    pub fn render(&self, name: &str, source: &str, ctx: &TemplateContext<'_>) -> Result<String> {
        self.render_with(name, source, ctx, OnError::Fail)
    }

    /// Render `source` with an explicit error policy
    ///
    /// [`OnError::Placeholder`] only applies to the old epoch. The output
    /// rendered before the failing expression is kept and `<ERROR: ...>`
    /// takes the place of everything from that point on.
    pub fn render_with(
        &self,
        name: &str,
        source: &str,
        ctx: &TemplateContext<'_>,
        on_error: OnError,
    ) -> Result<String> {
        trace!(template = name, epoch = %ctx.epoch, "Rendering template");
        let template = match self.env.template_from_named_str(name, source) {
            Ok(template) => template,
            Err(err) => return self.degrade(name, String::new(), err, ctx, on_error),
        };
        let mut buffer = Vec::new();
        match template.render_captured_to(ctx.to_value(), &mut buffer) {
            Ok(_) => Ok(String::from_utf8_lossy(&buffer).into_owned()),
            Err(err) => {
                let partial = String::from_utf8_lossy(&buffer).into_owned();
                self.degrade(name, partial, err, ctx, on_error)
            }
        }
    }

    fn degrade(
        &self,
        name: &str,
        partial: String,
        err: Error,
        ctx: &TemplateContext<'_>,
        on_error: OnError,
    ) -> Result<String> {
        let message = err.to_string();
        if on_error == OnError::Placeholder && ctx.epoch == Epoch::Old {
            warn!(template = name, error = %message, "Degrading old-view render failure");
            let single_line = message.replace(['\n', '\r'], " ");
            return Ok(format!("{}<ERROR: {}>", partial, single_line));
        }
        let error = if err.kind() == ErrorKind::SyntaxError {
            TemplateError::Parse {
                name: name.to_string(),
                message,
            }
        } else {
            TemplateError::Render {
                name: name.to_string(),
                message,
            }
        };
        Err(error.into())
    }
}

fn register_functions(env: &mut Environment<'static>) {
    env.add_function("to_json", to_json);
    env.add_filter("to_json", to_json);
    env.add_function("from_json", from_json);
    env.add_filter("from_json", from_json);
    env.add_function("to_yaml", to_yaml);
    env.add_filter("to_yaml", to_yaml);
    env.add_function("from_yaml", from_yaml);
    env.add_filter("from_yaml", from_yaml);
    env.add_function("b64enc", b64enc);
    env.add_filter("b64enc", b64enc);
    env.add_function("b64dec", b64dec);
    env.add_filter("b64dec", b64dec);
    env.add_function("shell_quote", shell_quote);
    env.add_filter("shell_quote", shell_quote);
    env.add_function("regex_replace", regex_replace);
    env.add_filter("regex_replace", regex_replace);
    env.add_function("getenv", getenv);
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

fn to_json(value: Value) -> std::result::Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(format!("to_json: {}", e)))
}

fn from_json(text: &str) -> std::result::Result<Value, Error> {
    let parsed: serde_json::Value =
        serde_json::from_str(text).map_err(|e| invalid(format!("from_json: {}", e)))?;
    Ok(Value::from_serialize(&parsed))
}

fn to_yaml(value: Value) -> std::result::Result<String, Error> {
    serde_yaml::to_string(&value).map_err(|e| invalid(format!("to_yaml: {}", e)))
}

fn from_yaml(text: &str) -> std::result::Result<Value, Error> {
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| invalid(format!("from_yaml: {}", e)))?;
    Ok(Value::from_serialize(&parsed))
}

fn b64enc(text: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
}

fn b64dec(text: &str) -> std::result::Result<String, Error> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| invalid(format!("b64dec: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| invalid(format!("b64dec: {}", e)))
}

fn shell_quote(text: &str) -> String {
    shell_words::quote(text).into_owned()
}

fn regex_replace(text: &str, pattern: &str, replacement: &str) -> std::result::Result<String, Error> {
    let re = regex::Regex::new(pattern).map_err(|e| invalid(format!("regex_replace: {}", e)))?;
    Ok(re.replace_all(text, replacement).into_owned())
}

fn getenv(name: &str) -> Value {
    std::env::var(name).map(Value::from).unwrap_or(Value::UNDEFINED)
}
