//! Scoped logging stack
//!
//! A [`Logger`] fans records out to zero or more [`LogSink`]s and carries a
//! list of attached key/value fields. A [`LogStack`] keeps the loggers of the
//! currently open scopes for one lifecycle invocation: entering a scope
//! pushes a child logger that inherits the parent's fields, and leaving pops
//! it again, but only if it is still on top.
//!
//! [`ScopeGuard`] ties the pop to `Drop`, so early returns through `?` leave
//! the stack balanced. Cloning a stack produces an independent copy with the
//! same sinks and depth; the copies never see each other's pushes.

use crate::redaction::RedactionConfig;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Source of unique logger ids, used by [`LogStack::pop_if`]
static LOGGER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_logger_id() -> u64 {
    LOGGER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Severity of a log record
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Get the level name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// One emitted log line with its accumulated scope fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl LogRecord {
    /// Value of the last field named `key`
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Destination for log records
pub trait LogSink: Send + Sync + fmt::Debug {
    /// Records below this level are not delivered
    fn min_level(&self) -> LogLevel {
        LogLevel::Trace
    }

    /// Deliver one record. Sinks swallow their own I/O failures; logging
    /// never fails an operation.
    fn emit(&self, record: &LogRecord);
}

/// Re-emits records as `tracing` events
#[derive(Debug, Default)]
pub struct TracingSink {
    min_level: LogLevel,
}

impl TracingSink {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl LogSink for TracingSink {
    fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn emit(&self, record: &LogRecord) {
        let scope = record
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        let message = record.message.as_str();
        match record.level {
            LogLevel::Trace => tracing::trace!(target: "shellres_core::engine", scope = %scope, "{}", message),
            LogLevel::Debug => tracing::debug!(target: "shellres_core::engine", scope = %scope, "{}", message),
            LogLevel::Info => tracing::info!(target: "shellres_core::engine", scope = %scope, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "shellres_core::engine", scope = %scope, "{}", message),
            LogLevel::Error => tracing::error!(target: "shellres_core::engine", scope = %scope, "{}", message),
        }
    }
}

/// Appends one JSON object per record to a file
#[derive(Debug)]
pub struct JsonFileSink {
    min_level: LogLevel,
    file: Mutex<File>,
}

impl JsonFileSink {
    /// Open (creating if needed) `path` in append mode
    pub fn open(path: &Path, min_level: LogLevel) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            min_level,
            file: Mutex::new(file),
        })
    }
}

impl LogSink for JsonFileSink {
    fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn emit(&self, record: &LogRecord) {
        let fields: serde_json::Map<String, serde_json::Value> = record
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let line = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": record.level,
            "message": record.message,
            "fields": fields,
        });
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything captured so far
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Whether any captured message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|record| record.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// A fan-out over sinks with attached fields
///
/// Loggers are cheap to clone and `Send`, so the executor's reader threads
/// each get their own copy.
#[derive(Debug, Clone)]
pub struct Logger {
    id: u64,
    sinks: Arc<Vec<Arc<dyn LogSink>>>,
    fields: Arc<Vec<(String, String)>>,
    redaction: RedactionConfig,
}

impl Logger {
    /// Create a root logger over `sinks`
    pub fn new(sinks: Vec<Arc<dyn LogSink>>, redaction: RedactionConfig) -> Self {
        Self {
            id: next_logger_id(),
            sinks: Arc::new(sinks),
            fields: Arc::new(Vec::new()),
            redaction,
        }
    }

    /// A logger with no sinks
    pub fn disabled() -> Self {
        Self::new(Vec::new(), RedactionConfig::disabled())
    }

    /// Derive a logger that carries this logger's fields plus `extra`
    pub fn child<K, V>(&self, extra: &[(K, V)]) -> Logger
    where
        K: AsRef<str>,
        V: ToString,
    {
        let mut fields = self.fields.as_ref().clone();
        fields.extend(
            extra
                .iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.to_string())),
        );
        Logger {
            id: next_logger_id(),
            sinks: Arc::clone(&self.sinks),
            fields: Arc::new(fields),
            redaction: self.redaction.clone(),
        }
    }

    /// A child logger whose secret registry is forked from this one
    ///
    /// Secrets registered through the returned logger and its children stay
    /// with it and are dropped together with it.
    pub fn with_forked_secrets(&self) -> Logger {
        Logger {
            redaction: self.redaction.fork(),
            ..self.child::<&str, &str>(&[])
        }
    }

    /// Unique id of this logger
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fields attached to this logger
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Redaction applied to every record
    pub fn redaction(&self) -> &RedactionConfig {
        &self.redaction
    }

    /// Emit a record with per-record fields appended after the scope fields
    pub fn log_with(&self, level: LogLevel, message: &str, extra: &[(&str, String)]) {
        let wanted = self.sinks.iter().any(|sink| level >= sink.min_level());
        if !wanted {
            return;
        }
        let mut fields = self.fields.as_ref().clone();
        fields.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
        let record = LogRecord {
            level,
            message: self.redaction.redact(message),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k, self.redaction.redact(&v)))
                .collect(),
        };
        for sink in self.sinks.iter() {
            if level >= sink.min_level() {
                sink.emit(&record);
            }
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.log_with(level, message, &[]);
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Per-invocation stack of scoped loggers
///
/// The bottom frame is the root logger and is never popped.
#[derive(Debug)]
pub struct LogStack {
    frames: Rc<RefCell<Vec<Logger>>>,
}

impl LogStack {
    pub fn new(root: Logger) -> Self {
        Self {
            frames: Rc::new(RefCell::new(vec![root])),
        }
    }

    /// The logger on top of the stack
    pub fn current(&self) -> Logger {
        let frames = self.frames.borrow();
        // the root frame is never popped, so the stack is never empty
        frames[frames.len() - 1].clone()
    }

    /// Number of frames, including the root
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Push a child of the current logger carrying `extra` fields and return it
    pub fn push<K, V>(&self, extra: &[(K, V)]) -> Logger
    where
        K: AsRef<str>,
        V: ToString,
    {
        let child = self.current().child(extra);
        self.frames.borrow_mut().push(child.clone());
        child
    }

    /// Pop the top frame only if it is `expected`
    ///
    /// Returns whether a frame was popped.
    pub fn pop_if(&self, expected: &Logger) -> bool {
        pop_frame_if(&self.frames, expected.id())
    }

    /// Push a scope that is popped again when the guard drops
    pub fn scope<K, V>(&self, extra: &[(K, V)]) -> ScopeGuard
    where
        K: AsRef<str>,
        V: ToString,
    {
        let logger = self.push(extra);
        ScopeGuard {
            frames: Rc::clone(&self.frames),
            logger,
        }
    }

    pub fn trace(&self, message: &str) {
        self.current().trace(message);
    }

    pub fn debug(&self, message: &str) {
        self.current().debug(message);
    }

    pub fn info(&self, message: &str) {
        self.current().info(message);
    }

    pub fn warn(&self, message: &str) {
        self.current().warn(message);
    }

    pub fn error(&self, message: &str) {
        self.current().error(message);
    }
}

impl Clone for LogStack {
    /// Independent copy: same sinks, same depth, separate frames
    fn clone(&self) -> Self {
        Self {
            frames: Rc::new(RefCell::new(self.frames.borrow().clone())),
        }
    }
}

fn pop_frame_if(frames: &RefCell<Vec<Logger>>, id: u64) -> bool {
    let mut frames = frames.borrow_mut();
    match frames.last() {
        Some(top) if frames.len() > 1 && top.id() == id => {
            frames.pop();
            true
        }
        _ => false,
    }
}

/// Pops its scope from the originating stack on drop
#[derive(Debug)]
pub struct ScopeGuard {
    frames: Rc<RefCell<Vec<Logger>>>,
    logger: Logger,
}

impl ScopeGuard {
    /// The logger pushed by this scope
    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        pop_frame_if(&self.frames, self.logger.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redaction::SecretRegistry;

    fn memory_logger() -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(
            vec![sink.clone() as Arc<dyn LogSink>],
            RedactionConfig::default(),
        );
        (logger, sink)
    }

    #[test]
    fn test_child_inherits_fields() {
        let (root, sink) = memory_logger();
        let op = root.child(&[("op", "create")]);
        let stage = op.child(&[("stage", "create_command")]);
        stage.info("running");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("op"), Some("create"));
        assert_eq!(records[0].field("stage"), Some("create_command"));
        assert!(root.fields().is_empty());
    }

    #[test]
    fn test_push_and_pop_if() {
        let (root, _sink) = memory_logger();
        let stack = LogStack::new(root);
        let a = stack.push(&[("op", "read")]);
        let b = stack.push(&[("stage", "read_command")]);
        assert_eq!(stack.depth(), 3);

        // not on top: refused
        assert!(!stack.pop_if(&a));
        assert_eq!(stack.depth(), 3);

        assert!(stack.pop_if(&b));
        assert!(stack.pop_if(&a));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_root_is_never_popped() {
        let (root, _sink) = memory_logger();
        let stack = LogStack::new(root.clone());
        assert!(!stack.pop_if(&root));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_scope_guard_pops_on_early_return() {
        fn step() -> Result<(), String> {
            Err("nope".to_string())
        }

        fn failing(stack: &LogStack) -> Result<(), String> {
            let _scope = stack.scope(&[("stage", "doomed")]);
            step()?;
            stack.info("unreachable");
            Ok(())
        }

        let (root, sink) = memory_logger();
        let stack = LogStack::new(root);
        assert!(failing(&stack).is_err());
        assert_eq!(stack.depth(), 1);
        stack.info("after");
        assert_eq!(sink.records()[0].field("stage"), None);
    }

    #[test]
    fn test_clone_is_independent() {
        let (root, sink) = memory_logger();
        let stack = LogStack::new(root);
        let _outer = stack.scope(&[("op", "update")]);

        let forked = stack.clone();
        assert_eq!(forked.depth(), 2);
        let _inner = forked.scope(&[("stage", "forked")]);
        assert_eq!(forked.depth(), 3);
        assert_eq!(stack.depth(), 2);

        stack.info("original");
        forked.info("forked");
        let records = sink.records();
        assert_eq!(records[0].field("stage"), None);
        assert_eq!(records[1].field("stage"), Some("forked"));
        assert_eq!(records[1].field("op"), Some("update"));
    }

    #[test]
    fn test_min_level_filters() {
        #[derive(Debug, Default)]
        struct WarnOnly(MemorySink);
        impl LogSink for WarnOnly {
            fn min_level(&self) -> LogLevel {
                LogLevel::Warn
            }
            fn emit(&self, record: &LogRecord) {
                self.0.emit(record);
            }
        }

        let sink = Arc::new(WarnOnly::default());
        let logger = Logger::new(
            vec![sink.clone() as Arc<dyn LogSink>],
            RedactionConfig::disabled(),
        );
        logger.info("quiet");
        logger.warn("loud");
        let records = sink.0.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "loud");
    }

    #[test]
    fn test_records_are_redacted() {
        let registry = SecretRegistry::new();
        registry.add_secret("s3cr3t-value");
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(
            vec![sink.clone() as Arc<dyn LogSink>],
            RedactionConfig::with_registry(registry),
        );
        let scoped = logger.child(&[("token", "s3cr3t-value")]);
        scoped.info("using s3cr3t-value now");
        let records = sink.records();
        assert_eq!(records[0].message, "using **** now");
        assert_eq!(records[0].field("token"), Some("****"));
    }

    #[test]
    fn test_json_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("engine.jsonl");
        let sink = Arc::new(JsonFileSink::open(&path, LogLevel::Debug).unwrap());
        let logger = Logger::new(
            vec![sink as Arc<dyn LogSink>],
            RedactionConfig::disabled(),
        )
        .child(&[("op", "read")]);
        logger.trace("dropped");
        logger.debug("first");
        logger.error("second");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["message"], "first");
        assert_eq!(lines[1]["level"], "error");
        assert_eq!(lines[1]["fields"]["op"], "read");
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error > LogLevel::Info);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_forked_secrets_stay_with_the_fork() {
        let (root, sink) = memory_logger();
        let scoped = root.with_forked_secrets().child(&[("stage", "create")]);
        scoped.redaction().registry.add_secret("scoped-secret");

        scoped.info("value scoped-secret");
        root.info("value scoped-secret");
        let messages: Vec<String> = sink.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["value ****", "value scoped-secret"]);
        assert_eq!(root.redaction().registry.secret_count(), 0);
    }
}
