//! Command execution
//!
//! Runs one rendered script through the configured interpreter. Output of
//! the child is drained by two reader threads (stdout, stderr) which tee
//! every chunk into:
//!
//! - a small ring buffer of combined output, used only in error messages;
//! - a larger ring buffer of stdout, which becomes the return value;
//! - the scoped logger, one record per completed line tagged `stream=out`
//!   or `stream=err`.
//!
//! Both buffers are bounded; when a command produces more than fits, the
//! oldest bytes are discarded. The executor does not return before both
//! readers have signalled completion, so no line of a fast-exiting process
//! is lost.

use crate::change_map::StringMap;
use crate::config::ProviderConfig;
use crate::errors::{CommandError, Result};
use crate::redaction::RedactionConfig;
use crate::scoped_log::{LogLevel, Logger};
use crate::templates::{TemplateContext, TemplateRenderer};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// How long readers may keep draining after a timed-out child was killed
const KILL_GRACE: Duration = Duration::from_secs(2);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Fixed-capacity byte buffer keeping the most recent bytes
#[derive(Debug, Clone)]
pub struct RingBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    discarded: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            discarded: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.discarded += self.bytes.len() + chunk.len() - self.capacity;
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.discarded += overflow;
        }
        self.bytes.extend(chunk);
    }

    /// Number of bytes dropped from the front so far
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Buffered bytes as text; invalid UTF-8 is replaced
    pub fn to_string_lossy(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(front.len() + back.len());
        joined.extend_from_slice(front);
        joined.extend_from_slice(back);
        String::from_utf8_lossy(&joined).into_owned()
    }
}

#[derive(Debug)]
struct Capture {
    stdout: RingBuffer,
    combined: RingBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Out,
    Err,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Stream::Out => "out",
            Stream::Err => "err",
        }
    }
}

/// One process execution
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    /// Stage name used in logs (`create`, `read`, `exists`, ...)
    pub stage: &'a str,
    /// Fully resolved interpreter argv, script included
    pub argv: Vec<String>,
    /// The script text, reported in errors
    pub script: &'a str,
    /// Complete child environment; nothing else is inherited
    pub environment: &'a StringMap,
    /// Resource id for log annotation
    pub resource_id: &'a str,
}

/// Runs scripts through the provider's interpreter
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    interpreter: Vec<String>,
    separator: String,
    timeout: Option<Duration>,
    working_directory: Option<PathBuf>,
    stdout_capture_bytes: usize,
    error_capture_bytes: usize,
    annotate_processes: bool,
}

impl CommandExecutor {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            interpreter: config.interpreter_argv()?,
            separator: config.command_separator.clone(),
            timeout: config.timeout(),
            working_directory: config.working_directory.clone(),
            stdout_capture_bytes: config.stdout_capture_bytes,
            error_capture_bytes: config.error_capture_bytes,
            annotate_processes: config.annotate_processes,
        })
    }

    /// Join non-empty command fragments with the configured separator
    pub fn join(&self, fragments: &[&str]) -> String {
        fragments
            .iter()
            .filter(|f| !f.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    /// Build the argv that runs `script`
    ///
    /// Non-leading interpreter arguments containing template syntax are
    /// rendered with `command` bound to the script. When none do, the
    /// script is appended as the last argument.
    pub fn resolve_argv(
        &self,
        script: &str,
        renderer: &TemplateRenderer,
        ctx: &TemplateContext<'_>,
    ) -> Result<Vec<String>> {
        let Some((program, args)) = self.interpreter.split_first() else {
            return Err(CommandError::EmptyInterpreter {
                command: script.to_string(),
            }
            .into());
        };

        let mut argv = vec![program.clone()];
        let mut substituted = false;
        let ctx = ctx.clone().with_extra("command", script);
        for arg in args {
            if renderer.is_templated(arg) {
                argv.push(renderer.render("interpreter", arg, &ctx)?);
                substituted = true;
            } else {
                argv.push(arg.clone());
            }
        }
        if !substituted {
            argv.push(script.to_string());
        }
        Ok(argv)
    }

    /// Run the invocation and return its captured stdout
    #[instrument(skip_all, fields(stage = invocation.stage))]
    pub fn run(&self, invocation: Invocation<'_>, log: &Logger) -> Result<String> {
        let redaction = log.redaction().clone();
        let command_text = redaction.redact(invocation.script);

        let Some((program, args)) = invocation.argv.split_first() else {
            return Err(CommandError::EmptyInterpreter {
                command: command_text,
            }
            .into());
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(invocation.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }

        log.debug(&format!("Running {} command", invocation.stage));
        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: command_text.clone(),
            source,
            output: String::new(),
        })?;

        let pid = child.id();
        let line_log = if self.annotate_processes {
            log.child(&[
                ("pid", pid.to_string()),
                ("resource_id", invocation.resource_id.to_string()),
            ])
        } else {
            log.clone()
        };

        let capture = Arc::new(Mutex::new(Capture {
            stdout: RingBuffer::new(self.stdout_capture_bytes),
            combined: RingBuffer::new(self.error_capture_bytes),
        }));
        let (done_tx, done_rx) = mpsc::channel::<Stream>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                Stream::Out,
                Arc::clone(&capture),
                line_log.clone(),
                done_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                Stream::Err,
                Arc::clone(&capture),
                line_log,
                done_tx.clone(),
            ));
        }
        drop(done_tx);

        let deadline = self.timeout.map(|timeout| started + timeout);
        let finished = wait_for_readers(&done_rx, readers.len(), deadline);

        let status = if finished {
            wait_child(&mut child, deadline).map_err(|source| CommandError::Wait {
                command: command_text.clone(),
                source,
            })?
        } else {
            None
        };

        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            let grace = Instant::now() + KILL_GRACE;
            wait_for_readers(&done_rx, readers.len(), Some(grace));
            let output = combined_output(&capture, &redaction);
            let timeout_secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
            log.error(&format!(
                "{} command timed out after {}s",
                invocation.stage, timeout_secs
            ));
            return Err(CommandError::Timeout {
                command: command_text,
                timeout_secs,
                output,
            }
            .into());
        };

        for reader in readers {
            let _ = reader.join();
        }

        debug!(
            "Command finished with {} in {:?}",
            status,
            started.elapsed()
        );

        if !status.success() {
            let output = combined_output(&capture, &redaction);
            log.error(&format!(
                "{} command failed with {}",
                invocation.stage,
                describe_status(&status)
            ));
            return Err(CommandError::Failed {
                command: command_text,
                status: describe_status(&status),
                output,
            }
            .into());
        }

        let capture = capture
            .lock()
            .map_err(|_| CommandError::Wait {
                command: command_text.clone(),
                source: std::io::Error::other("output capture poisoned"),
            })?;
        if capture.stdout.discarded() > 0 {
            log.warn(&format!(
                "{} command output exceeded {} bytes; {} leading bytes discarded",
                invocation.stage,
                self.stdout_capture_bytes,
                capture.stdout.discarded()
            ));
        }
        Ok(capture.stdout.to_string_lossy())
    }
}

fn spawn_reader<R>(
    source: R,
    stream: Stream,
    capture: Arc<Mutex<Capture>>,
    log: Logger,
    done: mpsc::Sender<Stream>,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if let Ok(mut capture) = capture.lock() {
                        if stream == Stream::Out {
                            capture.stdout.push(&line);
                        }
                        capture.combined.push(&line);
                    }
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end_matches(['\n', '\r']);
                    log.log_with(
                        LogLevel::Info,
                        text,
                        &[("stream", stream.as_str().to_string())],
                    );
                }
                Err(e) => {
                    log.warn(&format!("Failed to read std{}: {}", stream.as_str(), e));
                    break;
                }
            }
        }
        let _ = done.send(stream);
    })
}

/// Wait until `expected` readers signalled; false if the deadline passed
fn wait_for_readers(
    done: &mpsc::Receiver<Stream>,
    expected: usize,
    deadline: Option<Instant>,
) -> bool {
    let mut remaining = expected;
    while remaining > 0 {
        let received = match deadline {
            None => done.recv().is_ok(),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                match done.recv_timeout(left) {
                    Ok(_) => true,
                    Err(mpsc::RecvTimeoutError::Timeout) => return false,
                    Err(mpsc::RecvTimeoutError::Disconnected) => false,
                }
            }
        };
        if !received {
            // all senders gone: every reader has exited
            return true;
        }
        remaining -= 1;
    }
    true
}

/// Reap the child; `None` when the deadline passed first
fn wait_child(child: &mut Child, deadline: Option<Instant>) -> std::io::Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return child.wait().map(Some);
    };
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn combined_output(capture: &Arc<Mutex<Capture>>, redaction: &RedactionConfig) -> String {
    capture
        .lock()
        .map(|c| redaction.redact(&c.combined.to_string_lossy()))
        .unwrap_or_default()
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => status.to_string(),
    }
}
