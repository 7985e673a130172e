//! # Coderoom Sandbox
//!
//! Runs JavaScript, TypeScript, JSX and HTML snippets from a shared editor and
//! captures what they print. Scripts are parsed with tree-sitter grammars and
//! lowered into a small AST (type annotations are erased and JSX becomes
//! `React.createElement` calls on the way), then executed by a tree-walking
//! interpreter that has no access to the host.
//!
//! Every run is bounded:
//!
//! - a wall-clock deadline checked on each statement, loop iteration and call
//! - a byte cap on captured output
//! - a call depth limit raising `RangeError`
//! - a string length cap raising `RangeError`
//! - a nesting limit on parsed source
//!
//! ```rust,ignore
//! use coderoom_sandbox::Sandbox;
//!
//! let result = Sandbox::default().run("console.log(1 + 1)", "javascript")?;
//! assert_eq!(result.output, vec!["2"]);
//! ```

mod ast;
mod builtins;
pub mod config;
pub mod error;
mod interp;
pub mod language;
mod literal;
mod markup;
pub mod output;
mod parser;
mod value;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use language::Language;

use ast::Stmt;
use interp::{Control, Halt, Interpreter};
use language::Dialect;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use value::Value;

/// Scripts recurse on the native stack; the worker gets room for the
/// configured call depth.
const WORKER_STACK_BYTES: usize = 256 * 1024 * 1024;

/// Slack given to a detached run before the caller stops waiting for it.
const BACKSTOP_GRACE_MS: u64 = 500;

/// What a run printed, plus how it ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Captured lines, followed by any error or timeout notice.
    pub output: Vec<String>,
    /// Output hit the byte cap and the script was stopped.
    pub truncated: bool,
    /// The deadline passed before the script finished.
    pub timed_out: bool,
    /// Passive HTML to display, from an HTML snippet or a React render.
    pub markup: Option<String>,
}

impl ExecutionResult {
    fn timeout(timeout_ms: u64) -> Self {
        Self {
            output: vec![timeout_notice(timeout_ms)],
            timed_out: true,
            ..Default::default()
        }
    }

    /// Output lines joined by newlines.
    pub fn text(&self) -> String {
        self.output.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.markup.is_none()
    }
}

fn timeout_notice(timeout_ms: u64) -> String {
    format!("[Execution stopped: timeout exceeded {timeout_ms}ms]")
}

/// Executes snippets under the limits of a [`SandboxConfig`].
#[derive(Clone, Debug, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `source` in the language named by `tag`, blocking until it ends.
    pub fn run(&self, source: &str, tag: &str) -> Result<ExecutionResult> {
        self.run_with_cancel(source, tag, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`run`](Self::run); setting `cancel` stops the script as if its
    /// deadline had passed.
    pub fn run_with_cancel(
        &self,
        source: &str,
        tag: &str,
        cancel: Arc<AtomicBool>,
    ) -> Result<ExecutionResult> {
        let language: Language = tag.parse()?;
        run_on_worker(self.config.clone(), language, source.to_string(), cancel)
    }

    /// Run on tokio's blocking pool. If the worker overruns its deadline by
    /// more than a grace period it is cancelled and a timeout is reported
    /// without waiting further.
    pub async fn run_detached(&self, source: String, tag: &str) -> Result<ExecutionResult> {
        let language: Language = tag.parse()?;
        let cancel = Arc::new(AtomicBool::new(false));
        let config = self.config.clone();
        let flag = cancel.clone();
        let task =
            tokio::task::spawn_blocking(move || run_on_worker(config, language, source, flag));

        let backstop = Duration::from_millis(self.config.timeout_ms + BACKSTOP_GRACE_MS);
        match tokio::time::timeout(backstop, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(SandboxError::Worker(err.to_string())),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                warn!(language = %language, "Sandbox worker missed its deadline, abandoning it");
                Ok(ExecutionResult::timeout(self.config.timeout_ms))
            }
        }
    }
}

fn run_on_worker(
    config: SandboxConfig,
    language: Language,
    source: String,
    cancel: Arc<AtomicBool>,
) -> Result<ExecutionResult> {
    let handle = std::thread::Builder::new()
        .name("coderoom-sandbox".into())
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || execute(&config, language, &source, cancel))
        .map_err(|err| SandboxError::Worker(err.to_string()))?;
    handle
        .join()
        .map_err(|_| SandboxError::Worker("script worker panicked".into()))?
}

fn execute(
    config: &SandboxConfig,
    language: Language,
    source: &str,
    cancel: Arc<AtomicBool>,
) -> Result<ExecutionResult> {
    debug!(language = %language, bytes = source.len(), "Executing snippet");
    if language != Language::Html {
        let program = parse(source, language.dialect())?;
        return Ok(Run::new(config, cancel).scripts(vec![Ok(program)], false).finish());
    }

    if source.trim().is_empty() {
        return Ok(ExecutionResult::default());
    }
    let scripts = markup::extract_scripts(source);
    if !scripts.is_empty() {
        let programs = scripts
            .iter()
            .map(|script| parse(script, Dialect::default()).map_err(|err| err.to_string()))
            .collect();
        let mut result = Run::new(config, cancel).scripts(programs, true).finish();
        result.markup.get_or_insert_with(|| source.to_string());
        return Ok(result);
    }
    if source.contains("console.") {
        let program = parse(source, Dialect::default())?;
        return Ok(Run::new(config, cancel).scripts(vec![Ok(program)], false).finish());
    }
    Ok(ExecutionResult {
        markup: Some(source.to_string()),
        ..Default::default()
    })
}

fn parse(source: &str, dialect: Dialect) -> Result<Vec<Stmt>> {
    parser::parse_program(source, dialect).map_err(|err| {
        if dialect.translates() {
            SandboxError::Translation(format!(
                "Transpile Error: {} ({}:{})",
                err.message, err.line, err.column
            ))
        } else {
            SandboxError::Syntax {
                message: err.message,
                line: err.line,
                column: err.column,
            }
        }
    })
}

/// One interpreter instance shared by every script of a run.
struct Run {
    interp: Interpreter,
    timeout_ms: u64,
    halted: Option<Halt>,
}

impl Run {
    fn new(config: &SandboxConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            interp: Interpreter::new(config, cancel),
            timeout_ms: config.timeout_ms,
            halted: None,
        }
    }

    /// Execute scripts in order, then pending timers. Unless
    /// `continue_on_error`, an uncaught exception ends the run.
    fn scripts(mut self, programs: Vec<std::result::Result<Vec<Stmt>, String>>, continue_on_error: bool) -> Self {
        let mut failed = false;
        for program in programs {
            match program {
                Ok(program) => {
                    let outcome = self.interp.run_program(&program);
                    failed |= self.settle(outcome);
                }
                Err(message) => {
                    self.interp.output_mut().notice(format!("[Error] {message}"));
                    failed = true;
                }
            }
            if self.halted.is_some() || (failed && !continue_on_error) {
                return self;
            }
        }
        let outcome = self.interp.run_timers();
        self.settle(outcome);
        self
    }

    /// Record how a script ended; `true` for an uncaught exception.
    fn settle(&mut self, outcome: std::result::Result<(), Control>) -> bool {
        match outcome {
            Ok(()) => false,
            Err(Control::Throw(error)) => {
                let line = format!("[Error] {}", error_message(&error));
                self.interp.output_mut().notice(line);
                true
            }
            Err(Control::Halt(halt)) => {
                self.halted = Some(halt);
                false
            }
            Err(_) => false,
        }
    }

    fn finish(mut self) -> ExecutionResult {
        let timed_out = matches!(self.halted, Some(Halt::Timeout));
        if timed_out {
            warn!(timeout_ms = self.timeout_ms, "Script exceeded its deadline");
            self.interp.output_mut().notice(timeout_notice(self.timeout_ms));
        }
        let markup = self.interp.markup.take();
        let output = self.interp.take_output();
        ExecutionResult {
            truncated: output.is_truncated(),
            output: output.into_lines(),
            timed_out,
            markup,
        }
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::Object(object) if object.borrow().is_error() => object
            .borrow()
            .get("message")
            .map(|message| message.to_js_string())
            .unwrap_or_default(),
        other => other.to_js_string(),
    }
}
