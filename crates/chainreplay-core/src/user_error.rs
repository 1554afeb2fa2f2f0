//! User handler failures and the operator-facing error sink.
//!
//! A [`UserHandlerError`] carries everything an operator needs to locate a
//! failing handler: the handler label, block number, formatted event params,
//! and a backtrace reduced to frames from user code.

use std::backtrace::BacktraceStatus;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::types::LogEvent;

/// Label used for the one-time setup task.
pub const SETUP_LABEL: &str = "setup";

/// A handler returned an error (or the error's cause chain ended in one).
#[derive(Debug, Clone)]
pub struct UserHandlerError {
    /// Readable one-line summary, e.g.
    /// `Error while handling "Token:Transfer" event at block 17: boom`.
    pub message: String,
    /// `"setup"` or `"{logFilterName}:{eventName}"`.
    pub handler: String,
    pub block_number: Option<u64>,
    /// Decoded params of the failing event.
    pub params: Option<serde_json::Value>,
    /// User-code frames of the captured backtrace plus the cause chain.
    pub stack: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl UserHandlerError {
    /// Failure inside the setup handler.
    pub fn setup(err: &anyhow::Error) -> Self {
        Self {
            message: format!("Error while handling \"{SETUP_LABEL}\" event: {err}"),
            handler: SETUP_LABEL.to_string(),
            block_number: None,
            params: None,
            stack: stack_of(err),
            occurred_at: Utc::now(),
        }
    }

    /// Failure inside a log event handler.
    pub fn log_event(event: &LogEvent, err: &anyhow::Error) -> Self {
        let handler = event.label();
        Self {
            message: format!(
                "Error while handling \"{handler}\" event at block {}: {err}",
                event.block.number
            ),
            handler,
            block_number: Some(event.block.number),
            params: Some(event.params.clone()),
            stack: stack_of(err),
            occurred_at: Utc::now(),
        }
    }
}

impl fmt::Display for UserHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(params) = &self.params {
            let pretty = serde_json::to_string_pretty(params).unwrap_or_else(|_| params.to_string());
            write!(f, "\nEvent params:\n{pretty}")?;
        }
        Ok(())
    }
}

impl std::error::Error for UserHandlerError {}

// ─── Stack translation ────────────────────────────────────────────────────────

fn stack_of(err: &anyhow::Error) -> Option<String> {
    let mut lines = Vec::new();
    let backtrace = err.backtrace();
    if backtrace.status() == BacktraceStatus::Captured {
        lines.extend(user_frames(&backtrace.to_string()));
    }
    for cause in err.chain().skip(1) {
        lines.push(format!("Caused by: {cause}"));
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Reduce a rendered std backtrace to `at symbol (file:line:col)` entries,
/// dropping frames from the standard library, the async runtime, and
/// registry crates.
pub fn user_frames(rendered: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut symbol: Option<&str> = None;
    for line in rendered.lines() {
        let trimmed = line.trim();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(sym) = symbol.take() {
                if !is_library_location(location) {
                    frames.push(format!("    at {sym} ({location})"));
                }
            }
        } else if let Some((index, rest)) = trimmed.split_once(": ") {
            if index.chars().all(|c| c.is_ascii_digit()) {
                symbol = Some(rest);
            }
        }
    }
    frames
}

fn is_library_location(location: &str) -> bool {
    location.starts_with("/rustc/")
        || location.contains("/.cargo/registry/")
        || location.contains("/library/std/")
        || location.contains("/library/core/")
}

// ─── Reporter ─────────────────────────────────────────────────────────────────

/// Operator-facing sink for handler errors.
///
/// Keeps the most recent error for polling consumers and fans every report out
/// to subscribers.
#[derive(Debug, Clone)]
pub struct UserErrorReporter {
    tx: broadcast::Sender<Arc<UserHandlerError>>,
    last: Arc<Mutex<Option<Arc<UserHandlerError>>>>,
}

impl UserErrorReporter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<UserHandlerError>> {
        self.tx.subscribe()
    }

    pub fn report(&self, error: Arc<UserHandlerError>) {
        *self.last.lock().unwrap() = Some(error.clone());
        // no subscribers is fine
        let _ = self.tx.send(error);
    }

    pub fn last(&self) -> Option<Arc<UserHandlerError>> {
        self.last.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        *self.last.lock().unwrap() = None;
    }
}

impl Default for UserErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}
