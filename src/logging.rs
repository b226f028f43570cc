//! Logging plumbing
//! Every engine component receives a [`Logger`] when it is constructed instead of
//! looking one up globally. By default a `Logger` forwards to the process-wide `log`
//! facade; tests hand in a [`CaptureLog`] to inspect what was emitted.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use serde::Serialize;

use crate::core::stream::{EventSender, StreamEvent};

/// A log record as forwarded to the operator console.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Explicit logging handle passed into each component.
#[derive(Clone)]
pub struct Logger {
    target: &'static str,
    sink: Option<Arc<dyn Log>>,
}

impl Logger {
    /// A logger writing through the global `log` facade.
    pub fn new(target: &'static str) -> Self {
        Self { target, sink: None }
    }

    /// A logger writing into a caller-provided sink.
    pub fn with_sink(target: &'static str, sink: Arc<dyn Log>) -> Self {
        Self {
            target,
            sink: Some(sink),
        }
    }

    /// Same sink, different target.
    pub fn scoped(&self, target: &'static str) -> Self {
        Self {
            target,
            sink: self.sink.clone(),
        }
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.emit(Level::Error, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.emit(Level::Warn, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.emit(Level::Info, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.emit(Level::Debug, message);
    }

    fn emit(&self, level: Level, message: impl fmt::Display) {
        let sink: &dyn Log = match &self.sink {
            Some(sink) => sink.as_ref(),
            None => {
                if level > log::max_level() {
                    return;
                }
                log::logger()
            }
        };
        let metadata = Metadata::builder().level(level).target(self.target).build();
        if !sink.enabled(&metadata) {
            return;
        }
        sink.log(
            &Record::builder()
                .metadata(metadata)
                .args(format_args!("{}", message))
                .build(),
        );
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct CaptureLog {
    records: Mutex<Vec<(Level, String)>>,
}

impl CaptureLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<(Level, String)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(_, message)| message.contains(needle))
    }
}

impl Log for CaptureLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// Process logger: env_logger formatting on stderr, plus an optional copy of every
/// record sent to the operator console as a [`StreamEvent::Log`].
pub struct ConsoleLogger {
    inner: env_logger::Logger,
    level: LevelFilter,
    console: Option<EventSender>,
}

impl ConsoleLogger {
    pub fn init(level: LevelFilter, console: Option<EventSender>) -> Result<(), SetLoggerError> {
        let inner = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .build();
        let logger = ConsoleLogger {
            inner,
            level,
            console,
        };
        log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))
    }

    fn forward(&self, record: &Record) {
        let Some(console) = &self.console else {
            return;
        };
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        // The console may already be gone during shutdown.
        let _ = console.send(StreamEvent::Log(log_message));
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level && self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.inner.log(record);
            self.forward(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}
