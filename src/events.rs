//! Diagnostic events mirrored to an external sink.
//!
//! Three message classes flow out of the protocol core:
//! * raw trace lines: request/response fragments as they cross the wire
//! * structured info: `{message, payload?}`
//! * structured errors: `{code, message, payload?}`
//!
//! Each class can be suppressed independently, and a master switch mutes
//! everything at once (useful when a browser event stream is the consumer
//! and nobody is watching). The default sink forwards to the `log` facade.

use std::sync::atomic::{AtomicBool, Ordering};

/// A single diagnostic event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Raw protocol fragment, one line or body chunk at a time.
    Trace(String),

    /// Informational message with an optional payload.
    Info {
        message: String,
        payload: Option<String>,
    },

    /// Error report carrying the status code that triggered it.
    Error {
        code: u16,
        message: String,
        payload: Option<String>,
    },
}

/// Consumer of diagnostic events.
///
/// Implementations must be cheap to call: the transport mirrors every
/// outgoing and incoming fragment through [`EventSink::trace`].
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);

    fn trace(&self, line: &str) {
        self.emit(Event::Trace(line.to_owned()));
    }

    fn info(&self, message: &str, payload: Option<&str>) {
        self.emit(Event::Info {
            message: message.to_owned(),
            payload: payload.map(str::to_owned),
        });
    }

    fn error(&self, code: u16, message: &str, payload: Option<&str>) {
        self.emit(Event::Error {
            code,
            message: message.to_owned(),
            payload: payload.map(str::to_owned),
        });
    }
}

/// Sink backed by the `log` facade, with per-class suppression.
#[derive(Debug)]
pub struct LogSink {
    enabled: AtomicBool,
    trace_enabled: AtomicBool,
    info_enabled: AtomicBool,
    error_enabled: AtomicBool,
}

impl Default for LogSink {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            trace_enabled: AtomicBool::new(true),
            info_enabled: AtomicBool::new(true),
            error_enabled: AtomicBool::new(true),
        }
    }
}

impl LogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Master switch over all classes. Returns the new state.
    pub fn toggle(&self) -> bool {
        let enabled = !self.enabled.load(Ordering::Relaxed);
        self.enabled.store(enabled, Ordering::Relaxed);
        enabled
    }

    pub fn set_trace_enabled(&self, enabled: bool) {
        self.trace_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_info_enabled(&self, enabled: bool) {
        self.info_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_error_enabled(&self, enabled: bool) {
        self.error_enabled.store(enabled, Ordering::Relaxed);
    }

    fn class_enabled(&self, event: &Event) -> bool {
        let class = match event {
            Event::Trace(_) => &self.trace_enabled,
            Event::Info { .. } => &self.info_enabled,
            Event::Error { .. } => &self.error_enabled,
        };
        self.enabled.load(Ordering::Relaxed) && class.load(Ordering::Relaxed)
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        if !self.class_enabled(&event) {
            return;
        }

        match event {
            Event::Trace(line) => trace!("{line}"),
            Event::Info { message, payload } => match payload {
                Some(payload) => info!("{message}: {payload}"),
                None => info!("{message}"),
            },
            Event::Error {
                code,
                message,
                payload,
            } => match payload {
                Some(payload) => error!("[{code}] {message}: {payload}"),
                None => error!("[{code}] {message}"),
            },
        }
    }
}
