//! Bridges the `log` facade into the current span.
//!
//! Routes every log record either into the currently open span or, if
//! none is open, to an inner fallback logger. Error attachment is
//! handled separately, by `runtime::report_exception` and
//! `runtime::run_in_span`'s failure path — a plain `log::Record` carries
//! no exception payload, so this bridge only ever produces
//! `Event::LogLine`s.
use log::{Level, Log, Metadata, Record};

use crate::registry;
use crate::runtime;

/// A `log::Log` implementation that records lines into the current span
/// when one is open, and otherwise forwards to an inner logger.
pub struct LogBridge {
    inner: Box<dyn Log>,
}

impl LogBridge {
    /// Wraps `inner`, which receives every record that arrives with no
    /// span currently open.
    pub fn new(inner: Box<dyn Log>) -> LogBridge {
        LogBridge { inner }
    }
}

impl Log for LogBridge {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match runtime::current() {
            Some((trace_id, index)) => {
                let level = record.level();
                let message = record.args().to_string();
                let recorded = registry::with_trace(trace_id, |t| {
                    if let Some(span) = t.span_mut(&index) {
                        span.add_log(level, message);
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
                if !recorded {
                    self.inner.log(record);
                }
            }
            None => self.inner.log(record),
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// A `Log` that discards everything, used as `LogBridge`'s inner logger
/// when there's nothing to fall back to.
pub struct NullLog;

impl Log for NullLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        false
    }
    fn log(&self, _record: &Record<'_>) {}
    fn flush(&self) {}
}
