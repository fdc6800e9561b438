//! Spans: an ordered, append-only event log for one scoped block.
use std::collections::BTreeMap;
use std::panic::Location;
use std::time::{Duration, SystemTime};

use log::Level;

use crate::event::Event;
use crate::ids::{Ref, TraceId};
use crate::traceback::Traceback;

/// The lifecycle state of a `Span`.
///
/// The authoritative state machine: `Created -> Started -> {Succeeded,
/// Failed}`. No two-state `running`/`done` alias is exposed anywhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Constructed but not yet entered.
    Created,
    /// Entered; still running.
    Started,
    /// Closed without an error.
    Succeeded,
    /// Closed with an error that propagated through the close.
    Failed,
}

/// An ordered, append-only event log for one scoped block of execution.
///
/// A `Span` is mutated only by the runtime that opened it; once closed it
/// is immutable. Events are never reordered or removed — a `Vec` already
/// gives append order for free, so no separate event counter is kept; the
/// `Vec` index *is* the insertion index.
#[derive(Debug, Clone)]
pub struct Span {
    name: String,
    status: Status,
    ts_start: Option<SystemTime>,
    ts_end: Option<SystemTime>,
    call_location: Option<String>,
    events: Vec<Event>,
    child_count: u32,
    is_root: bool,
}

impl Span {
    /// Constructs a new `Created` span. `is_root` marks whether this span
    /// is the root of its trace, which governs what `close` does when the
    /// span fails (see `Trace::close_span`).
    pub(crate) fn new(name: impl Into<String>, is_root: bool) -> Span {
        Span {
            name: name.into(),
            status: Status::Created,
            ts_start: None,
            ts_end: None,
            call_location: None,
            events: Vec::new(),
            child_count: 0,
            is_root,
        }
    }

    /// Opens the span: `Created -> Started`, stamping `ts_start` and
    /// capturing `call_location` if it was not already supplied.
    ///
    /// # Panics
    ///
    /// Panics if the span is not `Created`.
    #[track_caller]
    pub(crate) fn open(&mut self) {
        assert_eq!(self.status, Status::Created, "span already opened");
        self.status = Status::Started;
        self.ts_start = Some(SystemTime::now());
        if self.call_location.is_none() {
            self.call_location = Some(Location::caller().to_string());
        }
    }

    /// Closes the span: `Started -> {Succeeded, Failed}`, stamping
    /// `ts_end`. Does not itself decide what "root closed with an error"
    /// means to the owning `Trace` — see `Trace::close_span`.
    ///
    /// # Panics
    ///
    /// Panics if the span is not `Started`.
    pub(crate) fn close(&mut self, failed: bool) {
        assert_eq!(self.status, Status::Started, "span not open");
        self.ts_end = Some(SystemTime::now());
        self.status = if failed { Status::Failed } else { Status::Succeeded };
    }

    /// Appends a structured log line.
    pub fn add_log(&mut self, level: Level, message: impl Into<String>) {
        self.events.push(Event::LogLine { level, message: message.into() });
    }

    /// Appends an arbitrary key/value mapping.
    pub fn add_extra(&mut self, extra: BTreeMap<String, String>) {
        self.events.push(Event::Extra(extra));
    }

    /// Appends a `RefSrc` event.
    pub fn add_ref_src(&mut self, r: Ref) {
        self.events.push(Event::RefSrc(r));
    }

    /// Appends a `RefDest` event.
    pub fn add_ref_dest(&mut self, r: Ref) {
        self.events.push(Event::RefDest(r));
    }

    /// Appends a `TreeParent` event naming the parent trace.
    pub fn add_tree_parent(&mut self, parent_name: impl Into<String>, parent_trace_id: TraceId) {
        self.events.push(Event::TreeParent {
            parent_name: parent_name.into(),
            parent_trace_id,
        });
    }

    /// Appends a `TreeChild` event naming a spawned child trace.
    pub fn add_tree_child(&mut self, child_trace_id: TraceId) {
        self.events.push(Event::TreeChild(child_trace_id));
    }

    /// Appends an `ExitError` event plus its parallel `CallTrace`.
    pub fn add_exit_trace(&mut self, trace: Traceback, call_trace: impl Into<String>) {
        self.events.push(Event::ExitError(trace));
        self.events.push(Event::CallTrace(call_trace.into()));
    }

    /// Appends an `ExceptError` event plus its parallel `CallTrace`.
    pub fn add_except_trace(&mut self, trace: Traceback, call_trace: impl Into<String>) {
        self.events.push(Event::ExceptError(trace));
        self.events.push(Event::CallTrace(call_trace.into()));
    }

    /// Allocates a new child slot and appends its placeholder event,
    /// preserving temporal interleaving between log events and nested
    /// spans. Returns the allocated child index.
    pub fn reserve_child_slot(&mut self) -> u32 {
        let k = self.child_count;
        self.child_count += 1;
        self.events.push(Event::ChildSpanPlaceholder { child_index: k });
        k
    }

    /// The span's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The span's current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// `true` once the span has closed, successfully or not.
    pub fn is_closed(&self) -> bool {
        matches!(self.status, Status::Succeeded | Status::Failed)
    }

    /// `true` if this is the root span of its trace.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// The start timestamp, set once the span opens.
    pub fn ts_start(&self) -> Option<SystemTime> {
        self.ts_start
    }

    /// The end timestamp, set once the span closes.
    pub fn ts_end(&self) -> Option<SystemTime> {
        self.ts_end
    }

    /// The span's duration, once closed. Returns `Duration::ZERO` rather
    /// than panicking if `ts_end` ever preceded `ts_start`.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.ts_start?, self.ts_end?);
        Some(end.duration_since(start).unwrap_or(Duration::ZERO))
    }

    /// The call site that opened this span.
    pub fn call_location(&self) -> Option<&str> {
        self.call_location.as_deref()
    }

    /// The events recorded so far, in insertion order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }
}
