//! `tracetree` assembles hierarchical execution traces out of scoped
//! spans and the structured log calls made while they're open.
//!
//! A trace is a tree of [`Span`](span::Span)s rooted at whatever scope
//! first opens one on a given thread or cooperative task. Nesting another
//! span while the first is still open adds a child in the same trace;
//! picking the work back up on a different thread or task without saying
//! so forks a new trace instead, linked back to the original one by id so
//! each can still be rendered, closed, and published independently
//! (see [`runtime`]).
//!
//! ```
//! use tracetree::new_span;
//!
//! fn handle_request() {
//!     let _span = new_span("handle_request");
//!     log::info!("doing some work");
//! }
//! ```
//!
//! Enable the `macros` feature (on by default) for the
//! `#[tracetree::span]` attribute, which wraps a function or method body
//! in a span without any explicit guard variable.
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod logbridge;
pub mod publisher;
pub mod registry;
pub mod render;
pub mod runtime;
pub mod span;
pub mod timestamp;
pub mod trace;
pub mod traceback;
pub mod tree_index;
pub mod worker;

#[cfg(feature = "macros")]
pub use tracetree_macros::span;

pub use config::{configure, configure_with_sink, Config};
pub use error::ConfigureError;
pub use event::Event;
pub use ids::{Ref, TraceId};
pub use logbridge::LogBridge;
pub use publisher::{LoggingSink, Publisher, TraceSink};
pub use render::{ChildTraceResolver, TextRenderer, TreeRenderer};
pub use runtime::{
    bind_task, current, new_span, new_span_forcing_new_trace, new_trace, report_exception, run_in_span, Bind,
    DetachedSpan, SpanGuard, Task, TaskGuard,
};
pub use span::{Span, Status};
pub use trace::Trace;
pub use traceback::{Frame, Traceback};
pub use tree_index::TreeIndex;
pub use worker::{spawn_traced, WorkerPool};

use std::collections::BTreeMap;

/// Attaches an arbitrary key/value mapping to the currently open span.
/// A no-op if no span is currently open.
pub fn log_extra(extra: BTreeMap<String, String>) {
    let Some((trace_id, index)) = current() else {
        return;
    };
    registry::with_trace(trace_id, |t| {
        if let Some(span) = t.span_mut(&index) {
            span.add_extra(extra);
        }
    });
}

/// Records a [`Ref`] pointing out from the current span, and returns it
/// so it can be handed to whatever will record the matching
/// [`Ref`](Ref)-bearing `RefDest` on the other end. A no-op (returning a
/// fresh, unrecorded `Ref`) if no span is currently open.
pub fn ref_src() -> Ref {
    let r = Ref::new();
    if let Some((trace_id, index)) = current() {
        registry::with_trace(trace_id, |t| {
            if let Some(span) = t.span_mut(&index) {
                span.add_ref_src(r);
            }
        });
    }
    r
}

/// Records `r` as a [`Ref`] pointing in to the current span. A no-op if
/// no span is currently open.
pub fn ref_dest(r: Ref) {
    if let Some((trace_id, index)) = current() {
        registry::with_trace(trace_id, |t| {
            if let Some(span) = t.span_mut(&index) {
                span.add_ref_dest(r);
            }
        });
    }
}

#[cfg(test)]
mod test;
