//! The append-only, heterogeneous event sequence a `Span` records.
use std::collections::BTreeMap;

use log::Level;

use crate::ids::{Ref, TraceId};
use crate::traceback::Traceback;

/// One entry appended to a `Span`, in the order it was recorded.
#[derive(Debug, Clone)]
pub enum Event {
    /// A structured log line recorded at some level.
    LogLine { level: Level, message: String },
    /// An arbitrary key/value mapping attached via `log_extra`/`add_extra`.
    Extra(BTreeMap<String, String>),
    /// An error that propagated through this span's close.
    ExitError(Traceback),
    /// An error reported while the span continued running.
    ExceptError(Traceback),
    /// The formatted text of the log line an `ExitError`/`ExceptError`
    /// event was derived from, so a renderer can show where it was
    /// emitted from.
    CallTrace(String),
    /// This span is the source of a cross-span reference.
    RefSrc(Ref),
    /// This span refers to a `RefSrc` recorded elsewhere.
    RefDest(Ref),
    /// This trace's root is a child of another trace (cross-runtime
    /// link), naming the parent trace's id and root span name.
    TreeParent { parent_name: String, parent_trace_id: TraceId },
    /// A child trace was spawned from this span (cross-runtime link).
    TreeChild(TraceId),
    /// A placeholder reserved for a nested child span, substituted by the
    /// renderer once the child's sub-tree is known. Keeps child spans
    /// interleaved with log events in the order they actually occurred.
    ChildSpanPlaceholder { child_index: u32 },
}

impl Event {
    /// Returns `true` if this event is the `TreeChild` naming `trace_id`.
    pub fn is_tree_child_of(&self, trace_id: TraceId) -> bool {
        matches!(self, Event::TreeChild(id) if *id == trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_child_matches_only_its_own_id() {
        let a = TraceId::next();
        let b = TraceId::next();
        let event = Event::TreeChild(a);
        assert!(event.is_tree_child_of(a));
        assert!(!event.is_tree_child_of(b));
    }
}
