//! Traces: an ordered collection of spans sharing a single `TraceId`.
use std::collections::HashMap;

use crate::ids::TraceId;
use crate::span::Span;
use crate::traceback::Traceback;
use crate::tree_index::TreeIndex;

/// A tree of `Span`s rooted at a single entry point, identified by a
/// process-local `TraceId`.
///
/// A `Trace` is mutated only by the runtime (thread or cooperative task)
/// that opened it; cross-runtime access goes through the registry, which
/// serializes it behind a mutex. Spans close in LIFO order, matching the
/// scoped-block discipline spans are opened under.
pub struct Trace {
    trace_id: TraceId,
    runtime_id: String,
    parent_trace_id: Option<TraceId>,
    spans: Vec<(TreeIndex, Span)>,
    index_of: HashMap<TreeIndex, usize>,
    open_stack: Vec<TreeIndex>,
}

impl Trace {
    pub(crate) fn new(
        trace_id: TraceId,
        runtime_id: impl Into<String>,
        parent_trace_id: Option<TraceId>,
    ) -> Trace {
        Trace {
            trace_id,
            runtime_id: runtime_id.into(),
            parent_trace_id,
            spans: Vec::new(),
            index_of: HashMap::new(),
            open_stack: Vec::new(),
        }
    }

    /// Inserts and opens the root span. Must be called exactly once,
    /// immediately after `new`. `parent` carries the name and id of the
    /// trace this one was forked from, if any, and is recorded as a
    /// `TreeParent` event on the new root.
    #[track_caller]
    pub(crate) fn open_root(&mut self, name: impl Into<String>, parent: Option<(String, TraceId)>) -> TreeIndex {
        let idx = TreeIndex::root();
        let mut span = Span::new(name, true);
        span.open();
        if let Some((parent_name, parent_trace_id)) = parent {
            span.add_tree_parent(parent_name, parent_trace_id);
        }
        self.insert(idx.clone(), span);
        self.open_stack.push(idx.clone());
        idx
    }

    /// Opens a new child span nested under the currently open span.
    ///
    /// # Panics
    ///
    /// Panics if no span is currently open in this trace.
    #[track_caller]
    pub(crate) fn open_child(&mut self, name: impl Into<String>) -> TreeIndex {
        let parent_idx = self.current_index().expect("no span open to nest under");
        let k = self
            .span_mut(&parent_idx)
            .expect("current span missing")
            .reserve_child_slot();
        let idx = parent_idx.child(k);
        let mut span = Span::new(name, false);
        span.open();
        self.insert(idx.clone(), span);
        self.open_stack.push(idx.clone());
        idx
    }

    fn insert(&mut self, idx: TreeIndex, span: Span) {
        self.index_of.insert(idx.clone(), self.spans.len());
        self.spans.push((idx, span));
    }

    /// Closes the span at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not the top of the open stack — spans in a
    /// trace must close LIFO, innermost first.
    pub(crate) fn close_span(&mut self, idx: &TreeIndex, failed: bool) {
        assert_eq!(self.open_stack.last(), Some(idx), "spans must close LIFO");
        self.open_stack.pop();
        self.span_mut(idx).expect("span missing").close(failed);
    }

    /// Attaches an `ExitError` to the root span, for the case where the
    /// root span itself closes with a propagating error.
    pub(crate) fn attach_root_exit_error(&mut self, tb: Traceback, call_trace: String) {
        let root_idx = self.root_index();
        self.span_mut(&root_idx)
            .expect("root always present")
            .add_exit_trace(tb, call_trace);
    }

    /// Attaches an `ExceptError` to the currently open span (or the root,
    /// if nothing is open), for an error reported without closing
    /// anything.
    pub(crate) fn attach_except_error(&mut self, tb: Traceback, call_trace: String) {
        let idx = self.current_index().unwrap_or_else(|| self.root_index());
        self.span_mut(&idx)
            .expect("span missing")
            .add_except_trace(tb, call_trace);
    }

    /// Records that a child trace was forked from the currently open
    /// span (or the root, if nothing is open).
    pub(crate) fn record_tree_child(&mut self, child_trace_id: TraceId) {
        let idx = self.current_index().unwrap_or_else(|| self.root_index());
        self.span_mut(&idx)
            .expect("span missing")
            .add_tree_child(child_trace_id);
    }

    /// This trace's id.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The identity of the thread or task this trace was opened on, used
    /// to detect a span being continued on a different runtime than the
    /// one that opened its trace.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// The id of the trace this one was forked from, if any.
    pub fn parent_trace_id(&self) -> Option<TraceId> {
        self.parent_trace_id
    }

    /// Looks up a span by its tree index.
    pub fn span(&self, idx: &TreeIndex) -> Option<&Span> {
        self.index_of.get(idx).map(|&i| &self.spans[i].1)
    }

    pub(crate) fn span_mut(&mut self, idx: &TreeIndex) -> Option<&mut Span> {
        self.index_of.get(idx).copied().map(move |i| &mut self.spans[i].1)
    }

    /// The root span's tree index; always `"0"`.
    pub fn root_index(&self) -> TreeIndex {
        TreeIndex::root()
    }

    /// The root span.
    pub fn root_span(&self) -> &Span {
        self.span(&self.root_index()).expect("root always present")
    }

    /// The tree index of the most recently opened, not-yet-closed span,
    /// or `None` if the trace has fully closed.
    pub fn current_index(&self) -> Option<TreeIndex> {
        self.open_stack.last().cloned()
    }

    /// `true` once every span opened in this trace has closed.
    pub fn is_fully_closed(&self) -> bool {
        self.open_stack.is_empty()
    }

    /// All spans in insertion order, alongside their tree index.
    pub fn spans(&self) -> impl Iterator<Item = &(TreeIndex, Span)> {
        self.spans.iter()
    }
}
