//! Rendering a `Trace` to text.
//!
//! Deliberately plain: no terminal-color markup. The library's job is to
//! produce the string, not to decide how a terminal should show it.
use std::fmt::Write as _;

use crate::event::Event;
use crate::ids::TraceId;
use crate::timestamp::format_rfc3339;
use crate::trace::Trace;
use crate::tree_index::TreeIndex;

/// Resolves a child trace's already-rendered text, for splicing a
/// `TreeChild` event into its parent's output. The publisher is the
/// natural implementor, since it alone tracks which traces have already
/// been rendered.
pub trait ChildTraceResolver {
    /// Returns the rendered text for `trace_id`, if it is available yet.
    fn resolve(&self, trace_id: TraceId) -> Option<String>;
}

/// A resolver that never has anything available — every `TreeChild`
/// renders as pending. Useful for rendering a trace in isolation, and in
/// tests.
pub struct NoChildren;

impl ChildTraceResolver for NoChildren {
    fn resolve(&self, _trace_id: TraceId) -> Option<String> {
        None
    }
}

/// Renders traces to an indented text tree.
pub trait TreeRenderer {
    /// Renders `trace` in full, consulting `resolver` for any `TreeChild`
    /// links.
    fn render(&self, trace: &Trace, resolver: &dyn ChildTraceResolver) -> String;
}

/// The default `TreeRenderer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextRenderer;

impl TreeRenderer for TextRenderer {
    fn render(&self, trace: &Trace, resolver: &dyn ChildTraceResolver) -> String {
        let mut out = String::new();
        render_span(trace, &trace.root_index(), 0, &mut out, resolver);
        out
    }
}

fn render_span(trace: &Trace, idx: &TreeIndex, depth: usize, out: &mut String, resolver: &dyn ChildTraceResolver) {
    let span = match trace.span(idx) {
        Some(span) => span,
        None => return,
    };
    let indent = "  ".repeat(depth);

    let ts = span.ts_start().map(format_rfc3339).unwrap_or_default();
    let duration_ms = span
        .duration()
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0);
    let _ = writeln!(
        out,
        "{indent}{} => {:?}  {ts} \u{29d6} {duration_ms:.3}ms",
        span.name(),
        span.status()
    );

    for event in span.events() {
        match event {
            Event::LogLine { level, message } => {
                let _ = writeln!(out, "{indent}  [{level}] {message}");
            }
            Event::Extra(map) => {
                for (k, v) in map {
                    let _ = writeln!(out, "{indent}  {k}={v}");
                }
            }
            Event::ExitError(tb) => {
                let _ = writeln!(out, "{indent}  ExitError: {tb}");
            }
            Event::ExceptError(tb) => {
                let _ = writeln!(out, "{indent}  ExceptError: {tb}");
            }
            Event::CallTrace(site) => {
                let _ = writeln!(out, "{indent}  at {site}");
            }
            Event::RefSrc(r) => {
                let _ = writeln!(out, "{indent}  ref_src={r}");
            }
            Event::RefDest(r) => {
                let _ = writeln!(out, "{indent}  ref_dest={r}");
            }
            // Rendered by the side holding the child: the root of the
            // forked trace carries `TreeParent`, but we only render it
            // from the parent's `TreeChild` side to avoid duplicating the
            // link in both outputs.
            Event::TreeParent { .. } => {}
            Event::TreeChild(child_trace_id) => match resolver.resolve(*child_trace_id) {
                Some(rendered) => out.push_str(&indent_block(&rendered, depth + 1)),
                None => {
                    let _ = writeln!(out, "{indent}  (child trace {child_trace_id} pending)");
                }
            },
            Event::ChildSpanPlaceholder { child_index } => {
                render_span(trace, &idx.child(*child_index), depth + 1, out, resolver);
            }
        }
    }
}

fn indent_block(text: &str, depth: usize) -> String {
    let indent = "  ".repeat(depth);
    let mut out = String::new();
    for line in text.lines() {
        let _ = writeln!(out, "{indent}{line}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TraceId;

    fn sample_trace() -> Trace {
        let mut trace = Trace::new(TraceId::next(), "thread:test", None);
        trace.open_root("request", None);
        let child = trace.open_child("step");
        trace.close_span(&child, false);
        trace
    }

    #[test]
    fn renders_nested_span_indented_under_its_parent() {
        let mut trace = sample_trace();
        trace.close_span(&trace.root_index(), false);
        let text = TextRenderer.render(&trace, &NoChildren);
        assert!(text.contains("request => Succeeded"));
        assert!(text.contains("  step => Succeeded"));
    }

    #[test]
    fn tree_child_without_a_resolved_child_renders_pending() {
        let mut trace = sample_trace();
        let child_id = TraceId::next();
        trace.record_tree_child(child_id);
        trace.close_span(&trace.root_index(), false);
        let text = TextRenderer.render(&trace, &NoChildren);
        assert!(text.contains("pending"));
    }

    #[test]
    fn tree_child_splices_in_resolved_child_text() {
        struct Fixed(TraceId, String);
        impl ChildTraceResolver for Fixed {
            fn resolve(&self, trace_id: TraceId) -> Option<String> {
                if trace_id == self.0 {
                    Some(self.1.clone())
                } else {
                    None
                }
            }
        }

        let mut trace = sample_trace();
        let child_id = TraceId::next();
        trace.record_tree_child(child_id);
        trace.close_span(&trace.root_index(), false);
        let resolver = Fixed(child_id, "other-process-root => Succeeded\n".to_string());
        let text = TextRenderer.render(&trace, &resolver);
        assert!(text.contains("other-process-root => Succeeded"));
        assert!(!text.contains("pending"));
    }
}
