//! The process-wide trace table.
//!
//! A single module-level registry holds every `Trace` still live in the
//! process, keyed by `TraceId`, so that a span opened on one thread can
//! later be found and mutated by the publisher running on another. Span
//! bookkeeping is always-on: there is no "unconfigured" state to fall
//! back to.
use std::collections::HashMap;
use std::sync::Mutex;

use lazycell::AtomicLazyCell;

use crate::ids::TraceId;
use crate::trace::Trace;

static REGISTRY: AtomicLazyCell<Mutex<HashMap<TraceId, Trace>>> = AtomicLazyCell::NONE;

fn table() -> &'static Mutex<HashMap<TraceId, Trace>> {
    if let Some(table) = REGISTRY.borrow() {
        return table;
    }
    // Lost a race with another thread's fill; that's fine, the value is
    // identical either way.
    let _ = REGISTRY.fill(Mutex::new(HashMap::new()));
    REGISTRY.borrow().expect("just filled")
}

/// Registers a freshly created trace. Panics if its id already exists,
/// which would indicate a `TraceId` allocation bug.
pub(crate) fn insert(trace: Trace) {
    let mut table = table().lock().unwrap_or_else(|e| e.into_inner());
    let id = trace.trace_id();
    let prior = table.insert(id, trace);
    assert!(prior.is_none(), "trace id {} registered twice", id);
}

/// Runs `f` against the trace with id `id`, if it is still registered.
pub(crate) fn with_trace<R>(id: TraceId, f: impl FnOnce(&mut Trace) -> R) -> Option<R> {
    let mut table = table().lock().unwrap_or_else(|e| e.into_inner());
    table.get_mut(&id).map(f)
}

/// Removes and returns a trace. Used by the publisher once a trace has
/// been fully rendered and is no longer needed.
pub(crate) fn remove(id: TraceId) -> Option<Trace> {
    let mut table = table().lock().unwrap_or_else(|e| e.into_inner());
    table.remove(&id)
}

/// The number of traces currently registered. Exposed for tests asserting
/// on the published/pending boundary.
pub fn len() -> usize {
    table().lock().unwrap_or_else(|e| e.into_inner()).len()
}

/// Drops every registered trace. A reset hook for tests that need to
/// clear global state between cases.
pub fn clear() {
    table().lock().unwrap_or_else(|e| e.into_inner()).clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_round_trip() {
        let _lock = crate::test_support::lock_registry();
        clear();
        let id = TraceId::next();
        insert(Trace::new(id, "thread:test", None));
        assert_eq!(len(), 1);
        let got = with_trace(id, |t| t.trace_id());
        assert_eq!(got, Some(id));
        let removed = remove(id);
        assert!(removed.is_some());
        assert_eq!(with_trace(id, |t| t.trace_id()), None);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn inserting_duplicate_id_panics() {
        let _lock = crate::test_support::lock_registry();
        clear();
        let id = TraceId::next();
        insert(Trace::new(id, "thread:test", None));
        insert(Trace::new(id, "thread:test", None));
    }
}
