//! Runtime instrumentation: the thread/task-local "current span" binding,
//! the join-vs-fork decision when opening a span, and the `SpanGuard`
//! through which callers actually drive a span's lifecycle.
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::ids::TraceId;
use crate::registry;
use crate::trace::Trace;
use crate::traceback::Traceback;
use crate::tree_index::TreeIndex;

thread_local! {
    static CURRENT: RefCell<Option<(TraceId, TreeIndex)>> = RefCell::new(None);
    static TASK_NAME: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

/// Identifies the runtime (OS thread, optionally refined by a cooperative
/// task name) a trace or span was opened on. The task half is empty
/// unless execution is currently inside a `Bind`- or `Task`-wrapped
/// future poll.
pub fn runtime_id() -> String {
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("unnamed").to_string();
    let task = TASK_NAME.with(|stack| stack.borrow().last().cloned());
    match task {
        Some(task) => format!("thread:{thread_name}.task:{task}"),
        None => format!("thread:{thread_name}"),
    }
}

/// A guard object for the thread-local current span binding.
///
/// Restores the previous binding when it drops.
pub struct CurrentGuard {
    prev: Option<(TraceId, TreeIndex)>,
    // !Send: pokes at thread locals.
    _p: PhantomData<*const ()>,
}

unsafe impl Sync for CurrentGuard {}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.prev.take());
    }
}

/// Sets this thread's current span binding, returning a guard that
/// restores the previous one on drop.
fn set_current(next: Option<(TraceId, TreeIndex)>) -> CurrentGuard {
    let prev = CURRENT.with(|c| c.replace(next));
    CurrentGuard { prev, _p: PhantomData }
}

/// Returns this thread's current `(trace, span index)` binding, if any.
pub fn current() -> Option<(TraceId, TreeIndex)> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Marks the calling context as running under a distinct cooperative
/// task, independent of whatever task name (if any) was already active.
/// Pushes a name onto the task-identity stack on construction and pops
/// it on drop, so the identity survives a panicking poll exactly as
/// reliably as a normal return.
pub struct TaskGuard {
    // !Send: pokes at thread locals.
    _p: PhantomData<*const ()>,
}

impl TaskGuard {
    /// Pushes `task_name` onto this thread's task-identity stack.
    pub fn new(task_name: impl Into<String>) -> TaskGuard {
        TASK_NAME.with(|stack| stack.borrow_mut().push(task_name.into()));
        TaskGuard { _p: PhantomData }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        TASK_NAME.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// A guard object for an open span.
///
/// Closes the span when dropped: `Succeeded` on an ordinary drop,
/// `Failed` if the drop is unwinding (`std::thread::panicking()`), which
/// is the idiomatic analogue of a context manager seeing a propagating
/// exception on exit. Code that reports errors through `Result` instead
/// of unwinding should call `fail` explicitly before the guard drops; see
/// `run_in_span`.
pub struct SpanGuard {
    trace_id: TraceId,
    index: TreeIndex,
    closed: bool,
    _attach: Option<CurrentGuard>,
}

impl SpanGuard {
    /// This span's trace id.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// This span's tree index within its trace.
    pub fn index(&self) -> &TreeIndex {
        &self.index
    }

    /// Closes the span as `Succeeded`.
    pub fn close(mut self) {
        self.close_as(false);
    }

    /// Closes the span as `Failed`, attaching `tb` — to the root's
    /// `ExitError` if this is the root span, otherwise to the span's own
    /// event log via the status transition alone (the error itself is
    /// expected to already have been reported via `report_exception` or a
    /// log call).
    pub fn fail(mut self, tb: Traceback, call_trace: impl Into<String>) {
        let call_trace = call_trace.into();
        if self.index == TreeIndex::root() {
            registry::with_trace(self.trace_id, |t| {
                t.attach_root_exit_error(tb, call_trace);
            });
        }
        self.close_as(true);
    }

    fn close_as(&mut self, failed: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        registry::with_trace(self.trace_id, |t| t.close_span(&self.index, failed));
        if self.index == TreeIndex::root() {
            if let Some(publisher) = crate::config::publisher() {
                publisher.notify_root_closed(self.trace_id);
            }
        }
    }

    /// Detaches this span from the current thread, returning a value that
    /// can move to another thread and later be `attach`ed or `bind`-ed to
    /// a future.
    pub fn detach(mut self) -> DetachedSpan {
        DetachedSpan {
            trace_id: self.trace_id,
            index: mem::replace(&mut self.index, TreeIndex::root()),
            closed: mem::replace(&mut self.closed, true),
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.close_as(std::thread::panicking());
    }
}

/// A span detached from any thread's current-span binding. `Send`, unlike
/// `SpanGuard`, which carries a `!Send` guard.
pub struct DetachedSpan {
    trace_id: TraceId,
    index: TreeIndex,
    closed: bool,
}

impl DetachedSpan {
    /// Re-attaches this span to the calling thread's current-span
    /// binding.
    pub fn attach(mut self) -> SpanGuard {
        let guard = set_current(Some((self.trace_id, self.index.clone())));
        SpanGuard {
            trace_id: self.trace_id,
            index: mem::replace(&mut self.index, TreeIndex::root()),
            closed: mem::replace(&mut self.closed, true),
            _attach: Some(guard),
        }
    }

    /// Binds this span to a future: its context becomes current every
    /// time the future is polled, and the span closes when the future
    /// completes or is dropped.
    pub fn bind<F: Future>(self, future: F) -> Bind<F> {
        Bind { span: self, future }
    }
}

impl Drop for DetachedSpan {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let failed = std::thread::panicking();
            registry::with_trace(self.trace_id, |t| t.close_span(&self.index, failed));
            if self.index == TreeIndex::root() {
                if let Some(publisher) = crate::config::publisher() {
                    publisher.notify_root_closed(self.trace_id);
                }
            }
        }
    }
}

pin_project! {
    /// A future wrapping a `DetachedSpan`, setting it current on every
    /// poll. This is the crate's sanctioned way to model a cooperative
    /// task's identity without depending on any particular async runtime.
    pub struct Bind<F> {
        span: DetachedSpan,
        #[pin]
        future: F,
    }
}

impl<F: Future> Future for Bind<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        let _guard = set_current(Some((this.span.trace_id, this.span.index.clone())));
        let task_name = format!("{:p}", this.span as *const DetachedSpan);
        let _task = TaskGuard::new(task_name);
        this.future.poll(cx)
    }
}

pin_project! {
    /// A future that runs under a distinct cooperative task identity on
    /// every poll, established before the wrapped future's body ever
    /// runs — unlike `Bind`, no span is attached up front. This lets the
    /// first `new_span` call inside the wrapped future see a `runtime_id`
    /// that differs from whatever thread happens to poll it, so it forks
    /// a new trace instead of joining one already current on that
    /// thread.
    ///
    /// Whatever current-span binding the wrapped future establishes for
    /// itself (by calling `new_span`) is saved away between polls and
    /// restored only while this task is the one being polled, so it
    /// survives an `.await` without leaking into whichever other task or
    /// thread gets polled next on the same thread.
    pub struct Task<F> {
        name: String,
        current: Option<(TraceId, TreeIndex)>,
        #[pin]
        future: F,
    }
}

impl<F: Future> Future for Task<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        let _task = TaskGuard::new(this.name.clone());
        let _current_guard = set_current(this.current.take());
        let result = this.future.poll(cx);
        *this.current = current();
        result
    }
}

/// Wraps `future` so every poll runs under the distinct cooperative task
/// identity `name`. Unlike `DetachedSpan::bind`, this does not require an
/// already-open span to detach — it marks task identity up front, so a
/// `new_span` call made from inside `future` forks a new trace rather
/// than silently joining whatever trace happens to be current on the
/// polling thread.
pub fn bind_task<F: Future>(name: impl Into<String>, future: F) -> Task<F> {
    Task { name: name.into(), current: None, future }
}

/// A trace id allocated for a unit of work at hand-off time — before the
/// work itself begins running. `worker::spawn_traced`/`submit_traced`
/// call `preallocate_child_trace` synchronously when the work is
/// submitted, recording the `TreeChild` link immediately, then carry the
/// returned value across the thread boundary so the dispatched call can
/// be wrapped in its own root span, under this same trace id, once it
/// actually runs — even if the submitting span has already closed by
/// then.
pub(crate) struct PreallocatedTrace {
    trace_id: TraceId,
    parent: Option<(String, TraceId)>,
}

/// Allocates a trace id for a unit of work about to be handed off to
/// another thread or queue. If a trace is current on the calling thread,
/// synchronously records a `TreeChild` link to the new id on the current
/// span, so the link exists even if the submitting span closes before
/// the dispatched work runs.
pub(crate) fn preallocate_child_trace() -> PreallocatedTrace {
    let trace_id = TraceId::next();
    match current() {
        Some((parent_trace_id, current_idx)) => {
            let parent_name = registry::with_trace(parent_trace_id, |t| {
                t.span(&current_idx).map(|s| s.name().to_string())
            })
            .flatten()
            .unwrap_or_else(|| "unknown".to_string());
            registry::with_trace(parent_trace_id, |t| t.record_tree_child(trace_id));
            PreallocatedTrace {
                trace_id,
                parent: Some((parent_name, parent_trace_id)),
            }
        }
        None => PreallocatedTrace { trace_id, parent: None },
    }
}

impl PreallocatedTrace {
    /// Runs `f` inside a freshly opened root span under this
    /// preallocated trace id, on whatever thread calls it. Closes the
    /// span as `Succeeded` when `f` returns, or `Failed` (via the span
    /// guard's `Drop`) if `f` panics.
    #[track_caller]
    pub(crate) fn run<T>(self, name: impl Into<String>, f: impl FnOnce() -> T) -> T {
        let guard = start_new_trace(self.trace_id, name.into(), runtime_id(), self.parent);
        let result = f();
        guard.close();
        result
    }
}

/// Opens a new span, joining the current trace if one is bound to this
/// runtime, forking a fresh child trace if the current trace belongs to a
/// different runtime, or starting a brand-new trace if nothing is
/// current.
#[track_caller]
pub fn new_span(name: impl Into<String>) -> SpanGuard {
    new_span_impl(name.into(), false)
}

/// Opens a new span that always forks a fresh trace, linked back to
/// whatever trace is current (if any) the same way a runtime-migration
/// fork is linked, regardless of whether the calling runtime matches.
#[track_caller]
pub fn new_span_forcing_new_trace(name: impl Into<String>) -> SpanGuard {
    new_span_impl(name.into(), true)
}

#[track_caller]
fn new_span_impl(name: String, force_new_trace: bool) -> SpanGuard {
    let this_runtime = runtime_id();

    let Some((trace_id, current_idx)) = current() else {
        return start_new_trace(TraceId::next(), name, this_runtime, None);
    };

    if force_new_trace {
        return fork_new_trace(name, this_runtime, trace_id, &current_idx);
    }

    let same_runtime = registry::with_trace(trace_id, |t| t.runtime_id() == this_runtime);
    match same_runtime {
        Some(true) => {
            let idx = registry::with_trace(trace_id, |t| t.open_child(name))
                .expect("current trace vanished while current span binding was live");
            let guard = set_current(Some((trace_id, idx.clone())));
            SpanGuard {
                trace_id,
                index: idx,
                closed: false,
                _attach: Some(guard),
            }
        }
        // Same runtime, but the trace the binding pointed at is gone
        // (already published and evicted) — start fresh rather than
        // panic.
        None => start_new_trace(TraceId::next(), name, this_runtime, None),
        Some(false) => fork_new_trace(name, this_runtime, trace_id, &current_idx),
    }
}

/// Forks a new trace from `current_idx` in `parent_trace_id`, linking the
/// two with `TreeParent`/`TreeChild` events.
fn fork_new_trace(name: String, this_runtime: String, parent_trace_id: TraceId, current_idx: &TreeIndex) -> SpanGuard {
    let parent_name = registry::with_trace(parent_trace_id, |t| {
        t.span(current_idx).map(|s| s.name().to_string())
    })
    .flatten()
    .unwrap_or_else(|| "unknown".to_string());
    let guard = start_new_trace(TraceId::next(), name, this_runtime, Some((parent_name, parent_trace_id)));
    registry::with_trace(parent_trace_id, |t| t.record_tree_child(guard.trace_id));
    guard
}

/// Opens a brand-new, top-level trace regardless of what's current.
#[track_caller]
pub fn new_trace(name: impl Into<String>) -> SpanGuard {
    start_new_trace(TraceId::next(), name.into(), runtime_id(), None)
}

fn start_new_trace(trace_id: TraceId, name: String, runtime_id: String, parent: Option<(String, TraceId)>) -> SpanGuard {
    let parent_trace_id = parent.as_ref().map(|(_, id)| *id);
    let mut trace = Trace::new(trace_id, runtime_id, parent_trace_id);
    let idx = trace.open_root(name, parent);
    registry::insert(trace);
    let guard = set_current(Some((trace_id, idx.clone())));
    SpanGuard {
        trace_id,
        index: idx,
        closed: false,
        _attach: Some(guard),
    }
}

/// Runs `f`, closing the span as `Succeeded` if it returns `Ok` and as
/// `Failed` — recording an `ExitError` if this is the root span of its
/// trace — if it returns `Err`. The idiomatic realization of "error
/// propagated through span close" for `Result`-returning code, alongside
/// the panic-unwind path `SpanGuard`'s `Drop` already covers.
#[track_caller]
pub fn run_in_span<T, E>(name: impl Into<String>, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
where
    E: std::error::Error,
{
    let span = new_span(name);
    match f() {
        Ok(value) => {
            span.close();
            Ok(value)
        }
        Err(err) => {
            let tb = Traceback::capture(err.to_string());
            span.fail(tb, "run_in_span");
            Err(err)
        }
    }
}

/// Reports an error against the currently open span without closing it.
/// A no-op if no trace is current.
#[track_caller]
pub fn report_exception(err: &dyn std::error::Error) {
    let Some((trace_id, _)) = current() else {
        return;
    };
    let tb = Traceback::capture(err.to_string());
    registry::with_trace(trace_id, |t| {
        t.attach_except_error(tb, std::panic::Location::caller().to_string());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Status;

    #[test]
    fn opening_with_no_current_starts_a_fresh_trace() {
        let _lock = crate::test_support::lock_registry();
        registry::clear();
        let guard = new_span("root");
        let trace_id = guard.trace_id();
        guard.close();
        let status = registry::with_trace(trace_id, |t| t.root_span().status());
        assert_eq!(status, Some(Status::Succeeded));
    }

    #[test]
    fn nested_span_joins_the_current_trace() {
        let _lock = crate::test_support::lock_registry();
        registry::clear();
        let outer = new_span("outer");
        let outer_trace = outer.trace_id();
        let inner = new_span("inner");
        assert_eq!(inner.trace_id(), outer_trace);
        inner.close();
        outer.close();
        let span_count = registry::with_trace(outer_trace, |t| t.spans().count());
        assert_eq!(span_count, Some(2));
    }

    #[test]
    fn fail_on_root_attaches_exit_error() {
        let _lock = crate::test_support::lock_registry();
        registry::clear();
        let guard = new_span("root");
        let trace_id = guard.trace_id();
        guard.fail(Traceback::capture("boom"), "test");
        let has_exit_error = registry::with_trace(trace_id, |t| {
            t.root_span()
                .events()
                .iter()
                .any(|e| matches!(e, crate::event::Event::ExitError(_)))
        });
        assert_eq!(has_exit_error, Some(true));
    }

    #[test]
    fn run_in_span_closes_succeeded_on_ok() {
        let _lock = crate::test_support::lock_registry();
        registry::clear();
        let result: Result<(), std::io::Error> = run_in_span("ok-case", || Ok(()));
        assert!(result.is_ok());
    }

    #[test]
    fn dropping_without_explicit_close_succeeds() {
        let _lock = crate::test_support::lock_registry();
        registry::clear();
        let trace_id = {
            let guard = new_span("implicit");
            guard.trace_id()
        };
        let status = registry::with_trace(trace_id, |t| t.root_span().status());
        assert_eq!(status, Some(Status::Succeeded));
    }

    #[test]
    fn force_new_trace_forks_even_on_the_same_runtime() {
        let _lock = crate::test_support::lock_registry();
        registry::clear();
        let parent = new_span("parent");
        let parent_trace = parent.trace_id();

        let forced = new_span_forcing_new_trace("forced_parent");
        let forced_trace = forced.trace_id();
        assert_ne!(forced_trace, parent_trace);

        let grandchild = new_span("child_forced_parent");
        assert_eq!(grandchild.trace_id(), forced_trace, "nested span still joins the forced trace");
        grandchild.close();
        forced.close();
        parent.close();

        let parent_links_to_forced = registry::with_trace(parent_trace, |t| {
            t.root_span().events().iter().any(|e| e.is_tree_child_of(forced_trace))
        });
        assert_eq!(parent_links_to_forced, Some(true));
        assert_eq!(registry::with_trace(forced_trace, |t| t.parent_trace_id()), Some(Some(parent_trace)));
    }
}
