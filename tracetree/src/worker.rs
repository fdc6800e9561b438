//! Explicit trace-propagating wrappers around thread spawning and a small
//! worker pool.
//!
//! Rust has no equivalent of monkeypatching a stdlib constructor, and
//! reaching for one would fight the borrow checker for no benefit —
//! instead callers opt in explicitly by spawning through
//! `spawn_traced`/`submit_traced`, the more conventional Rust shape
//! (wrapper functions, not runtime patching).
//!
//! Propagation allocates the dispatched work's trace id at submission
//! time, before the work runs, and records the `TreeChild` link on the
//! submitting span synchronously then — so the link exists even if that
//! span has already closed by the time the work actually starts. Once
//! the work runs, it gets its own root span under that preallocated id,
//! whether or not it ever calls `new_span` itself.
use std::thread::{self, JoinHandle};

use crate::config;
use crate::runtime;

/// Set to disable automatic propagation process-wide; see
/// `config::auto_instrumentation_disabled`.
fn propagation_disabled() -> bool {
    config::auto_instrumentation_disabled()
}

/// Spawns a thread running `f` inside its own root span named `name`,
/// under a trace id allocated and linked to the caller's current span (if
/// any) before the thread starts. If propagation is disabled, `f` runs
/// unwrapped, untraced.
pub fn spawn_traced<F, T>(name: impl Into<String>, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if propagation_disabled() {
        return thread::spawn(f);
    }
    let name = name.into();
    let preallocated = runtime::preallocate_child_trace();
    thread::spawn(move || preallocated.run(name, f))
}

/// A small fixed-size thread pool whose submitted jobs run inside their
/// own root span, under a trace id allocated and linked at
/// `submit_traced` time, the same way `spawn_traced` does for a one-off
/// thread.
///
/// This is deliberately minimal — a worker pool for exercising and testing
/// the propagation path, not a general-purpose executor. Production code
/// reaching for a real pool should wrap `submit_traced`'s propagation
/// technique around whichever pool it already uses.
pub struct WorkerPool {
    sender: std::sync::mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl WorkerPool {
    /// Builds a pool of `size` worker threads, named `<name>-0`, `<name>-1`,
    /// ... so each has a distinct `runtime_id`.
    pub fn new(name: &str, size: usize) -> WorkerPool {
        let (sender, receiver) = std::sync::mpsc::channel::<Job>();
        let receiver = std::sync::Arc::new(std::sync::Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    // This thread is the pool's own internal worker loop,
                    // not user code — it never opens spans of its own, so
                    // it is excluded from propagation the same way the
                    // original excludes `concurrent.futures.thread._worker`.
                    loop {
                        let job = { receiver.lock().unwrap_or_else(|e| e.into_inner()).recv() };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        WorkerPool { sender, workers }
    }

    /// Submits `f` to run on a pool worker inside its own root span named
    /// `name`, under a trace id allocated and linked to the submitting
    /// thread's current span (if any) synchronously, before `f` ever
    /// runs. If propagation is disabled, `f` runs unwrapped, untraced.
    pub fn submit_traced<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if propagation_disabled() {
            let _ = self.sender.send(Box::new(f));
            return;
        }
        let name = name.into();
        let preallocated = runtime::preallocate_child_trace();
        let job: Job = Box::new(move || {
            preallocated.run(name, f);
        });
        let _ = self.sender.send(job);
    }

    /// Shuts the pool down, joining every worker. Blocks until all
    /// previously submitted jobs finish.
    pub fn join(self) {
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}
