//! End-to-end scenarios exercising the public API together, rather than
//! one module at a time.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::publisher::{Publisher, TraceSink};
use crate::registry;
use crate::runtime::{bind_task, new_span, new_span_forcing_new_trace, new_trace, report_exception, run_in_span};
use crate::span::Status;
use crate::worker::spawn_traced;
use crate::{ids::TraceId, log_extra};

struct RecordingSink(Arc<Mutex<Vec<(TraceId, String)>>>);

impl TraceSink for RecordingSink {
    fn publish(&mut self, trace_id: TraceId, rendered: &str) {
        self.0.lock().unwrap().push((trace_id, rendered.to_string()));
    }
}

fn start_recording_publisher() -> (Publisher, Arc<Mutex<Vec<(TraceId, String)>>>) {
    let published = Arc::new(Mutex::new(Vec::new()));
    let publisher = Publisher::start(
        Box::new(RecordingSink(published.clone())),
        Duration::from_millis(20),
        Duration::from_millis(200),
    );
    (publisher, published)
}

#[test]
fn s1_a_single_span_records_logs_and_extras() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let span = new_span("root");
    let trace_id = span.trace_id();
    let mut extra = BTreeMap::new();
    extra.insert("user_id".to_string(), "42".to_string());
    log_extra(extra);
    span.close();

    let span_count = registry::with_trace(trace_id, |t| t.spans().count());
    assert_eq!(span_count, Some(1));
    let status = registry::with_trace(trace_id, |t| t.root_span().status());
    assert_eq!(status, Some(Status::Succeeded));
}

#[test]
fn s2_nested_spans_form_a_tree_under_one_trace() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let root = new_span("request");
    let trace_id = root.trace_id();
    {
        let step_one = new_span("validate");
        step_one.close();
    }
    {
        let step_two = new_span("persist");
        {
            let nested = new_span("write-through-cache");
            nested.close();
        }
        step_two.close();
    }
    root.close();

    let indices: Vec<String> = registry::with_trace(trace_id, |t| {
        t.spans().map(|(idx, _)| idx.to_string()).collect()
    })
    .unwrap();
    assert_eq!(indices, vec!["0", "0/0", "0/1", "0/1/0"]);
}

#[test]
fn s3_reporting_an_exception_does_not_close_the_span() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let span = new_span("background-job");
    let trace_id = span.trace_id();
    let err = std::io::Error::new(std::io::ErrorKind::Other, "disk hiccup");
    report_exception(&err);

    let status = registry::with_trace(trace_id, |t| t.root_span().status());
    assert_eq!(status, Some(Status::Started));
    let has_except_error = registry::with_trace(trace_id, |t| {
        t.root_span()
            .events()
            .iter()
            .any(|e| matches!(e, crate::event::Event::ExceptError(_)))
    });
    assert_eq!(has_except_error, Some(true));
    span.close();
}

#[test]
fn s4_an_error_returned_from_run_in_span_fails_the_root_with_an_exit_error() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    #[derive(Debug)]
    struct Boom;
    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }
    impl std::error::Error for Boom {}

    let mut trace_id = None;
    let result: Result<(), Boom> = run_in_span("fragile-operation", || {
        trace_id = crate::current().map(|(id, _)| id);
        Err(Boom)
    });
    assert!(result.is_err());

    let trace_id = trace_id.unwrap();
    let status = registry::with_trace(trace_id, |t| t.root_span().status());
    assert_eq!(status, Some(Status::Failed));
    let has_exit_error = registry::with_trace(trace_id, |t| {
        t.root_span()
            .events()
            .iter()
            .any(|e| matches!(e, crate::event::Event::ExitError(_)))
    });
    assert_eq!(has_exit_error, Some(true));
}

#[test]
fn s5_spawning_a_traced_thread_forks_a_linked_child_trace() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let parent = new_span("request");
    let parent_trace = parent.trace_id();

    let (tx, rx) = std::sync::mpsc::channel();
    let handle = spawn_traced("background-work", move || {
        tx.send(crate::current().map(|(id, _)| id).unwrap()).unwrap();
    });
    handle.join().unwrap();
    let child_trace = rx.recv().unwrap();

    assert_ne!(child_trace, parent_trace);
    assert_eq!(registry::with_trace(child_trace, |t| t.parent_trace_id()), Some(Some(parent_trace)));
    let parent_links_to_child = registry::with_trace(parent_trace, |t| {
        t.root_span().events().iter().any(|e| e.is_tree_child_of(child_trace))
    });
    assert_eq!(parent_links_to_child, Some(true));
    parent.close();
}

#[test]
fn s6_publisher_withholds_a_parent_until_its_child_trace_is_ready() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let (publisher, published) = start_recording_publisher();

    let parent = new_span("request");
    let parent_trace = parent.trace_id();
    let child = new_trace("deferred-child");
    let child_trace = child.trace_id();
    registry::with_trace(parent_trace, |t| t.record_tree_child(child_trace));

    parent.close();
    publisher.notify_root_closed(parent_trace);
    publisher.flush();
    assert!(published.lock().unwrap().is_empty());
    assert_eq!(registry::len(), 2, "both traces still pending");

    child.close();
    publisher.notify_root_closed(child_trace);
    publisher.flush();

    let ids: Vec<TraceId> = published.lock().unwrap().iter().map(|(id, _)| *id).collect();
    assert!(ids.contains(&parent_trace));
    assert!(ids.contains(&child_trace));
}

#[test]
fn s7_force_new_trace_produces_two_linked_published_traces() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let (publisher, published) = start_recording_publisher();

    let parent = new_span("parent");
    let parent_trace = parent.trace_id();
    let forced_parent = new_span_forcing_new_trace("forced_parent");
    let forced_trace = forced_parent.trace_id();
    assert_ne!(forced_trace, parent_trace);

    let child_forced_parent = new_span("child_forced_parent");
    assert_eq!(child_forced_parent.trace_id(), forced_trace);
    let mut extra = BTreeMap::new();
    extra.insert("parent".to_string(), "forced_parent".to_string());
    log_extra(extra);
    child_forced_parent.close();
    forced_parent.close();
    parent.close();

    publisher.notify_root_closed(parent_trace);
    publisher.notify_root_closed(forced_trace);
    publisher.flush();

    let got = published.lock().unwrap();
    assert_eq!(got.len(), 2, "both traces published independently");
    let ids: Vec<TraceId> = got.iter().map(|(id, _)| *id).collect();
    assert!(ids.contains(&parent_trace));
    assert!(ids.contains(&forced_trace));

    let (_, parent_text) = got.iter().find(|(id, _)| *id == parent_trace).unwrap();
    assert!(parent_text.contains("parent => Succeeded"));
    let (_, forced_text) = got.iter().find(|(id, _)| *id == forced_trace).unwrap();
    assert!(forced_text.contains("forced_parent => Succeeded"));
}

#[test]
fn configure_twice_returns_an_error() {
    let first = crate::config::configure(Config::builder().build());
    let second = crate::config::configure(Config::builder().build());
    assert!(first.is_ok());
    assert!(second.is_err());
}

#[test]
fn s8_cooperative_tasks_fork_independent_traces() {
    use futures::channel::oneshot;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;

    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let (publisher, published) = start_recording_publisher();

    let parent = new_span("parent");
    let parent_trace = parent.trace_id();

    let task_trace_ids = Arc::new(Mutex::new(Vec::new()));
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let mut releases = Vec::new();
    for i in 0..3 {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        releases.push(release_tx);
        let task_trace_ids = task_trace_ids.clone();
        let name = format!("async-task{i}");
        spawner
            .spawn_local(bind_task(name.clone(), async move {
                let span = new_span(name);
                task_trace_ids.lock().unwrap().push(span.trace_id());
                let _ = release_rx.await;
                span.close();
            }))
            .unwrap();
    }

    // Drives every task up to its first await point, so each has already
    // opened its own span before any of them is released.
    pool.run_until_stalled();
    assert_eq!(registry::len(), 4, "parent plus three independent task traces");

    let task_traces = task_trace_ids.lock().unwrap().clone();
    assert_eq!(task_traces.len(), 3);
    let mut unique = task_traces.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 3, "each task forked its own trace");
    assert!(!task_traces.contains(&parent_trace));

    for release in releases {
        let _ = release.send(());
    }
    pool.run_until_stalled();

    for trace_id in &task_traces {
        publisher.notify_root_closed(*trace_id);
    }
    publisher.flush();
    assert_eq!(registry::len(), 1, "only the still-open parent remains");

    parent.close();
    publisher.notify_root_closed(parent_trace);
    publisher.flush();
    assert_eq!(registry::len(), 0, "every trace has drained once all spans closed");

    let published_ids: Vec<TraceId> = published.lock().unwrap().iter().map(|(id, _)| *id).collect();
    for trace_id in &task_traces {
        assert!(published_ids.contains(trace_id));
    }
    assert!(published_ids.contains(&parent_trace));
}

#[test]
fn async_bind_threads_a_span_through_poll() {
    let _lock = crate::test_support::lock_registry();
    registry::clear();
    let span = new_span("async-job");
    let trace_id = span.trace_id();
    let detached = span.detach();
    let result = futures::executor::block_on(detached.bind(async { 1 + 1 }));
    assert_eq!(result, 2);

    let status = registry::with_trace(trace_id, |t| t.root_span().status());
    assert_eq!(status, Some(Status::Succeeded));
}
