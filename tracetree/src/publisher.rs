//! Publishing finished traces to a sink.
//!
//! A closed root trace is printed immediately unless it references a
//! child trace that hasn't closed yet, in which case it waits, retrying
//! whenever a new trace closes, until a flush threshold forces it out
//! anyway.
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::info;

use crate::ids::TraceId;
use crate::registry;
use crate::render::{ChildTraceResolver, TextRenderer, TreeRenderer};
use crate::trace::Trace;

/// Consumes a fully rendered trace.
pub trait TraceSink: Send {
    /// Publishes `rendered`, the text for the trace rooted at `trace_id`.
    fn publish(&mut self, trace_id: TraceId, rendered: &str);
}

/// A `TraceSink` that logs the rendered trace at `info` level.
pub struct LoggingSink;

impl TraceSink for LoggingSink {
    fn publish(&mut self, trace_id: TraceId, rendered: &str) {
        info!("trace {trace_id} finished:\n{rendered}");
    }
}

enum Message {
    RootClosed(TraceId),
    Flush(mpsc::Sender<()>),
}

/// Background publisher: a consumer thread that renders and hands off
/// finished traces, plus a ticker thread that forces out traces which
/// have been waiting on an unresolved child for too long.
pub struct Publisher {
    sender: mpsc::Sender<Message>,
    consumer: Option<JoinHandle<()>>,
    ticker_stop: Option<mpsc::Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Starts a publisher. `flush_interval` is how often the ticker
    /// thread wakes to check for stale pending traces; `flush_threshold`
    /// is how long a trace may wait on an unresolved child before it is
    /// force-printed with a "pending" placeholder anyway.
    pub fn start(
        mut sink: Box<dyn TraceSink>,
        flush_interval: Duration,
        flush_threshold: Duration,
    ) -> Publisher {
        let (sender, receiver) = mpsc::channel();
        let consumer = thread::Builder::new()
            .name("tracetree-publisher".to_string())
            .spawn(move || consume(receiver, sink.as_mut(), flush_threshold))
            .expect("failed to spawn publisher thread");

        let (ticker_stop, stop_rx) = mpsc::channel();
        let ticker_sender = sender.clone();
        let ticker = thread::Builder::new()
            .name("tracetree-publisher-ticker".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(flush_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let (ack_tx, ack_rx) = mpsc::channel();
                        if ticker_sender.send(Message::Flush(ack_tx)).is_err() {
                            break;
                        }
                        let _ = ack_rx.recv();
                    }
                }
            })
            .expect("failed to spawn publisher ticker thread");

        Publisher {
            sender,
            consumer: Some(consumer),
            ticker_stop: Some(ticker_stop),
            ticker: Some(ticker),
        }
    }

    /// Notifies the publisher that `trace_id`'s root span has closed and
    /// it is ready to be printed (or queued, if it references an
    /// unfinished child trace).
    pub fn notify_root_closed(&self, trace_id: TraceId) {
        let _ = self.sender.send(Message::RootClosed(trace_id));
    }

    /// Blocks until every trace currently queued has been printed,
    /// including ones still waiting on a child — those are forced out
    /// with a pending placeholder rather than held indefinitely.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.sender.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.flush();
        if let Some(stop) = self.ticker_stop.take() {
            let _ = stop.send(());
        }
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        drop(std::mem::replace(&mut self.sender, mpsc::channel().0));
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

struct PendingResolver<'a>(&'a HashMap<TraceId, String>);

impl ChildTraceResolver for PendingResolver<'_> {
    fn resolve(&self, trace_id: TraceId) -> Option<String> {
        self.0.get(&trace_id).cloned()
    }
}

fn consume(receiver: mpsc::Receiver<Message>, sink: &mut dyn TraceSink, flush_threshold: Duration) {
    let mut rendered: HashMap<TraceId, String> = HashMap::new();
    let mut pending_since: HashMap<TraceId, Instant> = HashMap::new();

    loop {
        match receiver.recv() {
            Ok(Message::RootClosed(id)) => {
                attempt_print(id, &mut rendered, &mut pending_since, sink);
            }
            Ok(Message::Flush(ack)) => {
                flush_pending(flush_threshold, &mut rendered, &mut pending_since, sink);
                let _ = ack.send(());
            }
            Err(_) => {
                flush_pending(Duration::ZERO, &mut rendered, &mut pending_since, sink);
                break;
            }
        }
        flush_pending(flush_threshold, &mut rendered, &mut pending_since, sink);
    }
}

/// Tries to render and publish `id`. If it references a child trace that
/// hasn't rendered yet, records it as pending instead; publishing a
/// blocked child later re-tries whatever traces were waiting on it.
fn attempt_print(
    id: TraceId,
    rendered: &mut HashMap<TraceId, String>,
    pending_since: &mut HashMap<TraceId, Instant>,
    sink: &mut dyn TraceSink,
) {
    if rendered.contains_key(&id) {
        return;
    }
    let text = registry::with_trace(id, |trace| render_if_ready(trace, rendered));
    match text {
        Some(Some(text)) => {
            publish(id, text, rendered, pending_since, sink);
            retry_waiting_parents(id, rendered, pending_since, sink);
        }
        Some(None) => {
            pending_since.entry(id).or_insert_with(Instant::now);
        }
        None => {
            // Already removed from the registry by a previous publish.
        }
    }
}

/// Renders `trace` if every `TreeChild` it references has already been
/// rendered; otherwise returns `None` without consuming anything.
fn render_if_ready(trace: &Trace, rendered: &HashMap<TraceId, String>) -> Option<String> {
    let ready = trace.spans().all(|(_, span)| {
        span.events()
            .iter()
            .all(|event| match event {
                crate::event::Event::TreeChild(child_id) => rendered.contains_key(child_id),
                _ => true,
            })
    });
    if !ready {
        return None;
    }
    let resolver = PendingResolver(rendered);
    Some(TextRenderer.render(trace, &resolver))
}

fn publish(
    id: TraceId,
    text: String,
    rendered: &mut HashMap<TraceId, String>,
    pending_since: &mut HashMap<TraceId, Instant>,
    sink: &mut dyn TraceSink,
) {
    sink.publish(id, &text);
    rendered.insert(id, text);
    pending_since.remove(&id);
    registry::remove(id);
}

fn retry_waiting_parents(
    just_rendered: TraceId,
    rendered: &mut HashMap<TraceId, String>,
    pending_since: &mut HashMap<TraceId, Instant>,
    sink: &mut dyn TraceSink,
) {
    let waiting: Vec<TraceId> = pending_since.keys().copied().collect();
    for id in waiting {
        if rendered.contains_key(&id) {
            continue;
        }
        let parent_references_child = registry::with_trace(id, |trace| {
            trace.spans().any(|(_, span)| {
                span.events().iter().any(|e| e.is_tree_child_of(just_rendered))
            })
        })
        .unwrap_or(false);
        if parent_references_child {
            attempt_print(id, rendered, pending_since, sink);
        }
    }
}

/// Force-prints any trace that has been waiting on an unresolved child
/// for at least `threshold`, rendering its still-unresolved `TreeChild`
/// links as pending rather than withholding it forever.
fn flush_pending(
    threshold: Duration,
    rendered: &mut HashMap<TraceId, String>,
    pending_since: &mut HashMap<TraceId, Instant>,
    sink: &mut dyn TraceSink,
) {
    let stale: Vec<TraceId> = pending_since
        .iter()
        .filter(|(_, since)| since.elapsed() >= threshold)
        .map(|(id, _)| *id)
        .collect();
    for id in stale {
        let text = registry::with_trace(id, |trace| {
            let resolver = PendingResolver(rendered);
            TextRenderer.render(trace, &resolver)
        });
        if let Some(text) = text {
            publish(id, text, rendered, pending_since, sink);
        } else {
            pending_since.remove(&id);
        }
    }
}
