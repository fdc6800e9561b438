//! Process-wide configuration.
//!
//! A builder produces an immutable value, and a single `AtomicLazyCell`
//! fill installs the publisher for the process's lifetime. Spans are
//! always tracked regardless of configuration (see `registry`) —
//! `configure` only controls whether finished traces get published
//! anywhere.
use std::env;
use std::time::Duration;

use lazycell::AtomicLazyCell;

use crate::error::ConfigureError;
use crate::publisher::{LoggingSink, Publisher, TraceSink};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_FLUSH_THRESHOLD: Duration = Duration::from_secs(5);

static PUBLISHER: AtomicLazyCell<Publisher> = AtomicLazyCell::NONE;

/// Publisher tuning. Build with `Config::builder()`.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    flush_interval: Duration,
    flush_threshold: Duration,
}

impl Config {
    /// Starts a `Builder` with the default interval and threshold.
    pub fn builder() -> Builder {
        Builder::default()
    }
}

/// Builds a `Config`.
#[derive(Debug, Clone, Copy)]
pub struct Builder {
    flush_interval: Duration,
    flush_threshold: Duration,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl Builder {
    /// How often the publisher's ticker thread checks for traces that
    /// have been waiting too long on an unresolved child. Default 1s.
    pub fn flush_interval(mut self, interval: Duration) -> Builder {
        self.flush_interval = interval;
        self
    }

    /// How long a closed trace may wait on an unresolved `TreeChild`
    /// before it is force-published with a pending placeholder anyway.
    /// Default 5s.
    pub fn flush_threshold(mut self, threshold: Duration) -> Builder {
        self.flush_threshold = threshold;
        self
    }

    /// Finalizes the configuration.
    pub fn build(self) -> Config {
        Config {
            flush_interval: self.flush_interval,
            flush_threshold: self.flush_threshold,
        }
    }
}

/// Starts the publisher with `config`, logging finished traces via
/// `LoggingSink`. Returns an error if a publisher is already running.
pub fn configure(config: Config) -> Result<(), ConfigureError> {
    configure_with_sink(config, Box::new(LoggingSink))
}

/// Starts the publisher with `config`, handing finished traces to `sink`
/// instead of the default logger.
pub fn configure_with_sink(config: Config, sink: Box<dyn TraceSink>) -> Result<(), ConfigureError> {
    let publisher = Publisher::start(sink, config.flush_interval, config.flush_threshold);
    PUBLISHER.fill(publisher).map_err(|_| ConfigureError::new())
}

/// The running publisher, if `configure`/`configure_with_sink` has been
/// called.
pub(crate) fn publisher() -> Option<&'static Publisher> {
    PUBLISHER.borrow()
}

/// `true` if automatic trace propagation across `spawn_traced`/
/// `submit_traced` should be skipped, per the `LOG_TREE_SKIP_MONKEYPATCH`
/// environment variable. Any non-empty value disables propagation; unset
/// or empty leaves it enabled.
pub fn auto_instrumentation_disabled() -> bool {
    env::var("LOG_TREE_SKIP_MONKEYPATCH")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}
