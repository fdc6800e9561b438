//! Trace and reference identifiers.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use data_encoding::HEXLOWER_PERMISSIVE;
use rand::Rng;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The unique identifier of a `Trace`.
///
/// Ids are rendered as `"t-<n>"`, where `n` is a process-local monotonic
/// counter. They are never reused within a process and carry no meaning
/// outside of it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u64);

impl TraceId {
    /// Allocates the next trace id in sequence.
    pub fn next() -> TraceId {
        TraceId(NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value backing this id.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "t-{}", self.0)
    }
}

/// An opaque identifier shared between a `RefSrc` event and a `RefDest`
/// event, possibly in different spans or traces.
///
/// `Ref`s are 128 bits of randomness rendered as a lowercase hex string.
/// Matching two `Ref`s up is left entirely to whoever reads the rendered
/// trace; this crate only records them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ref([u8; 16]);

impl Ref {
    /// Generates a fresh, random `Ref`.
    pub fn new() -> Ref {
        let mut buf = [0; 16];
        rand::thread_rng().fill(&mut buf);
        Ref(buf)
    }
}

impl Default for Ref {
    fn default() -> Ref {
        Ref::new()
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&HEXLOWER_PERMISSIVE.encode(&self.0))
    }
}
