//! Event sources driven by the session loop.

use std::time::Duration;

/// Identifies a registered source. Engines usually derive this from the
/// owning device so re-registration (e.g. to change the timeout) replaces
/// the previous entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey(pub u64);

/// Why a source is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The source reported readiness.
    Ready,
    /// The per-source timeout elapsed without readiness.
    Timeout,
}

/// Per-source dispatch timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Dispatch only on readiness.
    Infinite,
    /// Dispatch every loop iteration.
    Poll,
    /// Dispatch on readiness, or after this long without one.
    After(Duration),
}

impl Timeout {
    /// The conventional encoding: -1 waits indefinitely, 0 polls, a
    /// positive value is a timeout in milliseconds.
    pub fn from_ms(ms: i64) -> Timeout {
        match ms {
            t if t < 0 => Timeout::Infinite,
            0 => Timeout::Poll,
            t => Timeout::After(Duration::from_millis(t as u64)),
        }
    }
}

/// One registered I/O source: readiness probe plus dispatch callback.
///
/// `readiness` must not block and must not call back into the session; it
/// is a pure transport-side poll. `dispatch` runs with the session
/// borrowed out, so it may freely send packets, add or remove sources, or
/// re-register itself; it must perform at most one bounded read per call.
/// Returning `false` asks the loop to drop the registration.
pub trait EventSource {
    fn readiness(&mut self) -> std::io::Result<bool>;

    fn dispatch(&mut self, session: &crate::Session, wakeup: Wakeup) -> bool;
}
