//! In-flight request tracking
//!
//! Maps outbound request ids to their method names so inbound responses
//! can be routed back to the right handler, and so newer requests can
//! supersede older ones of the same method.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// Tracks requests that have been sent but not yet answered.
///
/// Requests are added from the caller's task while responses resolve from
/// the listener task, so every operation takes one lock; `supersede` is
/// atomic with respect to concurrent sends.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: Mutex<HashMap<i64, String>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an in-flight request
    pub fn add(&self, id: i64, method: &str) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let previous = self.entries.lock().unwrap().insert(id, method.to_string());
        debug_assert!(previous.is_none(), "request id {id} reused while tracked");
    }

    /// Remove and return the method for a response id.
    ///
    /// `None` means the id is unknown - typically a response for a request
    /// that was canceled or superseded in the meantime. Callers treat this
    /// as non-fatal and drop the response.
    pub fn resolve(&self, id: i64) -> Option<String> {
        self.entries.lock().unwrap().remove(&id)
    }

    /// Atomically remove every tracked request of the given method,
    /// returning the removed ids so cancellations can be emitted for them
    pub fn supersede(&self, method: &str) -> Vec<i64> {
        let mut entries = self.entries.lock().unwrap();
        let mut ids: Vec<i64> = entries
            .iter()
            .filter(|(_, m)| m.as_str() == method)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in &ids {
            entries.remove(id);
        }
        if !ids.is_empty() {
            trace!(method, ?ids, "superseding in-flight requests");
        }
        ids
    }

    /// Drop a single entry; returns whether it was tracked
    pub fn remove(&self, id: i64) -> bool {
        self.entries.lock().unwrap().remove(&id).is_some()
    }

    /// Drop all entries. Called on process restart or termination so stale
    /// ids from a previous server generation are never matched against a
    /// new server's responses.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
