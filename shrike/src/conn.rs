//! Live-request bookkeeping for graceful shutdown.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// An in-flight request.
#[derive(Debug, Clone)]
pub struct LiveRequest {
    pub id: u64,
    pub host: String,
    pub client: Option<String>,
    pub started: Instant,
}

/// Registry of in-flight requests keyed by a monotonically increasing id.
/// An entry exists exactly while the engine is handling the request; the
/// engine's final logging phase removes it.
#[derive(Default)]
pub struct ConnectionTracker {
    next_id: AtomicU64,
    live: DashMap<u64, LiveRequest>,
    closed: AtomicBool,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, host: &str, client: Option<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(
            id,
            LiveRequest {
                id,
                host: host.to_string(),
                client,
                started: Instant::now(),
            },
        );
        id
    }

    pub fn end(&self, id: u64) {
        self.live.remove(&id);
    }

    pub fn active(&self) -> usize {
        self.live.len()
    }

    /// Stop admitting new requests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for in-flight requests to finish, polling until `timeout`.
    /// Returns whether the registry drained.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.live.is_empty() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        self.live.is_empty()
    }

    pub fn snapshot(&self) -> Vec<LiveRequest> {
        self.live.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let tracker = ConnectionTracker::new();
        let a = tracker.begin("example.com", None);
        let b = tracker.begin("example.com", None);
        assert!(b > a);
        assert_eq!(tracker.active(), 2);
    }

    #[test]
    fn test_end_removes_entry() {
        let tracker = ConnectionTracker::new();
        let id = tracker.begin("example.com", Some("127.0.0.1".to_string()));
        assert_eq!(tracker.active(), 1);
        tracker.end(id);
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn test_drain_returns_once_empty() {
        let tracker = ConnectionTracker::new();
        let id = tracker.begin("example.com", None);

        assert!(!tracker.drain(Duration::from_millis(60)));
        tracker.end(id);
        assert!(tracker.drain(Duration::from_millis(60)));
    }

    #[test]
    fn test_close_flag() {
        let tracker = ConnectionTracker::new();
        assert!(!tracker.is_closed());
        tracker.close();
        assert!(tracker.is_closed());
    }
}
