//! Transfer progress reporting.
//!
//! Events are monotonically non-decreasing in `bytes_done` and are
//! rate-limited so a fast transfer does not flood the consumer; the
//! completion event is always delivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum interval between intermediate events.
const EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Direction of the transfer an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
}

/// One progress sample.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub operation: Operation,
    pub path: String,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

/// Callback invoked with progress events.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Tracks one transfer and emits rate-limited events.
pub struct ProgressTracker {
    operation: Operation,
    path: String,
    total_bytes: u64,
    bytes_done: u64,
    started: Instant,
    last_emit: Option<Instant>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(
        operation: Operation,
        path: impl Into<String>,
        total_bytes: u64,
        callback: Option<ProgressCallback>,
    ) -> Self {
        Self {
            operation,
            path: path.into(),
            total_bytes,
            bytes_done: 0,
            started: Instant::now(),
            last_emit: None,
            callback,
        }
    }

    /// Record `n` more bytes and maybe emit an event.
    pub fn advance(&mut self, n: u64) {
        self.bytes_done += n;
        let due = match self.last_emit {
            None => true,
            Some(at) => at.elapsed() >= EMIT_INTERVAL,
        };
        if due {
            self.emit();
        }
    }

    /// Jump to an absolute position (used when a resume skips bytes).
    pub fn set_position(&mut self, bytes_done: u64) {
        // Monotonic: never move backwards.
        if bytes_done > self.bytes_done {
            self.bytes_done = bytes_done;
        }
    }

    /// Emit the final event unconditionally.
    pub fn finish(&mut self) {
        self.emit();
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    fn emit(&mut self) {
        self.last_emit = Some(Instant::now());
        if let Some(callback) = &self.callback {
            callback(ProgressEvent {
                operation: self.operation,
                path: self.path.clone(),
                bytes_done: self.bytes_done,
                total_bytes: self.total_bytes,
                elapsed: self.started.elapsed(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ProgressCallback = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (callback, events)
    }

    #[test]
    fn events_are_monotonic() {
        let (callback, events) = collecting();
        let mut tracker =
            ProgressTracker::new(Operation::Upload, "a.bin", 100, Some(callback));
        tracker.advance(10);
        tracker.advance(20);
        tracker.advance(70);
        tracker.finish();

        let events = events.lock().unwrap();
        assert!(!events.is_empty());
        let mut prev = 0;
        for event in events.iter() {
            assert!(event.bytes_done >= prev);
            prev = event.bytes_done;
        }
        assert_eq!(events.last().unwrap().bytes_done, 100);
    }

    #[test]
    fn intermediate_events_are_rate_limited() {
        let (callback, events) = collecting();
        let mut tracker =
            ProgressTracker::new(Operation::Download, "b.bin", 10_000, Some(callback));
        for _ in 0..10_000 {
            tracker.advance(1);
        }
        tracker.finish();

        // The first event fires, then the interval suppresses the rest;
        // only the explicit finish is added.
        assert!(events.lock().unwrap().len() <= 3);
    }

    #[test]
    fn set_position_never_goes_backwards() {
        let mut tracker = ProgressTracker::new(Operation::Download, "c.bin", 100, None);
        tracker.set_position(50);
        tracker.set_position(30);
        assert_eq!(tracker.bytes_done(), 50);
    }

    #[test]
    fn finish_fires_without_callback() {
        let mut tracker = ProgressTracker::new(Operation::Upload, "d.bin", 0, None);
        tracker.finish();
        assert_eq!(tracker.bytes_done(), 0);
    }
}
