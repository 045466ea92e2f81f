//! Bounded, line-oriented log storage shared between process supervision,
//! the interstitial page, and the control API.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Number of log lines retained per process (and for the server request log).
pub const DEFAULT_CAPACITY: usize = 500;

/// A fixed-capacity ring of log lines.
///
/// Writers hand in raw bytes from a pipe; the ring splits them on `\n` and
/// buffers a trailing partial line until it is completed by a later write.
/// When the ring is full the oldest lines are dropped. All operations take an
/// internal lock, so the same ring can be fed by a stdout reader and a stderr
/// reader concurrently.
pub struct LogRing {
    inner: Mutex<RingInner>,
}

struct RingInner {
    lines: VecDeque<String>,
    partial: String,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                lines: VecDeque::with_capacity(capacity),
                partial: String::new(),
                capacity,
            }),
        }
    }

    /// Append raw bytes, splitting them into lines.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; child processes write
    /// whatever they like to their pipes.
    pub fn write(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut inner = self.inner.lock();
        for ch in text.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut inner.partial);
                inner.push_line(line);
            } else {
                inner.partial.push(ch);
            }
        }
    }

    /// Append a complete line (no trailing newline required).
    pub fn push_line(&self, line: impl Into<String>) {
        self.inner.lock().push_line(line.into());
    }

    /// Point-in-time copy of the ring, oldest line first.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().lines.iter().cloned().collect()
    }

    /// Number of complete lines currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all stored lines and any buffered partial line.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lines.clear();
        inner.partial.clear();
    }

    /// The last `n` lines, oldest first. Used for failure summaries.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RingInner {
    fn push_line(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_lines_up_to_capacity() {
        let ring = LogRing::new(3);
        ring.write(b"line1\n");
        ring.write(b"line2\n");
        ring.write(b"line3\n");

        assert_eq!(ring.snapshot(), vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn drops_oldest_when_full() {
        let ring = LogRing::new(2);
        ring.write(b"line1\n");
        ring.write(b"line2\n");
        ring.write(b"line3\n");

        assert_eq!(ring.snapshot(), vec!["line2", "line3"]);
    }

    #[test]
    fn splits_multi_line_writes() {
        let ring = LogRing::new(10);
        ring.write(b"line1\nline2\nline3\n");

        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn buffers_partial_lines_until_completed() {
        let ring = LogRing::new(10);
        ring.write(b"hel");
        assert_eq!(ring.len(), 0);

        ring.write(b"lo\nwor");
        assert_eq!(ring.snapshot(), vec!["hello"]);

        ring.write(b"ld\n");
        assert_eq!(ring.snapshot(), vec!["hello", "world"]);
    }

    #[test]
    fn snapshot_returns_a_copy() {
        let ring = LogRing::new(10);
        ring.write(b"line1\n");

        let mut first = ring.snapshot();
        first[0] = "modified".to_string();

        assert_eq!(ring.snapshot(), vec!["line1"]);
    }

    #[test]
    fn clear_empties_ring_and_partial() {
        let ring = LogRing::new(10);
        ring.write(b"line1\npart");
        ring.clear();

        assert_eq!(ring.len(), 0);
        // The buffered "part" must not resurface after a clear.
        ring.write(b"ial\n");
        assert_eq!(ring.snapshot(), vec!["ial"]);
    }

    #[test]
    fn overflow_keeps_last_n_in_write_order() {
        let ring = LogRing::new(5);
        for i in 0..23 {
            ring.write(format!("line{i}\n").as_bytes());
        }

        let lines = ring.snapshot();
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines,
            vec!["line18", "line19", "line20", "line21", "line22"]
        );
    }

    #[test]
    fn tail_returns_last_lines() {
        let ring = LogRing::new(10);
        for i in 0..4 {
            ring.push_line(format!("l{i}"));
        }
        assert_eq!(ring.tail(2), vec!["l2", "l3"]);
        assert_eq!(ring.tail(100).len(), 4);
    }

    #[test]
    fn concurrent_writers_do_not_lose_lines() {
        use std::sync::Arc;

        let ring = Arc::new(LogRing::new(1000));
        let mut handles = Vec::new();
        for w in 0..4 {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    ring.write(format!("w{w}-{i}\n").as_bytes());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ring.len(), 400);
    }
}
