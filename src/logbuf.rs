// src/logbuf.rs
//
// Bounded capture of a running job's stdout/stderr, grounded in the
// teacher's `LogBuffer` (src/logs.rs) — same circular-buffer-under-a-mutex
// shape, minus the `log::Log` sink (there is no TUI to feed here; the
// worker flushes this straight into the store's `logs` column).

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn push_chunk(&self, chunk: &str) {
        for line in chunk.lines() {
            self.push(line);
        }
    }

    pub fn snapshot(&self) -> String {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_once_full() {
        let buf = LogBuffer::new(3);
        buf.push("a");
        buf.push("b");
        buf.push("c");
        buf.push("d");
        assert_eq!(buf.snapshot(), "b\nc\nd");
    }

    #[test]
    fn push_chunk_splits_on_newlines() {
        let buf = LogBuffer::new(10);
        buf.push_chunk("frame=1\nframe=2\nframe=3");
        assert_eq!(buf.snapshot(), "frame=1\nframe=2\nframe=3");
    }
}
