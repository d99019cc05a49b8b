//! Drainable buffer for engine diagnostics.
//!
//! Engines report log lines through a callback that may fire on a thread the
//! orchestrator does not own, so every access goes through a mutex. The
//! orchestrator drains the buffer between phases.

use parking_lot::Mutex;

/// Ordered, append-only buffer of log lines until drained.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    lines: Mutex<Vec<String>>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line. Safe to call from any thread.
    pub fn append(&self, line: impl Into<String>) {
        self.lines.lock().push(line.into());
    }

    /// Remove and return everything buffered, in FIFO order.
    ///
    /// An empty buffer drains to a single empty string. Consumers that do
    /// not depend on that shape should use [`MessageBuffer::take`].
    pub fn drain(&self) -> Vec<String> {
        let lines = self.take();
        if lines.is_empty() {
            vec![String::new()]
        } else {
            lines
        }
    }

    /// Remove and return everything buffered; empty when nothing was appended.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}
