//! Byte-stream to line splitter.
//!
//! Tools redraw their progress line with `\r`, so both `\r` and `\n` end a
//! line. Empty lines are dropped.

/// Lines longer than this are flushed as-is so a tool that never emits a
/// terminator cannot grow the buffer without bound.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                self.flush_into(&mut out);
            } else {
                self.buf.push(b);
                if self.buf.len() >= MAX_LINE_BYTES {
                    self.flush_into(&mut out);
                }
            }
        }
        out
    }

    /// Remaining partial line at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let mut out = Vec::new();
        self.flush_into(&mut out);
        out.pop()
    }

    fn flush_into(&mut self, out: &mut Vec<String>) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        if !line.trim().is_empty() {
            out.push(line);
        }
    }
}
