//! Bounded console output buffer with absolute positions

use std::fmt;

use crate::common::lossy_tail;

/// Absolute byte offset into the console stream since the session opened
///
/// Cursors stay meaningful after the buffer has dropped old bytes; they
/// simply point before [`ConsoleBuffer::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor(u64);

impl Cursor {
    /// The first byte the session ever received
    pub const START: Cursor = Cursor(0);

    pub fn offset(self) -> u64 {
        self.0
    }

    pub(crate) fn from_offset(offset: u64) -> Cursor {
        Cursor(offset)
    }

    pub(crate) fn advance(self, by: usize) -> Cursor {
        Cursor(self.0 + by as u64)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Console bytes received so far, capped at a byte ceiling
///
/// When the ceiling is exceeded the oldest quarter is dropped at once.
#[derive(Debug)]
pub struct ConsoleBuffer {
    data: Vec<u8>,
    /// Absolute offset of `data[0]`
    base: u64,
    max_bytes: usize,
    closed: bool,
}

impl ConsoleBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: Vec::new(),
            base: 0,
            max_bytes: max_bytes.max(64),
            closed: false,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.max_bytes {
            let keep = self.max_bytes / 4 * 3;
            let drop = self.data.len() - keep;
            self.data.drain(..drop);
            self.base += drop as u64;
        }
    }

    /// Position just past the newest byte
    pub fn end(&self) -> Cursor {
        Cursor(self.base + self.data.len() as u64)
    }

    /// Oldest position still held
    pub fn start(&self) -> Cursor {
        Cursor(self.base)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The stream hit end-of-file; no more bytes will arrive
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn index(&self, cursor: Cursor) -> usize {
        cursor.0.saturating_sub(self.base).min(self.data.len() as u64) as usize
    }

    /// Bytes in `[from, to)`, clamped to what is still buffered
    pub fn slice(&self, from: Cursor, to: Cursor) -> &[u8] {
        let lo = self.index(from);
        let hi = self.index(to).max(lo);
        &self.data[lo..hi]
    }

    /// First occurrence of `needle` lying entirely inside `[from, limit)`
    pub fn find(&self, needle: &[u8], from: Cursor, limit: Cursor) -> Option<Cursor> {
        let lo = self.index(from);
        let window = self.slice(from, limit);
        find_bytes(window, needle).map(|i| Cursor(self.base + (lo + i) as u64))
    }

    /// The next complete line starting at `from`
    ///
    /// Returns `(content_end, next_line)`: the content runs from `from` up to
    /// the terminator with any trailing `\r` excluded, and the following
    /// line starts after the `\n`.
    pub fn next_line(&self, from: Cursor) -> Option<(Cursor, Cursor)> {
        let from = from.max(self.start());
        let rest = self.slice(from, self.end());
        let nl = rest.iter().position(|&b| b == b'\n')?;
        let content = if nl > 0 && rest[nl - 1] == b'\r' { nl - 1 } else { nl };
        Some((from.advance(content), from.advance(nl + 1)))
    }

    /// The whole line containing the bytes `[start, end)`, without terminators
    pub fn line_around(&self, start: Cursor, end: Cursor) -> String {
        let lo = self.index(start);
        let hi = self.index(end).max(lo);
        let line_start = self.data[..lo]
            .iter()
            .rposition(|&b| b == b'\n' || b == b'\r')
            .map(|i| i + 1)
            .unwrap_or(0);
        let line_end = self.data[hi..]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
            .map(|i| hi + i)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[line_start..line_end]).into_owned()
    }

    /// Last `max` bytes as text, for error reports
    pub fn tail(&self, max: usize) -> String {
        lossy_tail(&self.data, max)
    }
}

/// Byte-substring search
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
