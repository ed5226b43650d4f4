use std::collections::VecDeque;

/// Growable byte buffer with a hard cap that keeps the first `limit` bytes.
///
/// Bytes past the cap are counted but not stored, so a reader can keep
/// draining a pipe after the limit is hit.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl OutputBuffer {
    /// Empty buffer that stores at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    /// Appends as much of `chunk` as fits. Returns `false` once anything had
    /// to be discarded.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);
        let discarded = chunk.len() - kept;
        self.dropped += discarded as u64;
        discarded == 0
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Configured cap in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether any byte was discarded.
    pub fn overflowed(&self) -> bool {
        self.dropped > 0
    }

    /// Number of discarded bytes.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Stored bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the buffer, returning the stored bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte buffer that keeps the most recent `limit` bytes of a stream.
///
/// Used for diagnostics, where the last thing a process printed is what
/// explains its failure.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
    dropped: u64,
}

impl TailBuffer {
    /// Empty buffer that remembers the last `limit` bytes pushed.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Appends `chunk`, evicting the oldest bytes beyond the cap.
    pub fn push(&mut self, chunk: &[u8]) {
        let chunk = if chunk.len() > self.limit {
            let skipped = chunk.len() - self.limit;
            self.dropped += skipped as u64;
            &chunk[skipped..]
        } else {
            chunk
        };

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.bytes.extend(chunk);
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Configured cap in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether older bytes were evicted.
    pub fn overflowed(&self) -> bool {
        self.dropped > 0
    }

    /// Number of evicted bytes.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Stored bytes, oldest first.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    /// The last `max_chars` characters of the stream, lossily decoded and
    /// trimmed, for attaching to error messages.
    pub fn tail_lossy(&self, max_chars: usize) -> String {
        let bytes = self.to_vec();
        let text = String::from_utf8_lossy(&bytes);
        let trimmed = text.trim();
        let count = trimmed.chars().count();
        if count <= max_chars {
            return trimmed.to_string();
        }
        trimmed.chars().skip(count - max_chars).collect()
    }
}

/// Splits a byte stream into lines on `\n` or `\r`, cutting any line at
/// `max_len` bytes so memory stays bounded whatever the producer writes.
#[derive(Debug)]
pub struct LineSplitter {
    line: Vec<u8>,
    max_len: usize,
}

impl LineSplitter {
    /// Splitter emitting lines of at most `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            line: Vec::with_capacity(max_len.min(4096)),
            max_len,
        }
    }

    /// Feeds `chunk`, calling `emit` for every completed or cut line.
    /// Empty lines are skipped.
    pub fn feed(&mut self, chunk: &[u8], mut emit: impl FnMut(&[u8])) {
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush(&mut emit);
                continue;
            }
            self.line.push(byte);
            if self.line.len() >= self.max_len {
                self.flush(&mut emit);
            }
        }
    }

    /// Emits whatever is left once the stream ended.
    pub fn finish(&mut self, mut emit: impl FnMut(&[u8])) {
        self.flush(&mut emit);
    }

    fn flush(&mut self, emit: &mut impl FnMut(&[u8])) {
        if !self.line.is_empty() {
            emit(&self.line);
            self.line.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_bytes_until_the_limit() {
        let mut buffer = OutputBuffer::with_limit(8);
        assert!(buffer.push(b"hello"));
        assert!(!buffer.push(b" world"));
        assert_eq!(buffer.as_bytes(), b"hello wo");
        assert_eq!(buffer.dropped(), 3);
        assert!(buffer.overflowed());

        assert!(!buffer.push(b"more"));
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.dropped(), 7);
    }

    #[test]
    fn tail_buffer_keeps_the_latest_bytes() {
        let mut buffer = TailBuffer::with_limit(8);
        buffer.push(b"hello");
        assert!(!buffer.overflowed());
        buffer.push(b" world");
        assert_eq!(buffer.to_vec(), b"lo world");
        assert_eq!(buffer.dropped(), 3);

        buffer.push(b"0123456789abc");
        assert_eq!(buffer.to_vec(), b"56789abc");
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.dropped(), 3 + 5 + 8);
    }

    #[test]
    fn tail_is_trimmed_and_bounded() {
        let mut buffer = TailBuffer::with_limit(1024);
        buffer.push(b"line one\nline two\n");
        assert_eq!(buffer.tail_lossy(100), "line one\nline two");
        assert_eq!(buffer.tail_lossy(8), "line two");
    }

    #[test]
    fn splitter_handles_newlines_and_carriage_returns() {
        let mut splitter = LineSplitter::new(64);
        let mut lines: Vec<String> = Vec::new();
        let mut collect =
            |line: &[u8]| lines.push(String::from_utf8_lossy(line).into_owned());
        splitter.feed(b"first\nsec", &mut collect);
        splitter.feed(b"ond\r\n10%\r20%", &mut collect);
        splitter.finish(&mut collect);
        assert_eq!(lines, ["first", "second", "10%", "20%"]);
    }

    #[test]
    fn splitter_cuts_lines_without_terminator() {
        let mut splitter = LineSplitter::new(4);
        let mut lines = Vec::new();
        splitter.feed(&[b'x'; 10], |line| lines.push(line.len()));
        splitter.finish(|line| lines.push(line.len()));
        assert_eq!(lines, [4, 4, 2]);
    }
}
