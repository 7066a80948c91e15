//! Bounded chunk buffer for output replay on reattach.
//!
//! Keeps PTY output chunks exactly as they were read, so replaying the
//! concatenation never splits an escape sequence that arrived whole. When the
//! total grows past the cap the oldest chunks go first; the newest chunk is
//! always kept even if it alone is over the cap.

use std::collections::VecDeque;

/// Default replay cap in bytes.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100_000;

#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    /// Sum of all retained chunk lengths.
    size: usize,
    max_size: usize,
}

impl OutputBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Append a chunk, evicting whole chunks from the front while over the cap.
    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.chunks.push_back(chunk.to_vec());
        self.size += chunk.len();

        while self.size > self.max_size && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.size -= evicted.len();
            }
        }
    }

    /// All retained chunks joined in arrival order.
    pub fn replay(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Retained bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_joins_in_order() {
        let mut buf = OutputBuffer::new(100);
        buf.append(b"c1 ");
        buf.append(b"c2 ");
        buf.append(b"c3");
        assert_eq!(buf.replay(), b"c1 c2 c3");
        assert_eq!(buf.size(), 8);
        assert_eq!(buf.chunk_count(), 3);
    }

    #[test]
    fn evicts_oldest_whole_chunks() {
        let mut buf = OutputBuffer::new(10);
        buf.append(b"aaaa");
        buf.append(b"bbbb");
        buf.append(b"cccc"); // 12 > 10, "aaaa" goes
        assert_eq!(buf.replay(), b"bbbbcccc");
        assert_eq!(buf.size(), 8);

        buf.append(b"dddddd"); // 14 > 10, "bbbb" goes, 10 fits
        assert_eq!(buf.replay(), b"ccccdddddd");
        assert_eq!(buf.size(), 10);
    }

    #[test]
    fn keeps_a_single_oversized_chunk() {
        let mut buf = OutputBuffer::new(4);
        buf.append(b"ab");
        buf.append(b"\x1b[31mred\x1b[0m");
        assert_eq!(buf.chunk_count(), 1);
        assert_eq!(buf.replay(), b"\x1b[31mred\x1b[0m");
        assert!(buf.size() > buf.max_size());
    }

    #[test]
    fn ignores_empty_chunks() {
        let mut buf = OutputBuffer::default();
        buf.append(b"");
        assert!(buf.is_empty());
        assert_eq!(buf.max_size(), DEFAULT_MAX_BUFFER_SIZE);
    }
}
