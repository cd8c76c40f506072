// Logical concatenation of received chunks, addressed without copying.
use std::collections::VecDeque;

use bstr::ByteSlice;

use crate::core::chunk::VirtualChunk;

/// Accumulates chunks and exposes them as one contiguous logical buffer.
///
/// Positions are logical: index 0 is the first byte that has not been
/// discarded. Discarding advances an offset into the first chunk and drops
/// (releases) chunks once they are fully consumed; bytes are never moved.
#[derive(Debug, Default)]
pub struct VirtualBuffer {
    chunks: VecDeque<VirtualChunk>,
    offset: usize,
    len: usize,
}

impl VirtualBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `discard` leading bytes, then append `chunk` at the end.
    pub fn offer(&mut self, chunk: VirtualChunk, discard: usize) {
        self.discard(discard);
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn discard(&mut self, count: usize) {
        let mut count = count.min(self.len);
        self.len -= count;
        while let Some(front) = self.chunks.front() {
            let available = front.len() - self.offset;
            if count < available {
                self.offset += count;
                break;
            }
            count -= available;
            self.offset = 0;
            self.chunks.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.offset = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get_byte(&self, index: usize) -> Option<u8> {
        if index >= self.len {
            return None;
        }
        let mut index = index + self.offset;
        for chunk in &self.chunks {
            if index < chunk.len() {
                return Some(chunk.data()[index]);
            }
            index -= chunk.len();
        }
        None
    }

    /// Position of the first `byte` at or after `from`.
    pub fn find_byte(&self, from: usize, byte: u8) -> Option<usize> {
        let mut base = 0usize;
        let mut skip = from + self.offset;
        for chunk in &self.chunks {
            let len = chunk.len();
            if skip < len {
                if let Some(pos) = chunk.data()[skip..].find_byte(byte) {
                    return Some(base + skip + pos - self.offset);
                }
                skip = 0;
            } else {
                skip -= len;
            }
            base += len;
        }
        None
    }

    /// Views covering `[begin, end)`, one per underlying chunk touched.
    pub fn slice(&self, begin: usize, end: usize) -> Slices<'_> {
        let end = end.min(self.len);
        Slices {
            chunks: self.chunks.iter(),
            skip: begin.min(end) + self.offset,
            remaining: end.saturating_sub(begin),
        }
    }
}

pub struct Slices<'a> {
    chunks: std::collections::vec_deque::Iter<'a, VirtualChunk>,
    skip: usize,
    remaining: usize,
}

impl Iterator for Slices<'_> {
    type Item = VirtualChunk;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let chunk = self.chunks.next()?;
            let len = chunk.len();
            if self.skip >= len {
                self.skip -= len;
                continue;
            }
            let start = self.skip;
            let stop = len.min(start + self.remaining);
            self.skip = 0;
            self.remaining -= stop - start;
            return Some(chunk.slice(start..stop));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::VirtualBuffer;
    use crate::core::chunk::{DataChunk, VirtualChunk};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk(data: &'static str) -> VirtualChunk {
        VirtualChunk::root(DataChunk::new(data.as_bytes()))
    }

    fn collect(buf: &VirtualBuffer, begin: usize, end: usize) -> Vec<String> {
        buf.slice(begin, end)
            .map(|view| String::from_utf8_lossy(view.data()).into_owned())
            .collect()
    }

    #[test]
    fn random_access_spans_chunks() {
        let mut buf = VirtualBuffer::new();
        buf.offer(chunk("ab"), 0);
        buf.offer(chunk("cde"), 0);
        buf.offer(chunk("f"), 0);
        assert_eq!(buf.len(), 6);
        let bytes: Vec<u8> = (0..6).filter_map(|i| buf.get_byte(i)).collect();
        assert_eq!(bytes, b"abcdef");
        assert_eq!(buf.get_byte(6), None);
    }

    #[test]
    fn slice_yields_one_view_per_chunk() {
        let mut buf = VirtualBuffer::new();
        buf.offer(chunk("line"), 0);
        buf.offer(chunk("1\nli"), 0);
        buf.offer(chunk("ne2\n"), 0);
        assert_eq!(collect(&buf, 0, 5), vec!["line", "1"]);
        assert_eq!(collect(&buf, 6, 11), vec!["li", "ne2"]);
        assert_eq!(collect(&buf, 2, 3), vec!["n"]);
        assert!(collect(&buf, 3, 3).is_empty());
    }

    #[test]
    fn discard_keeps_unconsumed_tail() {
        let mut buf = VirtualBuffer::new();
        buf.offer(chunk("line1\nli"), 0);
        buf.offer(chunk("ne2\n"), 6);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.get_byte(0), Some(b'l'));
        assert_eq!(collect(&buf, 0, 5), vec!["li", "ne2"]);
        assert_eq!(buf.find_byte(0, b'\n'), Some(5));
    }

    #[test]
    fn find_byte_respects_start_and_offset() {
        let mut buf = VirtualBuffer::new();
        buf.offer(chunk("a\nb"), 0);
        buf.offer(chunk("c\nd\n"), 2);
        // logical buffer is now "bc\nd\n"
        assert_eq!(buf.find_byte(0, b'\n'), Some(2));
        assert_eq!(buf.find_byte(3, b'\n'), Some(4));
        assert_eq!(buf.find_byte(5, b'\n'), None);
    }

    #[test]
    fn consumed_chunks_are_released() {
        let released = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&released);
        let first = DataChunk::with_release(&b"abc\n"[..], move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        let mut buf = VirtualBuffer::new();
        buf.offer(VirtualChunk::root(first), 0);
        let line = buf.slice(0, 3).next().expect("view");
        buf.offer(chunk("def"), 4);
        assert_eq!(buf.len(), 3);
        assert_eq!(released.load(Ordering::SeqCst), 0);

        drop(line);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
