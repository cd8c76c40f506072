// Byte chunks flowing through read/append pipelines, plus refcounted sub-slices.
use std::fmt;
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::Stream;

use crate::core::error::Error;

/// Pull-based byte source: the consumer asks for one chunk at a time.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<DataChunk, Error>> + Send>>;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A unit of bytes handed out by a producer.
///
/// The optional release hook runs exactly once, when the chunk is released or
/// dropped. It signals that the pipeline is done with the chunk, not that its
/// memory is unreferenced: `Bytes` handed downstream keep the storage alive on
/// their own, so a hook must never reuse a buffer in place.
pub struct DataChunk {
    data: Bytes,
    release: Option<ReleaseHook>,
}

impl DataChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            release: None,
        }
    }

    pub fn with_release(data: impl Into<Bytes>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            data: data.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DataChunk {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for DataChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChunk")
            .field("len", &self.data.len())
            .field("release", &self.release.is_some())
            .finish()
    }
}

impl From<Bytes> for DataChunk {
    fn from(data: Bytes) -> Self {
        DataChunk::new(data)
    }
}

// Owns the physical chunk until every derived VirtualChunk has released it.
struct Parent {
    chunk: Mutex<Option<DataChunk>>,
    refs: AtomicUsize,
}

impl Parent {
    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let chunk = self
                .chunk
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .take();
            drop(chunk);
        }
    }
}

/// A view into a physical [`DataChunk`] that shares its storage.
///
/// Every `VirtualChunk` holds one reference on the parent chunk; the parent is
/// released back to its producer once the last reference goes away. `release`
/// is idempotent and also runs on drop, so cancelled pipelines do not leak.
pub struct VirtualChunk {
    parent: Arc<Parent>,
    data: Bytes,
    released: AtomicBool,
}

impl VirtualChunk {
    /// Take ownership of a physical chunk, returning a view over all of it.
    pub fn root(chunk: DataChunk) -> Self {
        let data = chunk.data().clone();
        let parent = Arc::new(Parent {
            chunk: Mutex::new(Some(chunk)),
            refs: AtomicUsize::new(1),
        });
        Self {
            parent,
            data,
            released: AtomicBool::new(false),
        }
    }

    /// Derive a sub-view; `range` is relative to this view.
    pub fn slice(&self, range: Range<usize>) -> Self {
        self.parent.retain();
        Self {
            parent: Arc::clone(&self.parent),
            data: self.data.slice(range),
            released: AtomicBool::new(false),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.parent.release();
        }
    }
}

impl Drop for VirtualChunk {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for VirtualChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualChunk")
            .field("len", &self.data.len())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{DataChunk, VirtualChunk};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_chunk(data: &'static [u8]) -> (DataChunk, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&count);
        let chunk = DataChunk::with_release(data, move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });
        (chunk, count)
    }

    #[test]
    fn handed_off_bytes_outlive_the_release_hook() {
        let (chunk, count) = counted_chunk(b"line content");
        let view = VirtualChunk::root(chunk).slice(0..4);
        let handed_off = view.data().clone();
        drop(view);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(handed_off.as_ref(), b"line");
    }

    #[test]
    fn data_chunk_release_hook_runs_once() {
        let (chunk, count) = counted_chunk(b"abc");
        chunk.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let (chunk, count) = counted_chunk(b"abc");
        drop(chunk);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parent_released_after_last_fragment_in_any_order() {
        let (chunk, count) = counted_chunk(b"line1\nline2\nline3\n");
        let root = VirtualChunk::root(chunk);
        let fragments = vec![root.slice(0..5), root.slice(6..11), root.slice(12..17)];
        assert_eq!(fragments[1].data().as_ref(), b"line2");

        root.release();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        fragments[2].release();
        fragments[0].release();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        fragments[1].release();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(fragments);
        drop(root);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let (chunk, count) = counted_chunk(b"abcdef");
        let root = VirtualChunk::root(chunk);
        let first = root.slice(0..3);
        let second = root.slice(3..6);
        drop(root);

        first.release();
        first.release();
        first.release();
        assert!(first.is_released());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        second.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_release_frees_parent_once() {
        let (chunk, count) = counted_chunk(b"0123456789abcdef");
        let root = VirtualChunk::root(chunk);
        let fragments: Vec<_> = (0..16).map(|i| Arc::new(root.slice(i..i + 1))).collect();
        drop(root);

        let handles: Vec<_> = fragments
            .iter()
            .flat_map(|fragment| {
                (0..2).map(move |_| {
                    let fragment = Arc::clone(fragment);
                    std::thread::spawn(move || fragment.release())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_slices_share_parent() {
        let (chunk, count) = counted_chunk(b"hello world");
        let root = VirtualChunk::root(chunk);
        let word = root.slice(6..11);
        let inner = word.slice(1..3);
        assert_eq!(inner.data().as_ref(), b"or");

        drop(root);
        drop(word);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(inner);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
