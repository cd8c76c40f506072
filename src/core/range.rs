// Chunked file reads with linear retry, capped to an exact byte count.
use std::fs::File;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::core::chunk::{ByteStream, DataChunk};
use crate::core::error::{Error, ErrorKind};
use crate::core::segment::{FileSegment, read_at};

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Linear backoff: attempt `n` waits `first + n * step`, giving up past `max`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetrySchedule {
    first: Duration,
    step: Duration,
    max: Duration,
}

impl RetrySchedule {
    pub const fn linear(first: Duration, step: Duration, max: Duration) -> Self {
        Self { first, step, max }
    }

    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        let delay = self.first.checked_add(self.step.checked_mul(attempt)?)?;
        (delay <= self.max).then_some(delay)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::linear(
            Duration::ZERO,
            Duration::from_millis(10),
            Duration::from_millis(250),
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    pub chunk_size: usize,
    pub retry: RetrySchedule,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetrySchedule::default(),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Run `op` until it succeeds, retrying transient I/O errors per `schedule`.
pub async fn with_retry<T, F, Fut>(schedule: RetrySchedule, mut op: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                let Some(delay) = schedule.delay(attempt) else {
                    return Err(err);
                };
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying read");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn read_block(file: Arc<File>, position: u64, options: ReadOptions) -> Result<Vec<u8>, Error> {
    let read = with_retry(options.retry, || {
        let file = Arc::clone(&file);
        let size = options.chunk_size;
        async move {
            let task = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; size];
                let read = read_at(&file, &mut buf, position)?;
                buf.truncate(read);
                Ok::<_, io::Error>(buf)
            });
            match task.await {
                Ok(result) => result,
                Err(err) => Err(io::Error::other(err)),
            }
        }
    })
    .await;
    read.map_err(|err| Error::io(err, "failed to read file").with_offset(position))
}

/// Stream the file from `position` to its end, one chunk per poll.
///
/// Each chunk is read only when the consumer asks for it.
pub fn read_chunks(
    file: Arc<File>,
    position: u64,
    options: ReadOptions,
) -> impl Stream<Item = Result<DataChunk, Error>> + Send + 'static {
    stream::unfold(Some(position), move |state| {
        let file = Arc::clone(&file);
        async move {
            let position = state?;
            match read_block(file, position, options).await {
                Ok(buf) if buf.is_empty() => None,
                Ok(buf) => {
                    let next = position + buf.len() as u64;
                    Some((Ok(DataChunk::new(buf)), Some(next)))
                }
                Err(err) => Some((Err(err), None)),
            }
        }
    })
}

/// Caps a chunk stream at exactly `remaining` bytes.
///
/// The chunk that crosses the cap is truncated and the upstream is dropped
/// right away, so no further reads are requested. An upstream that ends
/// short of the cap yields an `Io` error.
pub struct Limit<S> {
    inner: Option<S>,
    remaining: u64,
}

impl<S> Limit<S> {
    pub fn new(inner: S, limit: u64) -> Self {
        Self {
            inner: Some(inner),
            remaining: limit,
        }
    }
}

impl<S> Stream for Limit<S>
where
    S: Stream<Item = Result<DataChunk, Error>> + Unpin,
{
    type Item = Result<DataChunk, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.remaining == 0 {
            this.inner = None;
            return Poll::Ready(None);
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        let item = ready!(inner.poll_next_unpin(cx));
        match item {
            Some(Ok(mut chunk)) => {
                let len = chunk.len() as u64;
                if len >= this.remaining {
                    chunk.truncate(this.remaining as usize);
                    this.remaining = 0;
                    this.inner = None;
                } else {
                    this.remaining -= len;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => {
                this.inner = None;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.inner = None;
                let missing = this.remaining;
                this.remaining = 0;
                Poll::Ready(Some(Err(Error::new(ErrorKind::Io)
                    .with_message("file ended before the requested range")
                    .with_offset(missing))))
            }
        }
    }
}

/// Byte stream over exactly `[segment.begin, segment.end)`.
pub fn open_range(segment: &FileSegment, options: &ReadOptions) -> ByteStream {
    let path = segment.path().to_path_buf();
    let chunks = read_chunks(Arc::clone(segment.file()), segment.begin(), *options)
        .map_err(move |err| err.with_path(path.clone()));
    Box::pin(Limit::new(Box::pin(chunks), segment.len()))
}
