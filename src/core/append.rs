// Sharded append queues: one serial worker per shard, routed by path hash.
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::chunk::{ByteStream, DataChunk};
use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_SHARDS: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug)]
pub struct AppendOptions {
    pub shards: usize,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

struct AppendTask {
    path: PathBuf,
    source: ByteStream,
    compressed: bool,
    done: oneshot::Sender<Result<(), Error>>,
}

struct Shard {
    sender: mpsc::Sender<AppendTask>,
    worker: JoinHandle<()>,
}

struct Shards {
    slots: Vec<Option<Shard>>,
    closed: bool,
}

/// Serializes appends per destination path over a fixed set of shards.
///
/// Every path hashes to one shard, and each shard runs its tasks one at a time
/// in submission order. Shard workers are spawned on first use, so the queue
/// must be used from within a Tokio runtime.
pub struct AppendQueue {
    options: AppendOptions,
    shards: Mutex<Shards>,
}

impl AppendQueue {
    pub fn new(options: AppendOptions) -> Self {
        let options = AppendOptions {
            shards: options.shards.max(1),
            queue_capacity: options.queue_capacity.max(1),
            ..options
        };
        let slots = (0..options.shards).map(|_| None).collect();
        Self {
            options,
            shards: Mutex::new(Shards {
                slots,
                closed: false,
            }),
        }
    }

    pub fn options(&self) -> &AppendOptions {
        &self.options
    }

    /// Queue `source` to be appended to `path`.
    ///
    /// The task is enqueued before this returns, so the order of `append` calls
    /// for one path is the order the bytes land in the file. When the shard
    /// queue is full the source is drained and discarded in the background and
    /// the returned future fails with `QueueFull`.
    pub fn append(&self, path: impl Into<PathBuf>, source: ByteStream, compressed: bool) -> AppendFuture {
        let path = path.into();
        let shard = shard_index(&path, self.options.shards);
        let sender = match self.sender(shard) {
            Ok(sender) => sender,
            Err(err) => return AppendFuture::failed(err.with_path(path)),
        };
        let (done, result) = oneshot::channel();
        let task = AppendTask {
            path,
            source,
            compressed,
            done,
        };
        match sender.try_send(task) {
            Ok(()) => {
                debug!(shard, queued = sender.max_capacity() - sender.capacity(), "append queued");
                AppendFuture::queued(result)
            }
            Err(TrySendError::Full(task)) => {
                warn!(shard, path = %task.path.display(), "append queue is full, draining source");
                let drain = tokio::spawn(drain(task.source));
                AppendFuture::rejected(drain, task.path)
            }
            Err(TrySendError::Closed(task)) => {
                AppendFuture::failed(closed_error().with_path(task.path))
            }
        }
    }

    /// Stop accepting appends and wait for queued tasks to finish.
    pub async fn shutdown(&self) {
        let shards: Vec<(usize, Shard)> = {
            let mut guard = self
                .shards
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            guard.closed = true;
            guard
                .slots
                .iter_mut()
                .enumerate()
                .filter_map(|(index, slot)| slot.take().map(|shard| (index, shard)))
                .collect()
        };
        for (index, shard) in shards {
            drop(shard.sender);
            if let Err(err) = shard.worker.await {
                warn!(shard = index, error = %err, "append worker ended abnormally");
            }
        }
        info!("append queues drained");
    }

    fn sender(&self, index: usize) -> Result<mpsc::Sender<AppendTask>, Error> {
        let mut guard = self
            .shards
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if guard.closed {
            return Err(closed_error());
        }
        let slot = &mut guard.slots[index];
        if let Some(shard) = slot {
            return Ok(shard.sender.clone());
        }
        debug!(shard = index, "starting append worker");
        let (sender, receiver) = mpsc::channel(self.options.queue_capacity);
        let worker = tokio::spawn(run_worker(index, receiver, self.options.task_timeout));
        *slot = Some(Shard {
            sender: sender.clone(),
            worker,
        });
        Ok(sender)
    }
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Internal).with_message("append queue is closed")
}

/// Deterministic shard for a path, stable across runs.
pub fn shard_index(path: &Path, shards: usize) -> usize {
    let digest = Sha256::digest(path.as_os_str().as_encoded_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % shards.max(1) as u64) as usize
}

/// Completion of one append task.
#[must_use = "an append reports its outcome only when awaited"]
pub struct AppendFuture {
    inner: BoxFuture<'static, Result<(), Error>>,
}

impl AppendFuture {
    fn queued(result: oneshot::Receiver<Result<(), Error>>) -> Self {
        Self {
            inner: async move {
                result.await.unwrap_or_else(|_| {
                    Err(Error::new(ErrorKind::Internal).with_message("append worker stopped"))
                })
            }
            .boxed(),
        }
    }

    fn rejected(drain: JoinHandle<u64>, path: PathBuf) -> Self {
        Self {
            inner: async move {
                let drained = drain.await.unwrap_or_default();
                debug!(path = %path.display(), drained, "rejected append source drained");
                Err(Error::new(ErrorKind::QueueFull)
                    .with_message("queue is full")
                    .with_path(path))
            }
            .boxed(),
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self {
            inner: future::ready(Err(err)).boxed(),
        }
    }
}

impl Future for AppendFuture {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

async fn drain(mut source: ByteStream) -> u64 {
    let mut drained = 0u64;
    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => drained += chunk.len() as u64,
            Err(_) => break,
        }
    }
    drained
}

async fn run_worker(shard: usize, mut receiver: mpsc::Receiver<AppendTask>, timeout: Duration) {
    while let Some(task) = receiver.recv().await {
        let AppendTask {
            path,
            source,
            compressed,
            done,
        } = task;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let result = execute(&path, source, compressed, deadline).await;
        match &result {
            Ok(written) => debug!(
                shard,
                path = %path.display(),
                written,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "append complete"
            ),
            Err(err) => warn!(shard, path = %path.display(), error = %err, "append failed"),
        }
        // The caller may have stopped waiting.
        let _ = done.send(result.map(|_| ()));
    }
    debug!(shard, "append worker stopped");
}

/// Copy `source` to the end of `path`.
///
/// Every write has completed by the time this returns, on success and on
/// every error path. The deadline only bounds waiting on the source: a task
/// past its deadline drops the source and never abandons a write midway.
async fn execute(
    path: &Path,
    mut source: ByteStream,
    compressed: bool,
    deadline: tokio::time::Instant,
) -> Result<u64, Error> {
    let file = Arc::new(open_for_append(path).await?);
    let mut written = 0u64;
    loop {
        let item = match tokio::time::timeout_at(deadline, source.next()).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => return Err(timed_out(path)),
        };
        let chunk = item?;
        written += write_chunk(Arc::clone(&file), path, chunk, compressed, written).await?;
        if tokio::time::Instant::now() >= deadline {
            return Err(timed_out(path));
        }
    }
    Ok(written)
}

async fn open_for_append(path: &Path) -> Result<File, Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<File, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::io(err, "failed to create directory").with_path(parent)
            })?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| Error::io(err, "failed to open file for append").with_path(&path))
    })
    .await
    .map_err(join_error)?
}

/// Inflate (if needed) and write one chunk off the executor; returns bytes written.
async fn write_chunk(
    file: Arc<File>,
    path: &Path,
    chunk: DataChunk,
    compressed: bool,
    offset: u64,
) -> Result<u64, Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<u64, Error> {
        let data = if compressed {
            let inflated = inflate(chunk.data()).map_err(|err| {
                Error::new(ErrorKind::Decode)
                    .with_message("failed to inflate chunk")
                    .with_path(&path)
                    .with_offset(offset)
                    .with_source(err)
            })?;
            Bytes::from(inflated)
        } else {
            chunk.data().clone()
        };
        (&*file)
            .write_all(&data)
            .map_err(|err| Error::io(err, "failed to write file").with_path(&path))?;
        chunk.release();
        Ok(data.len() as u64)
    })
    .await
    .map_err(join_error)?
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("append write task failed")
        .with_source(err)
}

fn timed_out(path: &Path) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("append timed out")
        .with_path(path)
}

/// Inflate every gzip member in `data`; anything after a member must be another member.
fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
