//! Purpose: The `LogStore` service object tying appends and reads to one storage root.
//! Exports: `LogStore`, `StoreOptions`, `LineQuery`, `LineWindow`, `line_window`.
//! Role: Dependency-injected entry point for the CLI, the HTTP server, and tests.
//! Invariants: Every caller-supplied path is resolved under the storage root.
//! Invariants: `shutdown` drains queued appends before returning.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::core::append::{AppendFuture, AppendOptions, AppendQueue};
use crate::core::chunk::ByteStream;
use crate::core::encode::{LineEncoder, LineMarkup};
use crate::core::error::{Error, ErrorKind};
use crate::core::range::{ReadOptions, open_range};
use crate::core::segment::FileSegment;
use crate::storage_paths;

pub type ApiResult<T> = Result<T, Error>;

#[derive(Clone, Copy, Debug, Default)]
pub struct StoreOptions {
    pub append: AppendOptions,
    pub read: ReadOptions,
}

/// A tail or page request over one log file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineQuery {
    /// Forward reads start here; backward reads end here (0 means end of file).
    pub position: u64,
    /// `None` reads every line.
    pub max_lines: Option<u32>,
    pub lines_only: bool,
    pub backward: bool,
}

/// The segment selected by a [`LineQuery`] and the metadata reported with it.
#[derive(Clone, Debug)]
pub struct LineWindow {
    pub segment: FileSegment,
    pub lines: Option<u32>,
    /// Bytes left unread in the direction of the query.
    pub remaining: u64,
    /// Where the next forward read should start.
    pub position: u64,
}

impl LineWindow {
    /// Line count as reported to clients, `-1` when no scan took place.
    pub fn reported_lines(&self) -> i64 {
        self.lines.map_or(-1, i64::from)
    }
}

/// Resolve a [`LineQuery`] against the file at `path`.
pub fn line_window(path: &Path, query: LineQuery) -> ApiResult<LineWindow> {
    let file = FileSegment::open(path, 0, None)?;
    let size = file.end();
    if query.position > size {
        return Err(Error::new(ErrorKind::InvalidRange)
            .with_message("position is past the end of file")
            .with_path(path)
            .with_offset(query.position));
    }
    let source = if query.backward {
        let end = if query.position == 0 { size } else { query.position };
        file.slice_len(0, end)?
    } else {
        file.slice(query.position)?
    };
    let found = source.find_lines(query.max_lines, query.lines_only, query.backward)?;
    let remaining = if query.backward {
        found.begin() - source.begin()
    } else {
        source.end() - found.end()
    };
    Ok(LineWindow {
        lines: found.lines(),
        remaining,
        position: found.end(),
        segment: found,
    })
}

pub struct LogStore {
    root: PathBuf,
    appender: AppendQueue,
    read: ReadOptions,
    requests: AtomicU64,
}

impl LogStore {
    /// Open (creating if needed) the storage root.
    pub fn open(root: impl Into<PathBuf>, options: StoreOptions) -> ApiResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| {
            Error::io(err, "failed to create storage directory").with_path(&root)
        })?;
        info!(
            root = %root.display(),
            shards = options.append.shards,
            queue_capacity = options.append.queue_capacity,
            "log store opened"
        );
        Ok(Self {
            root,
            appender: AppendQueue::new(options.append),
            read: options.read,
            requests: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &str) -> ApiResult<PathBuf> {
        storage_paths::resolve(&self.root, relative)
    }

    /// Append `source` to the file at `relative` under the storage root.
    pub fn append(&self, relative: &str, source: ByteStream, compressed: bool) -> AppendFuture {
        match self.resolve(relative) {
            Ok(path) => self.appender.append(path, source, compressed),
            Err(err) => AppendFuture::failed(err),
        }
    }

    pub fn segment(&self, relative: &str, begin: u64, end: Option<u64>) -> ApiResult<FileSegment> {
        let path = self.resolve(relative)?;
        FileSegment::open(path, begin, end)
    }

    pub fn open_range(&self, segment: &FileSegment) -> ByteStream {
        open_range(segment, &self.read)
    }

    /// Run a line query off the async executor; scanning reads the file.
    pub async fn find_lines(&self, relative: &str, query: LineQuery) -> ApiResult<LineWindow> {
        let path = self.resolve(relative)?;
        tokio::task::spawn_blocking(move || line_window(&path, query))
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("line scan task failed")
                    .with_source(err)
            })?
    }

    /// Stream `segment` through the line encoder.
    pub fn encode(&self, segment: &FileSegment, markup: LineMarkup) -> LineEncoder<ByteStream> {
        let request_id = self.requests.fetch_add(1, Ordering::Relaxed);
        LineEncoder::new(self.open_range(segment), markup).with_request_id(request_id)
    }

    pub async fn shutdown(&self) {
        self.appender.shutdown().await;
    }
}
