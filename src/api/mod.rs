//! Purpose: Public Rust API for log storage: the store plus the stream types it hands out.
//! Exports: `LogStore` and its option/query types, stream and chunk types, errors.
//! Role: The path the CLI, the HTTP server, and integration tests go through.
//! Invariants: Callers never build storage paths by hand; the store resolves them.

mod store;

pub use crate::core::append::{AppendFuture, AppendOptions};
pub use crate::core::chunk::{ByteStream, DataChunk, VirtualChunk};
pub use crate::core::encode::{Encoded, LineEncoder, LineMarkup};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::range::{ReadOptions, RetrySchedule};
pub use crate::core::segment::FileSegment;
pub use store::{ApiResult, LineQuery, LineWindow, LogStore, StoreOptions, line_window};
