//! Purpose: Log storage library behind the `pipelog` CLI and HTTP server.
//! Exports: `api` (service object and read-path types), `core`, `storage_paths`.
//! Role: Shared by the binary and integration tests.
//! Invariants: Appends to one path are applied in submission order.
//! Invariants: Read streams never copy line content and never outlive their file handle.
pub mod api;
pub mod core;
pub mod storage_paths;
