// Core modules implementing log storage, line indexing, and streaming encoders.
pub mod append;
pub mod chunk;
pub mod encode;
pub mod error;
pub mod range;
pub mod segment;
pub mod vbuf;
