//! Worker output capture.
//!
//! - [`entry`] - the [`LogEntry`] line format stored in chunks.
//! - [`streamer`] - [`LogStreamer`], which batches lines into chunks.

pub mod entry;
pub mod streamer;

pub use entry::{LogEntry, LogStream};
pub use streamer::{
    LogStreamError, LogStreamer, StreamSummary, StreamerConfig, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_MAX_LINES,
};
