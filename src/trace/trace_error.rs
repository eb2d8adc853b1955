use crate::trace::trace_frame::FrameTime;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("I/O error on `{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Data ends in the middle of a block or record.
    #[error("{stream}: truncated at offset {offset}")]
    Truncated { stream: String, offset: u64 },

    #[error("{stream}: corrupt data at offset {offset}: {reason}")]
    Corrupt {
        stream: String,
        offset: u64,
        reason: String,
    },

    #[error("no trace found at `{path}'")]
    MissingTrace { path: PathBuf },

    #[error("trace `{path}' has version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: String,
        expected: u32,
    },

    #[error("no raw data recorded at time {time}")]
    NoRawData { time: FrameTime },

    #[error("raw data block holds {needed} bytes but the buffer only has room for {available}")]
    SizeMismatch { needed: usize, available: usize },

    #[error("expected frame at time {expected}, found {found}")]
    TimeMismatch { expected: FrameTime, found: FrameTime },

    #[error("path of {len} bytes is too long")]
    PathTooLong { len: usize },

    #[error("path contains a NUL byte at offset {offset}")]
    BadPath { offset: usize },

    #[error("can't encode record: {reason}")]
    Encode { reason: String },
}

impl TraceError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> TraceError {
        TraceError::Io {
            path: path.into(),
            source,
        }
    }
}
