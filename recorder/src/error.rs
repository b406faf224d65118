//! Error type shared by every recorder component.

use std::path::PathBuf;

use nvr_common::segment::TimestampError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("cannot spawn {program} for stream {stream}: {source}")]
    Spawn {
        stream: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot list {}: {source}", path.display())]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot move {} to {}: {source}", from.display(), to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", path.display())]
    Timestamp {
        path: PathBuf,
        #[source]
        source: TimestampError,
    },

    #[error("merge of {} failed: {reason}", dir.display())]
    Merge { dir: PathBuf, reason: String },

    #[error("cannot watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
