//! Error types for stacking operations

use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for zstack operations
#[derive(Error, Debug)]
pub enum StackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filename {name:?} does not match pattern {pattern:?}")]
    PatternMismatch { name: String, pattern: String },

    #[error("Invalid file pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Files {first:?} and {second:?} both map to z={z} in the same group")]
    DuplicateSlice {
        first: PathBuf,
        second: PathBuf,
        z: u64,
    },

    #[error("Group {0:?} contains no files")]
    EmptyGroup(String),

    #[error("Metadata of {file:?} is inconsistent with its group: {field} is {found}, expected {expected}")]
    MetadataInconsistency {
        file: PathBuf,
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("Could not open {file:?}: {source}")]
    SourceOpen {
        file: PathBuf,
        #[source]
        source: Box<StackError>,
    },

    #[error("Chunk transfer failed for {file:?} at z={z}, chunk x={x:?} y={y:?}: {source}")]
    ChunkTransfer {
        file: PathBuf,
        z: usize,
        x: Range<usize>,
        y: Range<usize>,
        #[source]
        source: Box<StackError>,
    },

    #[error("Worker crashed while running job {job:?}: {message}")]
    WorkerCrash { job: String, message: String },

    #[error("Invalid image format: {0}")]
    InvalidFormat(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Checksum mismatch for tile {0}")]
    ChecksumMismatch(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StackError {
    /// True for errors raised while partitioning files, before any job runs
    pub fn is_pre_job(&self) -> bool {
        matches!(
            self,
            StackError::PatternMismatch { .. }
                | StackError::InvalidPattern { .. }
                | StackError::DuplicateSlice { .. }
                | StackError::EmptyGroup(_)
        )
    }
}

/// Specialized Result type for zstack operations
pub type Result<T> = std::result::Result<T, StackError>;

impl From<bincode::Error> for StackError {
    fn from(err: bincode::Error) -> Self {
        StackError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StackError {
    fn from(err: serde_json::Error) -> Self {
        StackError::Serialization(err.to_string())
    }
}
