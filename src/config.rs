//! Run configuration

use crate::error::{Result, StackError};
use crate::layout::DEFAULT_CHUNK_EDGE;
use crate::merge::MergeOptions;
use crate::pattern::{FilePattern, DEFAULT_Z_AXIS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything one stacking run needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Directory holding the slice images
    pub input_dir: PathBuf,

    /// Directory receiving one volume per group
    pub output_dir: PathBuf,

    /// Filename pattern, e.g. `img_c{c}_z{zzz}.zvol`
    pub file_pattern: String,

    /// Pattern variable that orders slices
    #[serde(default = "default_z_axis")]
    pub z_axis: char,

    /// Worker budget; `None` uses the available parallelism
    #[serde(default)]
    pub workers: Option<usize>,

    /// Largest chunk edge moved by a single transfer
    #[serde(default = "default_chunk_edge")]
    pub max_chunk_edge: usize,
}

fn default_z_axis() -> char {
    DEFAULT_Z_AXIS
}

fn default_chunk_edge() -> usize {
    DEFAULT_CHUNK_EDGE
}

impl StackConfig {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        file_pattern: impl Into<String>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            file_pattern: file_pattern.into(),
            z_axis: DEFAULT_Z_AXIS,
            workers: None,
            max_chunk_edge: DEFAULT_CHUNK_EDGE,
        }
    }

    pub fn with_z_axis(mut self, z_axis: char) -> Self {
        self.z_axis = z_axis;
        self
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_chunk_edge(mut self, edge: usize) -> Self {
        self.max_chunk_edge = edge;
        self
    }

    /// Compile the file pattern
    pub fn pattern(&self) -> Result<FilePattern> {
        FilePattern::with_z_axis(&self.file_pattern, self.z_axis)
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions::default().with_max_chunk_edge(self.max_chunk_edge)
    }

    /// Check the configuration before any work starts
    pub fn validate(&self) -> Result<()> {
        if !self.input_dir.is_dir() {
            return Err(StackError::Configuration(format!(
                "Input directory {:?} does not exist",
                self.input_dir
            )));
        }
        if self.max_chunk_edge == 0 {
            return Err(StackError::Configuration(
                "Chunk edge must be greater than zero".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(StackError::Configuration(
                "Worker count must be greater than zero".to_string(),
            ));
        }
        self.pattern().map(|_| ())
    }
}
