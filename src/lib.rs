//! zstack - stack z-slices into volumetric tiled images
//!
//! Slices that share a spatial footprint but sit at different z positions are
//! grouped by filename pattern and merged into one tiled volume per group.
//!
//! # Features
//!
//! - Filename pattern grouping with collapsed z-range output names
//! - Recovery of a missing z spacing from the x/y spacing
//! - Bounded-memory chunked plane copies
//! - One merge job per group on a worker pool with live capacity sharing
//! - Tiled container with Deflate, Zstd and RLE tile compression
//!
//! # Example
//!
//! ```rust,ignore
//! use zstack::{run, StackConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StackConfig::new("/data/slices", "/data/volumes", "img_c{c}_z{zzz}.zvol");
//! let report = run(&config).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod calibration;
pub mod compression;
pub mod config;
pub mod error;
pub mod io;
pub mod layout;
pub mod merge;
pub mod metadata;
pub mod pattern;
pub mod scheduler;
pub mod types;
pub mod utils;

// Re-exports
pub use access::{TiledImageReader, TiledImageWriter};
pub use calibration::{LengthUnit, PhysicalSize, PhysicalSizes, ZCalibration};
pub use compression::{CompressionMethod, Compressor};
pub use config::StackConfig;
pub use error::{Result, StackError};
pub use io::{FileSystemIOManager, IOManager};
pub use layout::{Chunk, ChunkGrid, TileSize};
pub use merge::{MergeOptions, MergeSummary, VolumeMerger};
pub use metadata::ImageMetadata;
pub use pattern::{enumerate_groups, group_files, FilePattern, Group, SliceFile};
pub use scheduler::{JoinReport, PoolCapacity, WorkerBudget, WorkerPool};
pub use types::{DataType, ImageShape, Region};

/// Version of the zstack implementation
pub const ZSTACK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of a whole run
pub type RunReport = JoinReport;

/// Stack every group found in the configured input directory.
///
/// Pattern and grouping errors are returned before any job starts. Failures of
/// individual groups are collected in the report; outputs of groups that
/// succeeded stay on disk either way.
pub async fn run(config: &StackConfig) -> Result<RunReport> {
    config.validate()?;
    let pattern = config.pattern()?;
    let groups = enumerate_groups(&config.input_dir, &pattern).await?;

    tracing::info!(
        groups = groups.len(),
        input_dir = %config.input_dir.display(),
        pattern = pattern.as_str(),
        "Enumerated groups"
    );

    tokio::fs::create_dir_all(&config.output_dir).await?;

    let options = config.merge_options();
    let mut pool = WorkerPool::init(config.workers, "stack");
    for group in groups {
        let output = config.output_dir.join(&group.output_name);
        let name = group.output_name.clone();
        pool.submit(name, move |capacity| async move {
            let merger = VolumeMerger::new(options, capacity);
            merger.merge(&group, &output).await.map(|_| ())
        });
    }

    tracing::info!(
        queued = pool.pending(),
        workers = pool.capacity().capacity(),
        "Submitted all groups"
    );

    let report = pool.join().await;
    if report.is_success() {
        tracing::info!(volumes = report.succeeded.len(), "All groups stacked");
    } else {
        tracing::error!(
            failed = report.failures.len(),
            succeeded = report.succeeded.len(),
            "Some groups failed to stack"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!ZSTACK_VERSION.is_empty());
    }
}
