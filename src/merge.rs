//! Volume merger - stacks the planes of a group's files into one output volume.
//!
//! Output z-slots are filled strictly in file order, then native z order within
//! each file, so the plane at output index `k` is the `k`-th plane of the
//! concatenated inputs. Every plane moves through a fixed grid of chunks, which
//! caps how many pixels a single transfer holds regardless of image size.

use crate::access::{TiledImageReader, TiledImageWriter};
use crate::calibration::{reconcile_z, ZCalibration};
use crate::error::{Result, StackError};
use crate::layout::{ChunkGrid, DEFAULT_CHUNK_EDGE};
use crate::metadata::ImageMetadata;
use crate::pattern::Group;
use crate::scheduler::WorkerBudget;
use crate::utils::format_bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tunables for a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// Largest chunk edge, in samples
    pub max_chunk_edge: usize,
}

impl MergeOptions {
    pub fn with_max_chunk_edge(mut self, edge: usize) -> Self {
        self.max_chunk_edge = edge;
        self
    }
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            max_chunk_edge: DEFAULT_CHUNK_EDGE,
        }
    }
}

/// What a finished merge produced
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub output: PathBuf,
    /// z extent of the output
    pub depth: usize,
    /// Planes copied, counted across z, channel and timepoint
    pub planes: usize,
    /// Chunk transfers performed
    pub chunks: usize,
    pub calibration: ZCalibration,
    /// Writer concurrency at creation and after each input file
    pub writer_concurrency: Vec<usize>,
}

async fn open_source(path: &Path) -> Result<TiledImageReader> {
    TiledImageReader::open(path)
        .await
        .map_err(|e| StackError::SourceOpen {
            file: path.to_path_buf(),
            source: Box::new(e),
        })
}

/// Merges groups into volumes, sizing its I/O from a pool's live capacity
pub struct VolumeMerger {
    options: MergeOptions,
    budget: Arc<dyn WorkerBudget>,
}

impl VolumeMerger {
    pub fn new(options: MergeOptions, budget: impl WorkerBudget + 'static) -> Self {
        Self {
            options,
            budget: Arc::new(budget),
        }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Stack every file of `group` into a new volume at `output`.
    ///
    /// Nothing is published at `output` unless the whole group was copied.
    pub async fn merge(&self, group: &Group, output: &Path) -> Result<MergeSummary> {
        let files: Vec<&Path> = group.files.iter().map(|f| f.path.as_path()).collect();
        let (first, depth) = self.survey(&files, &group.output_name).await?;

        let calibration = reconcile_z(&first);
        let metadata = first.stacked(depth, calibration.size());
        let grid = ChunkGrid::new(metadata.shape.x, metadata.shape.y, self.options.max_chunk_edge)?;
        let chunk_bytes = grid.max_chunk_bytes(metadata.data_type.size_in_bytes());

        tracing::info!(
            group = %group.label(),
            output = %output.display(),
            files = files.len(),
            depth,
            shape = %metadata.shape,
            chunk_edge = grid.max_edge(),
            chunk_bytes = %format_bytes(chunk_bytes),
            z_fallback = calibration.is_fallback(),
            "Stacking group"
        );

        let mut writer =
            TiledImageWriter::create(output, metadata, self.budget.available_workers()).await?;

        match self.copy_planes(&mut writer, &files, &first, &grid).await {
            Ok((planes, chunks, writer_concurrency)) => {
                let bytes = planes * writer.metadata().plane_bytes();
                let tiles = writer.tiles_written();
                let output = writer.close().await?;
                tracing::info!(
                    output = %output.display(),
                    planes,
                    chunks,
                    tiles,
                    copied = %format_bytes(bytes),
                    "Finished stacking group"
                );
                Ok(MergeSummary {
                    output,
                    depth,
                    planes,
                    chunks,
                    calibration,
                    writer_concurrency,
                })
            }
            Err(error) => {
                if let Err(cleanup) = writer.abort().await {
                    tracing::warn!(error = %cleanup, "Could not remove partial output");
                }
                Err(error)
            }
        }
    }

    /// Read every file's metadata once; returns the first file's metadata and
    /// the summed z extent. Fails before anything is written if the files
    /// cannot be stacked.
    async fn survey(&self, files: &[&Path], name: &str) -> Result<(ImageMetadata, usize)> {
        let Some((head, rest)) = files.split_first() else {
            return Err(StackError::EmptyGroup(name.to_string()));
        };

        let reader = open_source(head).await?;
        let first = reader.metadata().clone();
        reader.close();

        let mut depth = first.shape.z;
        for path in rest {
            let reader = open_source(path).await?;
            first.check_stackable(reader.metadata(), path)?;
            depth += reader.metadata().shape.z;
            reader.close();
        }
        Ok((first, depth))
    }

    async fn copy_planes(
        &self,
        writer: &mut TiledImageWriter,
        files: &[&Path],
        first: &ImageMetadata,
        grid: &ChunkGrid,
    ) -> Result<(usize, usize, Vec<usize>)> {
        let mut output_z = 0;
        let mut planes = 0;
        let mut chunks = 0;
        let mut hints = vec![writer.concurrency()];

        for path in files {
            let mut reader = open_source(path).await?;
            first.check_stackable(reader.metadata(), path)?;
            reader.set_concurrency(self.budget.available_workers());

            let shape = reader.metadata().shape;
            tracing::debug!(
                file = %path.display(),
                planes = shape.z,
                first_output_z = output_z,
                "Copying file"
            );

            for z in 0..shape.z {
                for t in 0..shape.t {
                    for c in 0..shape.c {
                        for chunk in grid.chunks() {
                            let transfer = async {
                                let data = reader.read_region(&chunk.region(z, c, t)).await?;
                                writer
                                    .write_region(&chunk.region(output_z, c, t), &data)
                                    .await
                            };
                            transfer.await.map_err(|e| StackError::ChunkTransfer {
                                file: path.to_path_buf(),
                                z,
                                x: chunk.x.clone(),
                                y: chunk.y.clone(),
                                source: Box::new(e),
                            })?;
                            chunks += 1;
                        }
                        planes += 1;
                    }
                }
                output_z += 1;
            }
            reader.close();

            // The pool may have rebalanced while this file was copied
            writer.set_concurrency(self.budget.available_workers());
            hints.push(writer.concurrency());
        }

        Ok((planes, chunks, hints))
    }
}
