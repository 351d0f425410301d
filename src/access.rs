//! Tiled image access - region reads and writes on a tiled container

use crate::compression::{get_compressor, CompressionLevel};
use crate::error::{Result, StackError};
use crate::io::{FileSystemIOManager, IOManager};
use crate::layout::TileGrid;
use crate::metadata::ImageMetadata;
use crate::types::Region;
use crate::utils::{calculate_checksum, tile_path, verify_checksum};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";

/// (t, c, z, tx, ty)
type TileKey = (usize, usize, usize, usize, usize);

/// On-disk record of one tile
#[derive(Debug, Serialize, Deserialize)]
struct TileRecord {
    width: u32,
    height: u32,
    checksum: u32,
    payload: Vec<u8>,
}

/// Copy the `window` of `src` (covering `src_x` x `src_y`) into `dst` (covering `dst_x` x `dst_y`).
#[allow(clippy::too_many_arguments)]
fn copy_window(
    src: &[u8],
    src_x: &Range<usize>,
    src_y: &Range<usize>,
    dst: &mut [u8],
    dst_x: &Range<usize>,
    dst_y: &Range<usize>,
    window: (&Range<usize>, &Range<usize>),
    sample_bytes: usize,
) {
    let (wx, wy) = window;
    let row_bytes = wx.len() * sample_bytes;
    let src_stride = src_x.len() * sample_bytes;
    let dst_stride = dst_x.len() * sample_bytes;

    for y in wy.clone() {
        let s = (y - src_y.start) * src_stride + (wx.start - src_x.start) * sample_bytes;
        let d = (y - dst_y.start) * dst_stride + (wx.start - dst_x.start) * sample_bytes;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}

fn intersect(a: &Range<usize>, b: &Range<usize>) -> Range<usize> {
    a.start.max(b.start)..a.end.min(b.end)
}

/// Tile-level storage shared by readers and writers
struct TileStore {
    io: Arc<dyn IOManager>,
    metadata: ImageMetadata,
    grid: TileGrid,
}

impl TileStore {
    fn new(io: Arc<dyn IOManager>, metadata: ImageMetadata) -> Self {
        let grid = TileGrid::new(metadata.shape.x, metadata.shape.y, metadata.tile_size);
        Self { io, metadata, grid }
    }

    fn sample_bytes(&self) -> usize {
        self.metadata.data_type.size_in_bytes()
    }

    fn check_region(&self, region: &Region) -> Result<()> {
        if !region.fits(&self.metadata.shape) {
            return Err(StackError::OutOfBounds(format!(
                "Region x={:?} y={:?} z={} c={} t={} outside image {}",
                region.x, region.y, region.z, region.c, region.t, self.metadata.shape
            )));
        }
        Ok(())
    }

    /// Decoded samples of one tile; tiles never written read as zero
    async fn read_tile(&self, region: &Region, tx: usize, ty: usize) -> Result<Vec<u8>> {
        let (x, y) = self.grid.tile_range(tx, ty);
        let expected = x.len() * y.len() * self.sample_bytes();
        let path = tile_path(region.t, region.c, region.z, tx, ty);

        let Some(raw) = self.io.try_read(&path).await? else {
            return Ok(vec![0u8; expected]);
        };

        let record: TileRecord = bincode::deserialize(&raw)?;
        if record.width as usize != x.len() || record.height as usize != y.len() {
            return Err(StackError::InvalidFormat(format!(
                "Tile {} is {}x{}, expected {}x{}",
                path,
                record.width,
                record.height,
                x.len(),
                y.len()
            )));
        }

        let compressor = get_compressor(self.metadata.compression);
        let data = compressor.decompress(&record.payload, expected)?;
        if data.len() != expected {
            return Err(StackError::Decompression(format!(
                "Tile {} decoded to {} bytes, expected {}",
                path,
                data.len(),
                expected
            )));
        }
        if !verify_checksum(&data, record.checksum) {
            return Err(StackError::ChecksumMismatch(path));
        }
        Ok(data)
    }

    async fn write_tile(&self, region: &Region, tx: usize, ty: usize, data: &[u8]) -> Result<()> {
        let (x, y) = self.grid.tile_range(tx, ty);
        let compressor = get_compressor(self.metadata.compression);
        let record = TileRecord {
            width: x.len() as u32,
            height: y.len() as u32,
            checksum: calculate_checksum(data),
            payload: compressor.compress(data, CompressionLevel::default())?,
        };
        let encoded = bincode::serialize(&record)?;
        self.io
            .write(&tile_path(region.t, region.c, region.z, tx, ty), &encoded)
            .await
    }
}

/// Read side of a tiled image
pub struct TiledImageReader {
    store: TileStore,
    concurrency: usize,
}

impl TiledImageReader {
    /// Open an existing tiled image from the local filesystem
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(Arc::new(FileSystemIOManager::new(path))).await
    }

    /// Open a tiled image through any storage backend
    pub async fn open_with(io: Arc<dyn IOManager>) -> Result<Self> {
        if !io.exists(METADATA_FILE).await? {
            return Err(StackError::InvalidFormat(format!(
                "{} is not a tiled image: missing {}",
                io.location().display(),
                METADATA_FILE
            )));
        }
        let metadata_bytes = io.read(METADATA_FILE).await?;
        let metadata: ImageMetadata = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| StackError::Metadata(e.to_string()))?;
        metadata.validate()?;

        Ok(Self {
            store: TileStore::new(io, metadata),
            concurrency: 1,
        })
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.store.metadata
    }

    pub fn path(&self) -> &Path {
        self.store.io.location()
    }

    /// Maximum number of tiles fetched concurrently by one region read
    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Read a region as row-major little-endian samples
    pub async fn read_region(&self, region: &Region) -> Result<Bytes> {
        self.store.check_region(region)?;

        let sample_bytes = self.store.sample_bytes();
        let mut out = vec![0u8; region.samples() * sample_bytes];
        let tiles = self.store.grid.overlapping_tiles(region);

        let mut fetched = stream::iter(tiles)
            .map(|(tx, ty)| async move {
                let data = self.store.read_tile(region, tx, ty).await?;
                Ok::<_, StackError>((tx, ty, data))
            })
            .buffer_unordered(self.concurrency);

        while let Some(result) = fetched.next().await {
            let (tx, ty, data) = result?;
            let (tile_x, tile_y) = self.store.grid.tile_range(tx, ty);
            let wx = intersect(&tile_x, &region.x);
            let wy = intersect(&tile_y, &region.y);
            copy_window(
                &data,
                &tile_x,
                &tile_y,
                &mut out,
                &region.x,
                &region.y,
                (&wx, &wy),
                sample_bytes,
            );
        }

        Ok(Bytes::from(out))
    }

    /// Release the reader
    pub fn close(self) {}
}

/// Write side of a tiled image.
///
/// Tiles are written to a hidden staging directory next to the destination.
/// `close` publishes it under the final name, `abort` (or dropping an unclosed
/// writer) removes it.
pub struct TiledImageWriter {
    store: TileStore,
    staging: PathBuf,
    destination: PathBuf,
    concurrency: usize,
    staged: Mutex<HashSet<TileKey>>,
    finished: bool,
}

impl TiledImageWriter {
    /// Create a new tiled image at `path`
    pub async fn create(
        path: impl AsRef<Path>,
        metadata: ImageMetadata,
        concurrency: usize,
    ) -> Result<Self> {
        metadata.validate()?;

        let destination = path.as_ref().to_path_buf();
        let staging = hidden_sibling(&destination, "partial")?;

        tokio::fs::create_dir_all(&staging).await?;
        let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(&staging));
        let metadata_json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| StackError::Metadata(e.to_string()))?;

        let writer = Self {
            store: TileStore::new(io, metadata),
            staging,
            destination,
            concurrency: concurrency.max(1),
            staged: Mutex::new(HashSet::new()),
            finished: false,
        };
        writer.store.io.write(METADATA_FILE, &metadata_json).await?;
        Ok(writer)
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.store.metadata
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Maximum number of tiles written concurrently by one region write
    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of distinct tiles written so far
    pub fn tiles_written(&self) -> usize {
        self.staged.lock().len()
    }

    /// Write row-major little-endian samples into a region
    pub async fn write_region(&self, region: &Region, data: &[u8]) -> Result<()> {
        self.store.check_region(region)?;

        let sample_bytes = self.store.sample_bytes();
        let expected_bytes = region.samples() * sample_bytes;
        if data.len() != expected_bytes {
            return Err(StackError::InvalidDimensions(format!(
                "Data size mismatch: expected {} bytes, got {}",
                expected_bytes,
                data.len()
            )));
        }

        let tiles = self.store.grid.overlapping_tiles(region);
        let mut written = stream::iter(tiles)
            .map(|(tx, ty)| async move {
                let (tile_x, tile_y) = self.store.grid.tile_range(tx, ty);
                let wx = intersect(&tile_x, &region.x);
                let wy = intersect(&tile_y, &region.y);

                // Partially covered tiles keep the samples outside the window.
                // The staging area starts empty, so only staged tiles hold any.
                let key = (region.t, region.c, region.z, tx, ty);
                let staged = self.staged.lock().contains(&key);
                let mut tile = if !staged || (wx == tile_x && wy == tile_y) {
                    vec![0u8; tile_x.len() * tile_y.len() * sample_bytes]
                } else {
                    self.store.read_tile(region, tx, ty).await?
                };
                copy_window(
                    data,
                    &region.x,
                    &region.y,
                    &mut tile,
                    &tile_x,
                    &tile_y,
                    (&wx, &wy),
                    sample_bytes,
                );
                self.store.write_tile(region, tx, ty, &tile).await?;
                self.staged.lock().insert(key);
                Ok::<(), StackError>(())
            })
            .buffer_unordered(self.concurrency);

        while let Some(result) = written.next().await {
            result?;
        }
        Ok(())
    }

    /// Publish the image under its destination name
    ///
    /// A previous output at the destination is moved aside first and only
    /// deleted once the new image is in place; if publishing fails it is
    /// moved back.
    pub async fn close(mut self) -> Result<PathBuf> {
        let backup = hidden_sibling(&self.destination, "replaced")?;
        let displaced = match tokio::fs::rename(&self.destination, &backup).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StackError::Io(e)),
        };

        if let Err(e) = tokio::fs::rename(&self.staging, &self.destination).await {
            if displaced {
                if let Err(restore) = tokio::fs::rename(&backup, &self.destination).await {
                    tracing::warn!(
                        backup = %backup.display(),
                        error = %restore,
                        "Could not restore previous output"
                    );
                }
            }
            return Err(StackError::Io(e));
        }
        self.finished = true;

        if displaced {
            if let Err(e) = remove_path(&backup).await {
                tracing::warn!(
                    backup = %backup.display(),
                    error = %e,
                    "Could not remove replaced output"
                );
            }
        }
        Ok(self.destination.clone())
    }

    /// Discard everything written so far
    pub async fn abort(mut self) -> Result<()> {
        self.finished = true;
        match tokio::fs::remove_dir_all(&self.staging).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StackError::Io(e)),
            _ => Ok(()),
        }
    }
}

/// Hidden, uniquely named path next to `destination`
fn hidden_sibling(destination: &Path, tag: &str) -> Result<PathBuf> {
    let name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            StackError::Configuration(format!("Output path {:?} has no file name", destination))
        })?;
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.{}-{}", name, tag, Uuid::new_v4().simple())))
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    if tokio::fs::symlink_metadata(path).await?.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

impl Drop for TiledImageWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_dir_all(&self.staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::layout::TileSize;
    use crate::types::{DataType, ImageShape};
    use tempfile::TempDir;

    fn pattern(region: &Region, seed: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity(region.samples() * 2);
        for y in region.y.clone() {
            for x in region.x.clone() {
                data.extend_from_slice(&(seed.wrapping_add((y * 131 + x) as u16)).to_le_bytes());
            }
        }
        data
    }

    fn hidden_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    fn metadata(x: usize, y: usize, z: usize) -> ImageMetadata {
        ImageMetadata::new(ImageShape::xyz(x, y, z), DataType::U16)
            .with_tile_size(TileSize::square(16))
    }

    #[tokio::test]
    async fn test_write_then_read_unaligned_regions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plane.zvol");

        let writer = TiledImageWriter::create(&path, metadata(40, 30, 1), 3)
            .await
            .unwrap();
        let full = Region::new(0..40, 0..30, 0, 0, 0);
        // Two overlapping writes; the second wins where they meet
        writer.write_region(&full, &pattern(&full, 0)).await.unwrap();
        let inner = Region::new(5..23, 7..29, 0, 0, 0);
        writer.write_region(&inner, &pattern(&inner, 1000)).await.unwrap();
        writer.close().await.unwrap();

        let reader = TiledImageReader::open(&path).await.unwrap();
        assert_eq!(reader.read_region(&inner).await.unwrap(), pattern(&inner, 1000));
        let corner = Region::new(30..40, 0..7, 0, 0, 0);
        assert_eq!(reader.read_region(&corner).await.unwrap(), pattern(&corner, 0));
    }

    #[tokio::test]
    async fn test_partial_writes_into_fresh_tiles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("halves.zvol");
        let writer = TiledImageWriter::create(&path, metadata(20, 16, 1), 2)
            .await
            .unwrap();

        // Both halves share the tiles of column 0..16
        let left = Region::new(0..10, 0..16, 0, 0, 0);
        let right = Region::new(10..20, 0..16, 0, 0, 0);
        writer.write_region(&left, &pattern(&left, 3)).await.unwrap();
        assert_eq!(writer.tiles_written(), 1);
        writer.write_region(&right, &pattern(&right, 3)).await.unwrap();
        assert_eq!(writer.tiles_written(), 2);
        writer.close().await.unwrap();

        let reader = TiledImageReader::open(&path).await.unwrap();
        let full = Region::new(0..20, 0..16, 0, 0, 0);
        assert_eq!(reader.read_region(&full).await.unwrap(), pattern(&full, 3));
    }

    #[tokio::test]
    async fn test_unwritten_tiles_read_as_zero() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sparse.zvol");
        let writer = TiledImageWriter::create(&path, metadata(32, 32, 2), 1)
            .await
            .unwrap();
        writer.close().await.unwrap();

        let reader = TiledImageReader::open(&path).await.unwrap();
        let data = reader
            .read_region(&Region::new(0..32, 0..32, 1, 0, 0))
            .await
            .unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_region_validation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bounds.zvol");
        let writer = TiledImageWriter::create(&path, metadata(16, 16, 1), 1)
            .await
            .unwrap();

        let outside = Region::new(0..17, 0..16, 0, 0, 0);
        assert!(matches!(
            writer.write_region(&outside, &[0u8; 17 * 16 * 2]).await,
            Err(StackError::OutOfBounds(_))
        ));
        let inside = Region::new(0..4, 0..4, 0, 0, 0);
        assert!(matches!(
            writer.write_region(&inside, &[0u8; 3]).await,
            Err(StackError::InvalidDimensions(_))
        ));
        writer.abort().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_abort_and_drop_leave_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gone.zvol");

        let writer = TiledImageWriter::create(&path, metadata(16, 16, 1), 1)
            .await
            .unwrap();
        let full = Region::new(0..16, 0..16, 0, 0, 0);
        writer.write_region(&full, &pattern(&full, 3)).await.unwrap();
        drop(writer);

        let entries = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn test_close_replaces_existing_output() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("again.zvol");
        let full = Region::new(0..16, 0..16, 0, 0, 0);

        for seed in [1u16, 2u16] {
            let writer = TiledImageWriter::create(&path, metadata(16, 16, 1), 1)
                .await
                .unwrap();
            writer.write_region(&full, &pattern(&full, seed)).await.unwrap();
            writer.close().await.unwrap();
        }

        let reader = TiledImageReader::open(&path).await.unwrap();
        assert_eq!(reader.read_region(&full).await.unwrap(), pattern(&full, 2));
        assert_eq!(hidden_entries(temp_dir.path()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_failed_close_keeps_previous_output() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kept.zvol");
        let full = Region::new(0..16, 0..16, 0, 0, 0);

        let first = TiledImageWriter::create(&path, metadata(16, 16, 1), 1)
            .await
            .unwrap();
        first.write_region(&full, &pattern(&full, 1)).await.unwrap();
        first.close().await.unwrap();

        let second = TiledImageWriter::create(&path, metadata(16, 16, 1), 1)
            .await
            .unwrap();
        second.write_region(&full, &pattern(&full, 2)).await.unwrap();
        // Pull the staged image away so publishing it fails
        for name in hidden_entries(temp_dir.path()) {
            std::fs::remove_dir_all(temp_dir.path().join(name)).unwrap();
        }
        assert!(second.close().await.is_err());

        let reader = TiledImageReader::open(&path).await.unwrap();
        assert_eq!(reader.read_region(&full).await.unwrap(), pattern(&full, 1));
        assert_eq!(hidden_entries(temp_dir.path()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_every_compression_method() {
        let temp_dir = TempDir::new().unwrap();
        let full = Region::new(0..20, 0..20, 0, 0, 0);

        for method in [
            CompressionMethod::None,
            CompressionMethod::Deflate,
            CompressionMethod::RLE,
            CompressionMethod::Zstd,
        ] {
            let path = temp_dir.path().join(format!("{:?}.zvol", method));
            let writer =
                TiledImageWriter::create(&path, metadata(20, 20, 1).with_compression(method), 2)
                    .await
                    .unwrap();
            writer.write_region(&full, &pattern(&full, 9)).await.unwrap();
            writer.close().await.unwrap();

            let reader = TiledImageReader::open(&path).await.unwrap();
            assert_eq!(reader.metadata().compression, method);
            assert_eq!(reader.read_region(&full).await.unwrap(), pattern(&full, 9));
        }
    }

    #[tokio::test]
    async fn test_open_rejects_plain_directory() {
        let temp_dir = TempDir::new().unwrap();
        let plain = temp_dir.path().join("not_an_image");
        std::fs::create_dir_all(&plain).unwrap();

        match TiledImageReader::open(&plain).await {
            Err(StackError::InvalidFormat(message)) => {
                assert!(message.contains("metadata.json"))
            }
            other => panic!("expected invalid format, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_corrupt_tile_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corrupt.zvol");
        let full = Region::new(0..16, 0..16, 0, 0, 0);
        let writer = TiledImageWriter::create(&path, metadata(16, 16, 1), 1)
            .await
            .unwrap();
        writer.write_region(&full, &pattern(&full, 5)).await.unwrap();
        writer.close().await.unwrap();

        std::fs::write(path.join(tile_path(0, 0, 0, 0, 0)), b"garbage").unwrap();
        let reader = TiledImageReader::open(&path).await.unwrap();
        assert!(reader.read_region(&full).await.is_err());
    }
}
