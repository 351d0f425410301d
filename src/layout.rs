//! Plane layout - how an x-y plane is divided into storage tiles and copy chunks

use crate::error::{Result, StackError};
use crate::types::Region;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Default edge length of a copy chunk
pub const DEFAULT_CHUNK_EDGE: usize = 8192;

/// Size of a storage tile in x and y
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSize {
    pub x: usize,
    pub y: usize,
}

impl TileSize {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    pub fn square(edge: usize) -> Self {
        Self::new(edge, edge)
    }
}

impl Default for TileSize {
    fn default() -> Self {
        Self::square(1024)
    }
}

/// Split `[0, extent)` into consecutive windows of at most `edge`.
pub fn axis_windows(extent: usize, edge: usize) -> impl Iterator<Item = Range<usize>> {
    debug_assert!(edge > 0);
    (0..extent)
        .step_by(edge.max(1))
        .map(move |start| start..(start + edge).min(extent))
}

/// Tile grid of one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub width: usize,
    pub height: usize,
    pub tile_size: TileSize,
}

impl TileGrid {
    pub fn new(width: usize, height: usize, tile_size: TileSize) -> Self {
        Self {
            width,
            height,
            tile_size,
        }
    }

    /// Sample range covered by tile `(tx, ty)`, trimmed at the plane edge
    pub fn tile_range(&self, tx: usize, ty: usize) -> (Range<usize>, Range<usize>) {
        let x0 = tx * self.tile_size.x;
        let y0 = ty * self.tile_size.y;
        (
            x0..(x0 + self.tile_size.x).min(self.width),
            y0..(y0 + self.tile_size.y).min(self.height),
        )
    }

    /// Tiles that intersect a region, row-major
    pub fn overlapping_tiles(&self, region: &Region) -> Vec<(usize, usize)> {
        if region.width() == 0 || region.height() == 0 {
            return Vec::new();
        }
        let tx0 = region.x.start / self.tile_size.x;
        let tx1 = (region.x.end - 1) / self.tile_size.x;
        let ty0 = region.y.start / self.tile_size.y;
        let ty1 = (region.y.end - 1) / self.tile_size.y;

        let mut tiles = Vec::with_capacity((tx1 - tx0 + 1) * (ty1 - ty0 + 1));
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                tiles.push((tx, ty));
            }
        }
        tiles
    }
}

/// Rectangular x-y window moved by a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub x: Range<usize>,
    pub y: Range<usize>,
}

impl Chunk {
    pub fn samples(&self) -> usize {
        self.x.len() * self.y.len()
    }

    /// Region addressing this chunk on plane `(z, c, t)`
    pub fn region(&self, z: usize, c: usize, t: usize) -> Region {
        Region::new(self.x.clone(), self.y.clone(), z, c, t)
    }
}

/// Fixed grid of copy chunks covering a plane exactly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrid {
    width: usize,
    height: usize,
    max_edge: usize,
}

impl ChunkGrid {
    pub fn new(width: usize, height: usize, max_edge: usize) -> Result<Self> {
        if max_edge == 0 {
            return Err(StackError::Configuration(
                "Chunk edge must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            width,
            height,
            max_edge,
        })
    }

    pub fn max_edge(&self) -> usize {
        self.max_edge
    }

    /// Number of chunks in the grid
    pub fn len(&self) -> usize {
        self.width.div_ceil(self.max_edge) * self.height.div_ceil(self.max_edge)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks in x-major order (columns of chunks, each walked down y)
    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        axis_windows(self.width, self.max_edge).flat_map(move |x| {
            axis_windows(self.height, self.max_edge).map(move |y| Chunk { x: x.clone(), y })
        })
    }

    /// Largest number of bytes a single chunk transfer holds
    pub fn max_chunk_bytes(&self, sample_bytes: usize) -> usize {
        self.max_edge.min(self.width) * self.max_edge.min(self.height) * sample_bytes
    }
}
