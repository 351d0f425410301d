//! Core data types for tiled images

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample types a tiled image can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of one sample
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Extents of a five-dimensional image (x, y, z, channel, timepoint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub c: usize,
    pub t: usize,
}

impl ImageShape {
    pub fn new(x: usize, y: usize, z: usize, c: usize, t: usize) -> Self {
        Self { x, y, z, c, t }
    }

    /// A single-channel, single-timepoint shape
    pub fn xyz(x: usize, y: usize, z: usize) -> Self {
        Self::new(x, y, z, 1, 1)
    }

    /// Number of samples in one x-y plane
    pub fn plane_samples(&self) -> usize {
        self.x * self.y
    }

    pub fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0 || self.c == 0 || self.t == 0
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} (c={}, t={})",
            self.x, self.y, self.z, self.c, self.t
        )
    }
}

/// A rectangular x-y window of one plane, addressed by (z, c, t)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: std::ops::Range<usize>,
    pub y: std::ops::Range<usize>,
    pub z: usize,
    pub c: usize,
    pub t: usize,
}

impl Region {
    pub fn new(
        x: std::ops::Range<usize>,
        y: std::ops::Range<usize>,
        z: usize,
        c: usize,
        t: usize,
    ) -> Self {
        Self { x, y, z, c, t }
    }

    pub fn width(&self) -> usize {
        self.x.end.saturating_sub(self.x.start)
    }

    pub fn height(&self) -> usize {
        self.y.end.saturating_sub(self.y.start)
    }

    /// Number of samples covered by the window
    pub fn samples(&self) -> usize {
        self.width() * self.height()
    }

    /// Check the window against an image shape
    pub fn fits(&self, shape: &ImageShape) -> bool {
        self.x.start < self.x.end
            && self.y.start < self.y.end
            && self.x.end <= shape.x
            && self.y.end <= shape.y
            && self.z < shape.z
            && self.c < shape.c
            && self.t < shape.t
    }
}
