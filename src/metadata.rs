//! Tiled image metadata structures

use crate::calibration::{PhysicalSize, PhysicalSizes};
use crate::compression::CompressionMethod;
use crate::error::{Result, StackError};
use crate::layout::TileSize;
use crate::types::{DataType, ImageShape};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Container format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Complete metadata for a tiled image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Format version
    pub version: FormatVersion,

    /// Extents along x, y, z, channel and timepoint
    pub shape: ImageShape,

    /// Sample type
    pub data_type: DataType,

    /// Physical spacing per spatial axis
    pub physical_size: PhysicalSizes,

    /// Storage tile size
    pub tile_size: TileSize,

    /// Compression method used for tiles
    pub compression: CompressionMethod,

    /// Creation timestamp, carried over to derived images
    pub created_at: DateTime<Utc>,

    /// Custom metadata key-value pairs
    pub custom_metadata: BTreeMap<String, String>,
}

impl ImageMetadata {
    /// Create new metadata
    pub fn new(shape: ImageShape, data_type: DataType) -> Self {
        Self {
            version: FormatVersion::default(),
            shape,
            data_type,
            physical_size: PhysicalSizes::default(),
            tile_size: TileSize::default(),
            compression: CompressionMethod::Zstd,
            created_at: Utc::now(),
            custom_metadata: BTreeMap::new(),
        }
    }

    /// Set the physical sizes
    pub fn with_physical_size(mut self, sizes: PhysicalSizes) -> Self {
        self.physical_size = sizes;
        self
    }

    /// Set the tile size
    pub fn with_tile_size(mut self, tile_size: TileSize) -> Self {
        self.tile_size = tile_size;
        self
    }

    /// Set compression method
    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    /// Metadata for a volume stacked from slices described by `self`
    pub fn stacked(&self, z: usize, z_size: Option<PhysicalSize>) -> Self {
        let mut stacked = self.clone();
        stacked.shape.z = z;
        stacked.physical_size.z = z_size;
        stacked
    }

    /// Size in bytes of one full x-y plane
    pub fn plane_bytes(&self) -> usize {
        self.shape.plane_samples() * self.data_type.size_in_bytes()
    }

    /// Check structural validity
    pub fn validate(&self) -> Result<()> {
        if !self.version.is_compatible(&FormatVersion::CURRENT) {
            return Err(StackError::Metadata(format!(
                "Unsupported format version {}.{}",
                self.version.major, self.version.minor
            )));
        }
        if self.shape.is_empty() {
            return Err(StackError::InvalidDimensions(format!(
                "Image shape must be non-empty, got {}",
                self.shape
            )));
        }
        if self.tile_size.x == 0 || self.tile_size.y == 0 {
            return Err(StackError::InvalidDimensions(
                "Tile size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Ensure `other` can be stacked onto `self` along z.
    ///
    /// Everything except the z extent and calibration must agree.
    pub fn check_stackable(&self, other: &ImageMetadata, file: &Path) -> Result<()> {
        let checks: [(&'static str, String, String); 5] = [
            ("x", self.shape.x.to_string(), other.shape.x.to_string()),
            ("y", self.shape.y.to_string(), other.shape.y.to_string()),
            ("channel", self.shape.c.to_string(), other.shape.c.to_string()),
            ("timepoint", self.shape.t.to_string(), other.shape.t.to_string()),
            ("data type", self.data_type.to_string(), other.data_type.to_string()),
        ];

        for (field, expected, found) in checks {
            if expected != found {
                return Err(StackError::MetadataInconsistency {
                    file: file.to_path_buf(),
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::LengthUnit;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = FormatVersion::CURRENT;
        let v1_1 = FormatVersion { major: 1, minor: 1 };
        let v2_0 = FormatVersion { major: 2, minor: 0 };

        assert!(v1_0.is_compatible(&v1_1));
        assert!(!v1_0.is_compatible(&v2_0));
    }

    #[test]
    fn test_stacked_keeps_everything_but_z() {
        let mut base = ImageMetadata::new(ImageShape::new(64, 32, 1, 2, 1), DataType::U16)
            .with_physical_size(PhysicalSizes::new(
                Some(PhysicalSize::new(0.5, LengthUnit::Micrometer)),
                Some(PhysicalSize::new(0.5, LengthUnit::Micrometer)),
                None,
            ));
        base.custom_metadata
            .insert("instrument".to_string(), "confocal".to_string());

        let z = PhysicalSize::new(0.5, LengthUnit::Micrometer);
        let stacked = base.stacked(6, Some(z));
        assert_eq!(stacked.shape, ImageShape::new(64, 32, 6, 2, 1));
        assert_eq!(stacked.physical_size.z, Some(z));
        assert_eq!(stacked.physical_size.x, base.physical_size.x);
        assert_eq!(
            stacked.custom_metadata.get("instrument").map(String::as_str),
            Some("confocal")
        );
        assert_eq!(stacked.created_at, base.created_at);
    }

    #[test]
    fn test_check_stackable() {
        let a = ImageMetadata::new(ImageShape::xyz(64, 32, 1), DataType::U8);
        let b = ImageMetadata::new(ImageShape::xyz(64, 32, 4), DataType::U8);
        assert!(a.check_stackable(&b, Path::new("b")).is_ok());

        let wide = ImageMetadata::new(ImageShape::xyz(65, 32, 1), DataType::U8);
        match a.check_stackable(&wide, Path::new("wide")) {
            Err(StackError::MetadataInconsistency { field, expected, found, .. }) => {
                assert_eq!(field, "x");
                assert_eq!(expected, "64");
                assert_eq!(found, "65");
            }
            other => panic!("expected inconsistency, got {:?}", other),
        }

        let typed = ImageMetadata::new(ImageShape::xyz(64, 32, 1), DataType::F32);
        assert!(a.check_stackable(&typed, Path::new("typed")).is_err());
    }

    #[test]
    fn test_validate() {
        let ok = ImageMetadata::new(ImageShape::xyz(4, 4, 1), DataType::U8);
        assert!(ok.validate().is_ok());
        let empty = ImageMetadata::new(ImageShape::xyz(4, 0, 1), DataType::U8);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let metadata = ImageMetadata::new(ImageShape::xyz(4, 4, 2), DataType::F32);
        let json = serde_json::to_vec_pretty(&metadata).unwrap();
        let back: ImageMetadata = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
