//! Physical calibration: length units, per-axis physical sizes, and recovery
//! of a missing z spacing from the x/y spacing.

use crate::error::{Result, StackError};
use crate::metadata::ImageMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length units understood by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LengthUnit {
    Meter,
    Centimeter,
    Millimeter,
    Micrometer,
    Nanometer,
    Angstrom,
}

impl LengthUnit {
    /// Size of one unit expressed in nanometers
    pub fn base_factor(&self) -> f64 {
        match self {
            LengthUnit::Meter => 1e9,
            LengthUnit::Centimeter => 1e7,
            LengthUnit::Millimeter => 1e6,
            LengthUnit::Micrometer => 1e3,
            LengthUnit::Nanometer => 1.0,
            LengthUnit::Angstrom => 1e-1,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            LengthUnit::Meter => "m",
            LengthUnit::Centimeter => "cm",
            LengthUnit::Millimeter => "mm",
            LengthUnit::Micrometer => "µm",
            LengthUnit::Nanometer => "nm",
            LengthUnit::Angstrom => "Å",
        }
    }
}

impl FromStr for LengthUnit {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "m" => Ok(LengthUnit::Meter),
            "cm" => Ok(LengthUnit::Centimeter),
            "mm" => Ok(LengthUnit::Millimeter),
            // micro sign and greek mu are distinct code points
            "µm" | "μm" | "um" => Ok(LengthUnit::Micrometer),
            "nm" => Ok(LengthUnit::Nanometer),
            "Å" | "A" => Ok(LengthUnit::Angstrom),
            other => Err(StackError::Metadata(format!("Unknown length unit: {}", other))),
        }
    }
}

impl TryFrom<String> for LengthUnit {
    type Error = StackError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LengthUnit> for String {
    fn from(unit: LengthUnit) -> Self {
        unit.symbol().to_string()
    }
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Real-world size of one sample step along an axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalSize {
    pub value: f64,
    pub unit: LengthUnit,
}

impl PhysicalSize {
    pub fn new(value: f64, unit: LengthUnit) -> Self {
        Self { value, unit }
    }

    /// Value expressed in nanometers
    pub fn in_base_units(&self) -> f64 {
        self.value * self.unit.base_factor()
    }

    /// Re-express the same length in another unit
    pub fn to_unit(&self, unit: LengthUnit) -> Self {
        Self::new(self.in_base_units() / unit.base_factor(), unit)
    }
}

impl fmt::Display for PhysicalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Physical sizes of the three spatial axes; any of them may be undefined
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhysicalSizes {
    pub x: Option<PhysicalSize>,
    pub y: Option<PhysicalSize>,
    pub z: Option<PhysicalSize>,
}

impl PhysicalSizes {
    pub fn new(
        x: Option<PhysicalSize>,
        y: Option<PhysicalSize>,
        z: Option<PhysicalSize>,
    ) -> Self {
        Self { x, y, z }
    }
}

/// Outcome of resolving the z spacing of an output volume
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZCalibration {
    /// The source already carried a z spacing
    Native(PhysicalSize),
    /// Derived from the x/y spacing because z was missing
    Derived(PhysicalSize),
    /// Neither z nor x/y spacing is known; the output has no z calibration
    Undefined,
}

impl ZCalibration {
    pub fn size(&self) -> Option<PhysicalSize> {
        match self {
            ZCalibration::Native(size) | ZCalibration::Derived(size) => Some(*size),
            ZCalibration::Undefined => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        !matches!(self, ZCalibration::Native(_))
    }
}

/// Average two lengths and express the result in the coarser of their units.
///
/// Equal units are kept as-is. When the units differ the one with the larger
/// base factor wins, so µm and mm resolve to mm.
pub fn average_spacing(x: PhysicalSize, y: PhysicalSize) -> PhysicalSize {
    let mean = (x.in_base_units() + y.in_base_units()) / 2.0;
    let unit = if x.unit == y.unit {
        x.unit
    } else if x.unit.base_factor() > y.unit.base_factor() {
        x.unit
    } else {
        y.unit
    };
    PhysicalSize::new(mean, LengthUnit::Nanometer).to_unit(unit)
}

/// Resolve the z spacing for a volume stacked from slices described by `metadata`.
pub fn reconcile_z(metadata: &ImageMetadata) -> ZCalibration {
    let sizes = &metadata.physical_size;
    if let Some(z) = sizes.z {
        return ZCalibration::Native(z);
    }

    let derived = match (sizes.x, sizes.y) {
        (Some(x), Some(y)) => average_spacing(x, y),
        (Some(only), None) | (None, Some(only)) => only,
        (None, None) => {
            tracing::warn!(
                "Could not find physical z-size, and x/y sizes are undefined. \
                 The output will carry no z calibration."
            );
            return ZCalibration::Undefined;
        }
    };

    tracing::warn!(
        z = %derived,
        "Could not find physical z-size. Using the average of x & y"
    );
    ZCalibration::Derived(derived)
}
