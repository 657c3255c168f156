//! Core data types shared by the access and paging layers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of logical dimensions a volume can have
pub const DIMENSIONALITY_MAX: usize = 6;

/// Voxel formats supported for volume channels and request delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VoxelFormat {
    /// 1-bit boolean, stored as whole bytes
    U1 = 0,
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// 32-bit floating point
    R32 = 5,
    /// 64-bit floating point
    R64 = 6,
}

impl VoxelFormat {
    /// Size in bytes of one voxel element in this format
    pub fn size_in_bytes(&self) -> usize {
        match self {
            VoxelFormat::U1 | VoxelFormat::U8 => 1,
            VoxelFormat::U16 => 2,
            VoxelFormat::U32 | VoxelFormat::R32 => 4,
            VoxelFormat::U64 | VoxelFormat::R64 => 8,
        }
    }

    /// Check if this is a floating point format
    pub fn is_float(&self) -> bool {
        matches!(self, VoxelFormat::R32 | VoxelFormat::R64)
    }
}

impl fmt::Display for VoxelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Interpolation kernels used by sample, trace and projected requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterpolationMethod {
    /// Snap to the containing voxel
    Nearest,
    /// Separable multi-linear interpolation
    Linear,
    /// Separable Catmull-Rom cubic interpolation
    Cubic,
}

/// Access modes for page accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Pages are fetched from the store and may not be written
    ReadOnly,
    /// Existing pages are fetched and may be modified
    ReadWrite,
    /// Pages start out zero-initialized and may be written
    Create,
}

impl AccessMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

macro_rules! dimensions_nd {
    ($($name:ident => [$($dim:expr),+]),+ $(,)?) => {
        /// Named groups of the up-to-6 logical axes a request or accessor
        /// operates over. The 3D groups cover every axis triple, the 2D
        /// groups every axis pair.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum DimensionsND {
            $($name),+
        }

        impl DimensionsND {
            /// The axis indices in this group, in ascending order
            pub fn dimensions(&self) -> &'static [usize] {
                match self {
                    $(DimensionsND::$name => &[$($dim),+]),+
                }
            }
        }
    };
}

dimensions_nd! {
    Dimensions012 => [0, 1, 2],
    Dimensions013 => [0, 1, 3],
    Dimensions014 => [0, 1, 4],
    Dimensions015 => [0, 1, 5],
    Dimensions023 => [0, 2, 3],
    Dimensions024 => [0, 2, 4],
    Dimensions025 => [0, 2, 5],
    Dimensions034 => [0, 3, 4],
    Dimensions035 => [0, 3, 5],
    Dimensions045 => [0, 4, 5],
    Dimensions123 => [1, 2, 3],
    Dimensions124 => [1, 2, 4],
    Dimensions125 => [1, 2, 5],
    Dimensions134 => [1, 3, 4],
    Dimensions135 => [1, 3, 5],
    Dimensions145 => [1, 4, 5],
    Dimensions234 => [2, 3, 4],
    Dimensions235 => [2, 3, 5],
    Dimensions245 => [2, 4, 5],
    Dimensions345 => [3, 4, 5],
    Dimensions01 => [0, 1],
    Dimensions02 => [0, 2],
    Dimensions03 => [0, 3],
    Dimensions04 => [0, 4],
    Dimensions05 => [0, 5],
    Dimensions12 => [1, 2],
    Dimensions13 => [1, 3],
    Dimensions14 => [1, 4],
    Dimensions15 => [1, 5],
    Dimensions23 => [2, 3],
    Dimensions24 => [2, 4],
    Dimensions25 => [2, 5],
    Dimensions34 => [3, 4],
    Dimensions35 => [3, 5],
    Dimensions45 => [4, 5],
}

impl DimensionsND {
    /// Number of axes in this group
    pub fn dimensionality(&self) -> usize {
        self.dimensions().len()
    }

    /// Whether the given axis index belongs to this group
    pub fn contains(&self, dimension: usize) -> bool {
        self.dimensions().contains(&dimension)
    }

    /// Short name used in store object identifiers, e.g. "012"
    pub fn short_name(&self) -> String {
        self.dimensions()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("")
    }
}

impl fmt::Display for DimensionsND {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dimensions_{}", self.short_name())
    }
}

/// Axis descriptor with name, unit, and coordinate information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisDescriptor {
    /// Number of samples along this axis
    pub num_samples: usize,
    /// Name of the axis (e.g., "Inline", "Crossline", "Depth")
    pub name: String,
    /// Unit of measurement (e.g., "m", "ms", "ft")
    pub unit: String,
    /// Coordinate minimum
    pub coord_min: f64,
    /// Coordinate maximum
    pub coord_max: f64,
}

impl AxisDescriptor {
    pub fn new(
        num_samples: usize,
        name: impl Into<String>,
        unit: impl Into<String>,
        coord_min: f64,
        coord_max: f64,
    ) -> Self {
        Self {
            num_samples,
            name: name.into(),
            unit: unit.into(),
            coord_min,
            coord_max,
        }
    }

    /// Get the step size between samples
    pub fn step_size(&self) -> f64 {
        if self.num_samples <= 1 {
            0.0
        } else {
            (self.coord_max - self.coord_min) / (self.num_samples - 1) as f64
        }
    }

    /// Convert sample index to coordinate
    pub fn index_to_coord(&self, index: usize) -> f64 {
        self.coord_min + index as f64 * self.step_size()
    }

    /// Convert coordinate to sample index (nearest)
    pub fn coord_to_index(&self, coord: f64) -> usize {
        let step = self.step_size();
        if step == 0.0 {
            return 0;
        }
        let normalized = (coord - self.coord_min) / step;
        normalized
            .round()
            .max(0.0)
            .min((self.num_samples - 1) as f64) as usize
    }
}

/// Value range for a channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// Describes one data channel of a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Voxel format the channel is stored in
    pub format: VoxelFormat,
    /// Number of vector components per voxel (1 for scalar channels)
    pub components: usize,
    /// Channel name (e.g., "Amplitude")
    pub name: String,
    /// Unit of the channel values
    pub unit: String,
    /// Range the channel values fall in
    pub value_range: ValueRange,
    /// Sentinel marking absent samples, when the channel uses one
    pub no_value: Option<f32>,
}

impl ChannelDescriptor {
    pub fn new(
        format: VoxelFormat,
        name: impl Into<String>,
        unit: impl Into<String>,
        value_range: ValueRange,
    ) -> Self {
        Self {
            format,
            components: 1,
            name: name.into(),
            unit: unit.into(),
            value_range,
            no_value: None,
        }
    }

    /// Set the number of vector components per voxel
    pub fn with_components(mut self, components: usize) -> Self {
        self.components = components;
        self
    }

    /// Mark a sentinel value as "no value" for this channel
    pub fn with_no_value(mut self, no_value: f32) -> Self {
        self.no_value = Some(no_value);
        self
    }

    /// Size in bytes of one full voxel (all components)
    pub fn voxel_size_in_bytes(&self) -> usize {
        self.format.size_in_bytes() * self.components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voxel_format_sizes() {
        assert_eq!(VoxelFormat::U1.size_in_bytes(), 1);
        assert_eq!(VoxelFormat::U8.size_in_bytes(), 1);
        assert_eq!(VoxelFormat::U16.size_in_bytes(), 2);
        assert_eq!(VoxelFormat::U32.size_in_bytes(), 4);
        assert_eq!(VoxelFormat::R32.size_in_bytes(), 4);
        assert_eq!(VoxelFormat::U64.size_in_bytes(), 8);
        assert_eq!(VoxelFormat::R64.size_in_bytes(), 8);
    }

    #[test]
    fn test_dimensions_nd() {
        assert_eq!(DimensionsND::Dimensions012.dimensions(), &[0, 1, 2]);
        assert_eq!(DimensionsND::Dimensions012.dimensionality(), 3);
        assert_eq!(DimensionsND::Dimensions45.dimensions(), &[4, 5]);
        assert_eq!(DimensionsND::Dimensions45.dimensionality(), 2);
        assert!(DimensionsND::Dimensions025.contains(5));
        assert!(!DimensionsND::Dimensions025.contains(1));
        assert_eq!(DimensionsND::Dimensions134.short_name(), "134");
    }

    #[test]
    fn test_axis_descriptor() {
        let axis = AxisDescriptor::new(101, "Depth", "m", 0.0, 1000.0);
        assert_eq!(axis.step_size(), 10.0);
        assert_eq!(axis.index_to_coord(0), 0.0);
        assert_eq!(axis.index_to_coord(100), 1000.0);
        assert_eq!(axis.coord_to_index(500.0), 50);
    }

    #[test]
    fn test_channel_descriptor() {
        let channel = ChannelDescriptor::new(
            VoxelFormat::R32,
            "Amplitude",
            "",
            ValueRange::new(-1.0, 1.0),
        )
        .with_no_value(-999.25);
        assert_eq!(channel.components, 1);
        assert_eq!(channel.voxel_size_in_bytes(), 4);
        assert_eq!(channel.no_value, Some(-999.25));
    }
}
