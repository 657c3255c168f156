//! Request geometry - range normalization, validation and buffer sizing.
//!
//! Everything here is pure; the access manager runs these checks before any
//! asynchronous work is dispatched.

use crate::error::{Result, VdsError};
use crate::layout::ChunkLayout;
use crate::types::{DimensionsND, VoxelFormat, DIMENSIONALITY_MAX};

/// A request shape: inclusive minimum and exclusive maximum voxel
/// coordinates, always padded to 6 components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelRange {
    pub min: [i32; DIMENSIONALITY_MAX],
    pub max: [i32; DIMENSIONALITY_MAX],
}

impl VoxelRange {
    /// Pad variable-length min/max tuples to 6 components. Unused trailing
    /// dimensions default to [0, 1).
    pub fn normalize(min: &[i32], max: &[i32]) -> Self {
        let mut padded_min = [0i32; DIMENSIONALITY_MAX];
        let mut padded_max = [1i32; DIMENSIONALITY_MAX];
        for (dst, &src) in padded_min.iter_mut().zip(min.iter()) {
            *dst = src;
        }
        for (dst, &src) in padded_max.iter_mut().zip(max.iter()) {
            *dst = src;
        }
        Self {
            min: padded_min,
            max: padded_max,
        }
    }

    /// Extent along one dimension
    pub fn size(&self, dim: usize) -> usize {
        (self.max[dim] - self.min[dim]).max(0) as usize
    }

    /// Total number of voxels covered
    pub fn num_voxels(&self) -> usize {
        (0..DIMENSIONALITY_MAX).map(|dim| self.size(dim)).product()
    }

    /// Extents of the real dimensions, in dimension order
    pub fn shape(&self, dimensionality: usize) -> Vec<usize> {
        (0..dimensionality).map(|dim| self.size(dim)).collect()
    }
}

/// Validate a range against a layer's chunk grid: every dimension must be
/// non-empty and inside the LOD-scaled sample counts.
pub fn validate_range(chunks: &ChunkLayout, range: &VoxelRange) -> Result<()> {
    for dim in 0..DIMENSIONALITY_MAX {
        if range.min[dim] < 0 {
            return Err(VdsError::OutOfBounds(format!(
                "min[{}] = {} is negative",
                dim, range.min[dim]
            )));
        }
        if range.min[dim] >= range.max[dim] {
            return Err(VdsError::InvalidRange(format!(
                "empty range in dimension {}: min {} >= max {}",
                dim, range.min[dim], range.max[dim]
            )));
        }
        let samples = chunks.num_samples(dim) as i32;
        if range.max[dim] > samples {
            return Err(VdsError::OutOfBounds(format!(
                "max[{}] = {} exceeds {} samples",
                dim, range.max[dim], samples
            )));
        }
    }
    Ok(())
}

/// Exact destination buffer size in bytes for a subset request
pub fn subset_buffer_size(range: &VoxelRange, format: VoxelFormat, components: usize) -> usize {
    range.num_voxels() * format.size_in_bytes() * components
}

/// Exact destination buffer size in bytes for a projected subset request:
/// the 2D shape spanned by the projected dimension pair.
pub fn projected_subset_buffer_size(
    range: &VoxelRange,
    projected: DimensionsND,
    format: VoxelFormat,
    components: usize,
) -> Result<usize> {
    let dims = projected.dimensions();
    if dims.len() != 2 {
        return Err(VdsError::InvalidDimensions(format!(
            "projected dimension group {} is not a pair",
            projected
        )));
    }
    Ok(range.size(dims[0]) * range.size(dims[1]) * format.size_in_bytes() * components)
}

/// Buffer size for a sample request: one f32 per position
pub fn samples_buffer_size(sample_count: usize) -> usize {
    sample_count * VoxelFormat::R32.size_in_bytes()
}

/// Buffer size for a trace request: one full trace of f32 per position
pub fn traces_buffer_size(chunks: &ChunkLayout, trace_count: usize, trace_dimension: usize) -> usize {
    trace_count * chunks.num_samples(trace_dimension) * VoxelFormat::R32.size_in_bytes()
}

/// Iterate every voxel position in a box (min inclusive, max exclusive).
/// Dimension 0 varies slowest, dimension 5 fastest, matching the linear
/// buffer order used throughout.
pub(crate) fn for_each_voxel<F>(
    min: &[i32; DIMENSIONALITY_MAX],
    max: &[i32; DIMENSIONALITY_MAX],
    mut f: F,
) where
    F: FnMut(&[i32; DIMENSIONALITY_MAX]),
{
    for dim in 0..DIMENSIONALITY_MAX {
        if min[dim] >= max[dim] {
            return;
        }
    }
    let mut pos = *min;
    loop {
        f(&pos);
        let mut dim = DIMENSIONALITY_MAX - 1;
        loop {
            pos[dim] += 1;
            if pos[dim] < max[dim] {
                break;
            }
            pos[dim] = min[dim];
            if dim == 0 {
                return;
            }
            dim -= 1;
        }
    }
}

/// Linear element index of `pos` inside the box spanned by min/max
pub(crate) fn linear_index(
    pos: &[i32; DIMENSIONALITY_MAX],
    min: &[i32; DIMENSIONALITY_MAX],
    max: &[i32; DIMENSIONALITY_MAX],
) -> usize {
    let mut index = 0usize;
    for dim in 0..DIMENSIONALITY_MAX {
        let extent = (max[dim] - min[dim]) as usize;
        index = index * extent + (pos[dim] - min[dim]) as usize;
    }
    index
}

/// Intersection of two boxes; None when they do not overlap
pub(crate) fn intersect(
    a_min: &[i32; DIMENSIONALITY_MAX],
    a_max: &[i32; DIMENSIONALITY_MAX],
    b_min: &[i32; DIMENSIONALITY_MAX],
    b_max: &[i32; DIMENSIONALITY_MAX],
) -> Option<([i32; DIMENSIONALITY_MAX], [i32; DIMENSIONALITY_MAX])> {
    let mut min = [0i32; DIMENSIONALITY_MAX];
    let mut max = [0i32; DIMENSIONALITY_MAX];
    for dim in 0..DIMENSIONALITY_MAX {
        min[dim] = a_min[dim].max(b_min[dim]);
        max[dim] = a_max[dim].min(b_max[dim]);
        if min[dim] >= max[dim] {
            return None;
        }
    }
    Some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BrickSize, VolumeLayout};
    use crate::types::{AxisDescriptor, ChannelDescriptor, ValueRange};

    fn test_chunks() -> ChunkLayout {
        let axes = vec![
            AxisDescriptor::new(300, "Inline", "trace", 0.0, 299.0),
            AxisDescriptor::new(200, "Crossline", "trace", 0.0, 199.0),
            AxisDescriptor::new(100, "Depth", "ms", 0.0, 400.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            VoxelFormat::R32,
            "Amplitude",
            "",
            ValueRange::new(-1.0, 1.0),
        )];
        let layout = VolumeLayout::new(axes, channels)
            .unwrap()
            .with_brick_size(BrickSize::new([64, 64, 64, 1, 1, 1]));
        ChunkLayout::new(&layout, DimensionsND::Dimensions012, 0).unwrap()
    }

    #[test]
    fn test_normalize_pads_to_six() {
        let range = VoxelRange::normalize(&[10, 20], &[30, 40]);
        assert_eq!(range.min, [10, 20, 0, 0, 0, 0]);
        assert_eq!(range.max, [30, 40, 1, 1, 1, 1]);
        assert_eq!(range.num_voxels(), 20 * 20);
    }

    #[test]
    fn test_validate_rejects_empty_and_out_of_bounds() {
        let chunks = test_chunks();

        let ok = VoxelRange::normalize(&[0, 0, 0], &[300, 200, 100]);
        assert!(validate_range(&chunks, &ok).is_ok());

        let empty = VoxelRange::normalize(&[10, 0, 0], &[10, 200, 100]);
        assert!(matches!(
            validate_range(&chunks, &empty),
            Err(VdsError::InvalidRange(_))
        ));

        let inverted = VoxelRange::normalize(&[20, 0, 0], &[10, 200, 100]);
        assert!(validate_range(&chunks, &inverted).is_err());

        let oob = VoxelRange::normalize(&[0, 0, 0], &[301, 200, 100]);
        assert!(matches!(
            validate_range(&chunks, &oob),
            Err(VdsError::OutOfBounds(_))
        ));

        let negative = VoxelRange::normalize(&[-1, 0, 0], &[10, 200, 100]);
        assert!(validate_range(&chunks, &negative).is_err());
    }

    #[test]
    fn test_subset_buffer_size() {
        let range = VoxelRange::normalize(&[0, 0, 0], &[300, 200, 100]);
        assert_eq!(
            subset_buffer_size(&range, VoxelFormat::U8, 1),
            300 * 200 * 100
        );
        assert_eq!(
            subset_buffer_size(&range, VoxelFormat::R32, 1),
            300 * 200 * 100 * 4
        );
        assert_eq!(
            subset_buffer_size(&range, VoxelFormat::R32, 2),
            300 * 200 * 100 * 4 * 2
        );
    }

    #[test]
    fn test_projected_buffer_size() {
        let range = VoxelRange::normalize(&[0, 0, 0], &[300, 200, 100]);
        let size =
            projected_subset_buffer_size(&range, DimensionsND::Dimensions12, VoxelFormat::R32, 1)
                .unwrap();
        assert_eq!(size, 200 * 100 * 4);

        assert!(projected_subset_buffer_size(
            &range,
            DimensionsND::Dimensions012,
            VoxelFormat::R32,
            1
        )
        .is_err());
    }

    #[test]
    fn test_trace_and_sample_sizes() {
        let chunks = test_chunks();
        assert_eq!(samples_buffer_size(7), 28);
        assert_eq!(traces_buffer_size(&chunks, 3, 2), 3 * 100 * 4);
    }

    #[test]
    fn test_voxel_iteration_order() {
        let min = [0, 0, 0, 0, 0, 0];
        let max = [2, 1, 3, 1, 1, 1];
        let mut seen = Vec::new();
        for_each_voxel(&min, &max, |pos| {
            seen.push((pos[0], pos[2]));
        });
        assert_eq!(
            seen,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
        for (i, pos) in [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
            .iter()
            .enumerate()
        {
            let p = [pos.0, 0, pos.1, 0, 0, 0];
            assert_eq!(linear_index(&p, &min, &max), i);
        }
    }

    #[test]
    fn test_intersect() {
        let a_min = [0, 0, 0, 0, 0, 0];
        let a_max = [10, 10, 10, 1, 1, 1];
        let b_min = [5, 5, 5, 0, 0, 0];
        let b_max = [20, 20, 20, 1, 1, 1];
        let (min, max) = intersect(&a_min, &a_max, &b_min, &b_max).unwrap();
        assert_eq!(&min[..3], &[5, 5, 5]);
        assert_eq!(&max[..3], &[10, 10, 10]);

        let c_min = [10, 0, 0, 0, 0, 0];
        let c_max = [20, 10, 10, 1, 1, 1];
        assert!(intersect(&a_min, &a_max, &c_min, &c_max).is_none());
    }
}
