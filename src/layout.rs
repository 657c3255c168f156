//! Volume layout - dataset geometry and the derived per-layer chunking

use crate::error::{Result, VdsError};
use crate::types::{
    AxisDescriptor, ChannelDescriptor, DimensionsND, DIMENSIONALITY_MAX,
};
use serde::{Deserialize, Serialize};

/// Size of a chunk (brick) in each dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickSize {
    dims: [usize; DIMENSIONALITY_MAX],
}

impl BrickSize {
    pub fn new(dims: [usize; DIMENSIONALITY_MAX]) -> Self {
        Self { dims }
    }

    /// Create a brick size of `size` along the first `dimensionality` axes
    pub fn with_dimensionality(dimensionality: usize, size: usize) -> Result<Self> {
        if dimensionality == 0 || dimensionality > DIMENSIONALITY_MAX {
            return Err(VdsError::InvalidDimensions(
                "dimensionality must be between 1 and 6".to_string(),
            ));
        }

        let mut dims = [1; DIMENSIONALITY_MAX];
        for item in dims.iter_mut().take(dimensionality) {
            *item = size;
        }
        Ok(Self { dims })
    }

    /// Get the size for a specific dimension
    pub fn get(&self, dim: usize) -> usize {
        if dim < DIMENSIONALITY_MAX {
            self.dims[dim]
        } else {
            1
        }
    }

    pub fn dims(&self) -> &[usize; DIMENSIONALITY_MAX] {
        &self.dims
    }
}

impl Default for BrickSize {
    fn default() -> Self {
        // Common default: 64x64x64 for 3D data
        Self::new([64, 64, 64, 1, 1, 1])
    }
}

/// Describes the geometry of an opened volume: axes, channels, chunking and
/// LOD pyramid depth. Immutable once the dataset handle is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeLayout {
    /// Dimensionality (1-6)
    pub dimensionality: usize,

    /// Axis descriptors for each dimension
    pub axes: Vec<AxisDescriptor>,

    /// Data channels, at least one
    pub channels: Vec<ChannelDescriptor>,

    /// Brick size for chunking
    pub brick_size: BrickSize,

    /// Number of LOD pyramid levels above full resolution (0 = no pyramid)
    pub lod_levels: usize,
}

impl VolumeLayout {
    pub fn new(axes: Vec<AxisDescriptor>, channels: Vec<ChannelDescriptor>) -> Result<Self> {
        let dimensionality = axes.len();
        if dimensionality == 0 || dimensionality > DIMENSIONALITY_MAX {
            return Err(VdsError::InvalidDimensions(
                "number of axes must be between 1 and 6".to_string(),
            ));
        }
        if axes.iter().any(|a| a.num_samples == 0) {
            return Err(VdsError::InvalidDimensions(
                "every axis needs at least one sample".to_string(),
            ));
        }
        if channels.is_empty() {
            return Err(VdsError::InvalidDimensions(
                "a volume needs at least one channel".to_string(),
            ));
        }
        if channels.iter().any(|c| c.components == 0) {
            return Err(VdsError::InvalidDimensions(
                "channel component count must be positive".to_string(),
            ));
        }

        Ok(Self {
            dimensionality,
            axes,
            channels,
            brick_size: BrickSize::default(),
            lod_levels: 0,
        })
    }

    /// Set the brick size
    pub fn with_brick_size(mut self, brick_size: BrickSize) -> Self {
        self.brick_size = brick_size;
        self
    }

    /// Set the number of LOD levels
    pub fn with_lod_levels(mut self, lod_levels: usize) -> Self {
        self.lod_levels = lod_levels;
        self
    }

    /// Full-resolution sample count along `dim`; 1 for axes past the
    /// volume's dimensionality
    pub fn num_samples(&self, dim: usize) -> usize {
        if dim < self.dimensionality {
            self.axes[dim].num_samples
        } else {
            1
        }
    }

    /// Full-resolution size of each real dimension
    pub fn size(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.num_samples).collect()
    }

    /// Look up a channel descriptor, validating the index
    pub fn channel(&self, index: usize) -> Result<&ChannelDescriptor> {
        self.channels.get(index).ok_or_else(|| {
            VdsError::OutOfBounds(format!(
                "channel {} out of range, volume has {} channels",
                index,
                self.channels.len()
            ))
        })
    }

    /// Validate an LOD level against the pyramid depth
    pub fn validate_lod(&self, lod: usize) -> Result<()> {
        if lod > self.lod_levels {
            return Err(VdsError::OutOfBounds(format!(
                "LOD {} out of range, volume has {} LOD levels",
                lod, self.lod_levels
            )));
        }
        Ok(())
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        let size_str = self
            .size()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" x ");

        format!(
            "{}D volume: {}, {} channel(s), {} LOD level(s)",
            self.dimensionality,
            size_str,
            self.channels.len(),
            self.lod_levels
        )
    }
}

/// Sample count along one dimension after `lod` halving steps
fn lod_samples(num_samples: usize, lod: usize) -> usize {
    let step = 1usize << lod;
    ((num_samples + step - 1) / step).max(1)
}

/// The chunk grid of one layer: a (dimension group, LOD, channel) slice of
/// the volume. Dimensions in the group are chunked by the brick size and
/// scaled down per LOD step; remaining real dimensions keep full resolution
/// with single-voxel chunk thickness.
#[derive(Debug, Clone)]
pub struct ChunkLayout {
    dimensions: DimensionsND,
    lod: usize,
    samples: [usize; DIMENSIONALITY_MAX],
    chunk_dims: [usize; DIMENSIONALITY_MAX],
    chunk_counts: [usize; DIMENSIONALITY_MAX],
}

impl ChunkLayout {
    pub fn new(layout: &VolumeLayout, dimensions: DimensionsND, lod: usize) -> Result<Self> {
        layout.validate_lod(lod)?;
        for &dim in dimensions.dimensions() {
            if dim >= layout.dimensionality {
                return Err(VdsError::InvalidDimensions(format!(
                    "dimension group {} needs axis {} but the volume is {}D",
                    dimensions, dim, layout.dimensionality
                )));
            }
        }

        let mut samples = [1; DIMENSIONALITY_MAX];
        let mut chunk_dims = [1; DIMENSIONALITY_MAX];
        let mut chunk_counts = [1; DIMENSIONALITY_MAX];
        for dim in 0..DIMENSIONALITY_MAX {
            let n = layout.num_samples(dim);
            if dimensions.contains(dim) {
                samples[dim] = lod_samples(n, lod);
                chunk_dims[dim] = layout.brick_size.get(dim).max(1);
            } else {
                samples[dim] = n;
                chunk_dims[dim] = 1;
            }
            chunk_counts[dim] = (samples[dim] + chunk_dims[dim] - 1) / chunk_dims[dim];
        }

        Ok(Self {
            dimensions,
            lod,
            samples,
            chunk_dims,
            chunk_counts,
        })
    }

    pub fn dimensions(&self) -> DimensionsND {
        self.dimensions
    }

    pub fn lod(&self) -> usize {
        self.lod
    }

    /// Sample count along `dim` at this layer's LOD
    pub fn num_samples(&self, dim: usize) -> usize {
        self.samples[dim]
    }

    /// Chunk size along `dim` (unclipped)
    pub fn chunk_dim(&self, dim: usize) -> usize {
        self.chunk_dims[dim]
    }

    /// Number of chunks along `dim`
    pub fn chunks_along(&self, dim: usize) -> usize {
        self.chunk_counts[dim]
    }

    /// Total number of chunks addressable in this layer
    pub fn chunk_count(&self) -> i64 {
        self.chunk_counts.iter().product::<usize>() as i64
    }

    fn validate_chunk(&self, chunk: i64) -> Result<()> {
        let count = self.chunk_count();
        if chunk < 0 || chunk >= count {
            return Err(VdsError::InvalidChunkIndex {
                index: chunk,
                count,
            });
        }
        Ok(())
    }

    /// Convert a chunk index to chunk grid coordinates. Dimension 0 varies
    /// slowest, dimension 5 fastest.
    pub fn chunk_index_to_coords(&self, chunk: i64) -> Result<[usize; DIMENSIONALITY_MAX]> {
        self.validate_chunk(chunk)?;
        let mut coords = [0; DIMENSIONALITY_MAX];
        let mut remaining = chunk as usize;
        for dim in 0..DIMENSIONALITY_MAX {
            let stride: usize = self.chunk_counts[dim + 1..].iter().product();
            coords[dim] = remaining / stride;
            remaining %= stride;
        }
        Ok(coords)
    }

    /// Convert chunk grid coordinates to a chunk index
    pub fn chunk_coords_to_index(&self, coords: &[usize; DIMENSIONALITY_MAX]) -> i64 {
        let mut index = 0usize;
        for dim in 0..DIMENSIONALITY_MAX {
            let stride: usize = self.chunk_counts[dim + 1..].iter().product();
            index += coords[dim] * stride;
        }
        index as i64
    }

    /// The voxel extents a chunk covers (min inclusive, max exclusive),
    /// clipped at the layer boundary
    pub fn chunk_min_max(
        &self,
        chunk: i64,
    ) -> Result<([i32; DIMENSIONALITY_MAX], [i32; DIMENSIONALITY_MAX])> {
        let coords = self.chunk_index_to_coords(chunk)?;
        let mut min = [0i32; DIMENSIONALITY_MAX];
        let mut max = [0i32; DIMENSIONALITY_MAX];
        for dim in 0..DIMENSIONALITY_MAX {
            let start = coords[dim] * self.chunk_dims[dim];
            let end = (start + self.chunk_dims[dim]).min(self.samples[dim]);
            min[dim] = start as i32;
            max[dim] = end as i32;
        }
        Ok((min, max))
    }

    /// Index of the chunk containing a voxel position
    pub fn chunk_index_containing(&self, position: &[i32; DIMENSIONALITY_MAX]) -> Result<i64> {
        let mut coords = [0; DIMENSIONALITY_MAX];
        for dim in 0..DIMENSIONALITY_MAX {
            let p = position[dim];
            if p < 0 || p as usize >= self.samples[dim] {
                return Err(VdsError::OutOfBounds(format!(
                    "voxel position {} out of range 0..{} in dimension {}",
                    p, self.samples[dim], dim
                )));
            }
            coords[dim] = p as usize / self.chunk_dims[dim];
        }
        Ok(self.chunk_coords_to_index(&coords))
    }

    /// Number of voxels in a chunk after boundary clipping
    pub fn chunk_voxel_count(&self, chunk: i64) -> Result<usize> {
        let (min, max) = self.chunk_min_max(chunk)?;
        Ok((0..DIMENSIONALITY_MAX)
            .map(|dim| (max[dim] - min[dim]) as usize)
            .product())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ValueRange, VoxelFormat};

    fn test_layout() -> VolumeLayout {
        let axes = vec![
            AxisDescriptor::new(1000, "Inline", "trace", 0.0, 999.0),
            AxisDescriptor::new(800, "Crossline", "trace", 0.0, 799.0),
            AxisDescriptor::new(500, "Depth", "ms", 0.0, 2000.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            VoxelFormat::R32,
            "Amplitude",
            "",
            ValueRange::new(-1.0, 1.0),
        )];
        VolumeLayout::new(axes, channels)
            .unwrap()
            .with_brick_size(BrickSize::new([64, 64, 64, 1, 1, 1]))
            .with_lod_levels(2)
    }

    #[test]
    fn test_layout_creation() {
        let layout = test_layout();
        assert_eq!(layout.dimensionality, 3);
        assert_eq!(layout.size(), vec![1000, 800, 500]);
        assert_eq!(layout.num_samples(4), 1);
        assert!(layout.channel(0).is_ok());
        assert!(layout.channel(1).is_err());
    }

    #[test]
    fn test_chunk_counts() {
        let layout = test_layout();
        let chunks = ChunkLayout::new(&layout, DimensionsND::Dimensions012, 0).unwrap();
        assert_eq!(chunks.chunks_along(0), 16); // ceil(1000/64)
        assert_eq!(chunks.chunks_along(1), 13); // ceil(800/64)
        assert_eq!(chunks.chunks_along(2), 8); // ceil(500/64)
        assert_eq!(chunks.chunk_count(), 16 * 13 * 8);
    }

    #[test]
    fn test_lod_scaling() {
        let layout = test_layout();
        let chunks = ChunkLayout::new(&layout, DimensionsND::Dimensions012, 1).unwrap();
        assert_eq!(chunks.num_samples(0), 500);
        assert_eq!(chunks.num_samples(1), 400);
        assert_eq!(chunks.num_samples(2), 250);
        assert_eq!(chunks.chunks_along(0), 8); // ceil(500/64)

        assert!(ChunkLayout::new(&layout, DimensionsND::Dimensions012, 3).is_err());
    }

    #[test]
    fn test_two_dimensional_group() {
        let layout = test_layout();
        let chunks = ChunkLayout::new(&layout, DimensionsND::Dimensions01, 0).unwrap();
        // Dimension 2 stays full resolution with single-voxel chunks
        assert_eq!(chunks.chunk_dim(2), 1);
        assert_eq!(chunks.chunks_along(2), 500);
        assert_eq!(chunks.num_samples(2), 500);
    }

    #[test]
    fn test_chunk_index_conversion() {
        let layout = test_layout();
        let chunks = ChunkLayout::new(&layout, DimensionsND::Dimensions012, 0).unwrap();
        let coords = [5, 7, 3, 0, 0, 0];
        let index = chunks.chunk_coords_to_index(&coords);
        let recovered = chunks.chunk_index_to_coords(index).unwrap();
        assert_eq!(coords, recovered);

        assert!(chunks.chunk_index_to_coords(-1).is_err());
        assert!(chunks.chunk_index_to_coords(chunks.chunk_count()).is_err());
    }

    #[test]
    fn test_chunk_min_max_clipping() {
        let layout = test_layout();
        let chunks = ChunkLayout::new(&layout, DimensionsND::Dimensions012, 0).unwrap();

        let (min, max) = chunks.chunk_min_max(0).unwrap();
        assert_eq!(&min[..3], &[0, 0, 0]);
        assert_eq!(&max[..3], &[64, 64, 64]);

        // Last chunk is trimmed at the volume boundary
        let last = chunks.chunk_count() - 1;
        let (min, max) = chunks.chunk_min_max(last).unwrap();
        assert_eq!(&min[..3], &[960, 768, 448]);
        assert_eq!(&max[..3], &[1000, 800, 500]);
    }

    #[test]
    fn test_chunk_index_containing() {
        let layout = test_layout();
        let chunks = ChunkLayout::new(&layout, DimensionsND::Dimensions012, 0).unwrap();
        let chunk = chunks
            .chunk_index_containing(&[70, 10, 130, 0, 0, 0])
            .unwrap();
        let (min, max) = chunks.chunk_min_max(chunk).unwrap();
        assert!(min[0] <= 70 && 70 < max[0]);
        assert!(min[1] <= 10 && 10 < max[1]);
        assert!(min[2] <= 130 && 130 < max[2]);

        assert!(chunks
            .chunk_index_containing(&[1000, 0, 0, 0, 0, 0])
            .is_err());
    }
}
