//! Interpolated voxel sampling.
//!
//! Kernels are separable across the active dimensions of a group and
//! edge-clamped. Positions use the voxel-center convention: the continuous
//! coordinate `i + 0.5` lands exactly on voxel `i`, so interpolating at a
//! center reproduces the stored value for every method.

use crate::layout::ChunkLayout;
use crate::types::{InterpolationMethod, DIMENSIONALITY_MAX};

/// Source of individual voxel values, widened to f64. Implementations may
/// cache pages or chunks internally, hence `&mut self`.
pub trait VoxelSource {
    fn voxel(&mut self, position: [i32; DIMENSIONALITY_MAX]) -> f64;
}

/// Per-dimension kernel taps: first sample index and weights
struct Taps {
    base: i32,
    weights: [f64; 4],
    width: usize,
}

fn kernel_taps(pos: f32, method: InterpolationMethod) -> Taps {
    match method {
        InterpolationMethod::Nearest => Taps {
            base: pos.floor() as i32,
            weights: [1.0, 0.0, 0.0, 0.0],
            width: 1,
        },
        InterpolationMethod::Linear => {
            let t = pos as f64 - 0.5;
            let base = t.floor();
            let f = t - base;
            Taps {
                base: base as i32,
                weights: [1.0 - f, f, 0.0, 0.0],
                width: 2,
            }
        }
        InterpolationMethod::Cubic => {
            let t = pos as f64 - 0.5;
            let base = t.floor();
            let f = t - base;
            // Catmull-Rom weights over base-1 .. base+2
            let w0 = ((-0.5 * f + 1.0) * f - 0.5) * f;
            let w1 = (1.5 * f - 2.5) * f * f + 1.0;
            let w2 = ((-1.5 * f + 2.0) * f + 0.5) * f;
            let w3 = (0.5 * f - 0.5) * f * f;
            Taps {
                base: base as i32 - 1,
                weights: [w0, w1, w2, w3],
                width: 4,
            }
        }
    }
}

fn clamp_index(index: i32, samples: usize) -> i32 {
    index.clamp(0, samples as i32 - 1)
}

/// The voxel box (min inclusive, max exclusive) a sample at `pos` reads
/// from, clamped to the layer bounds. Used to prefetch chunks before the
/// synchronous gather.
pub fn support_box(
    chunks: &ChunkLayout,
    pos: &[f32; DIMENSIONALITY_MAX],
    method: InterpolationMethod,
) -> ([i32; DIMENSIONALITY_MAX], [i32; DIMENSIONALITY_MAX]) {
    let mut min = [0i32; DIMENSIONALITY_MAX];
    let mut max = [0i32; DIMENSIONALITY_MAX];
    let group = chunks.dimensions();
    for dim in 0..DIMENSIONALITY_MAX {
        let samples = chunks.num_samples(dim);
        let taps = if group.contains(dim) {
            kernel_taps(pos[dim], method)
        } else {
            kernel_taps(pos[dim], InterpolationMethod::Nearest)
        };
        min[dim] = clamp_index(taps.base, samples);
        max[dim] = clamp_index(taps.base + taps.width as i32 - 1, samples) + 1;
    }
    (min, max)
}

/// Interpolate a value at a continuous position. Dimensions outside the
/// layer's group snap to the containing voxel. When `no_value` is set and
/// any contributing tap carries it, the sentinel wins over the weighted sum.
pub fn interpolate<S: VoxelSource>(
    source: &mut S,
    chunks: &ChunkLayout,
    pos: &[f32; DIMENSIONALITY_MAX],
    method: InterpolationMethod,
    no_value: Option<f64>,
) -> f64 {
    let group = chunks.dimensions();
    let taps: [Taps; DIMENSIONALITY_MAX] = std::array::from_fn(|dim| {
        let method = if group.contains(dim) {
            method
        } else {
            InterpolationMethod::Nearest
        };
        kernel_taps(pos[dim], method)
    });

    let mut sum = 0.0f64;
    let mut cursor = [0usize; DIMENSIONALITY_MAX];
    'gather: loop {
        let mut weight = 1.0f64;
        let mut voxel = [0i32; DIMENSIONALITY_MAX];
        for dim in 0..DIMENSIONALITY_MAX {
            let t = &taps[dim];
            weight *= t.weights[cursor[dim]];
            voxel[dim] = clamp_index(t.base + cursor[dim] as i32, chunks.num_samples(dim));
        }
        if weight != 0.0 {
            let value = source.voxel(voxel);
            if let Some(nv) = no_value {
                if value == nv {
                    return nv;
                }
            }
            sum += weight * value;
        }

        // Advance the tap cursor, dimension 5 fastest
        let mut dim = DIMENSIONALITY_MAX - 1;
        loop {
            cursor[dim] += 1;
            if cursor[dim] < taps[dim].width {
                break;
            }
            cursor[dim] = 0;
            if dim == 0 {
                break 'gather;
            }
            dim -= 1;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BrickSize, VolumeLayout};
    use crate::types::{
        AxisDescriptor, ChannelDescriptor, DimensionsND, ValueRange, VoxelFormat,
    };

    /// Synthetic source: value = x + 10*y + 100*z
    struct Ramp;

    impl VoxelSource for Ramp {
        fn voxel(&mut self, p: [i32; DIMENSIONALITY_MAX]) -> f64 {
            p[0] as f64 + 10.0 * p[1] as f64 + 100.0 * p[2] as f64
        }
    }

    fn test_chunks() -> ChunkLayout {
        let axes = vec![
            AxisDescriptor::new(16, "X", "m", 0.0, 15.0),
            AxisDescriptor::new(16, "Y", "m", 0.0, 15.0),
            AxisDescriptor::new(16, "Z", "m", 0.0, 15.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            VoxelFormat::R32,
            "Value",
            "",
            ValueRange::new(0.0, 4000.0),
        )];
        let layout = VolumeLayout::new(axes, channels)
            .unwrap()
            .with_brick_size(BrickSize::new([8, 8, 8, 1, 1, 1]));
        ChunkLayout::new(&layout, DimensionsND::Dimensions012, 0).unwrap()
    }

    #[test]
    fn test_center_positions_are_exact() {
        let chunks = test_chunks();
        let pos = [3.5, 2.5, 7.5, 0.0, 0.0, 0.0];
        let expected = 3.0 + 20.0 + 700.0;
        for method in [
            InterpolationMethod::Nearest,
            InterpolationMethod::Linear,
            InterpolationMethod::Cubic,
        ] {
            let v = interpolate(&mut Ramp, &chunks, &pos, method, None);
            assert!(
                (v - expected).abs() < 1e-9,
                "{:?} at centers: {} != {}",
                method,
                v,
                expected
            );
        }
    }

    #[test]
    fn test_linear_midpoint() {
        let chunks = test_chunks();
        // Halfway between voxel (3,2,7) and (4,2,7)
        let pos = [4.0, 2.5, 7.5, 0.0, 0.0, 0.0];
        let v = interpolate(&mut Ramp, &chunks, &pos, InterpolationMethod::Linear, None);
        assert!((v - 723.5).abs() < 1e-9);
    }

    #[test]
    fn test_cubic_reproduces_linear_ramp() {
        // Catmull-Rom interpolates linear functions exactly away from edges
        let chunks = test_chunks();
        let pos = [4.25, 5.75, 8.5, 0.0, 0.0, 0.0];
        let v = interpolate(&mut Ramp, &chunks, &pos, InterpolationMethod::Cubic, None);
        let expected = (4.25 - 0.5) + 10.0 * (5.75 - 0.5) + 100.0 * 8.0;
        assert!((v - expected).abs() < 1e-9, "{} != {}", v, expected);
    }

    #[test]
    fn test_edge_clamping() {
        let chunks = test_chunks();
        let pos = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let v = interpolate(&mut Ramp, &chunks, &pos, InterpolationMethod::Cubic, None);
        assert!(v.is_finite());

        let (min, max) = support_box(&chunks, &pos, InterpolationMethod::Cubic);
        assert!(min.iter().all(|&m| m >= 0));
        assert!((0..3).all(|d| max[d] as usize <= chunks.num_samples(d)));
    }

    #[test]
    fn test_no_value_short_circuit() {
        struct Holes;
        impl VoxelSource for Holes {
            fn voxel(&mut self, p: [i32; DIMENSIONALITY_MAX]) -> f64 {
                if p[0] == 4 {
                    -999.25
                } else {
                    1.0
                }
            }
        }
        let chunks = test_chunks();
        let pos = [4.0, 2.5, 7.5, 0.0, 0.0, 0.0];
        let v = interpolate(
            &mut Holes,
            &chunks,
            &pos,
            InterpolationMethod::Linear,
            Some(-999.25),
        );
        assert_eq!(v, -999.25);
    }
}
