//! Typed voxel accessors over a page accessor.
//!
//! One generic accessor parameterized by scalar type and rank replaces a
//! per-format constructor zoo: `TypedAccessor<f32, 3>` reads and writes
//! single voxels, `InterpolatingAccessor<f32, 3>` resolves continuous
//! positions through the sampling kernels. Both keep the owning page for the
//! most recent voxel checked out and swap pages through the wrapped
//! accessor's cache as coordinates move.

use crate::error::{Result, VdsError};
use crate::page::{Page, PageAccessor};
use crate::sampler::{self, VoxelSource};
use crate::types::{InterpolationMethod, VoxelFormat, DIMENSIONALITY_MAX};
use crate::utils::{read_scalar, write_scalar};
use num_traits::NumCast;

/// Rust scalar types that map onto a voxel format
pub trait Scalar: Copy + Send + Sync + 'static {
    const FORMAT: VoxelFormat;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

macro_rules! impl_scalar {
    ($($ty:ty => $format:ident),+ $(,)?) => {
        $(
            impl Scalar for $ty {
                const FORMAT: VoxelFormat = VoxelFormat::$format;

                fn from_f64(value: f64) -> Self {
                    NumCast::from(value).unwrap_or_default()
                }

                fn to_f64(self) -> f64 {
                    NumCast::from(self).unwrap_or_default()
                }
            }
        )+
    };
}

impl_scalar! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => R32,
    f64 => R64,
}

/// View a native-endian byte buffer as typed elements
pub(crate) fn typed_from_bytes<T: Scalar>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = T::FORMAT.size_in_bytes();
    if bytes.len() % size != 0 {
        return Err(VdsError::InvalidDimensions(format!(
            "{} bytes do not divide into {} elements",
            bytes.len(),
            T::FORMAT
        )));
    }
    Ok((0..bytes.len() / size)
        .map(|index| T::from_f64(read_scalar(bytes, T::FORMAT, index)))
        .collect())
}

/// Convert typed elements into a native-endian byte buffer
pub fn typed_to_bytes<T: Scalar>(values: &[T]) -> Vec<u8> {
    let size = T::FORMAT.size_in_bytes();
    let mut bytes = vec![0u8; values.len() * size];
    for (index, value) in values.iter().enumerate() {
        write_scalar(&mut bytes, T::FORMAT, index, value.to_f64());
    }
    bytes
}

/// Direct voxel read/write access with a fixed scalar type and rank.
///
/// `N` is the rank of the accessor's dimension group; coordinates address
/// the group's axes in ascending order. The accessor owns its page
/// accessor, so every page it still holds is released on any exit path.
pub struct TypedAccessor<T: Scalar, const N: usize> {
    pages: PageAccessor,
    current: Option<Page>,
    replacement_no_value: Option<f32>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Scalar, const N: usize> TypedAccessor<T, N> {
    pub(crate) fn new(pages: PageAccessor, replacement_no_value: Option<f32>) -> Result<Self> {
        let group = pages.chunk_layout().dimensions();
        if group.dimensionality() != N {
            return Err(VdsError::InvalidDimensions(format!(
                "accessor rank {} does not match dimension group {}",
                N, group
            )));
        }
        let channel = pages.channel_descriptor();
        if channel.format != T::FORMAT {
            return Err(VdsError::Configuration(format!(
                "channel stores {}, accessor reads {}",
                channel.format,
                T::FORMAT
            )));
        }
        if channel.components != 1 {
            return Err(VdsError::Configuration(
                "typed accessors need a scalar channel".to_string(),
            ));
        }
        Ok(Self {
            pages,
            current: None,
            replacement_no_value,
            _marker: std::marker::PhantomData,
        })
    }

    /// Map a rank-N coordinate onto the full 6D voxel space
    fn expand(&self, coordinate: [i32; N]) -> [i32; DIMENSIONALITY_MAX] {
        let group = self.pages.chunk_layout().dimensions().dimensions();
        let mut position = [0i32; DIMENSIONALITY_MAX];
        for (slot, dim) in group.iter().enumerate() {
            position[*dim] = coordinate[slot];
        }
        position
    }

    /// Make sure the page containing `position` is checked out, swapping
    /// the current page through the cache when the coordinate moved to
    /// another chunk
    fn ensure_page(&mut self, position: &[i32; DIMENSIONALITY_MAX]) -> Result<&mut Page> {
        let chunk = self.pages.chunk_index(position)?;
        if self
            .current
            .as_ref()
            .map(|page| page.chunk_index() != chunk)
            .unwrap_or(false)
        {
            if let Some(page) = self.current.take() {
                self.pages.release_page(page)?;
            }
        }
        if self.current.is_none() {
            self.current = Some(self.pages.create_page(chunk)?);
        }
        Ok(self
            .current
            .as_mut()
            .ok_or_else(|| VdsError::Lifecycle("no page checked out".to_string()))?)
    }

    /// Read the voxel at a coordinate, applying the replacement no-value
    /// when one is configured
    pub fn get_value(&mut self, coordinate: [i32; N]) -> Result<T> {
        let position = self.expand(coordinate);
        let no_value = self.pages.channel_descriptor().no_value;
        let replacement = self.replacement_no_value;
        let format = T::FORMAT;
        let page = self.ensure_page(&position)?;
        let index = page.voxel_index(&position).ok_or_else(|| {
            VdsError::OutOfBounds(format!("position {:?} outside page extents", position))
        })?;
        let mut value = read_scalar(page.buffer(), format, index);
        if let (Some(nv), Some(replacement)) = (no_value, replacement) {
            if value == <f64 as From<f32>>::from(nv) {
                value = <f64 as From<f32>>::from(replacement);
            }
        }
        Ok(T::from_f64(value))
    }

    /// Write the voxel at a coordinate; fails when the wrapped page
    /// accessor is not writable
    pub fn set_value(&mut self, coordinate: [i32; N], value: T) -> Result<()> {
        if !self.pages.access_mode().is_writable() {
            return Err(VdsError::ReadOnlyAccess);
        }
        let position = self.expand(coordinate);
        let format = T::FORMAT;
        let page = self.ensure_page(&position)?;
        let index = page.voxel_index(&position).ok_or_else(|| {
            VdsError::OutOfBounds(format!("position {:?} outside page extents", position))
        })?;
        write_scalar(page.writable_buffer()?, format, index, value.to_f64());
        Ok(())
    }

    /// Release the held page and flush all written pages plus chunk
    /// metadata through the upload pipeline
    pub fn commit(&mut self) -> Result<()> {
        if let Some(page) = self.current.take() {
            self.pages.release_page(page)?;
        }
        self.pages.commit()
    }

    /// Release the held page and hand back the wrapped page accessor
    pub fn into_inner(mut self) -> Result<PageAccessor> {
        if let Some(page) = self.current.take() {
            self.pages.release_page(page)?;
        }
        Ok(self.pages)
    }
}

/// Continuous-position reads through the interpolation kernels
pub struct InterpolatingAccessor<T: Scalar, const N: usize> {
    inner: TypedAccessor<T, N>,
    interpolation: InterpolationMethod,
}

impl<T: Scalar, const N: usize> InterpolatingAccessor<T, N> {
    pub(crate) fn new(
        pages: PageAccessor,
        interpolation: InterpolationMethod,
        replacement_no_value: Option<f32>,
    ) -> Result<Self> {
        Ok(Self {
            inner: TypedAccessor::new(pages, replacement_no_value)?,
            interpolation,
        })
    }

    /// Interpolate a sample at a continuous rank-N position
    pub fn get_sample(&mut self, position: [f32; N]) -> Result<T> {
        let group = self.inner.pages.chunk_layout().dimensions().dimensions();
        let mut pos = [0.0f32; DIMENSIONALITY_MAX];
        for (slot, dim) in group.iter().enumerate() {
            pos[*dim] = position[slot];
        }
        for dim in 0..DIMENSIONALITY_MAX {
            let samples = self.inner.pages.chunk_layout().num_samples(dim) as f32;
            if !pos[dim].is_finite() || pos[dim] < 0.0 || pos[dim] >= samples {
                return Err(VdsError::OutOfBounds(format!(
                    "sample position component {} = {} outside 0..{}",
                    dim, pos[dim], samples
                )));
            }
        }

        let no_value = self
            .inner
            .pages
            .channel_descriptor()
            .no_value
            .map(<f64 as From<f32>>::from);
        let chunks = self.inner.pages.chunk_layout().clone();
        let mut source = PageVoxelSource {
            accessor: &mut self.inner,
            error: None,
        };
        let value = sampler::interpolate(&mut source, &chunks, &pos, self.interpolation, no_value);
        if let Some(error) = source.error {
            return Err(error);
        }
        let value = match (no_value, self.inner.replacement_no_value) {
            (Some(nv), Some(replacement)) if value == nv => <f64 as From<f32>>::from(replacement),
            _ => value,
        };
        Ok(T::from_f64(value))
    }

    /// Hand back the wrapped page accessor
    pub fn into_inner(self) -> Result<PageAccessor> {
        self.inner.into_inner()
    }
}

/// Voxel source reading through the typed accessor's page cache. Fetch
/// errors cannot surface through the gather itself; the first one is
/// recorded and re-raised after interpolation.
struct PageVoxelSource<'a, T: Scalar, const N: usize> {
    accessor: &'a mut TypedAccessor<T, N>,
    error: Option<VdsError>,
}

impl<T: Scalar, const N: usize> VoxelSource for PageVoxelSource<'_, T, N> {
    fn voxel(&mut self, position: [i32; DIMENSIONALITY_MAX]) -> f64 {
        if self.error.is_some() {
            return 0.0;
        }
        match self.accessor.ensure_page(&position) {
            Ok(page) => match page.voxel_index(&position) {
                Some(index) => read_scalar(page.buffer(), T::FORMAT, index),
                None => 0.0,
            },
            Err(error) => {
                self.error = Some(error);
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_byte_views() {
        let values: Vec<f32> = vec![1.0, -2.5, 3.25];
        let bytes = typed_to_bytes(&values);
        assert_eq!(bytes.len(), 12);
        let recovered: Vec<f32> = typed_from_bytes(&bytes).unwrap();
        assert_eq!(values, recovered);

        let misaligned = typed_from_bytes::<f32>(&bytes[..10]);
        assert!(misaligned.is_err());
    }

    #[test]
    fn test_scalar_formats() {
        assert_eq!(<u8 as Scalar>::FORMAT, VoxelFormat::U8);
        assert_eq!(<u32 as Scalar>::FORMAT, VoxelFormat::U32);
        assert_eq!(<f64 as Scalar>::FORMAT, VoxelFormat::R64);
        assert_eq!(u16::from_f64(513.0), 513);
        assert_eq!(4.5f32.to_f64(), 4.5);
    }
}
