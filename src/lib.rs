//! VDS Access - asynchronous access and paging core for chunked
//! multi-dimensional volume data.
//!
//! Turns voxel-range, sample and trace requests into scheduled, cancellable,
//! concurrently-serviced jobs against a chunked multi-resolution store, and
//! manages bounded page caches for direct chunk access.
//!
//! # Features
//!
//! - Up to 6D volumetric data with named dimension groups and LOD pyramids
//! - Asynchronous subset/projected/sample/trace requests with best-effort
//!   cancellation, blocking waits with timeout and non-blocking polls
//! - Bounded page caches with commit/write-back and LRU eviction
//! - Typed accessors generic over rank and voxel format
//! - Pipelined uploads with a polled error queue instead of throwing from
//!   write paths
//!
//! Storage backends implement the [`VolumeStore`] trait; an in-memory store
//! and a local filesystem store ship with the crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vds_access::{
//!     AccessManagerOptions, Dataset, DimensionsND, InMemoryVolumeStore, VoxelFormat, VoxelRange,
//! };
//!
//! # fn example(layout: vds_access::VolumeLayout) -> vds_access::Result<()> {
//! let store = Arc::new(InMemoryVolumeStore::new());
//! let dataset = Dataset::create(store, layout, AccessManagerOptions::default())?;
//!
//! let range = VoxelRange::normalize(&[0, 0, 0], &[100, 100, 100]);
//! let request = dataset.access_manager().request_volume_subset(
//!     range,
//!     DimensionsND::Dimensions012,
//!     0,
//!     0,
//!     VoxelFormat::R32,
//!     None,
//!     None,
//! )?;
//! let data = request.data()?;
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod compression;
pub mod error;
pub mod geometry;
pub mod handle;
pub mod layout;
pub mod manager;
pub mod page;
pub mod request;
pub mod sampler;
pub mod store;
pub mod types;
pub mod utils;

// Re-exports
pub use accessor::{InterpolatingAccessor, Scalar, TypedAccessor};
pub use compression::{CompressionLevel, CompressionMethod};
pub use error::{Result, VdsError};
pub use geometry::VoxelRange;
pub use handle::{Dataset, HandleTable};
pub use layout::{BrickSize, ChunkLayout, VolumeLayout};
pub use manager::{AccessManager, AccessManagerOptions, IoErrorRecord};
pub use page::{Page, PageAccessor};
pub use request::{RequestState, VolumeDataRequest};
pub use store::{
    ChunkKey, FileVolumeStore, InMemoryVolumeStore, LayerKey, LayerStatus, ProduceStatus,
    VolumeStore,
};
pub use types::{
    AccessMode, AxisDescriptor, ChannelDescriptor, DimensionsND, InterpolationMethod, ValueRange,
    VoxelFormat, DIMENSIONALITY_MAX,
};

/// Version of the access core
pub const VDS_ACCESS_VERSION: &str = env!("CARGO_PKG_VERSION");
