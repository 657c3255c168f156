//! The access manager - scheduling façade for asynchronous volume requests.
//!
//! Requests validate geometry synchronously, then run as jobs on a
//! manager-owned tokio runtime. The calling thread never blocks on dispatch.
//! Store write failures never raise from the triggering call; they land on a
//! bounded error FIFO polled through the manager.

use crate::accessor::{InterpolatingAccessor, Scalar, TypedAccessor};
use crate::error::{Result, VdsError};
use crate::geometry::{self, VoxelRange};
use crate::layout::{ChunkLayout, VolumeLayout};
use crate::page::PageAccessor;
use crate::request::{RequestShared, VolumeDataRequest};
use crate::sampler::{self, VoxelSource};
use crate::store::{ChunkKey, LayerKey, LayerStatus, ProduceStatus, VolumeStore};
use crate::types::{
    AccessMode, ChannelDescriptor, DimensionsND, InterpolationMethod, VoxelFormat,
    DIMENSIONALITY_MAX,
};
use crate::utils::{read_scalar, write_scalar};
use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};

/// Default page count for typed accessors created without an explicit bound
const DEFAULT_MAX_PAGES: usize = 8;

/// Record of one failed asynchronous store operation
#[derive(Debug, Clone)]
pub struct IoErrorRecord {
    /// Store object the operation targeted
    pub object_id: String,
    /// OS error code when one exists, -1 otherwise
    pub code: i32,
    pub message: String,
}

/// Tuning knobs for an access manager
#[derive(Debug, Clone)]
pub struct AccessManagerOptions {
    worker_threads: Option<usize>,
    max_io_errors: usize,
}

impl AccessManagerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the worker runtime to a thread count instead of the tokio default
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = Some(worker_threads);
        self
    }

    /// Bound of the upload/download error FIFOs; oldest entries are dropped
    /// beyond it
    pub fn with_max_io_errors(mut self, max_io_errors: usize) -> Self {
        self.max_io_errors = max_io_errors;
        self
    }

    pub(crate) fn worker_threads(&self) -> Option<usize> {
        self.worker_threads
    }
}

impl Default for AccessManagerOptions {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_io_errors: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LayerWriteStats {
    pub chunk_count: i64,
    pub written_chunks: u64,
}

/// Shared write pipeline: runtime handle, store and the asynchronous error
/// surface. Page accessors schedule their commits through this.
pub(crate) struct IoPipeline {
    handle: Handle,
    store: Arc<dyn VolumeStore>,
    pending_uploads: Mutex<usize>,
    uploads_drained: Condvar,
    upload_errors: Mutex<VecDeque<IoErrorRecord>>,
    download_errors: Mutex<VecDeque<IoErrorRecord>>,
    written_layers: Mutex<HashMap<LayerKey, LayerWriteStats>>,
    max_io_errors: usize,
}

fn error_code(error: &VdsError) -> i32 {
    match error {
        VdsError::Io(e) => e.raw_os_error().unwrap_or(-1),
        _ => -1,
    }
}

impl IoPipeline {
    pub(crate) fn store(&self) -> &Arc<dyn VolumeStore> {
        &self.store
    }

    /// Run a store future to completion from a non-runtime thread
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Schedule an asynchronous upload; failures land on the upload FIFO
    pub(crate) fn spawn_upload<F>(self: &Arc<Self>, object_id: String, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        *self.pending_uploads.lock() += 1;
        let pipeline = Arc::clone(self);
        self.handle.spawn(async move {
            if let Err(error) = future.await {
                tracing::warn!(object = %object_id, %error, "asynchronous upload failed");
                pipeline.push_upload_error(&object_id, &error);
            }
            let mut pending = pipeline.pending_uploads.lock();
            *pending -= 1;
            if *pending == 0 {
                pipeline.uploads_drained.notify_all();
            }
        });
    }

    /// Block until every scheduled upload has settled
    pub(crate) fn flush_uploads(&self) {
        let mut pending = self.pending_uploads.lock();
        while *pending > 0 {
            self.uploads_drained.wait(&mut pending);
        }
    }

    pub(crate) fn record_layer_write(&self, layer: LayerKey, chunk_count: i64, written: u64) {
        let mut layers = self.written_layers.lock();
        let stats = layers.entry(layer).or_default();
        stats.chunk_count = chunk_count;
        stats.written_chunks += written;
    }

    fn push_bounded(&self, queue: &Mutex<VecDeque<IoErrorRecord>>, record: IoErrorRecord) {
        let mut queue = queue.lock();
        if queue.len() >= self.max_io_errors {
            queue.pop_front();
        }
        queue.push_back(record);
    }

    pub(crate) fn push_upload_error(&self, object_id: &str, error: &VdsError) {
        self.push_bounded(
            &self.upload_errors,
            IoErrorRecord {
                object_id: object_id.to_string(),
                code: error_code(error),
                message: error.to_string(),
            },
        );
    }

    pub(crate) fn push_download_error(&self, object_id: &str, error: &VdsError) {
        self.push_bounded(
            &self.download_errors,
            IoErrorRecord {
                object_id: object_id.to_string(),
                code: error_code(error),
                message: error.to_string(),
            },
        );
    }
}

/// Interface for making asynchronous data requests against an opened volume.
///
/// Request dispatch and the error queues are safe to drive from multiple
/// threads. Page accessors created here are single-owner types.
pub struct AccessManager {
    layout: Arc<VolumeLayout>,
    runtime: Arc<Runtime>,
    pipeline: Arc<IoPipeline>,
    requests: Arc<Mutex<HashMap<u64, Arc<RequestShared>>>>,
    next_request_id: AtomicU64,
}

impl AccessManager {
    pub fn new(layout: Arc<VolumeLayout>, store: Arc<dyn VolumeStore>) -> Result<Self> {
        Self::with_options(layout, store, AccessManagerOptions::default())
    }

    pub fn with_options(
        layout: Arc<VolumeLayout>,
        store: Arc<dyn VolumeStore>,
        options: AccessManagerOptions,
    ) -> Result<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("vds-access-worker");
        if let Some(threads) = options.worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = Arc::new(builder.build().map_err(VdsError::Io)?);
        Ok(Self::from_parts(runtime, layout, store, options))
    }

    pub(crate) fn from_parts(
        runtime: Arc<Runtime>,
        layout: Arc<VolumeLayout>,
        store: Arc<dyn VolumeStore>,
        options: AccessManagerOptions,
    ) -> Self {
        let pipeline = Arc::new(IoPipeline {
            handle: runtime.handle().clone(),
            store,
            pending_uploads: Mutex::new(0),
            uploads_drained: Condvar::new(),
            upload_errors: Mutex::new(VecDeque::new()),
            download_errors: Mutex::new(VecDeque::new()),
            written_layers: Mutex::new(HashMap::new()),
            max_io_errors: options.max_io_errors,
        });
        Self {
            layout,
            runtime,
            pipeline,
            requests: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(0),
        }
    }

    pub fn layout(&self) -> &Arc<VolumeLayout> {
        &self.layout
    }

    /// Requests that have been dispatched but not yet reached a terminal state
    pub fn outstanding_request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn register_request(&self) -> Arc<RequestShared> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = Arc::new(RequestShared::new(id));
        self.requests.lock().insert(id, Arc::clone(&shared));
        shared
    }

    /// Validate a caller-supplied destination buffer, or allocate a
    /// zero-initialized one of exactly the required size
    fn prepare_buffer(&self, dest: Option<Vec<u8>>, required: usize) -> Result<Vec<u8>> {
        match dest {
            Some(buffer) => {
                if buffer.len() < required {
                    Err(VdsError::BufferTooSmall {
                        required,
                        actual: buffer.len(),
                    })
                } else {
                    Ok(buffer)
                }
            }
            None => Ok(vec![0u8; required]),
        }
    }

    /// Request a subset of the volume data, delivered in `format`.
    ///
    /// `range` coordinates are validated against the LOD-scaled layer before
    /// anything is dispatched. When `dest` is supplied its size is checked
    /// against the exact buffer size; otherwise a buffer is allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn request_volume_subset(
        &self,
        range: VoxelRange,
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        format: VoxelFormat,
        replacement_no_value: Option<f32>,
        dest: Option<Vec<u8>>,
    ) -> Result<VolumeDataRequest> {
        let chunks = ChunkLayout::new(&self.layout, dimensions, lod)?;
        let channel_desc = self.layout.channel(channel)?.clone();
        geometry::validate_range(&chunks, &range)?;
        let required = geometry::subset_buffer_size(&range, format, channel_desc.components);
        let buffer = self.prepare_buffer(dest, required)?;
        let shape = range.shape(self.layout.dimensionality);

        let shared = self.register_request();
        let layer = LayerKey::new(dimensions, lod, channel);
        tracing::debug!(id = shared.id(), layer = %layer.object_id(), "dispatching volume subset request");

        let pipeline = Arc::clone(&self.pipeline);
        let requests = Arc::clone(&self.requests);
        let job = Arc::clone(&shared);
        self.runtime.spawn(async move {
            let mut buffer = buffer;
            let outcome = produce_subset(
                &pipeline,
                &chunks,
                layer,
                &channel_desc,
                &range,
                format,
                replacement_no_value,
                &job,
                &mut buffer,
            )
            .await;
            finish_job(&requests, &job, &pipeline, &layer.object_id(), outcome, buffer);
        });

        Ok(VolumeDataRequest::new(shared, format, shape))
    }

    /// Request a 3D region projected onto a 2D plane.
    ///
    /// `voxel_plane` is `(a, b, c, d)` with `a*x + b*y + c*z + d = 0` over
    /// the three axes of `dimensions` in ascending order. `projected` names
    /// the two output axes; the third is solved from the plane per lattice
    /// point and sampled with `interpolation`.
    #[allow(clippy::too_many_arguments)]
    pub fn request_projected_volume_subset(
        &self,
        range: VoxelRange,
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        voxel_plane: [f32; 4],
        projected: DimensionsND,
        interpolation: InterpolationMethod,
        format: VoxelFormat,
        replacement_no_value: Option<f32>,
        dest: Option<Vec<u8>>,
    ) -> Result<VolumeDataRequest> {
        if dimensions.dimensionality() != 3 {
            return Err(VdsError::InvalidDimensions(format!(
                "projected requests need a 3D source group, got {}",
                dimensions
            )));
        }
        let proj_dims = projected.dimensions();
        if proj_dims.len() != 2 || !proj_dims.iter().all(|d| dimensions.contains(*d)) {
            return Err(VdsError::InvalidDimensions(format!(
                "projected dimensions {} are not a pair within {}",
                projected, dimensions
            )));
        }
        let chunks = ChunkLayout::new(&self.layout, dimensions, lod)?;
        let channel_desc = self.layout.channel(channel)?.clone();
        if channel_desc.components != 1 {
            return Err(VdsError::InvalidDimensions(
                "projected requests need a scalar channel".to_string(),
            ));
        }
        geometry::validate_range(&chunks, &range)?;

        // The solved axis is the group member not being projected
        let solved_dim = *dimensions
            .dimensions()
            .iter()
            .find(|d| !projected.contains(**d))
            .ok_or_else(|| {
                VdsError::InvalidDimensions("projected group covers all three axes".to_string())
            })?;
        let solved_coeff = voxel_plane[dimensions
            .dimensions()
            .iter()
            .position(|d| *d == solved_dim)
            .unwrap_or_default()];
        if solved_coeff == 0.0 {
            return Err(VdsError::InvalidRange(
                "voxel plane never intersects the solved axis".to_string(),
            ));
        }

        let required =
            geometry::projected_subset_buffer_size(&range, projected, format, channel_desc.components)?;
        let buffer = self.prepare_buffer(dest, required)?;
        let shape = vec![range.size(proj_dims[0]), range.size(proj_dims[1])];

        let shared = self.register_request();
        let layer = LayerKey::new(dimensions, lod, channel);
        tracing::debug!(id = shared.id(), layer = %layer.object_id(), "dispatching projected subset request");

        let pipeline = Arc::clone(&self.pipeline);
        let requests = Arc::clone(&self.requests);
        let job = Arc::clone(&shared);
        self.runtime.spawn(async move {
            let mut buffer = buffer;
            let outcome = produce_projected_subset(
                &pipeline,
                &chunks,
                layer,
                &channel_desc,
                &range,
                voxel_plane,
                projected,
                solved_dim,
                interpolation,
                format,
                replacement_no_value,
                &job,
                &mut buffer,
            )
            .await;
            finish_job(&requests, &job, &pipeline, &layer.object_id(), outcome, buffer);
        });

        Ok(VolumeDataRequest::new(shared, format, shape))
    }

    /// Request interpolated samples at a set of 6D positions. Samples are
    /// always delivered as 32-bit floats, one per position.
    pub fn request_volume_samples(
        &self,
        positions: &[[f32; DIMENSIONALITY_MAX]],
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        interpolation: InterpolationMethod,
        replacement_no_value: Option<f32>,
    ) -> Result<VolumeDataRequest> {
        let chunks = ChunkLayout::new(&self.layout, dimensions, lod)?;
        let channel_desc = self.layout.channel(channel)?.clone();
        if channel_desc.components != 1 {
            return Err(VdsError::InvalidDimensions(
                "sample requests need a scalar channel".to_string(),
            ));
        }
        validate_positions(&chunks, positions, None)?;
        let buffer = vec![0u8; geometry::samples_buffer_size(positions.len())];
        let shape = vec![positions.len()];

        let shared = self.register_request();
        let layer = LayerKey::new(dimensions, lod, channel);
        tracing::debug!(
            id = shared.id(),
            samples = positions.len(),
            layer = %layer.object_id(),
            "dispatching volume samples request"
        );

        let positions = positions.to_vec();
        let pipeline = Arc::clone(&self.pipeline);
        let requests = Arc::clone(&self.requests);
        let job = Arc::clone(&shared);
        self.runtime.spawn(async move {
            let mut buffer = buffer;
            let outcome = produce_samples(
                &pipeline,
                &chunks,
                layer,
                &channel_desc,
                &positions,
                interpolation,
                replacement_no_value,
                &job,
                &mut buffer,
            )
            .await;
            finish_job(&requests, &job, &pipeline, &layer.object_id(), outcome, buffer);
        });

        Ok(VolumeDataRequest::new(shared, VoxelFormat::R32, shape))
    }

    /// Request full traces along `trace_dimension` at a set of positions.
    /// Traces are always delivered as 32-bit floats, one complete trace per
    /// position.
    pub fn request_volume_traces(
        &self,
        positions: &[[f32; DIMENSIONALITY_MAX]],
        trace_dimension: usize,
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        interpolation: InterpolationMethod,
        replacement_no_value: Option<f32>,
    ) -> Result<VolumeDataRequest> {
        if !dimensions.contains(trace_dimension) {
            return Err(VdsError::InvalidDimensions(format!(
                "trace dimension {} is not part of {}",
                trace_dimension, dimensions
            )));
        }
        let chunks = ChunkLayout::new(&self.layout, dimensions, lod)?;
        let channel_desc = self.layout.channel(channel)?.clone();
        if channel_desc.components != 1 {
            return Err(VdsError::InvalidDimensions(
                "trace requests need a scalar channel".to_string(),
            ));
        }
        validate_positions(&chunks, positions, Some(trace_dimension))?;
        let trace_len = chunks.num_samples(trace_dimension);
        let buffer = vec![0u8; geometry::traces_buffer_size(&chunks, positions.len(), trace_dimension)];
        let shape = vec![positions.len(), trace_len];

        let shared = self.register_request();
        let layer = LayerKey::new(dimensions, lod, channel);
        tracing::debug!(
            id = shared.id(),
            traces = positions.len(),
            layer = %layer.object_id(),
            "dispatching volume traces request"
        );

        let positions = positions.to_vec();
        let pipeline = Arc::clone(&self.pipeline);
        let requests = Arc::clone(&self.requests);
        let job = Arc::clone(&shared);
        self.runtime.spawn(async move {
            let mut buffer = buffer;
            let outcome = produce_traces(
                &pipeline,
                &chunks,
                layer,
                &channel_desc,
                &positions,
                trace_dimension,
                interpolation,
                replacement_no_value,
                &job,
                &mut buffer,
            )
            .await;
            finish_job(&requests, &job, &pipeline, &layer.object_id(), outcome, buffer);
        });

        Ok(VolumeDataRequest::new(shared, VoxelFormat::R32, shape))
    }

    /// Force production of one chunk without delivering data to the caller;
    /// used for cache warming.
    pub fn prefetch_volume_chunk(
        &self,
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        chunk_index: i64,
    ) -> Result<VolumeDataRequest> {
        let chunks = ChunkLayout::new(&self.layout, dimensions, lod)?;
        self.layout.channel(channel)?;
        // Reuse the chunk bounds check
        chunks.chunk_min_max(chunk_index)?;

        let shared = self.register_request();
        let layer = LayerKey::new(dimensions, lod, channel);
        let key = ChunkKey::new(layer, chunk_index);
        tracing::debug!(id = shared.id(), object = %key.object_id(), "dispatching chunk prefetch");

        let pipeline = Arc::clone(&self.pipeline);
        let requests = Arc::clone(&self.requests);
        let job = Arc::clone(&shared);
        self.runtime.spawn(async move {
            let outcome = if job.is_cancel_requested() {
                Ok(false)
            } else {
                pipeline.store().produce_chunk(&key).await.map(|_| true)
            };
            finish_job(&requests, &job, &pipeline, &key.object_id(), outcome, Vec::new());
        });

        Ok(VolumeDataRequest::new(shared, VoxelFormat::R32, Vec::new()))
    }

    /// Create a page accessor over the chunks of one layer
    pub fn create_page_accessor(
        &self,
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        max_pages: usize,
        access_mode: AccessMode,
        chunk_metadata_page_size: usize,
    ) -> Result<PageAccessor> {
        let chunks = ChunkLayout::new(&self.layout, dimensions, lod)?;
        let channel_desc = self.layout.channel(channel)?.clone();
        if max_pages == 0 {
            return Err(VdsError::Configuration(
                "page accessor needs max_pages >= 1".to_string(),
            ));
        }
        if chunk_metadata_page_size == 0 {
            return Err(VdsError::Configuration(
                "chunk metadata page size must be positive".to_string(),
            ));
        }
        Ok(PageAccessor::new(
            LayerKey::new(dimensions, lod, channel),
            chunks,
            channel_desc,
            access_mode,
            max_pages,
            chunk_metadata_page_size,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.runtime),
        ))
    }

    /// Destroy a page accessor, forcing release of its cached pages.
    /// Uncommitted writes still held by the cache are discarded with a
    /// warning. Consuming the accessor makes later use impossible.
    pub fn destroy_page_accessor(&self, accessor: PageAccessor) {
        drop(accessor);
    }

    /// Create a typed accessor for direct voxel reads/writes. `N` must
    /// match the dimensionality of `dimensions` and `T` the channel format.
    pub fn create_typed_accessor<T: Scalar, const N: usize>(
        &self,
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        access_mode: AccessMode,
        replacement_no_value: Option<f32>,
    ) -> Result<TypedAccessor<T, N>> {
        let pages = self.create_page_accessor(
            dimensions,
            lod,
            channel,
            DEFAULT_MAX_PAGES,
            access_mode,
            1024,
        )?;
        TypedAccessor::new(pages, replacement_no_value)
    }

    /// Create an interpolating typed accessor for continuous-position reads
    pub fn create_interpolating_accessor<T: Scalar, const N: usize>(
        &self,
        dimensions: DimensionsND,
        lod: usize,
        channel: usize,
        interpolation: InterpolationMethod,
        replacement_no_value: Option<f32>,
    ) -> Result<InterpolatingAccessor<T, N>> {
        let pages = self.create_page_accessor(
            dimensions,
            lod,
            channel,
            DEFAULT_MAX_PAGES,
            AccessMode::ReadOnly,
            1024,
        )?;
        InterpolatingAccessor::new(pages, interpolation, replacement_no_value)
    }

    /// Block until every pipelined write has settled. When
    /// `write_updated_layer_status` is set, also persist refreshed status
    /// documents for every layer written through this manager.
    ///
    /// Durability is only confirmed by an empty upload-error queue after
    /// this returns.
    pub fn flush_upload_queue(&self, write_updated_layer_status: bool) {
        self.pipeline.flush_uploads();
        if !write_updated_layer_status {
            return;
        }
        let layers: Vec<(LayerKey, LayerWriteStats)> = self
            .pipeline
            .written_layers
            .lock()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        for (layer, stats) in layers {
            let status = LayerStatus {
                produce_status: ProduceStatus::Normal,
                chunk_count: stats.chunk_count,
                written_chunks: stats.written_chunks,
                updated: Utc::now(),
            };
            let store = Arc::clone(self.pipeline.store());
            let result = self
                .pipeline
                .block_on(async move { store.write_layer_status(&layer, &status).await });
            if let Err(error) = result {
                tracing::warn!(layer = %layer.object_id(), %error, "layer status write failed");
                self.pipeline
                    .push_upload_error(&layer.object_id(), &error);
            }
        }
    }

    /// Number of entries on the upload-error FIFO
    pub fn upload_error_count(&self) -> usize {
        self.pipeline.upload_errors.lock().len()
    }

    /// The oldest unconsumed upload error, without removing it
    pub fn current_upload_error(&self) -> Option<IoErrorRecord> {
        self.pipeline.upload_errors.lock().front().cloned()
    }

    /// Remove and return the oldest upload error
    pub fn pop_upload_error(&self) -> Option<IoErrorRecord> {
        self.pipeline.upload_errors.lock().pop_front()
    }

    /// Drop every recorded upload error
    pub fn clear_upload_errors(&self) {
        self.pipeline.upload_errors.lock().clear();
    }

    /// The oldest unconsumed download/production error, without removing it
    pub fn current_download_error(&self) -> Option<IoErrorRecord> {
        self.pipeline.download_errors.lock().front().cloned()
    }

    /// Drop every recorded download error
    pub fn clear_download_errors(&self) {
        self.pipeline.download_errors.lock().clear();
    }
}

impl Drop for AccessManager {
    fn drop(&mut self) {
        // Jobs canceled by the runtime shutdown can no longer transition
        // their requests; resolve them here so waiters wake up.
        let outstanding: Vec<Arc<RequestShared>> =
            self.requests.lock().drain().map(|(_, s)| s).collect();
        for shared in outstanding {
            shared.request_cancel();
            shared.finish_canceled(Some("access manager shut down".to_string()));
        }
    }
}

/// Resolve a finished job into its request's terminal state and drop it
/// from the outstanding table
fn finish_job(
    requests: &Mutex<HashMap<u64, Arc<RequestShared>>>,
    shared: &Arc<RequestShared>,
    pipeline: &Arc<IoPipeline>,
    object_id: &str,
    outcome: Result<bool>,
    buffer: Vec<u8>,
) {
    match outcome {
        Ok(true) => {
            tracing::debug!(id = shared.id(), "request completed");
            shared.finish_completed(Some(Bytes::from(buffer)));
        }
        Ok(false) => {
            tracing::debug!(id = shared.id(), "request canceled");
            shared.finish_canceled(None);
        }
        Err(error) => {
            tracing::warn!(id = shared.id(), %error, "request failed");
            pipeline.push_download_error(object_id, &error);
            shared.finish_canceled(Some(error.to_string()));
        }
    }
    requests.lock().remove(&shared.id());
}

/// Validate sample/trace positions against the layer bounds. The trace
/// dimension, when given, is produced in full and skips the check.
fn validate_positions(
    chunks: &ChunkLayout,
    positions: &[[f32; DIMENSIONALITY_MAX]],
    trace_dimension: Option<usize>,
) -> Result<()> {
    for (index, pos) in positions.iter().enumerate() {
        for dim in 0..DIMENSIONALITY_MAX {
            if Some(dim) == trace_dimension {
                continue;
            }
            let samples = chunks.num_samples(dim) as f32;
            if !pos[dim].is_finite() || pos[dim] < 0.0 || pos[dim] >= samples {
                return Err(VdsError::OutOfBounds(format!(
                    "position {} component {} = {} outside 0..{}",
                    index, dim, pos[dim], samples
                )));
            }
        }
    }
    Ok(())
}

fn expected_chunk_bytes(
    chunks: &ChunkLayout,
    channel: &ChannelDescriptor,
    chunk: i64,
) -> Result<usize> {
    Ok(chunks.chunk_voxel_count(chunk)? * channel.voxel_size_in_bytes())
}

/// Copy every chunk overlapping `range` into the destination buffer,
/// converting the channel format to the delivery format and substituting
/// the replacement no-value where configured. Returns false when the job
/// observed a cancellation request between chunks.
#[allow(clippy::too_many_arguments)]
async fn produce_subset(
    pipeline: &Arc<IoPipeline>,
    chunks: &ChunkLayout,
    layer: LayerKey,
    channel: &ChannelDescriptor,
    range: &VoxelRange,
    format: VoxelFormat,
    replacement_no_value: Option<f32>,
    shared: &RequestShared,
    buffer: &mut [u8],
) -> Result<bool> {
    let components = channel.components;
    let sentinel = channel.no_value.map(f64::from);

    let mut first_chunk = [0i32; DIMENSIONALITY_MAX];
    let mut last_chunk = [0i32; DIMENSIONALITY_MAX];
    for dim in 0..DIMENSIONALITY_MAX {
        first_chunk[dim] = range.min[dim] / chunks.chunk_dim(dim) as i32;
        last_chunk[dim] = (range.max[dim] - 1) / chunks.chunk_dim(dim) as i32 + 1;
    }

    let mut overlapping = Vec::new();
    geometry::for_each_voxel(&first_chunk, &last_chunk, |coords| {
        let mut c = [0usize; DIMENSIONALITY_MAX];
        for dim in 0..DIMENSIONALITY_MAX {
            c[dim] = coords[dim] as usize;
        }
        overlapping.push(chunks.chunk_coords_to_index(&c));
    });

    if shared.is_cancel_requested() {
        return Ok(false);
    }

    // Fetch all overlapping chunks concurrently
    let fetches: Vec<_> = overlapping
        .iter()
        .map(|&chunk| {
            let store = Arc::clone(pipeline.store());
            let key = ChunkKey::new(layer, chunk);
            async move {
                let data = store.fetch_chunk(&key).await?;
                Ok::<_, VdsError>((chunk, key, data))
            }
        })
        .collect();
    let fetched = try_join_all(fetches).await?;

    for (chunk, key, data) in fetched {
        if shared.is_cancel_requested() {
            return Ok(false);
        }
        let (chunk_min, chunk_max) = chunks.chunk_min_max(chunk)?;
        let Some((isect_min, isect_max)) =
            geometry::intersect(&chunk_min, &chunk_max, &range.min, &range.max)
        else {
            continue;
        };

        match data {
            Some(bytes) => {
                let expected = expected_chunk_bytes(chunks, channel, chunk)?;
                if bytes.len() < expected {
                    return Err(VdsError::Store(format!(
                        "chunk {} holds {} bytes, expected {}",
                        key.object_id(),
                        bytes.len(),
                        expected
                    )));
                }
                geometry::for_each_voxel(&isect_min, &isect_max, |pos| {
                    let src = geometry::linear_index(pos, &chunk_min, &chunk_max) * components;
                    let dst = geometry::linear_index(pos, &range.min, &range.max) * components;
                    for component in 0..components {
                        let mut value = read_scalar(&bytes, channel.format, src + component);
                        if let (Some(nv), Some(replacement)) = (sentinel, replacement_no_value) {
                            if value == nv {
                                value = f64::from(replacement);
                            }
                        }
                        write_scalar(buffer, format, dst + component, value);
                    }
                });
            }
            None => {
                // Never-written chunk: deliver the channel sentinel
                let fill = match (sentinel, replacement_no_value) {
                    (Some(_), Some(replacement)) => f64::from(replacement),
                    (Some(nv), None) => nv,
                    (None, _) => 0.0,
                };
                geometry::for_each_voxel(&isect_min, &isect_max, |pos| {
                    let dst = geometry::linear_index(pos, &range.min, &range.max) * components;
                    for component in 0..components {
                        write_scalar(buffer, format, dst + component, fill);
                    }
                });
            }
        }
    }
    Ok(true)
}

/// Job-local chunk cache backing interpolated sampling
struct ChunkSampleSource<'a> {
    pipeline: &'a Arc<IoPipeline>,
    chunks: &'a ChunkLayout,
    channel: &'a ChannelDescriptor,
    layer: LayerKey,
    sentinel: Option<f64>,
    cache: HashMap<i64, Option<(Bytes, [i32; DIMENSIONALITY_MAX], [i32; DIMENSIONALITY_MAX])>>,
}

impl<'a> ChunkSampleSource<'a> {
    fn new(
        pipeline: &'a Arc<IoPipeline>,
        chunks: &'a ChunkLayout,
        channel: &'a ChannelDescriptor,
        layer: LayerKey,
    ) -> Self {
        Self {
            pipeline,
            chunks,
            channel,
            layer,
            sentinel: channel.no_value.map(f64::from),
            cache: HashMap::new(),
        }
    }

    /// Fetch every chunk overlapping the box so the synchronous gather
    /// below never misses
    async fn ensure_box(
        &mut self,
        min: &[i32; DIMENSIONALITY_MAX],
        max: &[i32; DIMENSIONALITY_MAX],
    ) -> Result<()> {
        let mut first = [0i32; DIMENSIONALITY_MAX];
        let mut last = [0i32; DIMENSIONALITY_MAX];
        for dim in 0..DIMENSIONALITY_MAX {
            first[dim] = min[dim] / self.chunks.chunk_dim(dim) as i32;
            last[dim] = (max[dim] - 1) / self.chunks.chunk_dim(dim) as i32 + 1;
        }
        let mut wanted = Vec::new();
        geometry::for_each_voxel(&first, &last, |coords| {
            let mut c = [0usize; DIMENSIONALITY_MAX];
            for dim in 0..DIMENSIONALITY_MAX {
                c[dim] = coords[dim] as usize;
            }
            wanted.push(self.chunks.chunk_coords_to_index(&c));
        });
        for chunk in wanted {
            if self.cache.contains_key(&chunk) {
                continue;
            }
            let key = ChunkKey::new(self.layer, chunk);
            let entry = match self.pipeline.store().fetch_chunk(&key).await? {
                Some(bytes) => {
                    let expected = expected_chunk_bytes(self.chunks, self.channel, chunk)?;
                    if bytes.len() < expected {
                        return Err(VdsError::Store(format!(
                            "chunk {} holds {} bytes, expected {}",
                            key.object_id(),
                            bytes.len(),
                            expected
                        )));
                    }
                    let (chunk_min, chunk_max) = self.chunks.chunk_min_max(chunk)?;
                    Some((bytes, chunk_min, chunk_max))
                }
                None => None,
            };
            self.cache.insert(chunk, entry);
        }
        Ok(())
    }
}

impl VoxelSource for ChunkSampleSource<'_> {
    fn voxel(&mut self, position: [i32; DIMENSIONALITY_MAX]) -> f64 {
        // Positions are clamped by the sampler, so the lookup cannot fail
        // and the chunk is already cached by ensure_box.
        let Ok(chunk) = self.chunks.chunk_index_containing(&position) else {
            return self.sentinel.unwrap_or(0.0);
        };
        match self.cache.get(&chunk) {
            Some(Some((bytes, chunk_min, chunk_max))) => {
                let index = geometry::linear_index(&position, chunk_min, chunk_max);
                read_scalar(bytes, self.channel.format, index)
            }
            _ => self.sentinel.unwrap_or(0.0),
        }
    }
}

fn substitute(value: f64, sentinel: Option<f64>, replacement: Option<f32>) -> f64 {
    match (sentinel, replacement) {
        (Some(nv), Some(replacement)) if value == nv => f64::from(replacement),
        _ => value,
    }
}

#[allow(clippy::too_many_arguments)]
async fn produce_samples(
    pipeline: &Arc<IoPipeline>,
    chunks: &ChunkLayout,
    layer: LayerKey,
    channel: &ChannelDescriptor,
    positions: &[[f32; DIMENSIONALITY_MAX]],
    interpolation: InterpolationMethod,
    replacement_no_value: Option<f32>,
    shared: &RequestShared,
    buffer: &mut [u8],
) -> Result<bool> {
    let mut source = ChunkSampleSource::new(pipeline, chunks, channel, layer);
    let sentinel = source.sentinel;
    for (index, pos) in positions.iter().enumerate() {
        if shared.is_cancel_requested() {
            return Ok(false);
        }
        let (support_min, support_max) = sampler::support_box(chunks, pos, interpolation);
        source.ensure_box(&support_min, &support_max).await?;
        let value = sampler::interpolate(&mut source, chunks, pos, interpolation, sentinel);
        write_scalar(
            buffer,
            VoxelFormat::R32,
            index,
            substitute(value, sentinel, replacement_no_value),
        );
    }
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn produce_traces(
    pipeline: &Arc<IoPipeline>,
    chunks: &ChunkLayout,
    layer: LayerKey,
    channel: &ChannelDescriptor,
    positions: &[[f32; DIMENSIONALITY_MAX]],
    trace_dimension: usize,
    interpolation: InterpolationMethod,
    replacement_no_value: Option<f32>,
    shared: &RequestShared,
    buffer: &mut [u8],
) -> Result<bool> {
    let mut source = ChunkSampleSource::new(pipeline, chunks, channel, layer);
    let sentinel = source.sentinel;
    let trace_len = chunks.num_samples(trace_dimension);
    for (index, pos) in positions.iter().enumerate() {
        if shared.is_cancel_requested() {
            return Ok(false);
        }
        let mut sample_pos = *pos;
        sample_pos[trace_dimension] = 0.5;
        let (mut support_min, mut support_max) =
            sampler::support_box(chunks, &sample_pos, interpolation);
        support_min[trace_dimension] = 0;
        support_max[trace_dimension] = trace_len as i32;
        source.ensure_box(&support_min, &support_max).await?;

        for sample in 0..trace_len {
            // Trace-dimension coordinates land on voxel centers, so every
            // kernel reproduces the stored sample along the trace.
            sample_pos[trace_dimension] = sample as f32 + 0.5;
            let value =
                sampler::interpolate(&mut source, chunks, &sample_pos, interpolation, sentinel);
            write_scalar(
                buffer,
                VoxelFormat::R32,
                index * trace_len + sample,
                substitute(value, sentinel, replacement_no_value),
            );
        }
    }
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn produce_projected_subset(
    pipeline: &Arc<IoPipeline>,
    chunks: &ChunkLayout,
    layer: LayerKey,
    channel: &ChannelDescriptor,
    range: &VoxelRange,
    voxel_plane: [f32; 4],
    projected: DimensionsND,
    solved_dim: usize,
    interpolation: InterpolationMethod,
    format: VoxelFormat,
    replacement_no_value: Option<f32>,
    shared: &RequestShared,
    buffer: &mut [u8],
) -> Result<bool> {
    let mut source = ChunkSampleSource::new(pipeline, chunks, channel, layer);
    let sentinel = source.sentinel;
    let proj = projected.dimensions();
    let group = chunks.dimensions().dimensions();
    let solved_coeff = voxel_plane[group
        .iter()
        .position(|d| *d == solved_dim)
        .unwrap_or_default()];

    let (u_dim, v_dim) = (proj[0], proj[1]);
    let v_extent = range.size(v_dim);
    let no_value_fill = match (sentinel, replacement_no_value) {
        (Some(_), Some(replacement)) => f64::from(replacement),
        (Some(nv), None) => nv,
        (None, _) => 0.0,
    };

    for u in range.min[u_dim]..range.max[u_dim] {
        if shared.is_cancel_requested() {
            return Ok(false);
        }
        for v in range.min[v_dim]..range.max[v_dim] {
            let mut pos = [0.0f32; DIMENSIONALITY_MAX];
            for dim in 0..DIMENSIONALITY_MAX {
                pos[dim] = range.min[dim] as f32;
            }
            pos[u_dim] = u as f32 + 0.5;
            pos[v_dim] = v as f32 + 0.5;

            // Solve the plane equation for the remaining group axis
            let mut acc = voxel_plane[3];
            for (slot, dim) in group.iter().enumerate() {
                if *dim != solved_dim {
                    acc += voxel_plane[slot] * pos[*dim];
                }
            }
            let solved = -acc / solved_coeff;

            let dst = (u - range.min[u_dim]) as usize * v_extent
                + (v - range.min[v_dim]) as usize;
            if solved < range.min[solved_dim] as f32 || solved >= range.max[solved_dim] as f32 {
                // The plane leaves the requested region at this lattice point
                write_scalar(buffer, format, dst, no_value_fill);
                continue;
            }
            pos[solved_dim] = solved;

            let (support_min, support_max) = sampler::support_box(chunks, &pos, interpolation);
            source.ensure_box(&support_min, &support_max).await?;
            let value = sampler::interpolate(&mut source, chunks, &pos, interpolation, sentinel);
            write_scalar(
                buffer,
                format,
                dst,
                substitute(value, sentinel, replacement_no_value),
            );
        }
    }
    Ok(true)
}
