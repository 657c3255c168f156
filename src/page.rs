//! Page accessors - bounded-cache chunk access with commit/write-back.
//!
//! A page accessor checks chunk-sized pages in and out of a cache bounded by
//! `max_pages`. A checked-out [`Page`] owns its buffer, so releasing twice or
//! touching a buffer after release is unrepresentable; release moves the
//! buffer back into the cache, evicting the least-recently-released page
//! above the bound. Evicting or committing a dirty page schedules its write
//! on the manager's upload pipeline; failures surface on the upload-error
//! queue, not from the call.
//!
//! Accessors are single-owner: drive one from one logical thread at a time.

use crate::error::{Result, VdsError};
use crate::layout::ChunkLayout;
use crate::manager::IoPipeline;
use crate::store::{ChunkKey, LayerKey};
use crate::types::{AccessMode, ChannelDescriptor, DIMENSIONALITY_MAX};
use crate::utils::{calculate_checksum, write_scalar};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

static NEXT_ACCESSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Per-chunk record packed into metadata pages on commit
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkMetadataEntry {
    chunk: i64,
    size: u32,
    checksum: u32,
}

struct CachedPage {
    buffer: Vec<u8>,
    dirty: bool,
}

/// A chunk-sized buffer checked out from a [`PageAccessor`].
///
/// The page owns its buffer for the duration of the checkout. Return it with
/// [`PageAccessor::release_page`]; a page that is simply dropped discards
/// any writes it holds.
pub struct Page {
    accessor_id: u64,
    chunk: i64,
    min: [i32; DIMENSIONALITY_MAX],
    max: [i32; DIMENSIONALITY_MAX],
    buffer: Vec<u8>,
    components: usize,
    writable: bool,
    dirty: bool,
}

impl Page {
    /// Index of the chunk this page covers
    pub fn chunk_index(&self) -> i64 {
        self.chunk
    }

    /// The voxel extents this page covers (min inclusive, max exclusive),
    /// clipped at the volume boundary
    pub fn min_max(
        &self,
    ) -> (
        [i32; DIMENSIONALITY_MAX],
        [i32; DIMENSIONALITY_MAX],
    ) {
        (self.min, self.max)
    }

    /// Read access to the page buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access to the page buffer; fails on pages from a read-only
    /// accessor. Marks the page dirty.
    pub fn writable_buffer(&mut self) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(VdsError::ReadOnlyAccess);
        }
        self.dirty = true;
        Ok(&mut self.buffer)
    }

    /// Whether this page holds writes not yet returned to the cache
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Element index (pre-component) of a voxel position within this page,
    /// or None when the position is outside the page extents
    pub fn voxel_index(&self, position: &[i32; DIMENSIONALITY_MAX]) -> Option<usize> {
        for dim in 0..DIMENSIONALITY_MAX {
            if position[dim] < self.min[dim] || position[dim] >= self.max[dim] {
                return None;
            }
        }
        let mut index = 0usize;
        for dim in 0..DIMENSIONALITY_MAX {
            let extent = (self.max[dim] - self.min[dim]) as usize;
            index = index * extent + (position[dim] - self.min[dim]) as usize;
        }
        Some(index * self.components)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if self.dirty {
            tracing::warn!(
                chunk = self.chunk,
                "page dropped without release, uncommitted writes discarded"
            );
        }
    }
}

/// Bounded-cache access to the chunks of one layer
pub struct PageAccessor {
    id: u64,
    layer: LayerKey,
    chunks: ChunkLayout,
    channel: ChannelDescriptor,
    access_mode: AccessMode,
    max_pages: usize,
    chunk_metadata_page_size: usize,
    pipeline: Arc<IoPipeline>,
    // Keeps the manager's runtime alive for blocking fetches even if the
    // accessor outlives the manager handle.
    _runtime: Arc<Runtime>,
    cache: HashMap<i64, CachedPage>,
    lru: VecDeque<i64>,
    checked_out: HashSet<i64>,
    chunk_meta: HashMap<i64, ChunkMetadataEntry>,
}

impl PageAccessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        layer: LayerKey,
        chunks: ChunkLayout,
        channel: ChannelDescriptor,
        access_mode: AccessMode,
        max_pages: usize,
        chunk_metadata_page_size: usize,
        pipeline: Arc<IoPipeline>,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            id: NEXT_ACCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            layer,
            chunks,
            channel,
            access_mode,
            max_pages,
            chunk_metadata_page_size,
            pipeline,
            _runtime: runtime,
            cache: HashMap::new(),
            lru: VecDeque::new(),
            checked_out: HashSet::new(),
            chunk_meta: HashMap::new(),
        }
    }

    pub fn layer(&self) -> LayerKey {
        self.layer
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn channel_descriptor(&self) -> &ChannelDescriptor {
        &self.channel
    }

    pub(crate) fn chunk_layout(&self) -> &ChunkLayout {
        &self.chunks
    }

    /// Total number of chunks addressable by this accessor
    pub fn chunk_count(&self) -> i64 {
        self.chunks.chunk_count()
    }

    /// The voxel extents of a chunk, clipped at the volume boundary
    pub fn chunk_min_max(
        &self,
        chunk: i64,
    ) -> Result<([i32; DIMENSIONALITY_MAX], [i32; DIMENSIONALITY_MAX])> {
        self.chunks.chunk_min_max(chunk)
    }

    /// Index of the chunk containing a voxel position
    pub fn chunk_index(&self, position: &[i32; DIMENSIONALITY_MAX]) -> Result<i64> {
        self.chunks.chunk_index_containing(position)
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Adjust the cache bound, evicting down to the new size if needed
    pub fn set_max_pages(&mut self, max_pages: usize) -> Result<()> {
        if max_pages == 0 {
            return Err(VdsError::Configuration(
                "page accessor needs max_pages >= 1".to_string(),
            ));
        }
        self.max_pages = max_pages;
        self.evict_over_limit();
        Ok(())
    }

    /// Number of released pages currently cached
    pub fn cached_page_count(&self) -> usize {
        self.cache.len()
    }

    /// Number of pages currently checked out
    pub fn checked_out_count(&self) -> usize {
        self.checked_out.len()
    }

    fn page_bytes(&self, chunk: i64) -> Result<usize> {
        Ok(self.chunks.chunk_voxel_count(chunk)? * self.channel.voxel_size_in_bytes())
    }

    /// Buffer contents for a chunk the store has never seen: zeros in
    /// Create mode, the channel sentinel (or zeros) on read paths
    fn blank_page(&self, size: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; size];
        if self.access_mode != AccessMode::Create {
            if let Some(no_value) = self.channel.no_value {
                if no_value != 0.0 {
                    let elements = size / self.channel.format.size_in_bytes();
                    for index in 0..elements {
                        write_scalar(
                            &mut buffer,
                            self.channel.format,
                            index,
                            f64::from(no_value),
                        );
                    }
                }
            }
        }
        buffer
    }

    /// Check out the page for a chunk.
    ///
    /// In ReadOnly/ReadWrite mode this blocks until the chunk's data is
    /// available, fetching through the store when it is not cached; in
    /// Create mode never-written chunks start out zero-initialized. Fails
    /// when the chunk index is out of range, the chunk is already checked
    /// out, or every page slot is checked out.
    pub fn create_page(&mut self, chunk: i64) -> Result<Page> {
        let count = self.chunk_count();
        if chunk < 0 || chunk >= count {
            return Err(VdsError::InvalidChunkIndex {
                index: chunk,
                count,
            });
        }
        if self.checked_out.contains(&chunk) {
            return Err(VdsError::PageAlreadyCheckedOut(chunk));
        }
        if self.checked_out.len() >= self.max_pages {
            return Err(VdsError::CacheFull(self.checked_out.len()));
        }

        let (buffer, dirty) = if let Some(cached) = self.cache.remove(&chunk) {
            self.lru.retain(|c| *c != chunk);
            (cached.buffer, cached.dirty)
        } else {
            let size = self.page_bytes(chunk)?;
            let buffer = match self.access_mode {
                AccessMode::Create => vec![0u8; size],
                AccessMode::ReadOnly | AccessMode::ReadWrite => {
                    let key = ChunkKey::new(self.layer, chunk);
                    let store = Arc::clone(self.pipeline.store());
                    let fetched = self
                        .pipeline
                        .block_on(async move { store.fetch_chunk(&key).await });
                    match fetched {
                        Ok(Some(bytes)) => {
                            if bytes.len() < size {
                                let error = VdsError::Store(format!(
                                    "chunk {} holds {} bytes, expected {}",
                                    key.object_id(),
                                    bytes.len(),
                                    size
                                ));
                                self.pipeline.push_download_error(&key.object_id(), &error);
                                return Err(error);
                            }
                            bytes.to_vec()
                        }
                        Ok(None) => self.blank_page(size),
                        Err(error) => {
                            self.pipeline.push_download_error(&key.object_id(), &error);
                            return Err(error);
                        }
                    }
                }
            };
            (buffer, false)
        };

        let (min, max) = self.chunks.chunk_min_max(chunk)?;
        self.checked_out.insert(chunk);
        Ok(Page {
            accessor_id: self.id,
            chunk,
            min,
            max,
            buffer,
            components: self.channel.components,
            writable: self.access_mode.is_writable(),
            dirty,
        })
    }

    /// Return a page to the cache. The page's buffer moves back under the
    /// accessor's bound; least-recently-released pages are evicted above
    /// `max_pages`, flushing dirty ones through the upload pipeline first.
    pub fn release_page(&mut self, mut page: Page) -> Result<()> {
        if page.accessor_id != self.id {
            return Err(VdsError::Lifecycle(format!(
                "page for chunk {} belongs to another accessor",
                page.chunk
            )));
        }
        if !self.checked_out.remove(&page.chunk) {
            return Err(VdsError::Lifecycle(format!(
                "page for chunk {} is not checked out",
                page.chunk
            )));
        }
        let buffer = std::mem::take(&mut page.buffer);
        let dirty = page.dirty;
        page.dirty = false; // consumed; silence the drop warning
        self.cache.insert(page.chunk, CachedPage { buffer, dirty });
        self.lru.push_back(page.chunk);
        self.evict_over_limit();
        Ok(())
    }

    fn evict_over_limit(&mut self) {
        while self.cache.len() > self.max_pages {
            let Some(chunk) = self.lru.pop_front() else {
                break;
            };
            let Some(cached) = self.cache.remove(&chunk) else {
                continue;
            };
            if cached.dirty {
                // Uncommitted writes are never silently dropped by eviction
                self.schedule_chunk_write(chunk, cached.buffer);
            }
            tracing::debug!(chunk, layer = %self.layer.object_id(), "evicted page");
        }
    }

    fn schedule_chunk_write(&mut self, chunk: i64, buffer: Vec<u8>) {
        let key = ChunkKey::new(self.layer, chunk);
        self.chunk_meta.insert(
            chunk,
            ChunkMetadataEntry {
                chunk,
                size: buffer.len() as u32,
                checksum: calculate_checksum(&buffer),
            },
        );
        self.pipeline
            .record_layer_write(self.layer, self.chunks.chunk_count(), 1);
        let store = Arc::clone(self.pipeline.store());
        self.pipeline.spawn_upload(key.object_id(), async move {
            store.write_chunk(&key, Bytes::from(buffer)).await
        });
    }

    /// Flush all written (released, dirty) pages plus updated chunk
    /// metadata to the store.
    ///
    /// Writes are pipelined: failures surface on the manager's
    /// upload-error queue rather than from this call. Pages still checked
    /// out are not flushed until they are released.
    pub fn commit(&mut self) -> Result<()> {
        if !self.access_mode.is_writable() {
            return Err(VdsError::ReadOnlyAccess);
        }
        let dirty: Vec<i64> = self
            .cache
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(chunk, _)| *chunk)
            .collect();
        tracing::debug!(
            pages = dirty.len(),
            layer = %self.layer.object_id(),
            "committing page accessor"
        );
        for chunk in dirty {
            let buffer = match self.cache.get_mut(&chunk) {
                Some(page) => {
                    page.dirty = false;
                    page.buffer.clone()
                }
                None => continue,
            };
            self.schedule_chunk_write(chunk, buffer);
        }

        // Pack per-chunk metadata into fixed-size pages
        let mut pages: HashMap<usize, Vec<ChunkMetadataEntry>> = HashMap::new();
        for entry in self.chunk_meta.values() {
            let page = entry.chunk as usize / self.chunk_metadata_page_size;
            pages.entry(page).or_default().push(entry.clone());
        }
        for (page, mut entries) in pages {
            entries.sort_by_key(|e| e.chunk);
            let encoded = bincode::serialize(&entries)?;
            let layer = self.layer;
            let store = Arc::clone(self.pipeline.store());
            self.pipeline.spawn_upload(
                format!("{}/meta{:04}", layer.object_id(), page),
                async move {
                    store
                        .write_metadata_page(&layer, page, Bytes::from(encoded))
                        .await
                },
            );
        }
        Ok(())
    }
}

impl Drop for PageAccessor {
    fn drop(&mut self) {
        let dirty = self.cache.values().filter(|page| page.dirty).count();
        if dirty > 0 {
            tracing::warn!(
                pages = dirty,
                layer = %self.layer.object_id(),
                "page accessor destroyed with uncommitted pages, writes discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BrickSize, VolumeLayout};
    use crate::manager::{AccessManager, AccessManagerOptions};
    use crate::store::{InMemoryVolumeStore, VolumeStore};
    use crate::types::{AxisDescriptor, DimensionsND, ValueRange, VoxelFormat};
    use crate::utils::read_scalar;

    fn test_manager() -> (AccessManager, Arc<InMemoryVolumeStore>) {
        let axes = vec![
            AxisDescriptor::new(6, "X", "m", 0.0, 5.0),
            AxisDescriptor::new(4, "Y", "m", 0.0, 3.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            VoxelFormat::U16,
            "Value",
            "",
            ValueRange::new(0.0, 65535.0),
        )];
        let layout = Arc::new(
            VolumeLayout::new(axes, channels)
                .unwrap()
                .with_brick_size(BrickSize::new([4, 4, 1, 1, 1, 1])),
        );
        let store = Arc::new(InMemoryVolumeStore::new());
        let manager = AccessManager::with_options(
            layout,
            Arc::<InMemoryVolumeStore>::clone(&store) as Arc<dyn VolumeStore>,
            AccessManagerOptions::default().with_worker_threads(2),
        )
        .unwrap();
        (manager, store)
    }

    fn create_accessor(manager: &AccessManager, mode: AccessMode, max_pages: usize) -> PageAccessor {
        manager
            .create_page_accessor(DimensionsND::Dimensions01, 0, 0, max_pages, mode, 1024)
            .unwrap()
    }

    #[test]
    fn test_chunk_geometry() {
        let (manager, _store) = test_manager();
        let accessor = create_accessor(&manager, AccessMode::ReadOnly, 4);
        assert_eq!(accessor.chunk_count(), 2);
        let (min, max) = accessor.chunk_min_max(1).unwrap();
        assert_eq!(&min[..2], &[4, 0]);
        assert_eq!(&max[..2], &[6, 4]); // clipped at the 6-sample boundary
        assert_eq!(accessor.chunk_index(&[5, 2, 0, 0, 0, 0]).unwrap(), 1);
    }

    #[test]
    fn test_create_page_validation() {
        let (manager, _store) = test_manager();
        let mut accessor = create_accessor(&manager, AccessMode::Create, 4);

        assert!(matches!(
            accessor.create_page(2),
            Err(VdsError::InvalidChunkIndex { index: 2, count: 2 })
        ));
        assert!(matches!(
            accessor.create_page(-1),
            Err(VdsError::InvalidChunkIndex { .. })
        ));

        let page = accessor.create_page(0).unwrap();
        assert!(matches!(
            accessor.create_page(0),
            Err(VdsError::PageAlreadyCheckedOut(0))
        ));
        accessor.release_page(page).unwrap();
    }

    #[test]
    fn test_cache_full_when_all_pages_checked_out() {
        let (manager, _store) = test_manager();
        let mut accessor = create_accessor(&manager, AccessMode::Create, 1);
        let page = accessor.create_page(0).unwrap();
        assert!(matches!(
            accessor.create_page(1),
            Err(VdsError::CacheFull(1))
        ));
        accessor.release_page(page).unwrap();
        let page = accessor.create_page(1).unwrap();
        accessor.release_page(page).unwrap();
    }

    #[test]
    fn test_read_only_page_rejects_writes() {
        let (manager, _store) = test_manager();
        let mut accessor = create_accessor(&manager, AccessMode::ReadOnly, 4);
        let mut page = accessor.create_page(0).unwrap();
        assert!(matches!(
            page.writable_buffer(),
            Err(VdsError::ReadOnlyAccess)
        ));
        assert!(matches!(accessor.commit(), Err(VdsError::ReadOnlyAccess)));
        accessor.release_page(page).unwrap();
    }

    #[test]
    fn test_release_foreign_page_fails() {
        let (manager, _store) = test_manager();
        let mut first = create_accessor(&manager, AccessMode::Create, 4);
        let mut second = create_accessor(&manager, AccessMode::Create, 4);
        let page = first.create_page(0).unwrap();
        assert!(matches!(
            second.release_page(page),
            Err(VdsError::Lifecycle(_))
        ));
        // The failed release consumed the page handle; the chunk stays
        // checked out of the first accessor.
        assert_eq!(first.checked_out_count(), 1);
    }

    #[test]
    fn test_write_commit_read_back() {
        let (manager, store) = test_manager();
        let mut writer = create_accessor(&manager, AccessMode::Create, 4);

        for chunk in 0..writer.chunk_count() {
            let mut page = writer.create_page(chunk).unwrap();
            let (min, max) = page.min_max();
            let width = (max[1] - min[1]) as usize;
            let buffer = page.writable_buffer().unwrap();
            for x in min[0]..max[0] {
                for y in min[1]..max[1] {
                    let local = (x - min[0]) as usize * width + (y - min[1]) as usize;
                    let value = (x * 4 + y) as f64;
                    crate::utils::write_scalar(buffer, VoxelFormat::U16, local, value);
                }
            }
            writer.release_page(page).unwrap();
        }
        writer.commit().unwrap();
        manager.flush_upload_queue(true);
        assert_eq!(manager.upload_error_count(), 0);
        // Two chunks plus one metadata page
        assert_eq!(store.object_count(), 3);

        let mut reader = create_accessor(&manager, AccessMode::ReadOnly, 4);
        let page = reader.create_page(1).unwrap();
        let (min, max) = page.min_max();
        let index = page.voxel_index(&[5, 2, 0, 0, 0, 0]).unwrap();
        assert!(min[0] <= 5 && 5 < max[0]);
        assert_eq!(read_scalar(page.buffer(), VoxelFormat::U16, index), 22.0);
        reader.release_page(page).unwrap();
    }

    #[test]
    fn test_eviction_bound_and_dirty_flush() {
        let axes = vec![
            AxisDescriptor::new(32, "X", "m", 0.0, 31.0),
            AxisDescriptor::new(4, "Y", "m", 0.0, 3.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            VoxelFormat::U16,
            "Value",
            "",
            ValueRange::new(0.0, 65535.0),
        )];
        let layout = Arc::new(
            VolumeLayout::new(axes, channels)
                .unwrap()
                .with_brick_size(BrickSize::new([4, 4, 1, 1, 1, 1])),
        );
        let store = Arc::new(InMemoryVolumeStore::new());
        let manager = AccessManager::with_options(
            layout,
            Arc::<InMemoryVolumeStore>::clone(&store) as Arc<dyn VolumeStore>,
            AccessManagerOptions::default().with_worker_threads(2),
        )
        .unwrap();

        let max_pages = 3;
        let mut accessor = manager
            .create_page_accessor(
                DimensionsND::Dimensions01,
                0,
                0,
                max_pages,
                AccessMode::Create,
                1024,
            )
            .unwrap();
        assert_eq!(accessor.chunk_count(), 8);

        for chunk in 0..accessor.chunk_count() {
            let mut page = accessor.create_page(chunk).unwrap();
            page.writable_buffer().unwrap()[0] = chunk as u8 + 1;
            accessor.release_page(page).unwrap();
            assert!(accessor.cached_page_count() <= max_pages);
        }

        // Evicted dirty pages were flushed, not dropped
        manager.flush_upload_queue(false);
        assert_eq!(manager.upload_error_count(), 0);
        assert_eq!(
            store.object_count(),
            (accessor.chunk_count() as usize) - max_pages
        );

        // Commit flushes the still-cached remainder
        accessor.commit().unwrap();
        manager.flush_upload_queue(false);
        assert!(store.object_count() >= accessor.chunk_count() as usize);
    }

    #[test]
    fn test_set_max_pages_evicts_down() {
        let (manager, _store) = test_manager();
        let mut accessor = create_accessor(&manager, AccessMode::Create, 4);
        for chunk in 0..2 {
            let page = accessor.create_page(chunk).unwrap();
            accessor.release_page(page).unwrap();
        }
        assert_eq!(accessor.cached_page_count(), 2);
        accessor.set_max_pages(1).unwrap();
        assert_eq!(accessor.cached_page_count(), 1);
        assert!(accessor.set_max_pages(0).is_err());
    }

    #[test]
    fn test_page_outlives_accessor() {
        let (manager, _store) = test_manager();
        let mut accessor = create_accessor(&manager, AccessMode::ReadOnly, 4);
        let page = accessor.create_page(0).unwrap();
        drop(accessor);
        // The page owns its buffer, so no dangling view is expressible;
        // reads stay valid and the buffer is discarded when the page drops.
        assert_eq!(page.buffer().len(), 4 * 4 * 2);
        assert!(page.voxel_index(&[3, 3, 0, 0, 0, 0]).is_some());
        assert!(page.voxel_index(&[4, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_blank_read_page_uses_no_value() {
        let axes = vec![
            AxisDescriptor::new(4, "X", "m", 0.0, 3.0),
            AxisDescriptor::new(2, "Y", "m", 0.0, 1.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            VoxelFormat::R32,
            "Value",
            "",
            ValueRange::new(-1.0, 1.0),
        )
        .with_no_value(-999.25)];
        let layout = Arc::new(
            VolumeLayout::new(axes, channels)
                .unwrap()
                .with_brick_size(BrickSize::new([4, 2, 1, 1, 1, 1])),
        );
        let store = Arc::new(InMemoryVolumeStore::new());
        let manager = AccessManager::with_options(
            layout,
            store as Arc<dyn VolumeStore>,
            AccessManagerOptions::default().with_worker_threads(2),
        )
        .unwrap();

        let mut accessor = manager
            .create_page_accessor(
                DimensionsND::Dimensions01,
                0,
                0,
                2,
                AccessMode::ReadOnly,
                1024,
            )
            .unwrap();
        let page = accessor.create_page(0).unwrap();
        assert_eq!(read_scalar(page.buffer(), VoxelFormat::R32, 0), -999.25);
        accessor.release_page(page).unwrap();
    }
}
