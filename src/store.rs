//! The volume store seam and its bundled backends.
//!
//! The access core only ever talks to chunk storage through the
//! [`VolumeStore`] trait: fetch/write/produce chunks, persist layout and
//! per-layer status documents. Cloud backends implement this trait in the
//! consuming application; the in-memory and filesystem backends here cover
//! tests, fixtures and local datasets.

use crate::compression::{self, CompressionLevel, CompressionMethod};
use crate::error::{Result, VdsError};
use crate::layout::VolumeLayout;
use crate::types::DimensionsND;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Identifies one layer: a (dimension group, LOD, channel) slice of the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerKey {
    pub dimensions: DimensionsND,
    pub lod: usize,
    pub channel: usize,
}

impl LayerKey {
    pub fn new(dimensions: DimensionsND, lod: usize, channel: usize) -> Self {
        Self {
            dimensions,
            lod,
            channel,
        }
    }

    /// Store object prefix for this layer
    pub fn object_id(&self) -> String {
        format!(
            "layers/dim{}/lod{}/c{}",
            self.dimensions.short_name(),
            self.lod,
            self.channel
        )
    }
}

/// Identifies one chunk within a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub layer: LayerKey,
    pub chunk: i64,
}

impl ChunkKey {
    pub fn new(layer: LayerKey, chunk: i64) -> Self {
        Self { layer, chunk }
    }

    /// Store object identifier for this chunk
    pub fn object_id(&self) -> String {
        format!("{}/chunks/{:08}", self.layer.object_id(), self.chunk)
    }
}

/// Production status of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProduceStatus {
    /// No chunks have been produced for this layer
    Unavailable,
    /// Chunks exist but need remapping from another layer
    Remapped,
    /// The layer is directly readable
    Normal,
}

/// Per-layer production metadata, persisted on commit/flush
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStatus {
    pub produce_status: ProduceStatus,
    /// Total chunks addressable in the layer
    pub chunk_count: i64,
    /// Chunks written through the upload pipeline so far
    pub written_chunks: u64,
    /// Last status update
    pub updated: DateTime<Utc>,
}

/// Narrow interface the access core consumes from chunk storage
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Read the persisted volume layout, if the dataset exists
    async fn read_layout(&self) -> Result<Option<VolumeLayout>>;

    /// Persist the volume layout
    async fn write_layout(&self, layout: &VolumeLayout) -> Result<()>;

    /// Fetch a chunk's raw voxel bytes; None when never written
    async fn fetch_chunk(&self, key: &ChunkKey) -> Result<Option<Bytes>>;

    /// Write a chunk's raw voxel bytes
    async fn write_chunk(&self, key: &ChunkKey, data: Bytes) -> Result<()>;

    /// Force production of a chunk without returning its data (cache warming)
    async fn produce_chunk(&self, key: &ChunkKey) -> Result<()>;

    /// Write one packed chunk-metadata page for a layer
    async fn write_metadata_page(&self, layer: &LayerKey, page: usize, data: Bytes) -> Result<()>;

    /// Read a layer's production status, if one has been persisted
    async fn read_layer_status(&self, layer: &LayerKey) -> Result<Option<LayerStatus>>;

    /// Persist a layer's production status
    async fn write_layer_status(&self, layer: &LayerKey, status: &LayerStatus) -> Result<()>;
}

/// In-memory volume store for tests and fixtures.
///
/// Write failures can be injected to exercise the upload-error paths.
#[derive(Default)]
pub struct InMemoryVolumeStore {
    layout: RwLock<Option<VolumeLayout>>,
    objects: RwLock<HashMap<String, Bytes>>,
    layer_status: RwLock<HashMap<LayerKey, LayerStatus>>,
    produced: RwLock<HashSet<String>>,
    fail_writes: AtomicUsize,
}

impl InMemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` chunk/metadata writes fail with a store error
    pub fn inject_write_failures(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Number of chunks produced through `produce_chunk`
    pub fn produced_chunk_count(&self) -> usize {
        self.produced.read().len()
    }

    /// Number of objects (chunks + metadata pages) currently stored
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn take_write_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl VolumeStore for InMemoryVolumeStore {
    async fn read_layout(&self) -> Result<Option<VolumeLayout>> {
        Ok(self.layout.read().clone())
    }

    async fn write_layout(&self, layout: &VolumeLayout) -> Result<()> {
        *self.layout.write() = Some(layout.clone());
        Ok(())
    }

    async fn fetch_chunk(&self, key: &ChunkKey) -> Result<Option<Bytes>> {
        Ok(self.objects.read().get(&key.object_id()).cloned())
    }

    async fn write_chunk(&self, key: &ChunkKey, data: Bytes) -> Result<()> {
        if self.take_write_failure() {
            return Err(VdsError::Store(format!(
                "injected write failure for {}",
                key.object_id()
            )));
        }
        self.objects.write().insert(key.object_id(), data);
        Ok(())
    }

    async fn produce_chunk(&self, key: &ChunkKey) -> Result<()> {
        self.produced.write().insert(key.object_id());
        Ok(())
    }

    async fn write_metadata_page(&self, layer: &LayerKey, page: usize, data: Bytes) -> Result<()> {
        if self.take_write_failure() {
            return Err(VdsError::Store(format!(
                "injected write failure for {}/meta{}",
                layer.object_id(),
                page
            )));
        }
        self.objects
            .write()
            .insert(format!("{}/meta{:04}", layer.object_id(), page), data);
        Ok(())
    }

    async fn read_layer_status(&self, layer: &LayerKey) -> Result<Option<LayerStatus>> {
        Ok(self.layer_status.read().get(layer).cloned())
    }

    async fn write_layer_status(&self, layer: &LayerKey, status: &LayerStatus) -> Result<()> {
        self.layer_status.write().insert(*layer, status.clone());
        Ok(())
    }
}

/// Local filesystem volume store. One file per chunk object, layout and
/// layer status as JSON documents, chunk payloads run through the
/// configured codec.
pub struct FileVolumeStore {
    base_path: PathBuf,
    method: CompressionMethod,
    level: CompressionLevel,
}

impl FileVolumeStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            method: CompressionMethod::Zstd,
            level: CompressionLevel::default(),
        }
    }

    /// Set the chunk payload compression method
    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.method = method;
        self.level = level;
        self
    }

    fn full_path(&self, object_id: &str) -> PathBuf {
        self.base_path.join(object_id)
    }

    async fn write_object(&self, object_id: &str, data: &[u8]) -> Result<()> {
        let path = self.full_path(object_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(VdsError::Io)?;
        }
        let mut file = fs::File::create(&path).await.map_err(VdsError::Io)?;
        file.write_all(data).await.map_err(VdsError::Io)?;
        Ok(())
    }

    async fn read_object(&self, object_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.full_path(object_id);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VdsError::Io(e)),
        }
    }
}

#[async_trait]
impl VolumeStore for FileVolumeStore {
    async fn read_layout(&self) -> Result<Option<VolumeLayout>> {
        match self.read_object("layout.json").await? {
            Some(data) => {
                let layout: VolumeLayout = serde_json::from_slice(&data)
                    .map_err(|e| VdsError::Metadata(e.to_string()))?;
                Ok(Some(layout))
            }
            None => Ok(None),
        }
    }

    async fn write_layout(&self, layout: &VolumeLayout) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(layout).map_err(|e| VdsError::Metadata(e.to_string()))?;
        self.write_object("layout.json", &json).await
    }

    async fn fetch_chunk(&self, key: &ChunkKey) -> Result<Option<Bytes>> {
        match self.read_object(&key.object_id()).await? {
            Some(data) => {
                let raw = compression::decompress(self.method, &data, None)?;
                Ok(Some(Bytes::from(raw)))
            }
            None => Ok(None),
        }
    }

    async fn write_chunk(&self, key: &ChunkKey, data: Bytes) -> Result<()> {
        let payload = compression::compress(self.method, self.level, &data)?;
        self.write_object(&key.object_id(), &payload).await
    }

    async fn produce_chunk(&self, key: &ChunkKey) -> Result<()> {
        // Warm the OS page cache; the chunk itself stays in the store.
        let _ = self.read_object(&key.object_id()).await?;
        Ok(())
    }

    async fn write_metadata_page(&self, layer: &LayerKey, page: usize, data: Bytes) -> Result<()> {
        self.write_object(&format!("{}/meta{:04}", layer.object_id(), page), &data)
            .await
    }

    async fn read_layer_status(&self, layer: &LayerKey) -> Result<Option<LayerStatus>> {
        match self
            .read_object(&format!("{}/status.json", layer.object_id()))
            .await?
        {
            Some(data) => {
                let status: LayerStatus = serde_json::from_slice(&data)
                    .map_err(|e| VdsError::Metadata(e.to_string()))?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    async fn write_layer_status(&self, layer: &LayerKey, status: &LayerStatus) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(status).map_err(|e| VdsError::Metadata(e.to_string()))?;
        self.write_object(&format!("{}/status.json", layer.object_id()), &json)
            .await
    }
}
