//! Dataset handles and the handle table.
//!
//! A [`Dataset`] bundles an opened volume's layout, store and access
//! manager. The [`HandleTable`] is an explicit uuid-keyed registry with
//! insert-on-open/remove-on-close lifecycle, owned by whatever serves
//! requests rather than living in global state.

use crate::error::{Result, VdsError};
use crate::layout::VolumeLayout;
use crate::manager::{AccessManager, AccessManagerOptions};
use crate::store::VolumeStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

/// An opened volume dataset
pub struct Dataset {
    layout: Arc<VolumeLayout>,
    store: Arc<dyn VolumeStore>,
    manager: AccessManager,
}

fn build_runtime(options: &AccessManagerOptions) -> Result<Arc<Runtime>> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("vds-access-worker");
    if let Some(threads) = options.worker_threads() {
        builder.worker_threads(threads);
    }
    Ok(Arc::new(builder.build().map_err(VdsError::Io)?))
}

impl Dataset {
    /// Create a new dataset: persist the layout and stand up an access
    /// manager over the store
    pub fn create(
        store: Arc<dyn VolumeStore>,
        layout: VolumeLayout,
        options: AccessManagerOptions,
    ) -> Result<Self> {
        let runtime = build_runtime(&options)?;
        {
            let store = Arc::clone(&store);
            let layout = layout.clone();
            runtime.block_on(async move { store.write_layout(&layout).await })?;
        }
        let layout = Arc::new(layout);
        tracing::debug!(layout = %layout.summary(), "created dataset");
        let manager = AccessManager::from_parts(
            runtime,
            Arc::clone(&layout),
            Arc::clone(&store),
            options,
        );
        Ok(Self {
            layout,
            store,
            manager,
        })
    }

    /// Open an existing dataset, reading its layout from the store
    pub fn open(store: Arc<dyn VolumeStore>, options: AccessManagerOptions) -> Result<Self> {
        let runtime = build_runtime(&options)?;
        let layout = {
            let store = Arc::clone(&store);
            runtime
                .block_on(async move { store.read_layout().await })?
                .ok_or_else(|| VdsError::NotFound("dataset has no layout".to_string()))?
        };
        let layout = Arc::new(layout);
        tracing::debug!(layout = %layout.summary(), "opened dataset");
        let manager = AccessManager::from_parts(
            runtime,
            Arc::clone(&layout),
            Arc::clone(&store),
            options,
        );
        Ok(Self {
            layout,
            store,
            manager,
        })
    }

    pub fn layout(&self) -> &Arc<VolumeLayout> {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn VolumeStore> {
        &self.store
    }

    pub fn access_manager(&self) -> &AccessManager {
        &self.manager
    }
}

/// Explicit registry of open datasets keyed by opaque handles
#[derive(Default)]
pub struct HandleTable {
    datasets: RwLock<HashMap<Uuid, Arc<Dataset>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an opened dataset; returns its handle
    pub fn insert(&self, dataset: Dataset) -> Uuid {
        let id = Uuid::new_v4();
        self.datasets.write().insert(id, Arc::new(dataset));
        tracing::debug!(%id, "registered dataset handle");
        id
    }

    /// Look up an open dataset
    pub fn get(&self, id: Uuid) -> Option<Arc<Dataset>> {
        self.datasets.read().get(&id).cloned()
    }

    /// Close a dataset handle. The dataset is dropped once the last
    /// outstanding reference goes away.
    pub fn close(&self, id: Uuid) -> Result<()> {
        match self.datasets.write().remove(&id) {
            Some(_) => {
                tracing::debug!(%id, "closed dataset handle");
                Ok(())
            }
            None => Err(VdsError::NotFound(format!("no open dataset {}", id))),
        }
    }

    pub fn len(&self) -> usize {
        self.datasets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryVolumeStore;
    use crate::types::{AxisDescriptor, ChannelDescriptor, ValueRange, VoxelFormat};

    fn test_volume_layout() -> VolumeLayout {
        let axes = vec![
            AxisDescriptor::new(64, "X", "m", 0.0, 63.0),
            AxisDescriptor::new(64, "Y", "m", 0.0, 63.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            VoxelFormat::R32,
            "Value",
            "",
            ValueRange::new(0.0, 1.0),
        )];
        VolumeLayout::new(axes, channels).unwrap()
    }

    #[test]
    fn test_create_then_open() {
        let store: Arc<dyn VolumeStore> = Arc::new(InMemoryVolumeStore::new());
        let dataset = Dataset::create(
            Arc::clone(&store),
            test_volume_layout(),
            AccessManagerOptions::default().with_worker_threads(2),
        )
        .unwrap();
        assert_eq!(dataset.layout().dimensionality, 2);
        drop(dataset);

        let reopened = Dataset::open(
            store,
            AccessManagerOptions::default().with_worker_threads(2),
        )
        .unwrap();
        assert_eq!(reopened.layout().size(), vec![64, 64]);
    }

    #[test]
    fn test_open_missing_dataset() {
        let store: Arc<dyn VolumeStore> = Arc::new(InMemoryVolumeStore::new());
        assert!(matches!(
            Dataset::open(store, AccessManagerOptions::default()),
            Err(VdsError::NotFound(_))
        ));
    }

    #[test]
    fn test_handle_table_lifecycle() {
        let table = HandleTable::new();
        assert!(table.is_empty());

        let store: Arc<dyn VolumeStore> = Arc::new(InMemoryVolumeStore::new());
        let dataset = Dataset::create(
            store,
            test_volume_layout(),
            AccessManagerOptions::default().with_worker_threads(2),
        )
        .unwrap();

        let id = table.insert(dataset);
        assert_eq!(table.len(), 1);
        assert!(table.get(id).is_some());

        table.close(id).unwrap();
        assert!(table.get(id).is_none());
        assert!(matches!(table.close(id), Err(VdsError::NotFound(_))));
    }
}
