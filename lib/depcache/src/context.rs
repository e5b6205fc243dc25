//! Engine entry point.
//!
//! A [`Depcache`] owns the pieces every cache table shares: the row store,
//! the config registry and the cache root for external blobs. Tables are
//! registered against it:
//!
//! ```text
//! let cache = Depcache::open(store, DepcacheSettings::new("/var/cache/ibeis")).await?;
//! let thumbs = cache.register(thumbnails_descriptor()).await?;
//! let widths = thumbs.get(&parents, "width".into(), &config, true).await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ConfigRegistry;
use crate::descriptor::{ParentLoader, TableDescriptor};
use crate::external::ExternalStore;
use crate::store::RowStore;
use crate::table::CacheTable;
use crate::DepcacheError;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepcacheSettings {
    /// Directory holding the `extern_<table>/` blob directories.
    pub cache_root: PathBuf,
    /// Chunk size for tables that do not declare one. `None` computes every
    /// dirty row of a call in one batch.
    #[serde(default)]
    pub default_chunk_size: Option<usize>,
}

impl DepcacheSettings {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            default_chunk_size: None,
        }
    }

    pub fn default_chunk_size(mut self, chunk_size: usize) -> Self {
        self.default_chunk_size = Some(chunk_size);
        self
    }
}

pub struct Depcache {
    store: Arc<dyn RowStore>,
    registry: Arc<ConfigRegistry>,
    externals: ExternalStore,
    loader: Option<Arc<dyn ParentLoader>>,
    settings: DepcacheSettings,
}

impl Depcache {
    /// Open the engine over `store`, creating the config table if needed.
    pub async fn open(
        store: Arc<dyn RowStore>,
        settings: DepcacheSettings,
    ) -> Result<Self, DepcacheError> {
        let registry = Arc::new(ConfigRegistry::open(store.clone()).await?);
        info!(cache_root = %settings.cache_root.display(), "opened dependency cache");
        Ok(Self {
            store,
            registry,
            externals: ExternalStore::new(settings.cache_root.clone()),
            loader: None,
            settings,
        })
    }

    /// Resolve parent rowids to handles for tables declared `as_object`.
    pub fn with_parent_loader(mut self, loader: Arc<dyn ParentLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Validate a table declaration and bind it to this engine.
    pub async fn register(&self, descriptor: TableDescriptor) -> Result<CacheTable, DepcacheError> {
        CacheTable::register(
            descriptor,
            self.store.clone(),
            self.registry.clone(),
            self.externals.clone(),
            self.loader.clone(),
            self.settings.default_chunk_size,
        )
        .await
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    pub fn settings(&self) -> &DepcacheSettings {
        &self.settings
    }
}
