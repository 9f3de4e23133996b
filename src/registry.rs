use crate::artifact_store::ArtifactStoreClient;
use crate::db::PersistenceGateway;
use crate::handler_runtime::{HandlerRuntime, LoadedHandler};
use log::{error, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler load failed: {0}")]
    LoadFailed(String),
}

/// Handler Registry & Cache (C3). The durable token -> handler_name table
/// lives in the Persistence Gateway; this struct owns the in-memory
/// handler_name -> loaded-handler cache and the local directory that mirrors
/// artifact-store content for fast (re)loading.
pub struct HandlerRegistry {
    db: Arc<PersistenceGateway>,
    artifact_store: Arc<ArtifactStoreClient>,
    runtime: Arc<HandlerRuntime>,
    local_dir: PathBuf,
    cache: RwLock<std::collections::HashMap<String, Arc<LoadedHandler>>>,
}

impl HandlerRegistry {
    pub fn new(
        db: Arc<PersistenceGateway>,
        artifact_store: Arc<ArtifactStoreClient>,
        runtime: Arc<HandlerRuntime>,
        local_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            artifact_store,
            runtime,
            local_dir,
            cache: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn lookup(&self, token: &str) -> Option<String> {
        self.db.registry_lookup(token).await.ok().flatten().map(|e| e.handler_name)
    }

    pub async fn exists(&self, token: &str) -> bool {
        self.db.registry_exists(token).await.unwrap_or(false)
    }

    pub async fn register(
        &self,
        token: &str,
        handler_name: &str,
        creator_id: i64,
    ) -> Result<(), crate::db::DbError> {
        self.db.registry_register(token, handler_name, creator_id).await
    }

    pub async fn count_created_by(&self, user_id: i64, since: chrono::DateTime<chrono::Utc>) -> i64 {
        self.db.registry_count_created_by(user_id, since).await.unwrap_or(0)
    }

    fn local_path(&self, handler_name: &str) -> PathBuf {
        self.local_dir.join(format!("{}.rhai", handler_name))
    }

    /// Memoized load of `handler_name`. On any failure — source-fetch,
    /// parse, or capability probe — quarantines: deletes the local source
    /// file, the registry row, and the in-memory cache entry (§4.3).
    pub async fn load(&self, handler_name: &str) -> Result<Arc<LoadedHandler>, RegistryError> {
        if let Some(handler) = self.cache.read().await.get(handler_name) {
            return Ok(handler.clone());
        }

        match self.load_uncached(handler_name).await {
            Ok(handler) => {
                let handler = Arc::new(handler);
                self.cache.write().await.insert(handler_name.to_string(), handler.clone());
                Ok(handler)
            }
            Err(e) => {
                self.quarantine(handler_name, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn load_uncached(&self, handler_name: &str) -> Result<LoadedHandler, RegistryError> {
        let local_path = self.local_path(handler_name);
        let source = if local_path.exists() {
            tokio::fs::read_to_string(&local_path)
                .await
                .map_err(|e| RegistryError::LoadFailed(e.to_string()))?
        } else {
            let remote_path = ArtifactStoreClient::handler_path(handler_name);
            let (content, _version) = self
                .artifact_store
                .get(&remote_path)
                .await
                .map_err(|e| RegistryError::LoadFailed(e.to_string()))?
                .ok_or_else(|| RegistryError::LoadFailed("artifact missing".to_string()))?;
            if let Some(parent) = local_path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let _ = tokio::fs::write(&local_path, &content).await;
            content
        };

        self.runtime
            .load(handler_name, &source)
            .map_err(|e| RegistryError::LoadFailed(e.to_string()))
    }

    async fn quarantine(&self, handler_name: &str, reason: &str) {
        warn!("quarantining handler {}: {}", handler_name, reason);
        let local_path = self.local_path(handler_name);
        if let Err(e) = tokio::fs::remove_file(&local_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("failed to remove quarantined source {:?}: {}", local_path, e);
            }
        }
        if let Err(e) = self.db.registry_delete_by_handler_name(handler_name).await {
            error!("failed to remove registry row for {}: {}", handler_name, e);
        }
        self.cache.write().await.remove(handler_name);
    }

    /// Periodic directory sync (§4.3): removes cache entries whose backing
    /// file has disappeared, and eagerly loads new files in sorted order.
    pub async fn sync_directory(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.local_dir).await else {
            return;
        };
        let mut on_disk = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = stem_of(&entry.path()) {
                on_disk.push(name);
            }
        }
        on_disk.sort();
        let on_disk_set: HashSet<String> = on_disk.iter().cloned().collect();

        let cached_names: Vec<String> = self.cache.read().await.keys().cloned().collect();
        for name in cached_names {
            if !on_disk_set.contains(&name) {
                self.cache.write().await.remove(&name);
            }
        }

        for name in on_disk {
            if !self.cache.read().await.contains_key(&name) {
                if let Err(e) = self.load(&name).await {
                    warn!("failed to eagerly load {} during directory sync: {}", name, e);
                }
            }
        }

        if let Err(e) = self.db.events_reap_expired().await {
            warn!("events retention sweep failed: {}", e);
        } else {
            info!("events retention sweep completed");
        }
    }
}

fn stem_of(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != "rhai" {
        return None;
    }
    path.file_stem()?.to_str().map(|s| s.to_string())
}
