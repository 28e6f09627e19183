//! Source registration and removal.
//!
//! A source moves through `never_synced → syncing → synced`, or into
//! `error` when a walk fails or a sync is cancelled. Registration asks the
//! [`Authorizer`] first and records the read paths it grants; unregistering
//! retires every document from all three stores before the source row is
//! dropped.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::capability::Authorizer;
use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::models::{Source, SourceId, SourceState};
use crate::walker::build_globset;
use crate::writers::IndexWriters;

/// In-process registry of sources with a sync (or removal) in flight.
#[derive(Debug, Default)]
pub struct ActiveSyncs {
    running: Mutex<HashSet<SourceId>>,
}

impl ActiveSyncs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `source_id`; fails with [`EngineError::SyncInProgress`] if it
    /// is already claimed. The claim is released when the guard drops.
    pub fn claim(self: &Arc<Self>, source_id: &str) -> EngineResult<ActiveGuard> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(source_id.to_string()) {
            return Err(EngineError::SyncInProgress(source_id.to_string()));
        }
        Ok(ActiveGuard {
            registry: Arc::clone(self),
            source_id: source_id.to_string(),
        })
    }

    pub fn is_active(&self, source_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(source_id)
    }
}

#[derive(Debug)]
pub struct ActiveGuard {
    registry: Arc<ActiveSyncs>,
    source_id: SourceId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.source_id);
    }
}

fn new_source_id() -> SourceId {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

pub struct SourceManager {
    catalog: Arc<dyn Catalog>,
    writers: Arc<IndexWriters>,
    authorizer: Arc<dyn Authorizer>,
    active: Arc<ActiveSyncs>,
}

impl SourceManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        writers: Arc<IndexWriters>,
        authorizer: Arc<dyn Authorizer>,
        active: Arc<ActiveSyncs>,
    ) -> Self {
        Self {
            catalog,
            writers,
            authorizer,
            active,
        }
    }

    /// Register a directory or file as a source.
    pub async fn register_source(
        &self,
        path: &Path,
        include: &[String],
        exclude: &[String],
    ) -> EngineResult<Source> {
        let root = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| EngineError::SourceUnreachable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let decision = self.authorizer.authorize(&root);
        if !decision.allowed {
            return Err(EngineError::PolicyDenied(root));
        }

        build_globset(include)?;
        build_globset(exclude)?;

        if let Some(existing) = self
            .catalog
            .find_source_by_root(&root)
            .await
            .map_err(EngineError::Catalog)?
        {
            return Err(EngineError::SourceAlreadyRegistered {
                id: existing.id,
                path: root,
            });
        }

        let source = Source {
            id: new_source_id(),
            root,
            include: include.to_vec(),
            exclude: exclude.to_vec(),
            allowed_paths: decision.readonly_paths,
            state: SourceState::NeverSynced,
            created_at: chrono::Utc::now().timestamp(),
            last_synced_at: None,
        };
        self.catalog
            .insert_source(&source)
            .await
            .map_err(EngineError::Catalog)?;
        info!(source_id = %source.id, root = %source.root.display(), "registered source");
        Ok(source)
    }

    /// Remove a source and everything indexed from it. Refused while a sync
    /// of the source is running.
    pub async fn unregister_source(&self, id: &str) -> EngineResult<()> {
        let _claim = self.active.claim(id)?;
        self.get_source(id).await?;

        let documents = self
            .catalog
            .list_documents(id)
            .await
            .map_err(EngineError::Catalog)?;
        for doc in &documents {
            self.writers
                .retire(&doc.id)
                .await
                .map_err(EngineError::Catalog)?;
            self.catalog
                .delete_document(&doc.id)
                .await
                .map_err(EngineError::Catalog)?;
        }
        self.catalog
            .delete_source(id)
            .await
            .map_err(EngineError::Catalog)?;
        info!(source_id = %id, documents = documents.len(), "unregistered source");
        Ok(())
    }

    pub async fn list_sources(&self) -> EngineResult<Vec<Source>> {
        self.catalog.list_sources().await.map_err(EngineError::Catalog)
    }

    pub async fn get_source(&self, id: &str) -> EngineResult<Source> {
        self.catalog
            .get_source(id)
            .await
            .map_err(EngineError::Catalog)?
            .ok_or_else(|| EngineError::SourceNotFound(id.to_string()))
    }
}
