//! Full and incremental sync of a source into the index stores.
//!
//! # Algorithm
//!
//! 1. Claim the source (one sync per source) and mark it `syncing`.
//! 2. Walk the root; a failed walk puts the source in `error` and aborts.
//! 3. For every file, in a bounded worker pool:
//!    - fingerprint = SHA-256(bytes ‖ mtime);
//!    - unchanged and indexed everywhere → skip;
//!    - unchanged but some store failed → rewrite that store from the
//!      chunks already in the catalog;
//!    - new or changed → clean, chunk, diff chunk ids, write new chunks,
//!      retain only current ids, then commit to the catalog.
//! 4. Retire documents whose files vanished. Documents under a path the
//!    walk could not read are kept as they are.
//! 5. Mark the source `synced` (or `error` when cancelled) and report.
//!
//! Store writes always happen before the catalog commit, so a crash midway
//! leaves the old fingerprint in place and the document is redone on the
//! next run. Writes are idempotent, which makes redoing them safe.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::chunk::Chunker;
use crate::clean::ContentCleaner;
use crate::error::{EngineError, EngineResult};
use crate::events::{NoopSink, SyncEvent, SyncEventSink};
use crate::models::{
    ChunkId, Document, DocumentId, DocumentScope, Source, SourceId, SourceState, StoreKind,
    StoreStatus, StoreStatuses,
};
use crate::sources::ActiveSyncs;
use crate::walker::{walk_source, WalkOutcome, WalkedFile};
use crate::writers::{IndexWriters, WritePlan};

/// Content-type label recorded for files the cleaner cannot read.
pub const UNSUPPORTED: &str = "unsupported";

pub const DEFAULT_WORKERS: usize = 4;

/// Which sources a sync covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Source(SourceId),
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreError {
    pub path: String,
    pub store: StoreKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentError {
    pub path: String,
    pub message: String,
}

/// Outcome of one source sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub source_id: SourceId,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Files the cleaner could not turn into text.
    pub skipped: usize,
    pub errored: usize,
    /// Store writes redone for unchanged documents.
    pub retried: usize,
    /// Indexed documents left in place because the walk could not read
    /// where they live.
    pub kept_unreadable: usize,
    pub store_errors: Vec<StoreError>,
    pub errors: Vec<DocumentError>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl SyncReport {
    /// Documents whose stores were written during this sync.
    pub fn changed(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

/// Split the documents missing from `walk` into those whose file is gone
/// and those hidden behind a path the walk could not read.
fn vanished_documents<'a>(
    existing: &'a HashMap<String, Document>,
    walk: &WalkOutcome,
) -> (Vec<&'a Document>, Vec<&'a Document>) {
    let seen: HashSet<&str> = walk.files.iter().map(|f| f.relative.as_str()).collect();
    let mut missing: Vec<&Document> = existing
        .values()
        .filter(|d| !seen.contains(d.path.as_str()))
        .collect();
    missing.sort_by(|a, b| a.path.cmp(&b.path));
    missing.into_iter().partition(|d| !walk.is_obscured(&d.path))
}

/// Stable document id for a path under a source.
pub fn document_id(source_id: &str, relative_path: &str) -> DocumentId {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(relative_path.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// SHA-256 over the file bytes and its modification time.
pub fn fingerprint(bytes: &[u8], modified: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(modified.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

enum Outcome {
    Added,
    Updated,
    Unchanged,
    Skipped,
    Retried(usize),
    Errored(String),
    NotStarted,
}

struct FileResult {
    path: String,
    outcome: Outcome,
    store_errors: Vec<(StoreKind, String)>,
}

impl FileResult {
    fn new(path: &str, outcome: Outcome) -> Self {
        Self {
            path: path.to_string(),
            outcome,
            store_errors: Vec::new(),
        }
    }

    fn errored(path: &str, message: impl std::fmt::Display) -> Self {
        Self::new(path, Outcome::Errored(format!("{:#}", message)))
    }

    fn with_statuses(mut self, stores: &StoreStatuses) -> Self {
        for kind in StoreKind::ALL {
            if let StoreStatus::Failed { message, .. } = stores.get(kind) {
                self.store_errors.push((kind, message.clone()));
            }
        }
        self
    }
}

pub struct SyncCoordinator {
    catalog: Arc<dyn Catalog>,
    writers: Arc<IndexWriters>,
    cleaner: Arc<ContentCleaner>,
    chunker: Chunker,
    active: Arc<ActiveSyncs>,
    events: Arc<dyn SyncEventSink>,
    workers: usize,
}

impl SyncCoordinator {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        writers: Arc<IndexWriters>,
        cleaner: Arc<ContentCleaner>,
        chunker: Chunker,
        active: Arc<ActiveSyncs>,
    ) -> Self {
        Self {
            catalog,
            writers,
            cleaner,
            chunker,
            active,
            events: Arc::new(NoopSink),
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn SyncEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sync every registered source concurrently.
    pub async fn sync_all(
        &self,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<(SourceId, EngineResult<SyncReport>)>> {
        let sources = self.catalog.list_sources().await.map_err(EngineError::Catalog)?;
        let runs = sources.iter().map(|s| async move {
            (s.id.clone(), self.sync_source(&s.id, cancel).await)
        });
        Ok(join_all(runs).await)
    }

    pub async fn sync(
        &self,
        target: &SyncTarget,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<(SourceId, EngineResult<SyncReport>)>> {
        match target {
            SyncTarget::Source(id) => Ok(vec![(id.clone(), self.sync_source(id, cancel).await)]),
            SyncTarget::All => self.sync_all(cancel).await,
        }
    }

    /// Sync one source.
    ///
    /// Fails only when the source is unknown, already syncing, or its root
    /// cannot be walked. Per-document problems are counted in the report.
    pub async fn sync_source(
        &self,
        source_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<SyncReport> {
        let started = Instant::now();
        let _claim = self.active.claim(source_id)?;
        let source = self
            .catalog
            .get_source(source_id)
            .await
            .map_err(EngineError::Catalog)?
            .ok_or_else(|| EngineError::SourceNotFound(source_id.to_string()))?;

        self.set_state(source_id, &SourceState::Syncing, None).await?;

        let walk_target = source.clone();
        let walked = tokio::task::spawn_blocking(move || walk_source(&walk_target))
            .await
            .unwrap_or_else(|e| {
                Err(EngineError::SourceUnreachable {
                    path: source.root.clone(),
                    reason: e.to_string(),
                })
            });
        let walk = match walked {
            Ok(walk) => walk,
            Err(e) => {
                warn!(source_id, error = %e, "sync aborted");
                self.set_state(source_id, &SourceState::Error(e.to_string()), None)
                    .await?;
                self.events.emit(&SyncEvent::Failed {
                    source_id: source_id.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let files = &walk.files;
        let total = files.len();
        info!(
            source_id,
            files = total,
            unreadable = walk.unreadable.len(),
            "sync started"
        );
        self.events.emit(&SyncEvent::Started {
            source_id: source_id.to_string(),
            root: source.root.display().to_string(),
            total,
        });

        let existing: HashMap<String, Document> = self
            .catalog
            .list_documents(source_id)
            .await
            .map_err(EngineError::Catalog)?
            .into_iter()
            .map(|d| (d.path.clone(), d))
            .collect();

        let processed = AtomicUsize::new(0);
        let results: Vec<FileResult> = stream::iter(files.iter())
            .map(|file| {
                let previous = existing.get(&file.relative);
                let (source, processed) = (&source, &processed);
                async move {
                    if cancel.is_cancelled() {
                        return FileResult::new(&file.relative, Outcome::NotStarted);
                    }
                    let result = self.process_file(source, file, previous).await;
                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    self.events.emit(&SyncEvent::Progress {
                        source_id: source.id.clone(),
                        processed: done,
                        total,
                    });
                    result
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut report = SyncReport {
            source_id: source_id.to_string(),
            ..Default::default()
        };
        for result in results {
            for (store, message) in result.store_errors {
                report.store_errors.push(StoreError {
                    path: result.path.clone(),
                    store,
                    message,
                });
            }
            match result.outcome {
                Outcome::Added => report.added += 1,
                Outcome::Updated => report.updated += 1,
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Retried(n) => report.retried += n,
                Outcome::NotStarted => report.cancelled = true,
                Outcome::Errored(message) => {
                    report.errored += 1;
                    report.errors.push(DocumentError {
                        path: result.path,
                        message,
                    });
                }
            }
        }

        report.cancelled |= cancel.is_cancelled();
        if !report.cancelled {
            let (vanished, kept) = vanished_documents(&existing, &walk);
            for doc in &kept {
                warn!(source_id, path = %doc.path, "directory unreadable, keeping document");
            }
            report.kept_unreadable = kept.len();
            for doc in vanished {
                match self.retire_document(doc).await {
                    Ok(()) => report.removed += 1,
                    Err(e) => {
                        report.errored += 1;
                        report.errors.push(DocumentError {
                            path: doc.path.clone(),
                            message: format!("{:#}", e),
                        });
                    }
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        if report.cancelled {
            let state = SourceState::Error("sync cancelled before completion".to_string());
            self.set_state(source_id, &state, None).await?;
        } else {
            let now = chrono::Utc::now().timestamp();
            self.set_state(source_id, &SourceState::Synced, Some(now))
                .await?;
        }

        info!(
            source_id,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            unchanged = report.unchanged,
            skipped = report.skipped,
            errored = report.errored,
            retried = report.retried,
            cancelled = report.cancelled,
            "sync finished"
        );
        self.events.emit(&SyncEvent::Completed {
            report: report.clone(),
        });
        Ok(report)
    }

    async fn set_state(
        &self,
        source_id: &str,
        state: &SourceState,
        synced_at: Option<i64>,
    ) -> EngineResult<()> {
        self.catalog
            .set_source_state(source_id, state, synced_at)
            .await
            .map_err(EngineError::Catalog)
    }

    async fn retire_document(&self, doc: &Document) -> anyhow::Result<()> {
        self.writers.retire(&doc.id).await?;
        self.catalog.delete_document(&doc.id).await?;
        debug!(document = %doc.path, "retired");
        Ok(())
    }

    async fn process_file(
        &self,
        source: &Source,
        file: &WalkedFile,
        previous: Option<&Document>,
    ) -> FileResult {
        let path = file.relative.as_str();
        let bytes = match tokio::fs::read(&file.path).await {
            Ok(b) => b,
            Err(e) => return FileResult::errored(path, e),
        };
        let fingerprint = fingerprint(&bytes, file.modified);

        if let Some(prev) = previous.filter(|p| p.fingerprint == fingerprint) {
            if prev.stores.all_indexed() {
                let outcome = if prev.content_type == UNSUPPORTED {
                    Outcome::Skipped
                } else {
                    Outcome::Unchanged
                };
                return FileResult::new(path, outcome);
            }
            return self.retry_failed_stores(prev).await;
        }

        let mut doc = Document {
            id: document_id(&source.id, path),
            source_id: source.id.clone(),
            path: path.to_string(),
            fingerprint,
            content_type: String::new(),
            size_bytes: file.size,
            modified_at: file.modified,
            last_synced_at: chrono::Utc::now().timestamp(),
            chunk_count: 0,
            stores: StoreStatuses::pending(),
        };

        let cleaner = Arc::clone(&self.cleaner);
        let name = path.to_string();
        let cleaned = match tokio::task::spawn_blocking(move || cleaner.clean(&bytes, &name)).await {
            Ok(Ok(c)) => c,
            Ok(Err(EngineError::UnsupportedContent(reason))) => {
                return self.record_unsupported(doc, previous, &reason).await;
            }
            Ok(Err(e)) => return FileResult::errored(path, e),
            Err(e) => return FileResult::errored(path, e),
        };

        let chunks = self
            .chunker
            .chunk(&doc.id, &cleaned.text, &cleaned.content_type);
        let stored: HashSet<ChunkId> = match previous {
            Some(_) => match self.catalog.get_chunks(&doc.id).await {
                Ok(cs) => cs.into_iter().map(|c| c.id).collect(),
                Err(e) => return FileResult::errored(path, e),
            },
            None => HashSet::new(),
        };
        let new_ids: HashSet<ChunkId> = chunks
            .iter()
            .map(|c| c.id.clone())
            .filter(|id| !stored.contains(id))
            .collect();

        doc.content_type = cleaned.content_type.label();
        doc.chunk_count = chunks.len();
        let prior = previous.map(|p| p.stores.clone()).unwrap_or_default();
        let scope = DocumentScope::of(&doc);
        doc.stores = self
            .writers
            .write(WritePlan {
                scope: &scope,
                chunks: &chunks,
                new_chunk_ids: &new_ids,
                previous: &prior,
                targets: &StoreKind::ALL,
            })
            .await;

        if let Err(e) = self.catalog.commit_document(&doc, &chunks).await {
            return FileResult::errored(path, e);
        }
        debug!(
            document = %path,
            chunks = chunks.len(),
            new = new_ids.len(),
            "indexed"
        );
        let outcome = if previous.is_some() {
            Outcome::Updated
        } else {
            Outcome::Added
        };
        FileResult::new(path, outcome).with_statuses(&doc.stores)
    }

    async fn retry_failed_stores(&self, doc: &Document) -> FileResult {
        let targets = doc.stores.unindexed();
        let chunks = match self.catalog.get_chunks(&doc.id).await {
            Ok(c) => c,
            Err(e) => return FileResult::errored(&doc.path, e),
        };
        debug!(document = %doc.path, stores = ?targets, "retrying failed stores");
        let statuses = self
            .writers
            .write(WritePlan {
                scope: &DocumentScope::of(doc),
                chunks: &chunks,
                new_chunk_ids: &HashSet::new(),
                previous: &doc.stores,
                targets: &targets,
            })
            .await;
        if let Err(e) = self.catalog.set_store_statuses(&doc.id, &statuses).await {
            return FileResult::errored(&doc.path, e);
        }
        FileResult::new(&doc.path, Outcome::Retried(targets.len())).with_statuses(&statuses)
    }

    async fn record_unsupported(
        &self,
        mut doc: Document,
        previous: Option<&Document>,
        reason: &str,
    ) -> FileResult {
        debug!(document = %doc.path, reason, "unsupported content");
        if previous.is_some_and(|p| p.chunk_count > 0) {
            if let Err(e) = self.writers.retire(&doc.id).await {
                return FileResult::errored(&doc.path, e);
            }
        }
        doc.content_type = UNSUPPORTED.to_string();
        doc.stores = StoreStatuses {
            lexical: StoreStatus::Indexed,
            vector: StoreStatus::Indexed,
            graph: StoreStatus::Indexed,
        };
        if let Err(e) = self.catalog.commit_document(&doc, &[]).await {
            return FileResult::errored(&doc.path, e);
        }
        FileResult::new(&doc.path, Outcome::Skipped)
    }
}
