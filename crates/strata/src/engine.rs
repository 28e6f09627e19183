//! The assembled engine: SQLite-backed catalog and stores, configured
//! capability providers, the sync coordinator and the hybrid searcher.
//!
//! Every CLI command goes through an [`Engine`]; embedding it in another
//! program looks the same:
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use strata::config::load_config;
//! use strata::engine::Engine;
//! use strata_core::search::SearchRequest;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = load_config("config/strata.toml".as_ref())?;
//! let engine = Engine::open(&config).await?;
//! let response = engine
//!     .search(&SearchRequest::new("quick fox"), &CancellationToken::new())
//!     .await;
//! println!("{} results", response.results.len());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strata_core::capability::{EmbeddingScorer, EntityExtractor};
use strata_core::catalog::Catalog;
use strata_core::chunk::Chunker;
use strata_core::clean::ContentCleaner;
use strata_core::embedding::Embedder;
use strata_core::error::EngineResult;
use strata_core::events::{NoopSink, SyncEventSink};
use strata_core::health::SignalHealth;
use strata_core::models::{Document, Source, SourceId};
use strata_core::search::{HybridSearcher, SearchRequest, SearchResponse};
use strata_core::sources::{ActiveSyncs, SourceManager};
use strata_core::sync::{SyncCoordinator, SyncReport, SyncTarget};
use strata_core::writers::IndexWriters;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::entities::HeuristicExtractor;
use crate::extract::OfficeExtractor;
use crate::migrate::run_migrations;
use crate::policy::PathPolicy;
use crate::sqlite_store::{sqlite_indexes, SqliteCatalog};

pub struct Engine {
    pool: SqlitePool,
    catalog: Arc<dyn Catalog>,
    sources: SourceManager,
    coordinator: SyncCoordinator,
    searcher: HybridSearcher,
}

impl Engine {
    /// Open the configured database, run migrations and build the engine
    /// with a no-op sync event sink.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_with_events(config, Arc::new(NoopSink)).await
    }

    pub async fn open_with_events(
        config: &Config,
        events: Arc<dyn SyncEventSink>,
    ) -> Result<Self> {
        let pool = db::connect(config).await?;
        run_migrations(&pool).await?;
        let embedder = create_embedder(&config.embedding)?;
        Self::assemble(config, pool, embedder, events)
    }

    /// Build an engine over an already-migrated pool with an explicit
    /// embedder, bypassing the configured provider.
    pub fn assemble(
        config: &Config,
        pool: SqlitePool,
        embedder: Option<Arc<dyn Embedder>>,
        events: Arc<dyn SyncEventSink>,
    ) -> Result<Self> {
        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::new(pool.clone()));
        let indexes = sqlite_indexes(&pool);
        let health = Arc::new(SignalHealth::new(Duration::from_secs(
            config.embedding.cooldown_secs,
        )));

        let extractor: Option<Arc<dyn EntityExtractor>> = if config.extraction.is_enabled() {
            Some(Arc::new(HeuristicExtractor::new()))
        } else {
            None
        };

        let mut writers = IndexWriters::new(indexes.clone())
            .with_health(health.clone())
            .with_min_confidence(config.extraction.min_confidence)
            .with_embed_batch(config.embedding.batch_size);
        if let Some(embedder) = &embedder {
            writers = writers.with_embedder(embedder.clone());
        }
        if let Some(extractor) = extractor {
            writers = writers.with_extractor(extractor);
        }
        let writers = Arc::new(writers);

        let cleaner = Arc::new(ContentCleaner::new().with_extractor(Box::new(OfficeExtractor)));
        let chunker = Chunker::new(config.chunking.chunker_config());
        let active = Arc::new(ActiveSyncs::new());

        let sources = SourceManager::new(
            catalog.clone(),
            writers.clone(),
            Arc::new(PathPolicy::from_config(&config.policy)),
            active.clone(),
        );
        let coordinator = SyncCoordinator::new(catalog.clone(), writers, cleaner, chunker, active)
            .with_workers(config.sync.workers)
            .with_events(events);

        let mut searcher = HybridSearcher::new(indexes, catalog.clone())
            .with_config(config.retrieval.search_config())
            .with_strategy(config.retrieval.strategy_table()?)
            .with_graph_enabled(config.extraction.is_enabled())
            .with_health(health);
        if let Some(embedder) = embedder {
            debug!(model = embedder.model_name(), dims = embedder.dims(), "vector signal enabled");
            searcher = searcher.with_embedder(embedder.clone());
            if config.retrieval.rerank {
                searcher = searcher.with_scorer(Arc::new(EmbeddingScorer::new(embedder)));
            }
        }

        Ok(Self {
            pool,
            catalog,
            sources,
            coordinator,
            searcher,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn register_source(
        &self,
        path: &Path,
        include: &[String],
        exclude: &[String],
    ) -> EngineResult<Source> {
        self.sources.register_source(path, include, exclude).await
    }

    pub async fn unregister_source(&self, id: &str) -> EngineResult<()> {
        self.sources.unregister_source(id).await
    }

    pub async fn list_sources(&self) -> EngineResult<Vec<Source>> {
        self.sources.list_sources().await
    }

    pub async fn get_source(&self, id: &str) -> EngineResult<Source> {
        self.sources.get_source(id).await
    }

    /// Documents currently cataloged for a source, ordered by path.
    pub async fn documents(&self, source_id: &str) -> Result<Vec<Document>> {
        self.sources.get_source(source_id).await?;
        let mut docs = self.catalog.list_documents(source_id).await?;
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    pub async fn sync(
        &self,
        target: &SyncTarget,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<(SourceId, EngineResult<SyncReport>)>> {
        let results = self.coordinator.sync(target, cancel).await?;
        info!(sources = results.len(), "sync finished");
        Ok(results)
    }

    pub async fn search(&self, req: &SearchRequest, cancel: &CancellationToken) -> SearchResponse {
        self.searcher.search(req, cancel).await
    }
}
