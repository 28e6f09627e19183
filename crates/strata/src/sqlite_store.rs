//! SQLite-backed catalog and index stores.
//!
//! All four share one [`SqlitePool`] and the schema created by
//! [`run_migrations`](crate::migrate::run_migrations):
//!
//! | Type | Tables |
//! |------|--------|
//! | [`SqliteCatalog`] | `sources`, `documents`, `document_store_status`, `chunks` |
//! | [`SqliteLexicalIndex`] | `chunks_fts` (FTS5, BM25 via `rank`) |
//! | [`SqliteVectorIndex`] | `chunk_vectors` (brute-force cosine over BLOBs) |
//! | [`SqliteGraphIndex`] | `entities`, `entity_mentions`, `relations` |
//!
//! The index tables carry their own scope columns so search filters never
//! join against the catalog.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use strata_core::catalog::{Catalog, ChunkRecord};
use strata_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use strata_core::models::{
    entity_key, Chunk, ChunkEntities, ChunkId, ChunkKind, Document, DocumentScope, Source,
    SourceState, StoreKind, StoreStatus, StoreStatuses,
};
use strata_core::store::{
    is_stopword, rank_mentions, sort_candidates, tokenize, ChunkCandidate, ChunkVector,
    GraphIndex, Indexes, LexicalIndex, MatchMode, Mention, SearchFilter, VectorIndex,
};

/// Bound on host parameters per `IN (...)` list.
const MAX_BIND: usize = 500;

/// All three SQLite index stores over one pool.
pub fn sqlite_indexes(pool: &SqlitePool) -> Indexes {
    Indexes {
        lexical: Arc::new(SqliteLexicalIndex::new(pool.clone())),
        vector: Arc::new(SqliteVectorIndex::new(pool.clone())),
        graph: Arc::new(SqliteGraphIndex::new(pool.clone())),
    }
}

fn scope_of(row: &SqliteRow) -> DocumentScope {
    DocumentScope {
        document_id: row.get("document_id"),
        source_id: row.get("source_id"),
        path: row.get("path"),
        content_type: row.get("content_type"),
    }
}

// ============ Catalog ============

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_source(row: &SqliteRow) -> Result<Source> {
    let root: String = row.get("root");
    let include: String = row.get("include_json");
    let exclude: String = row.get("exclude_json");
    let allowed: String = row.get("allowed_json");
    let state: String = row.get("state");
    Ok(Source {
        id: row.get("id"),
        root: PathBuf::from(root),
        include: serde_json::from_str(&include).context("corrupt include patterns")?,
        exclude: serde_json::from_str(&exclude).context("corrupt exclude patterns")?,
        allowed_paths: serde_json::from_str(&allowed).context("corrupt allowed paths")?,
        state: SourceState::from_parts(&state, row.get("state_message")),
        created_at: row.get("created_at"),
        last_synced_at: row.get("last_synced_at"),
    })
}

fn row_to_document(row: &SqliteRow) -> Document {
    let size: i64 = row.get("size_bytes");
    let chunk_count: i64 = row.get("chunk_count");
    Document {
        id: row.get("id"),
        source_id: row.get("source_id"),
        path: row.get("path"),
        fingerprint: row.get("fingerprint"),
        content_type: row.get("content_type"),
        size_bytes: size.max(0) as u64,
        modified_at: row.get("modified_at"),
        last_synced_at: row.get("last_synced_at"),
        chunk_count: chunk_count.max(0) as usize,
        stores: StoreStatuses::pending(),
    }
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let ordinal: i64 = row.get("ordinal");
    let start: i64 = row.get("start_offset");
    let end: i64 = row.get("end_offset");
    let overlap_start: i64 = row.get("overlap_start");
    let tokens: i64 = row.get("token_estimate");
    let kind: String = row.get("kind");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        ordinal: ordinal as usize,
        start: start as usize,
        end: end as usize,
        overlap_start: overlap_start as usize,
        text: row.get("text"),
        kind: ChunkKind::parse(&kind),
        token_estimate: tokens as usize,
        hash: row.get("hash"),
        prev_id: row.get("prev_id"),
        next_id: row.get("next_id"),
    }
}

fn status_parts(status: &StoreStatus) -> (&'static str, Option<&str>, i64) {
    match status {
        StoreStatus::Pending => ("pending", None, 0),
        StoreStatus::Indexed => ("indexed", None, 0),
        StoreStatus::Failed { message, attempts } => ("failed", Some(message.as_str()), *attempts as i64),
    }
}

fn status_from_parts(status: &str, message: Option<String>, attempts: i64) -> StoreStatus {
    match status {
        "indexed" => StoreStatus::Indexed,
        "failed" => StoreStatus::Failed {
            message: message.unwrap_or_default(),
            attempts: attempts.max(0) as u32,
        },
        _ => StoreStatus::Pending,
    }
}

const DOCUMENT_COLUMNS: &str = "id, source_id, path, fingerprint, content_type, size_bytes, \
     modified_at, last_synced_at, chunk_count";

const CHUNK_COLUMNS: &str = "id, document_id, ordinal, start_offset, end_offset, overlap_start, \
     text, kind, token_estimate, hash, prev_id, next_id";

impl SqliteCatalog {
    /// Attach persisted store statuses to `docs`. Documents without rows
    /// stay pending.
    async fn load_statuses(&self, docs: &mut [Document]) -> Result<()> {
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for (i, d) in docs.iter().enumerate() {
            by_id.insert(d.id.clone(), i);
        }
        let ids: Vec<String> = by_id.keys().cloned().collect();
        for batch in ids.chunks(MAX_BIND) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT document_id, store, status, message, attempts \
                 FROM document_store_status WHERE document_id IN (",
            );
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id);
            }
            sep.push_unseparated(")");
            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in rows {
                let doc_id: String = row.get("document_id");
                let store: String = row.get("store");
                let Some(&i) = by_id.get(&doc_id) else {
                    continue;
                };
                let Ok(kind) = store.parse::<StoreKind>() else {
                    continue;
                };
                let status = status_from_parts(
                    row.get::<String, _>("status").as_str(),
                    row.get("message"),
                    row.get("attempts"),
                );
                docs[i].stores.set(kind, status);
            }
        }
        Ok(())
    }

    async fn write_statuses(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        document_id: &str,
        stores: &StoreStatuses,
    ) -> Result<()> {
        for kind in StoreKind::ALL {
            let (status, message, attempts) = status_parts(stores.get(kind));
            sqlx::query(
                r#"
                INSERT INTO document_store_status (document_id, store, status, message, attempts)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(document_id, store) DO UPDATE SET
                    status = excluded.status,
                    message = excluded.message,
                    attempts = excluded.attempts
                "#,
            )
            .bind(document_id)
            .bind(kind.as_str())
            .bind(status)
            .bind(message)
            .bind(attempts)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn insert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, root, include_json, exclude_json, allowed_json,
                                 state, state_message, created_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(source.root.to_string_lossy().into_owned())
        .bind(serde_json::to_string(&source.include)?)
        .bind(serde_json::to_string(&source.exclude)?)
        .bind(serde_json::to_string(&source.allowed_paths)?)
        .bind(source.state.label())
        .bind(source.state.message())
        .bind(source.created_at)
        .bind(source.last_synced_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert source {}", source.id))?;
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_source).transpose()
    }

    async fn find_source_by_root(&self, root: &Path) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE root = ?")
            .bind(root.to_string_lossy().into_owned())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_source).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_source).collect()
    }

    async fn set_source_state(
        &self,
        id: &str,
        state: &SourceState,
        synced_at: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET state = ?, state_message = ?, last_synced_at = COALESCE(?, last_synced_at)
            WHERE id = ?
            "#,
        )
        .bind(state.label())
        .bind(state.message())
        .bind(synced_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("source {} not found", id);
        }
        Ok(())
    }

    async fn delete_source(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let scoped = "SELECT id FROM documents WHERE source_id = ?";
        sqlx::query(&format!(
            "DELETE FROM chunks WHERE document_id IN ({scoped})"
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "DELETE FROM document_store_status WHERE document_id IN ({scoped})"
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_id = ? ORDER BY path ASC"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        let mut docs: Vec<Document> = rows.iter().map(row_to_document).collect();
        self.load_statuses(&mut docs).await?;
        Ok(docs)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut docs = vec![row_to_document(&row)];
        self.load_statuses(&mut docs).await?;
        Ok(docs.pop())
    }

    async fn commit_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, path, fingerprint, content_type, size_bytes,
                                   modified_at, last_synced_at, chunk_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                last_synced_at = excluded.last_synced_at,
                chunk_count = excluded.chunk_count
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_id)
        .bind(&doc.path)
        .bind(&doc.fingerprint)
        .bind(&doc.content_type)
        .bind(doc.size_bytes as i64)
        .bind(doc.modified_at)
        .bind(doc.last_synced_at)
        .bind(doc.chunk_count as i64)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to record document {}", doc.path))?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(&format!(
                "INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal as i64)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(chunk.overlap_start as i64)
            .bind(&chunk.text)
            .bind(chunk.kind.as_str())
            .bind(chunk.token_estimate as i64)
            .bind(&chunk.hash)
            .bind(&chunk.prev_id)
            .bind(&chunk.next_id)
            .execute(&mut *tx)
            .await?;
        }

        Self::write_statuses(&mut tx, &doc.id, &doc.stores).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_store_statuses(&self, document_id: &str, stores: &StoreStatuses) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_statuses(&mut tx, document_id, stores).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM chunks WHERE document_id = ?",
            "DELETE FROM document_store_status WHERE document_id = ?",
            "DELETE FROM documents WHERE id = ?",
        ] {
            sqlx::query(sql).bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ? ORDER BY ordinal ASC"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn lookup_chunks(&self, ids: &[ChunkId]) -> Result<HashMap<ChunkId, ChunkRecord>> {
        let mut out = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(MAX_BIND) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT c.id, c.document_id, c.ordinal, c.start_offset, c.end_offset, \
                 c.overlap_start, c.text, c.kind, c.token_estimate, c.hash, c.prev_id, \
                 c.next_id, d.source_id, d.path, d.content_type \
                 FROM chunks c JOIN documents d ON d.id = c.document_id WHERE c.id IN (",
            );
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id);
            }
            sep.push_unseparated(")");
            for row in qb.build().fetch_all(&self.pool).await? {
                let chunk = row_to_chunk(&row);
                out.insert(
                    chunk.id.clone(),
                    ChunkRecord {
                        chunk,
                        source_id: row.get("source_id"),
                        path: row.get("path"),
                        content_type: row.get("content_type"),
                    },
                );
            }
        }
        Ok(out)
    }
}

// ============ Lexical ============

/// FTS5 index over chunk text.
pub struct SqliteLexicalIndex {
    pool: SqlitePool,
}

impl SqliteLexicalIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Translate a user query into an FTS5 MATCH expression.
///
/// Every term is re-quoted so user input can never inject FTS5 syntax.
/// Fuzzy mode ORs the content terms, treating terms of three or more
/// characters as prefixes; exact mode matches the whole query as one
/// phrase. Returns `None` when the query has no searchable terms.
pub fn fts_query(query: &str, mode: MatchMode) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }
    match mode {
        MatchMode::Exact => Some(format!("\"{}\"", tokens.join(" "))),
        MatchMode::Fuzzy => {
            let content: Vec<&String> = tokens.iter().filter(|t| !is_stopword(t)).collect();
            let terms = if content.is_empty() {
                tokens.iter().collect()
            } else {
                content
            };
            let parts: Vec<String> = terms
                .into_iter()
                .map(|t| {
                    if t.chars().count() >= 3 {
                        format!("\"{t}\"*")
                    } else {
                        format!("\"{t}\"")
                    }
                })
                .collect();
            Some(parts.join(" OR "))
        }
    }
}

#[async_trait]
impl LexicalIndex for SqliteLexicalIndex {
    async fn upsert(&self, scope: &DocumentScope, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&chunk.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO chunks_fts (chunk_id, document_id, source_id, path, content_type, text)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&scope.document_id)
            .bind(&scope.source_id)
            .bind(&scope.path)
            .bind(&scope.content_type)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize> {
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM chunks_fts WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        let stale: Vec<&String> = stored.iter().filter(|id| !keep.contains(*id)).collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for id in &stale {
            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(*id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(stale.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        mode: MatchMode,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let Some(expr) = fts_query(query, mode) else {
            return Ok(Vec::new());
        };
        // Filtering happens on the scope columns after ranking, so the SQL
        // limit only applies to unfiltered queries.
        let sql_limit: i64 = if filter.is_empty() { limit as i64 } else { -1 };
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, source_id, path, content_type, rank,
                   snippet(chunks_fts, 5, '', '', '...', 48) AS snippet
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(sql_limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("fts query failed: {expr}"))?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .filter(|row| filter.matches(&scope_of(row)))
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    // FTS5 rank is negated BM25: lower is better.
                    raw_score: -rank,
                    snippet: row.get("snippet"),
                }
            })
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }
}

// ============ Vector ============

/// Embeddings stored as little-endian f32 BLOBs and scanned linearly.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, scope: &DocumentScope, vectors: &[ChunkVector]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for v in vectors {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, source_id, path, content_type, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    source_id = excluded.source_id,
                    path = excluded.path,
                    content_type = excluded.content_type,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&v.chunk_id)
            .bind(&scope.document_id)
            .bind(&scope.source_id)
            .bind(&scope.path)
            .bind(&scope.content_type)
            .bind(vec_to_blob(&v.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize> {
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM chunk_vectors WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        let mut removed = 0;
        for id in stored.iter().filter(|id| !keep.contains(*id)) {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, source_id, path, content_type, embedding FROM chunk_vectors",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .filter(|row| filter.matches(&scope_of(row)))
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: cosine_similarity(query, &blob_to_vec(&blob)) as f64,
                    snippet: String::new(),
                }
            })
            .filter(|c| c.raw_score > 0.0)
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_vectors(&self, chunk_ids: &[ChunkId]) -> Result<HashMap<ChunkId, Vec<f32>>> {
        let mut out = HashMap::with_capacity(chunk_ids.len());
        for batch in chunk_ids.chunks(MAX_BIND) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT chunk_id, embedding FROM chunk_vectors WHERE chunk_id IN (");
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id);
            }
            sep.push_unseparated(")");
            for row in qb.build().fetch_all(&self.pool).await? {
                let blob: Vec<u8> = row.get("embedding");
                out.insert(row.get("chunk_id"), blob_to_vec(&blob));
            }
        }
        Ok(out)
    }
}

// ============ Graph ============

/// Entity graph in relational form: mentions link chunks to entity keys,
/// relations link entity keys to each other, both with chunk provenance.
pub struct SqliteGraphIndex {
    pool: SqlitePool,
}

impl SqliteGraphIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Drop entity nodes no chunk mentions any more.
    async fn prune_entities(&self) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM entities
            WHERE key NOT IN (SELECT entity_key FROM entity_mentions)
              AND key NOT IN (SELECT from_key FROM relations)
              AND key NOT IN (SELECT to_key FROM relations)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GraphIndex for SqliteGraphIndex {
    async fn upsert(&self, scope: &DocumentScope, entities: &[ChunkEntities]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for ce in entities {
            sqlx::query("DELETE FROM entity_mentions WHERE chunk_id = ?")
                .bind(&ce.chunk_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM relations WHERE chunk_id = ?")
                .bind(&ce.chunk_id)
                .execute(&mut *tx)
                .await?;

            for entity in &ce.entities {
                let key = entity_key(&entity.name);
                if key.is_empty() {
                    continue;
                }
                sqlx::query("INSERT OR IGNORE INTO entities (key, name, kind) VALUES (?, ?, ?)")
                    .bind(&key)
                    .bind(entity.name.trim())
                    .bind(&entity.kind)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT INTO entity_mentions (chunk_id, entity_key, document_id, source_id,
                                                 path, content_type, confidence)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(chunk_id, entity_key) DO UPDATE SET
                        confidence = MAX(confidence, excluded.confidence)
                    "#,
                )
                .bind(&ce.chunk_id)
                .bind(&key)
                .bind(&scope.document_id)
                .bind(&scope.source_id)
                .bind(&scope.path)
                .bind(&scope.content_type)
                .bind(entity.confidence as f64)
                .execute(&mut *tx)
                .await?;

                for relation in &entity.relations {
                    let target = entity_key(&relation.target);
                    if target.is_empty() || target == key {
                        continue;
                    }
                    sqlx::query(
                        r#"
                        INSERT OR IGNORE INTO relations (chunk_id, document_id, from_key, to_key, kind)
                        VALUES (?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&ce.chunk_id)
                    .bind(&scope.document_id)
                    .bind(&key)
                    .bind(&target)
                    .bind(&relation.kind)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize> {
        let stored: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT chunk_id FROM entity_mentions WHERE document_id = ?
            UNION
            SELECT chunk_id FROM relations WHERE document_id = ?
            "#,
        )
        .bind(document_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        let stale: Vec<&String> = stored.iter().filter(|id| !keep.contains(*id)).collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for id in &stale {
            sqlx::query("DELETE FROM entity_mentions WHERE chunk_id = ?")
                .bind(*id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM relations WHERE chunk_id = ?")
                .bind(*id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.prune_entities().await?;
        Ok(stale.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entity_mentions WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM relations WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.prune_entities().await
    }

    async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, entity_key, document_id, source_id, path, content_type, confidence
            FROM entity_mentions
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mentions: Vec<Mention> = rows
            .iter()
            .filter(|row| filter.matches(&scope_of(row)))
            .map(|row| Mention {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                entity_key: row.get("entity_key"),
                confidence: row.get("confidence"),
            })
            .collect();
        if mentions.is_empty() {
            return Ok(Vec::new());
        }

        let edges: Vec<(String, String)> =
            sqlx::query_as("SELECT DISTINCT from_key, to_key FROM relations")
                .fetch_all(&self.pool)
                .await?;
        Ok(rank_mentions(query, &mentions, &edges, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::models::{ExtractedEntity, ExtractedRelation};

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::open(&dir.path().join("store.sqlite"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    fn scope(doc: &str, path: &str, content_type: &str) -> DocumentScope {
        DocumentScope {
            document_id: doc.into(),
            source_id: "src".into(),
            path: path.into(),
            content_type: content_type.into(),
        }
    }

    fn chunk(doc: &str, ordinal: usize, text: &str) -> Chunk {
        Chunk {
            id: format!("{doc}-{ordinal}"),
            document_id: doc.into(),
            ordinal,
            start: 0,
            end: text.len(),
            overlap_start: 0,
            text: text.into(),
            kind: ChunkKind::Prose,
            token_estimate: text.len() / 4,
            hash: format!("h{ordinal}"),
            prev_id: None,
            next_id: None,
        }
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(
            fts_query("the quick fox", MatchMode::Fuzzy).unwrap(),
            "\"quick\"* OR \"fox\"*"
        );
        assert_eq!(fts_query("is it", MatchMode::Fuzzy).unwrap(), "\"is\" OR \"it\"");
        assert_eq!(
            fts_query("\"brown fox\"", MatchMode::Exact).unwrap(),
            "\"brown fox\""
        );
        assert!(fts_query("  ** ", MatchMode::Fuzzy).is_none());
        // FTS5 operators in user input become plain terms.
        assert_eq!(
            fts_query("NEAR(a b)", MatchMode::Fuzzy).unwrap(),
            "\"near\"* OR \"b\""
        );
    }

    #[tokio::test]
    async fn lexical_upsert_search_and_retain() {
        let (_dir, pool) = pool().await;
        let idx = SqliteLexicalIndex::new(pool);
        let s = scope("d1", "notes/a.md", "markdown");
        idx.upsert(
            &s,
            &[chunk("d1", 0, "The quick brown fox"), chunk("d1", 1, "jumps over")],
        )
        .await
        .unwrap();
        // re-upsert replaces rather than duplicates
        idx.upsert(&s, &[chunk("d1", 0, "The quick brown fox")])
            .await
            .unwrap();

        let hits = idx
            .search("quick", MatchMode::Fuzzy, &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "d1-0");
        assert!(hits[0].snippet.contains("quick"));

        let exact = idx
            .search("brown quick", MatchMode::Exact, &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert!(exact.is_empty());

        let keep: HashSet<ChunkId> = ["d1-0".to_string()].into_iter().collect();
        assert_eq!(idx.retain_chunks("d1", &keep).await.unwrap(), 1);
        let filter = SearchFilter {
            sources: vec![],
            content_types: vec!["pdf".into()],
        };
        assert!(idx
            .search("quick", MatchMode::Fuzzy, &filter, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn vector_search_orders_by_cosine() {
        let (_dir, pool) = pool().await;
        let idx = SqliteVectorIndex::new(pool);
        let s = scope("d1", "a.md", "markdown");
        idx.upsert(
            &s,
            &[
                ChunkVector {
                    chunk_id: "x".into(),
                    vector: vec![1.0, 0.0],
                },
                ChunkVector {
                    chunk_id: "y".into(),
                    vector: vec![0.0, 1.0],
                },
            ],
        )
        .await
        .unwrap();
        let hits = idx
            .search(&[0.9, 0.1], &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "x");
        let vectors = idx.get_vectors(&["y".into(), "zz".into()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors["y"], vec![0.0, 1.0]);
        idx.delete_document("d1").await.unwrap();
        assert!(idx
            .search(&[1.0, 0.0], &SearchFilter::default(), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn vector_search_drops_orthogonal_and_opposite_vectors() {
        let (_dir, pool) = pool().await;
        let idx = SqliteVectorIndex::new(pool);
        idx.upsert(
            &scope("d1", "a.md", "markdown"),
            &[
                ChunkVector {
                    chunk_id: "orthogonal".into(),
                    vector: vec![0.0, 1.0],
                },
                ChunkVector {
                    chunk_id: "opposite".into(),
                    vector: vec![-1.0, 0.0],
                },
            ],
        )
        .await
        .unwrap();
        let hits = idx
            .search(&[1.0, 0.0], &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty(), "{:?}", hits);
    }

    #[tokio::test]
    async fn graph_follows_relations() {
        let (_dir, pool) = pool().await;
        let idx = SqliteGraphIndex::new(pool.clone());
        let s = scope("d1", "a.md", "markdown");
        let fox = ExtractedEntity {
            kind: "concept".into(),
            name: "Quick Brown Fox".into(),
            relations: vec![ExtractedRelation {
                kind: "mentions_with".into(),
                target: "Lazy Dog".into(),
            }],
            confidence: 0.9,
        };
        let dog = ExtractedEntity {
            kind: "concept".into(),
            name: "Lazy Dog".into(),
            relations: vec![],
            confidence: 0.8,
        };
        idx.upsert(
            &s,
            &[
                ChunkEntities {
                    chunk_id: "c1".into(),
                    entities: vec![fox],
                },
                ChunkEntities {
                    chunk_id: "c2".into(),
                    entities: vec![dog],
                },
            ],
        )
        .await
        .unwrap();

        let hits = idx
            .search("quick brown fox", &SearchFilter::default(), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);

        let keep: HashSet<ChunkId> = ["c2".to_string()].into_iter().collect();
        assert_eq!(idx.retain_chunks("d1", &keep).await.unwrap(), 1);
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM entities ORDER BY key")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(keys, vec!["lazy dog".to_string()]);
    }

    fn source(id: &str, root: &str) -> Source {
        Source {
            id: id.into(),
            root: PathBuf::from(root),
            include: vec!["**/*.md".into()],
            exclude: vec![],
            allowed_paths: vec![PathBuf::from(root)],
            state: SourceState::NeverSynced,
            created_at: 1,
            last_synced_at: None,
        }
    }

    fn document(id: &str, source_id: &str, path: &str) -> Document {
        Document {
            id: id.into(),
            source_id: source_id.into(),
            path: path.into(),
            fingerprint: "fp".into(),
            content_type: "markdown".into(),
            size_bytes: 10,
            modified_at: 5,
            last_synced_at: 6,
            chunk_count: 2,
            stores: StoreStatuses::pending(),
        }
    }

    #[tokio::test]
    async fn catalog_roundtrips_sources_and_documents() {
        let (_dir, pool) = pool().await;
        let catalog = SqliteCatalog::new(pool);
        catalog.insert_source(&source("s1", "/data/notes")).await.unwrap();
        assert!(catalog
            .insert_source(&source("s2", "/data/notes"))
            .await
            .is_err());

        let found = catalog
            .find_source_by_root(Path::new("/data/notes"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "s1");
        assert_eq!(found.include, vec!["**/*.md".to_string()]);

        catalog
            .set_source_state("s1", &SourceState::Error("gone".into()), Some(42))
            .await
            .unwrap();
        let s = catalog.get_source("s1").await.unwrap().unwrap();
        assert_eq!(s.state, SourceState::Error("gone".into()));
        assert_eq!(s.last_synced_at, Some(42));
        assert!(catalog
            .set_source_state("nope", &SourceState::Synced, None)
            .await
            .is_err());

        let mut doc = document("d1", "s1", "a.md");
        doc.stores.set(
            StoreKind::Vector,
            StoreStatus::Failed {
                message: "down".into(),
                attempts: 2,
            },
        );
        doc.stores.set(StoreKind::Lexical, StoreStatus::Indexed);
        let chunks = vec![chunk("d1", 1, "second"), chunk("d1", 0, "first")];
        catalog.commit_document(&doc, &chunks).await.unwrap();

        let stored = catalog.get_document("d1").await.unwrap().unwrap();
        assert_eq!(stored.stores, doc.stores);
        let ordered = catalog.get_chunks("d1").await.unwrap();
        assert_eq!(ordered[0].text, "first");

        let records = catalog
            .lookup_chunks(&["d1-0".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records["d1-0"].path, "a.md");

        // recommit replaces the chunk set
        catalog
            .commit_document(&doc, &[chunk("d1", 0, "only")])
            .await
            .unwrap();
        assert_eq!(catalog.get_chunks("d1").await.unwrap().len(), 1);

        catalog.delete_source("s1").await.unwrap();
        assert!(catalog.get_document("d1").await.unwrap().is_none());
        assert!(catalog.get_chunks("d1").await.unwrap().is_empty());
        assert!(catalog.list_sources().await.unwrap().is_empty());
    }
}
