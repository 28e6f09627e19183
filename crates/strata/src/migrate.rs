//! Database schema migrations.
//!
//! Every statement is idempotent, so migrations run on each startup. The
//! catalog tables (`sources`, `documents`, `document_store_status`,
//! `chunks`) are the system of record; the index tables (`chunks_fts`,
//! `chunk_vectors`, `entity_mentions`, `relations`) are projections that
//! carry their own scope columns and are never joined against the catalog.

use anyhow::Result;
use sqlx::SqlitePool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        root TEXT NOT NULL UNIQUE,
        include_json TEXT NOT NULL DEFAULT '[]',
        exclude_json TEXT NOT NULL DEFAULT '[]',
        allowed_json TEXT NOT NULL DEFAULT '[]',
        state TEXT NOT NULL DEFAULT 'never_synced',
        state_message TEXT,
        created_at INTEGER NOT NULL,
        last_synced_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        path TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        content_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        last_synced_at INTEGER NOT NULL,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        UNIQUE(source_id, path),
        FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_store_status (
        document_id TEXT NOT NULL,
        store TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (document_id, store),
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        overlap_start INTEGER NOT NULL,
        text TEXT NOT NULL,
        kind TEXT NOT NULL,
        token_estimate INTEGER NOT NULL,
        hash TEXT NOT NULL,
        prev_id TEXT,
        next_id TEXT,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunk_vectors (
        chunk_id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        source_id TEXT NOT NULL,
        path TEXT NOT NULL,
        content_type TEXT NOT NULL,
        embedding BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        key TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entity_mentions (
        chunk_id TEXT NOT NULL,
        entity_key TEXT NOT NULL,
        document_id TEXT NOT NULL,
        source_id TEXT NOT NULL,
        path TEXT NOT NULL,
        content_type TEXT NOT NULL,
        confidence REAL NOT NULL,
        PRIMARY KEY (chunk_id, entity_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS relations (
        chunk_id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        from_key TEXT NOT NULL,
        to_key TEXT NOT NULL,
        kind TEXT NOT NULL,
        PRIMARY KEY (chunk_id, from_key, to_key, kind)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document ON chunk_vectors(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_mentions_document ON entity_mentions(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_mentions_entity ON entity_mentions(entity_key)",
    "CREATE INDEX IF NOT EXISTS idx_relations_document ON relations(document_id)",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                source_id UNINDEXED,
                path UNINDEXED,
                content_type UNINDEXED,
                text,
                tokenize = "unicode61 tokenchars '_'"
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::open(&dir.path().join("t.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        for expected in [
            "chunk_vectors",
            "chunks",
            "chunks_fts",
            "document_store_status",
            "documents",
            "entities",
            "entity_mentions",
            "relations",
            "sources",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }
}
