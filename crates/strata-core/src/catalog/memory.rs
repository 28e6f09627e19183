//! In-memory [`Catalog`] used by tests and embedded callers.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{Chunk, ChunkId, Document, Source, SourceState, StoreStatuses};

use super::{Catalog, ChunkRecord};

#[derive(Default)]
struct State {
    sources: BTreeMap<String, Source>,
    documents: BTreeMap<String, Document>,
    chunks: HashMap<String, Vec<Chunk>>,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<State>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn insert_source(&self, source: &Source) -> Result<()> {
        let mut state = self.state.write().await;
        if state.sources.contains_key(&source.id) {
            bail!("source {} already exists", source.id);
        }
        state.sources.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        Ok(self.state.read().await.sources.get(id).cloned())
    }

    async fn find_source_by_root(&self, root: &Path) -> Result<Option<Source>> {
        Ok(self
            .state
            .read()
            .await
            .sources
            .values()
            .find(|s| s.root == root)
            .cloned())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self.state.read().await.sources.values().cloned().collect();
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sources)
    }

    async fn set_source_state(
        &self,
        id: &str,
        state: &SourceState,
        synced_at: Option<i64>,
    ) -> Result<()> {
        let mut guard = self.state.write().await;
        let Some(source) = guard.sources.get_mut(id) else {
            bail!("source {} not found", id);
        };
        source.state = state.clone();
        if synced_at.is_some() {
            source.last_synced_at = synced_at;
        }
        Ok(())
    }

    async fn delete_source(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.sources.remove(id);
        let doc_ids: Vec<String> = state
            .documents
            .values()
            .filter(|d| d.source_id == id)
            .map(|d| d.id.clone())
            .collect();
        for doc_id in doc_ids {
            state.documents.remove(&doc_id);
            state.chunks.remove(&doc_id);
        }
        Ok(())
    }

    async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>> {
        Ok(self
            .state
            .read()
            .await
            .documents
            .values()
            .filter(|d| d.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.state.read().await.documents.get(id).cloned())
    }

    async fn commit_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.state.write().await;
        state.documents.insert(doc.id.clone(), doc.clone());
        state.chunks.insert(doc.id.clone(), chunks.to_vec());
        Ok(())
    }

    async fn set_store_statuses(&self, document_id: &str, stores: &StoreStatuses) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(doc) = state.documents.get_mut(document_id) else {
            bail!("document {} not found", document_id);
        };
        doc.stores = stores.clone();
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.documents.remove(id);
        state.chunks.remove(id);
        Ok(())
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let state = self.state.read().await;
        let mut chunks = state.chunks.get(document_id).cloned().unwrap_or_default();
        chunks.sort_by_key(|c| c.ordinal);
        Ok(chunks)
    }

    async fn lookup_chunks(&self, ids: &[ChunkId]) -> Result<HashMap<ChunkId, ChunkRecord>> {
        let state = self.state.read().await;
        let wanted: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut out = HashMap::new();
        for (doc_id, chunks) in &state.chunks {
            let Some(doc) = state.documents.get(doc_id) else {
                continue;
            };
            for chunk in chunks.iter().filter(|c| wanted.contains(c.id.as_str())) {
                out.insert(
                    chunk.id.clone(),
                    ChunkRecord {
                        chunk: chunk.clone(),
                        source_id: doc.source_id.clone(),
                        path: doc.path.clone(),
                        content_type: doc.content_type.clone(),
                    },
                );
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn source(id: &str, root: &str) -> Source {
        Source {
            id: id.into(),
            root: PathBuf::from(root),
            include: vec![],
            exclude: vec![],
            allowed_paths: vec![PathBuf::from(root)],
            state: SourceState::NeverSynced,
            created_at: 1,
            last_synced_at: None,
        }
    }

    fn document(id: &str, source_id: &str) -> Document {
        Document {
            id: id.into(),
            source_id: source_id.into(),
            path: format!("{id}.md"),
            fingerprint: "f".into(),
            content_type: "markdown".into(),
            size_bytes: 1,
            modified_at: 0,
            last_synced_at: 0,
            chunk_count: 0,
            stores: StoreStatuses::pending(),
        }
    }

    #[tokio::test]
    async fn delete_source_cascades() {
        let cat = InMemoryCatalog::new();
        cat.insert_source(&source("s1", "/a")).await.unwrap();
        cat.insert_source(&source("s2", "/b")).await.unwrap();
        cat.commit_document(&document("d1", "s1"), &[]).await.unwrap();
        cat.commit_document(&document("d2", "s2"), &[]).await.unwrap();

        cat.delete_source("s1").await.unwrap();
        assert!(cat.get_document("d1").await.unwrap().is_none());
        assert!(cat.get_document("d2").await.unwrap().is_some());
        assert_eq!(cat.list_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_transitions_persist() {
        let cat = InMemoryCatalog::new();
        cat.insert_source(&source("s1", "/a")).await.unwrap();
        cat.set_source_state("s1", &SourceState::Synced, Some(42))
            .await
            .unwrap();
        let s = cat.get_source("s1").await.unwrap().unwrap();
        assert_eq!(s.state, SourceState::Synced);
        assert_eq!(s.last_synced_at, Some(42));
        assert!(cat
            .find_source_by_root(Path::new("/a"))
            .await
            .unwrap()
            .is_some());
        assert!(cat.insert_source(&source("s1", "/c")).await.is_err());
    }
}
