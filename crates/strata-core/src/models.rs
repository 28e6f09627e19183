//! Core data models used throughout Strata.
//!
//! Sources own documents, documents own chunks. Every cross reference is an
//! id, never a pointer, so retiring a document is a pure id-based cascade
//! across the catalog and the three index stores.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type SourceId = String;
pub type DocumentId = String;
pub type ChunkId = String;

/// The three index store families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Lexical,
    Vector,
    Graph,
}

impl StoreKind {
    pub const ALL: [StoreKind; 3] = [StoreKind::Lexical, StoreKind::Vector, StoreKind::Graph];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Lexical => "lexical",
            StoreKind::Vector => "vector",
            StoreKind::Graph => "graph",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "lexical" => Ok(StoreKind::Lexical),
            "vector" => Ok(StoreKind::Vector),
            "graph" => Ok(StoreKind::Graph),
            other => anyhow::bail!("unknown store kind: {}", other),
        }
    }
}

/// Sync state of a registered source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum SourceState {
    NeverSynced,
    Syncing,
    Synced,
    Error(String),
}

impl SourceState {
    pub fn label(&self) -> &'static str {
        match self {
            SourceState::NeverSynced => "never_synced",
            SourceState::Syncing => "syncing",
            SourceState::Synced => "synced",
            SourceState::Error(_) => "error",
        }
    }

    /// Rebuild from the persisted `(label, message)` pair.
    pub fn from_parts(label: &str, message: Option<String>) -> Self {
        match label {
            "syncing" => SourceState::Syncing,
            "synced" => SourceState::Synced,
            "error" => SourceState::Error(message.unwrap_or_default()),
            _ => SourceState::NeverSynced,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            SourceState::Error(m) => Some(m),
            _ => None,
        }
    }
}

/// A registered root: a directory or a single file.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: SourceId,
    /// Canonical absolute path.
    pub root: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Read paths granted by the authorization decision. Files resolving
    /// outside all of them are never read.
    pub allowed_paths: Vec<PathBuf>,
    pub state: SourceState,
    pub created_at: i64,
    pub last_synced_at: Option<i64>,
}

/// Detected content type of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentType {
    Markdown,
    Code(String),
    Config,
    PlainText,
    Html,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

impl ContentType {
    /// Stable label persisted alongside documents and index entries,
    /// e.g. `markdown`, `code:rust`, `pdf`.
    pub fn label(&self) -> String {
        match self {
            ContentType::Markdown => "markdown".to_string(),
            ContentType::Code(lang) => format!("code:{}", lang),
            ContentType::Config => "config".to_string(),
            ContentType::PlainText => "text".to_string(),
            ContentType::Html => "html".to_string(),
            ContentType::Pdf => "pdf".to_string(),
            ContentType::Docx => "docx".to_string(),
            ContentType::Pptx => "pptx".to_string(),
            ContentType::Xlsx => "xlsx".to_string(),
        }
    }

    pub fn from_label(label: &str) -> Self {
        if let Some(lang) = label.strip_prefix("code:") {
            return ContentType::Code(lang.to_string());
        }
        match label {
            "markdown" => ContentType::Markdown,
            "config" => ContentType::Config,
            "html" => ContentType::Html,
            "pdf" => ContentType::Pdf,
            "docx" => ContentType::Docx,
            "pptx" => ContentType::Pptx,
            "xlsx" => ContentType::Xlsx,
            _ => ContentType::PlainText,
        }
    }

    /// Formats that need a binary extractor before they are text.
    pub fn is_binary_document(&self) -> bool {
        matches!(
            self,
            ContentType::Pdf | ContentType::Docx | ContentType::Pptx | ContentType::Xlsx
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Per-store indexing status of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreStatus {
    Pending,
    Indexed,
    Failed { message: String, attempts: u32 },
}

impl StoreStatus {
    pub fn is_indexed(&self) -> bool {
        matches!(self, StoreStatus::Indexed)
    }

    pub fn attempts(&self) -> u32 {
        match self {
            StoreStatus::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// Status triple, one slot per [`StoreKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatuses {
    pub lexical: StoreStatus,
    pub vector: StoreStatus,
    pub graph: StoreStatus,
}

impl StoreStatuses {
    pub fn pending() -> Self {
        Self {
            lexical: StoreStatus::Pending,
            vector: StoreStatus::Pending,
            graph: StoreStatus::Pending,
        }
    }

    pub fn get(&self, kind: StoreKind) -> &StoreStatus {
        match kind {
            StoreKind::Lexical => &self.lexical,
            StoreKind::Vector => &self.vector,
            StoreKind::Graph => &self.graph,
        }
    }

    pub fn set(&mut self, kind: StoreKind, status: StoreStatus) {
        match kind {
            StoreKind::Lexical => self.lexical = status,
            StoreKind::Vector => self.vector = status,
            StoreKind::Graph => self.graph = status,
        }
    }

    /// Stores that still need a write for the current fingerprint.
    pub fn unindexed(&self) -> Vec<StoreKind> {
        StoreKind::ALL
            .into_iter()
            .filter(|k| !self.get(*k).is_indexed())
            .collect()
    }

    pub fn all_indexed(&self) -> bool {
        self.unindexed().is_empty()
    }
}

impl Default for StoreStatuses {
    fn default() -> Self {
        Self::pending()
    }
}

/// One file under a source.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub source_id: SourceId,
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    /// SHA-256 over the file bytes and mtime.
    pub fingerprint: String,
    /// [`ContentType::label`], or `unsupported` for skipped files.
    pub content_type: String,
    pub size_bytes: u64,
    pub modified_at: i64,
    pub last_synced_at: i64,
    pub chunk_count: usize,
    pub stores: StoreStatuses,
}

/// Structural tag of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Code,
    Prose,
    Heading,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Code => "code",
            ChunkKind::Prose => "prose",
            ChunkKind::Heading => "heading",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "code" => ChunkKind::Code,
            "heading" => ChunkKind::Heading,
            _ => ChunkKind::Prose,
        }
    }
}

/// A contiguous text unit of one document.
///
/// `start..end` is the byte range the chunk *owns* in the cleaned text;
/// owned ranges of consecutive chunks are adjacent and cover the whole
/// input. `text` additionally carries the overlap window
/// `overlap_start..start` shared with the previous chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub overlap_start: usize,
    pub text: String,
    pub kind: ChunkKind,
    pub token_estimate: usize,
    /// SHA-256 of `text`.
    pub hash: String,
    pub prev_id: Option<ChunkId>,
    pub next_id: Option<ChunkId>,
}

impl Chunk {
    /// Length in bytes of the leading overlap window.
    pub fn overlap_len(&self) -> usize {
        self.start - self.overlap_start
    }

    /// The part of `text` this chunk owns, without the overlap prefix.
    pub fn owned_text(&self) -> &str {
        &self.text[self.overlap_len()..]
    }
}

/// Where an index entry came from. Stores keep these fields so that they
/// can apply search filters without consulting the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentScope {
    pub document_id: DocumentId,
    pub source_id: SourceId,
    pub path: String,
    pub content_type: String,
}

impl DocumentScope {
    pub fn of(doc: &Document) -> Self {
        Self {
            document_id: doc.id.clone(),
            source_id: doc.source_id.clone(),
            path: doc.path.clone(),
            content_type: doc.content_type.clone(),
        }
    }
}

/// A relation emitted by the entity extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub kind: String,
    pub target: String,
}

/// An entity emitted by the entity extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
    pub confidence: f32,
}

/// Entities extracted from one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntities {
    pub chunk_id: ChunkId,
    pub entities: Vec<ExtractedEntity>,
}

/// Normalize an entity name into its graph node key.
pub fn entity_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_label_roundtrip() {
        for ct in [
            ContentType::Markdown,
            ContentType::Code("rust".into()),
            ContentType::Config,
            ContentType::PlainText,
            ContentType::Pdf,
            ContentType::Xlsx,
        ] {
            assert_eq!(ContentType::from_label(&ct.label()), ct);
        }
    }

    #[test]
    fn source_state_parts() {
        let s = SourceState::Error("gone".into());
        assert_eq!(
            SourceState::from_parts(s.label(), s.message().map(String::from)),
            s
        );
        assert_eq!(SourceState::from_parts("bogus", None), SourceState::NeverSynced);
    }

    #[test]
    fn unindexed_lists_failed_and_pending() {
        let mut st = StoreStatuses::pending();
        st.set(StoreKind::Lexical, StoreStatus::Indexed);
        st.set(
            StoreKind::Graph,
            StoreStatus::Failed {
                message: "x".into(),
                attempts: 1,
            },
        );
        assert_eq!(st.unindexed(), vec![StoreKind::Vector, StoreKind::Graph]);
        assert!(!st.all_indexed());
    }

    #[test]
    fn entity_key_collapses_whitespace_and_case() {
        assert_eq!(entity_key("  Quick   Brown\tFox "), "quick brown fox");
    }
}
