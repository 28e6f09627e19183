//! # Strata
//!
//! **Local hybrid retrieval over your own files.**
//!
//! Strata registers directories (or single files) as sources, keeps three
//! indexes of their content in sync (full-text, vector, entity graph) and
//! answers queries by fusing all three. This crate is the application
//! around [`strata_core`]: SQLite persistence, embedding and extraction
//! providers, path policy, configuration, logging and the `strata` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌──────────────────────┐
//! │ Sources  │──▶│ clean → chunk  │──▶│ SQLite               │
//! │ dirs     │   │ (strata-core)  │   │ FTS5 · vectors · KG  │
//! └──────────┘   └────────────────┘   └──────────┬───────────┘
//!                                                │
//!                                   ┌────────────┘
//!                                   ▼
//!                           ┌────────────────┐
//!                           │ HybridSearcher │──▶ CLI (strata)
//!                           │ RRF · MMR      │
//!                           └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! strata init
//! strata source add ~/notes --include '**/*.md'
//! strata sync --all
//! strata search "how is the cache invalidated" --explain
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`sqlite_store`] | SQLite catalog and the three index stores |
//! | [`embedding`] | OpenAI, Ollama and local embedding providers |
//! | [`entities`] | Heuristic entity and relation extractor |
//! | [`extract`] | Text extraction from PDF, DOCX, PPTX and XLSX |
//! | [`policy`] | Path allow-list authorizer |
//! | [`engine`] | Wires everything into an [`engine::Engine`] |
//! | [`progress`] | Sync progress sinks for the CLI |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`sources`], [`ingest`], [`search`] | CLI command handlers |

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod entities;
pub mod extract;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod policy;
pub mod progress;
pub mod search;
pub mod sources;
pub mod sqlite_store;
