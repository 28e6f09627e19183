//! # Strata Core
//!
//! The engine behind Strata: turning files into cleaned, chunked text,
//! indexing that text into three structurally different stores (lexical,
//! vector, graph) and answering queries by fusing all three.
//!
//! This crate contains no database, HTTP client or configuration loading.
//! Stores, catalog and model-backed capabilities are traits; in-memory
//! implementations live next to them for tests and embedding.
//!
//! | Stage | Module |
//! |-------|--------|
//! | bytes → text | [`clean`] |
//! | text → chunks | [`chunk`] |
//! | chunks → stores | [`writers`], [`store`] |
//! | files → documents | [`sources`], [`walker`], [`sync`] |
//! | query → results | [`classify`], [`fusion`], [`mmr`], [`rerank`], [`search`] |

pub mod capability;
pub mod catalog;
pub mod chunk;
pub mod classify;
pub mod clean;
pub mod embedding;
pub mod error;
pub mod events;
pub mod fusion;
pub mod health;
pub mod mmr;
pub mod models;
pub mod rerank;
pub mod search;
pub mod sources;
pub mod store;
pub mod sync;
pub mod walker;
pub mod writers;

pub use error::{EngineError, EngineResult};
