use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use strata::config::parse_config;
use strata::engine::Engine;
use strata_core::classify::SearchMode;
use strata_core::embedding::Embedder;
use strata_core::error::EngineResult;
use strata_core::events::NoopSink;
use strata_core::search::SearchRequest;
use strata_core::store::tokenize;
use strata_core::sync::SyncTarget;

// ============ CLI harness ============

fn strata_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_strata"))
}

struct TestEnv {
    tmp: TempDir,
    config: PathBuf,
}

impl TestEnv {
    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn docs(&self) -> PathBuf {
        self.root().join("docs")
    }
}

fn setup_test_env(extra: &str) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("a.md"), "The quick brown fox").unwrap();
    fs::write(docs.join("b.md"), "A lazy dog sleeps").unwrap();

    fs::create_dir_all(root.join("config")).unwrap();
    let config = root.join("config").join("strata.toml");
    fs::write(
        &config,
        format!(
            "[db]\npath = \"{}/data/strata.sqlite\"\n\n[logging]\nfilter = \"warn\"\n{}",
            root.display(),
            extra
        ),
    )
    .unwrap();

    TestEnv { tmp, config }
}

fn run_strata(env: &TestEnv, args: &[&str]) -> (String, String, bool) {
    let binary = strata_binary();
    let output = Command::new(&binary)
        .current_dir(env.root())
        .arg("--config")
        .arg(&env.config)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run strata binary at {:?}: {}", binary, e));

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn add_docs_source(env: &TestEnv) -> String {
    let docs = env.docs();
    let (stdout, stderr, ok) = run_strata(env, &["source", "add", docs.to_str().unwrap(), "--json"]);
    assert!(ok, "source add failed: {}", stderr);
    let source: Value = serde_json::from_str(&stdout).unwrap();
    source["id"].as_str().unwrap().to_string()
}

fn search_paths(env: &TestEnv, query: &str, mode: &str) -> Vec<String> {
    let (stdout, stderr, ok) = run_strata(env, &["search", query, "--mode", mode, "--json"]);
    assert!(ok, "search failed: {}", stderr);
    let response: Value = serde_json::from_str(&stdout).unwrap();
    response["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["path"].as_str().unwrap().to_string())
        .collect()
}

// ============ CLI ============

#[test]
fn test_init_creates_database() {
    let env = setup_test_env("");
    let (stdout, stderr, ok) = run_strata(&env, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(env.root().join("data/strata.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env("");
    assert!(run_strata(&env, &["init"]).2);
    let (_, stderr, ok) = run_strata(&env, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_init_writes_default_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("config").join("strata.toml");
    let output = Command::new(strata_binary())
        .current_dir(tmp.path())
        .arg("--config")
        .arg(&config)
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(config.exists());
    assert!(tmp.path().join("data").join("strata.sqlite").exists());
    let written = fs::read_to_string(&config).unwrap();
    assert!(parse_config(&written).is_ok());
}

#[test]
fn test_source_add_list_remove() {
    let env = setup_test_env("");
    let id = add_docs_source(&env);

    let (stdout, _, ok) = run_strata(&env, &["source", "list"]);
    assert!(ok);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("never_synced"));

    let (_, stderr, ok) = run_strata(&env, &["source", "add", env.docs().to_str().unwrap()]);
    assert!(!ok, "duplicate registration should fail");
    assert!(stderr.contains("already registered"));

    let (stdout, _, ok) = run_strata(&env, &["source", "remove", &id]);
    assert!(ok);
    assert!(stdout.contains("removed"));

    let (stdout, _, ok) = run_strata(&env, &["source", "list", "--json"]);
    assert!(ok);
    let rows: Value = serde_json::from_str(&stdout).unwrap();
    assert!(rows.as_array().unwrap().is_empty());
}

#[test]
fn test_source_add_missing_path_fails() {
    let env = setup_test_env("");
    let missing = env.root().join("nope");
    let (_, stderr, ok) = run_strata(&env, &["source", "add", missing.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("unreachable"));
}

#[test]
fn test_source_add_denied_by_policy() {
    let tmp_allowed = TempDir::new().unwrap();
    let env = setup_test_env(&format!(
        "\n[policy]\nallowed_roots = [\"{}\"]\n",
        tmp_allowed.path().display()
    ));
    let (_, stderr, ok) = run_strata(&env, &["source", "add", env.docs().to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("denied by policy"), "stderr: {}", stderr);
}

#[test]
fn test_sync_reports_counts() {
    let env = setup_test_env("");
    add_docs_source(&env);

    let (stdout, stderr, ok) = run_strata(&env, &["sync", "--all"]);
    assert!(ok, "sync failed: {}", stderr);
    assert!(stdout.contains("added: 2"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_sync_idempotent() {
    let env = setup_test_env("");
    add_docs_source(&env);
    assert!(run_strata(&env, &["sync"]).2);

    let (stdout, _, ok) = run_strata(&env, &["sync", "--json"]);
    assert!(ok);
    let reports: Value = serde_json::from_str(&stdout).unwrap();
    let report = &reports[0];
    assert_eq!(report["status"], "ok");
    assert_eq!(report["added"], 0);
    assert_eq!(report["updated"], 0);
    assert_eq!(report["unchanged"], 2);
}

#[test]
fn test_sync_unknown_source_fails() {
    let env = setup_test_env("");
    let (stdout, _, ok) = run_strata(&env, &["sync", "doesnotexist"]);
    assert!(!ok);
    assert!(stdout.contains("source not found"));
}

#[test]
fn test_search_lexical_then_delete() {
    let env = setup_test_env("");
    add_docs_source(&env);
    assert!(run_strata(&env, &["sync", "--all"]).2);

    let paths = search_paths(&env, "fox", "lexical");
    assert_eq!(paths.first().map(String::as_str), Some("a.md"));
    assert!(!paths.iter().any(|p| p == "b.md"));

    fs::remove_file(env.docs().join("a.md")).unwrap();
    let (stdout, _, ok) = run_strata(&env, &["sync", "--all"]);
    assert!(ok);
    assert!(stdout.contains("removed: 1"));

    assert!(search_paths(&env, "fox", "lexical").is_empty());
}

#[test]
fn test_search_human_output() {
    let env = setup_test_env("");
    add_docs_source(&env);
    assert!(run_strata(&env, &["sync"]).2);

    let (stdout, _, ok) = run_strata(&env, &["search", "lazy dog", "--explain"]);
    assert!(ok);
    assert!(stdout.contains("b.md"));
    assert!(stdout.contains("lexical: rank 1"));

    let (stdout, _, ok) = run_strata(&env, &["search", "zebra"]);
    assert!(ok);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_hybrid_without_embeddings_degrades() {
    let env = setup_test_env("");
    add_docs_source(&env);
    assert!(run_strata(&env, &["sync"]).2);

    let paths = search_paths(&env, "quick fox", "hybrid");
    assert_eq!(paths.first().map(String::as_str), Some("a.md"));
}

#[test]
fn test_search_type_filter() {
    let env = setup_test_env("");
    fs::write(env.docs().join("c.txt"), "The fox in plain text").unwrap();
    add_docs_source(&env);
    assert!(run_strata(&env, &["sync"]).2);

    let (stdout, _, ok) = run_strata(&env, &["search", "fox", "--type", "md", "--json"]);
    assert!(ok);
    let response: Value = serde_json::from_str(&stdout).unwrap();
    let paths: Vec<&str> = response["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["a.md"]);
}

#[test]
fn test_search_unknown_mode_errors() {
    let env = setup_test_env("");
    assert!(run_strata(&env, &["init"]).2);
    let (_, stderr, ok) = run_strata(&env, &["search", "fox", "--mode", "fuzzy"]);
    assert!(!ok);
    assert!(stderr.contains("Unknown search mode"));
}

#[test]
fn test_invalid_config_rejected() {
    let env = setup_test_env("\n[chunking]\ntarget_tokens = 0\n");
    let (_, stderr, ok) = run_strata(&env, &["init"]);
    assert!(!ok);
    assert!(stderr.contains("target_tokens"));
}

#[test]
fn test_completions() {
    let env = setup_test_env("");
    let (stdout, _, ok) = run_strata(&env, &["completions", "bash"]);
    assert!(ok);
    assert!(stdout.contains("strata"));
}

// ============ Library: SQLite-backed engine ============

/// Bag-of-words embedder: each token lands in a bucket by byte sum.
struct HashEmbedder;

const HASH_DIMS: usize = 32;

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        HASH_DIMS
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut v = vec![0.0f32; HASH_DIMS];
        for token in tokenize(text) {
            let bucket = token.bytes().map(|b| b as usize).sum::<usize>() % HASH_DIMS;
            v[bucket] += 1.0;
        }
        Ok(v)
    }
}

async fn open_engine(tmp: &TempDir, with_embedder: bool) -> Engine {
    let config = parse_config(&format!(
        "[db]\npath = \"{}/strata.sqlite\"\n",
        tmp.path().display()
    ))
    .unwrap();
    let pool = strata::db::connect(&config).await.unwrap();
    strata::migrate::run_migrations(&pool).await.unwrap();
    let embedder: Option<Arc<dyn Embedder>> = if with_embedder {
        Some(Arc::new(HashEmbedder))
    } else {
        None
    };
    Engine::assemble(&config, pool, embedder, Arc::new(NoopSink)).unwrap()
}

async fn count(engine: &Engine, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    sqlx::query_scalar::<_, i64>(&sql)
        .fetch_one(engine.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn engine_hybrid_search_uses_all_stores() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(
        docs.join("config.md"),
        "# Configuration\n\nThe load_config function reads the file and calls parse_config on it.",
    )
    .unwrap();
    fs::write(docs.join("dog.md"), "A lazy dog sleeps in the sun.").unwrap();

    let engine = open_engine(&tmp, true).await;
    let source = engine.register_source(&docs, &[], &[]).await.unwrap();
    let cancel = CancellationToken::new();
    let results = engine
        .sync(&SyncTarget::Source(source.id.clone()), &cancel)
        .await
        .unwrap();
    let report = results[0].1.as_ref().unwrap();
    assert_eq!(report.added, 2);
    assert!(report.store_errors.is_empty());

    assert!(count(&engine, "chunk_vectors").await >= 2);
    assert!(count(&engine, "entity_mentions").await > 0);
    assert!(count(&engine, "relations").await > 0);

    let response = engine
        .search(&SearchRequest::new("parse_config"), &cancel)
        .await;
    assert_eq!(response.mode, SearchMode::Hybrid);
    let top = &response.results[0];
    assert_eq!(top.path, "config.md");
    assert!(top.breakdown.lexical.is_some());
    assert!(top.breakdown.vector.is_some());
    assert!(top.breakdown.graph.is_some());
}

#[tokio::test]
async fn engine_modified_file_is_rechunked_alone() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("a.md"), "The quick brown fox").unwrap();
    fs::write(docs.join("b.md"), "A lazy dog sleeps").unwrap();

    let engine = open_engine(&tmp, false).await;
    let source = engine.register_source(&docs, &[], &[]).await.unwrap();
    let cancel = CancellationToken::new();
    engine.sync(&SyncTarget::All, &cancel).await.unwrap();

    fs::write(docs.join("b.md"), "A lazy cat sleeps").unwrap();
    let results = engine.sync(&SyncTarget::All, &cancel).await.unwrap();
    let report = results[0].1.as_ref().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 1);

    let response = engine
        .search(
            &SearchRequest::new("cat").with_mode(SearchMode::Lexical),
            &cancel,
        )
        .await;
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].path, "b.md");

    let docs_listed = engine.documents(&source.id).await.unwrap();
    assert_eq!(docs_listed.len(), 2);
    assert_eq!(docs_listed[0].path, "a.md");
}

#[tokio::test]
async fn engine_unregister_removes_every_projection() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(
        docs.join("notes.md"),
        "The SyncCoordinator calls IndexWriters for every document.",
    )
    .unwrap();

    let engine = open_engine(&tmp, true).await;
    let source = engine.register_source(&docs, &[], &[]).await.unwrap();
    let cancel = CancellationToken::new();
    engine.sync(&SyncTarget::All, &cancel).await.unwrap();
    assert!(count(&engine, "chunks_fts").await > 0);

    engine.unregister_source(&source.id).await.unwrap();
    for table in [
        "sources",
        "documents",
        "chunks",
        "chunks_fts",
        "chunk_vectors",
        "entity_mentions",
        "relations",
        "entities",
    ] {
        assert_eq!(count(&engine, table).await, 0, "{} not emptied", table);
    }
    assert!(engine.list_sources().await.unwrap().is_empty());
}
