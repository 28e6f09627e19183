//! `strata source add|remove|list`.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use strata_core::models::Source;

use crate::engine::Engine;

/// One row of `strata source list --json`.
#[derive(Debug, Serialize)]
pub struct SourceSummary {
    #[serde(flatten)]
    pub source: Source,
    pub documents: usize,
}

pub async fn run_add(
    engine: &Engine,
    path: &Path,
    include: &[String],
    exclude: &[String],
    json: bool,
) -> Result<()> {
    let source = engine.register_source(path, include, exclude).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&source)?);
    } else {
        println!("registered {} {}", source.id, source.root.display());
    }
    Ok(())
}

pub async fn run_remove(engine: &Engine, id: &str) -> Result<()> {
    engine.unregister_source(id).await?;
    println!("removed {}", id);
    Ok(())
}

pub async fn summaries(engine: &Engine) -> Result<Vec<SourceSummary>> {
    let mut out = Vec::new();
    for source in engine.list_sources().await? {
        let documents = engine.documents(&source.id).await?.len();
        out.push(SourceSummary { source, documents });
    }
    Ok(out)
}

pub async fn run_list(engine: &Engine, json: bool) -> Result<()> {
    let rows = summaries(engine).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No sources registered.");
        return Ok(());
    }

    println!(
        "{:<14} {:<14} {:>6} {:<17} ROOT",
        "ID", "STATE", "DOCS", "LAST SYNC"
    );
    for row in &rows {
        let last_sync = row
            .source
            .last_synced_at
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<14} {:>6} {:<17} {}",
            row.source.id,
            row.source.state.label(),
            row.documents,
            last_sync,
            row.source.root.display()
        );
        if let Some(message) = row.source.state.message() {
            println!("    error: {}", message);
        }
    }
    Ok(())
}
