//! `strata sync`.
//!
//! Resolves the target, runs the sync and prints one summary block per
//! source. Progress goes to the configured event sink on stderr; the
//! summary goes to stdout.

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use strata_core::sync::{SyncReport, SyncTarget};

use crate::engine::Engine;

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SourceOutcome {
    Ok(SyncReport),
    Failed { source_id: String, error: String },
}

/// `source` wins over `all`; with neither, every source is synced.
pub fn target(source: Option<String>, all: bool) -> SyncTarget {
    match source {
        Some(id) if !all => SyncTarget::Source(id),
        _ => SyncTarget::All,
    }
}

/// Returns `true` when every targeted source synced without a hard failure.
pub async fn run_sync(
    engine: &Engine,
    target: &SyncTarget,
    json: bool,
    cancel: &CancellationToken,
) -> Result<bool> {
    let results = engine.sync(target, cancel).await?;
    let mut all_ok = true;
    let mut outcomes = Vec::with_capacity(results.len());

    for (source_id, result) in results {
        match result {
            Ok(report) => outcomes.push(SourceOutcome::Ok(report)),
            Err(e) => {
                all_ok = false;
                outcomes.push(SourceOutcome::Failed {
                    source_id,
                    error: e.to_string(),
                });
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else if outcomes.is_empty() {
        println!("No sources registered.");
    } else {
        for outcome in &outcomes {
            print_outcome(outcome);
        }
    }
    Ok(all_ok)
}

fn print_outcome(outcome: &SourceOutcome) {
    match outcome {
        SourceOutcome::Ok(report) => {
            println!("sync {}", report.source_id);
            println!("  added: {}", report.added);
            println!("  updated: {}", report.updated);
            println!("  removed: {}", report.removed);
            println!("  unchanged: {}", report.unchanged);
            if report.retried > 0 {
                println!("  store retries: {}", report.retried);
            }
            if report.skipped > 0 {
                println!("  skipped (unsupported): {}", report.skipped);
            }
            if report.kept_unreadable > 0 {
                println!("  kept (unreadable directory): {}", report.kept_unreadable);
            }
            if report.errored > 0 {
                println!("  errored: {}", report.errored);
                for err in &report.errors {
                    println!("    {}: {}", err.path, err.message);
                }
            }
            for err in &report.store_errors {
                println!("  {} store failed for {}: {}", err.store, err.path, err.message);
            }
            println!("  took: {} ms", report.duration_ms);
            if report.cancelled {
                println!("cancelled");
            } else {
                println!("ok");
            }
        }
        SourceOutcome::Failed { source_id, error } => {
            println!("sync {}", source_id);
            println!("  error: {}", error);
            println!("failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_resolution() {
        assert_eq!(target(None, false), SyncTarget::All);
        assert_eq!(target(None, true), SyncTarget::All);
        assert_eq!(
            target(Some("abc".into()), false),
            SyncTarget::Source("abc".into())
        );
    }
}
