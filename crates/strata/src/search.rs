//! `strata search`.
//!
//! Builds a [`SearchRequest`] from the command line, runs it through the
//! engine and prints ranked chunks. `--explain` adds the per-signal
//! breakdown; `--json` prints the whole [`SearchResponse`].

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use strata_core::classify::SearchMode;
use strata_core::fusion::SignalScore;
use strata_core::search::{RankedResult, SearchRequest, SearchResponse};
use strata_core::store::SearchFilter;

use crate::engine::Engine;

#[derive(Debug, Clone, Default)]
pub struct SearchArgs {
    pub query: String,
    pub mode: Option<String>,
    pub sources: Vec<String>,
    pub types: Vec<String>,
    pub limit: Option<usize>,
    pub explain: bool,
    pub json: bool,
}

impl SearchArgs {
    pub fn request(&self) -> Result<SearchRequest> {
        let mode: SearchMode = match &self.mode {
            Some(m) => m.parse()?,
            None => SearchMode::default(),
        };
        let filter = SearchFilter {
            sources: self.sources.clone(),
            content_types: self
                .types
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .collect(),
        };
        let mut req = SearchRequest::new(self.query.clone())
            .with_mode(mode)
            .with_filter(filter);
        if let Some(limit) = self.limit {
            if limit == 0 {
                anyhow::bail!("--limit must be >= 1");
            }
            req = req.with_limit(limit);
        }
        Ok(req)
    }
}

pub async fn run_search(engine: &Engine, args: &SearchArgs, cancel: &CancellationToken) -> Result<()> {
    let req = args.request()?;
    let response = engine.search(&req, cancel).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    print_response(&response, args.explain);
    Ok(())
}

fn print_response(response: &SearchResponse, explain: bool) {
    for note in &response.degraded {
        eprintln!("warning: {}", note);
    }
    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    if explain {
        let w = &response.weights;
        println!(
            "class: {}  mode: {:?}  weights: lexical={:.2} vector={:.2} graph={:.2}  ({} ms)",
            response.class.as_str(),
            response.mode,
            w.lexical,
            w.vector,
            w.graph,
            response.elapsed_ms
        );
        println!();
    }

    for (i, result) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} #{}",
            i + 1,
            result.score,
            result.path,
            result.ordinal
        );
        println!("    source: {}", result.source_id);
        if !result.snippet.is_empty() {
            println!(
                "    excerpt: \"{}\"",
                result.snippet.replace('\n', " ").trim()
            );
        }
        if explain {
            print_breakdown(result);
        }
        println!("    chunk: {}", result.chunk_id);
        println!();
    }
}

fn print_breakdown(result: &RankedResult) {
    let b = &result.breakdown;
    let signal = |name: &str, s: &Option<SignalScore>| match s {
        Some(s) => println!(
            "    {}: rank {} raw {:.4} -> {:.4}",
            name, s.rank, s.raw_score, s.contribution
        ),
        None => println!("    {}: -", name),
    };
    signal("lexical", &b.lexical);
    signal("vector", &b.vector);
    signal("graph", &b.graph);
    match b.rerank {
        Some(r) => println!("    fused {:.4}  mmr {:.4}  rerank {:.4}", b.fused, b.mmr, r),
        None => println!("    fused {:.4}  mmr {:.4}", b.fused, b.mmr),
    }
}
