//! Query classification and the per-class store weighting.
//!
//! [`classify`] is a pure heuristic over the query text; the
//! [`StrategyTable`] maps each [`QueryClass`] to (lexical, vector, graph)
//! weights. The table is plain data so configuration can replace rows.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::StoreKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryClass {
    /// Quoted phrases and code identifiers: literal matching wins.
    Exact,
    /// Proper names: the graph knows who and what is connected.
    Entity,
    /// "Why/how" questions and long descriptions: meaning over wording.
    Conceptual,
    /// Short who/what/when questions.
    Factual,
    /// Everything else, typically a couple of loose keywords.
    Exploratory,
}

impl QueryClass {
    pub const ALL: [QueryClass; 5] = [
        QueryClass::Exact,
        QueryClass::Entity,
        QueryClass::Conceptual,
        QueryClass::Factual,
        QueryClass::Exploratory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::Exact => "exact",
            QueryClass::Entity => "entity",
            QueryClass::Conceptual => "conceptual",
            QueryClass::Factual => "factual",
            QueryClass::Exploratory => "exploratory",
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        QueryClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown query class: {}", s))
    }
}

/// Which signals a search may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Semantic,
    Lexical,
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "hybrid" => Ok(SearchMode::Hybrid),
            "semantic" => Ok(SearchMode::Semantic),
            "lexical" | "keyword" => Ok(SearchMode::Lexical),
            other => anyhow::bail!(
                "Unknown search mode: {}. Use hybrid, semantic, or lexical.",
                other
            ),
        }
    }
}

/// Per-store weights of one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub lexical: f64,
    pub vector: f64,
    pub graph: f64,
}

impl StrategyWeights {
    pub const fn new(lexical: f64, vector: f64, graph: f64) -> Self {
        Self {
            lexical,
            vector,
            graph,
        }
    }

    pub fn get(&self, kind: StoreKind) -> f64 {
        match kind {
            StoreKind::Lexical => self.lexical,
            StoreKind::Vector => self.vector,
            StoreKind::Graph => self.graph,
        }
    }

    /// Copy with `kind` switched off.
    pub fn without(mut self, kind: StoreKind) -> Self {
        match kind {
            StoreKind::Lexical => self.lexical = 0.0,
            StoreKind::Vector => self.vector = 0.0,
            StoreKind::Graph => self.graph = 0.0,
        }
        self
    }

    pub fn sum(&self) -> f64 {
        self.lexical + self.vector + self.graph
    }

    /// Weights must be non-negative and sum to 1.
    pub fn validate(&self) -> Result<(), String> {
        if [self.lexical, self.vector, self.graph]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err("weights must be finite and non-negative".to_string());
        }
        if (self.sum() - 1.0).abs() > 1e-6 {
            return Err(format!("weights must sum to 1.0, got {:.3}", self.sum()));
        }
        Ok(())
    }
}

/// Class → weights.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyTable {
    rows: HashMap<QueryClass, StrategyWeights>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        let rows = [
            (QueryClass::Exact, StrategyWeights::new(0.7, 0.2, 0.1)),
            (QueryClass::Entity, StrategyWeights::new(0.25, 0.2, 0.55)),
            (QueryClass::Conceptual, StrategyWeights::new(0.2, 0.65, 0.15)),
            (QueryClass::Factual, StrategyWeights::new(0.4, 0.4, 0.2)),
            (QueryClass::Exploratory, StrategyWeights::new(0.35, 0.35, 0.3)),
        ];
        Self {
            rows: rows.into_iter().collect(),
        }
    }
}

impl StrategyTable {
    pub fn weights(&self, class: QueryClass) -> StrategyWeights {
        self.rows
            .get(&class)
            .copied()
            .unwrap_or(StrategyWeights::new(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0))
    }

    pub fn with_override(mut self, class: QueryClass, weights: StrategyWeights) -> Self {
        self.rows.insert(class, weights);
        self
    }

    /// Weights for `class` under `mode`. The single-signal modes ignore the
    /// table.
    pub fn resolve(&self, class: QueryClass, mode: SearchMode) -> StrategyWeights {
        match mode {
            SearchMode::Hybrid => self.weights(class),
            SearchMode::Semantic => StrategyWeights::new(0.0, 1.0, 0.0),
            SearchMode::Lexical => StrategyWeights::new(1.0, 0.0, 0.0),
        }
    }
}

/// Phrases enclosed in double quotes or backticks.
pub fn quoted_phrases(query: &str) -> Vec<String> {
    let mut phrases = Vec::new();
    for quote in ['"', '`'] {
        let parts: Vec<&str> = query.split(quote).collect();
        // Odd indices sit between a pair of quotes.
        for (i, part) in parts.iter().enumerate() {
            if i % 2 == 1 && i + 1 < parts.len() && !part.trim().is_empty() {
                phrases.push(part.trim().to_string());
            }
        }
    }
    phrases
}

fn is_code_identifier(word: &str) -> bool {
    let w = word.trim_matches(|c: char| matches!(c, ',' | ';' | '?' | '!' | ':' | '\'' | '"'));
    if w.contains("::") || w.contains("->") || w.ends_with("()") {
        return true;
    }
    let chars: Vec<char> = w.chars().collect();
    let snake = chars.windows(3).any(|t| {
        t[1] == '_' && t[0].is_alphanumeric() && t[2].is_alphanumeric()
    });
    let camel = chars
        .windows(2)
        .any(|p| p[0].is_lowercase() && p[1].is_uppercase());
    let dotted = chars.windows(3).any(|t| {
        t[1] == '.' && t[0].is_alphabetic() && t[2].is_alphabetic()
    }) && !w.ends_with('.');
    snake || camel || dotted
}

fn starts_upper(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

/// Classify a query. Deterministic and side-effect free.
pub fn classify(query: &str) -> QueryClass {
    let q = query.trim();
    if q.is_empty() {
        return QueryClass::Exploratory;
    }
    if !quoted_phrases(q).is_empty() {
        return QueryClass::Exact;
    }

    let words: Vec<&str> = q.split_whitespace().collect();
    if words.iter().any(|w| is_code_identifier(w)) {
        return QueryClass::Exact;
    }

    let lower = q.to_lowercase();
    let first = words[0].to_lowercase();
    let first = first.trim_matches(|c: char| !c.is_alphanumeric());

    if lower.starts_with("how many") || lower.starts_with("how much") {
        return QueryClass::Factual;
    }
    if matches!(first, "why" | "how" | "explain" | "describe" | "compare") {
        return QueryClass::Conceptual;
    }
    if matches!(
        first,
        "who" | "what" | "when" | "where" | "which" | "whose" | "whom"
    ) {
        return QueryClass::Factual;
    }

    let inner_caps = words.iter().skip(1).filter(|w| starts_upper(w)).count();
    let all_caps = words.iter().all(|w| starts_upper(w));
    if inner_caps > 0 || (all_caps && words.len() <= 3) {
        return QueryClass::Entity;
    }
    if words.len() >= 6 {
        return QueryClass::Conceptual;
    }
    QueryClass::Exploratory
}
