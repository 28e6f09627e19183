//! Heuristic entity and relation extraction.
//!
//! A model-free [`EntityExtractor`] good enough to seed the graph store on
//! a laptop. It recognizes:
//!
//! | Form | Kind | Example |
//! |------|------|---------|
//! | definition keyword + name | `function` / `type` / `module` | `fn load_config`, `class Parser` |
//! | path | `path` | `strata_core::search` |
//! | CamelCase / camelCase | `identifier` | `HybridSearcher`, `parseConfig` |
//! | snake_case | `identifier` | `rank_constant` |
//! | capitalized multi-word name | `name` | `Quick Brown Fox` |
//! | markdown heading | `topic` | `## Sync Coordinator` |
//!
//! Entities named in the same sentence are linked with `mentions_with`; a
//! function defined under a type, module or heading is linked from it with
//! `defines`. Confidence starts from how distinctive the form is and grows
//! with repeated mentions.

use std::collections::HashMap;

use async_trait::async_trait;

use strata_core::capability::EntityExtractor;
use strata_core::error::EngineResult;
use strata_core::models::{entity_key, ExtractedEntity, ExtractedRelation};
use strata_core::store::is_stopword;

/// Most entities kept per text, highest confidence first.
const MAX_ENTITIES: usize = 32;
/// Only the first few entities of a sentence are linked pairwise.
const MAX_LINKED_PER_SENTENCE: usize = 6;
const MAX_RELATIONS_PER_ENTITY: usize = 12;
const REPEAT_BONUS: f32 = 0.05;

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EntityExtractor for HeuristicExtractor {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn extract(&self, text: &str) -> EngineResult<Vec<ExtractedEntity>> {
        Ok(extract_entities(text))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    Heading,
    Definition(&'static str),
    Path,
    Identifier,
    Name,
}

impl Form {
    fn kind(&self) -> &'static str {
        match self {
            Form::Heading => "topic",
            Form::Definition(kind) => *kind,
            Form::Path => "path",
            Form::Identifier => "identifier",
            Form::Name => "name",
        }
    }

    fn base_confidence(&self) -> f32 {
        match self {
            Form::Heading | Form::Definition(_) => 0.9,
            Form::Path => 0.8,
            Form::Identifier => 0.7,
            Form::Name => 0.6,
        }
    }
}

struct Candidate {
    name: String,
    form: Form,
    mentions: u32,
    relations: Vec<ExtractedRelation>,
}

#[derive(Default)]
struct Collector {
    order: Vec<Candidate>,
    index: HashMap<String, usize>,
}

impl Collector {
    /// Record one mention; returns the entity key.
    fn mention(&mut self, name: &str, form: Form) -> Option<String> {
        let key = entity_key(name);
        if key.is_empty() {
            return None;
        }
        match self.index.get(&key) {
            Some(&i) => {
                let c = &mut self.order[i];
                c.mentions += 1;
                if form.base_confidence() > c.form.base_confidence() {
                    c.form = form;
                }
            }
            None => {
                self.index.insert(key.clone(), self.order.len());
                self.order.push(Candidate {
                    name: name.to_string(),
                    form,
                    mentions: 1,
                    relations: Vec::new(),
                });
            }
        }
        Some(key)
    }

    fn relate(&mut self, from: &str, to: &str, kind: &str) {
        if from == to {
            return;
        }
        let (Some(&i), Some(&j)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        let target = self.order[j].name.clone();
        let relations = &mut self.order[i].relations;
        if relations.len() >= MAX_RELATIONS_PER_ENTITY
            || relations
                .iter()
                .any(|r| r.kind == kind && entity_key(&r.target) == to)
        {
            return;
        }
        relations.push(ExtractedRelation {
            kind: kind.to_string(),
            target,
        });
    }

    fn finish(self) -> Vec<ExtractedEntity> {
        let mut out: Vec<ExtractedEntity> = self
            .order
            .into_iter()
            .map(|c| ExtractedEntity {
                kind: c.form.kind().to_string(),
                confidence: (c.form.base_confidence()
                    + REPEAT_BONUS * c.mentions.saturating_sub(1) as f32)
                    .min(1.0),
                name: c.name,
                relations: c.relations,
            })
            .collect();
        // stable: equal confidence keeps first-seen order
        out.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        out.truncate(MAX_ENTITIES);
        out
    }
}

/// Run the heuristics over `text`.
pub fn extract_entities(text: &str) -> Vec<ExtractedEntity> {
    let mut collector = Collector::default();
    let mut container: Option<String> = None;

    for line in text.lines() {
        if let Some(heading) = heading_text(line) {
            if let Some(key) = collector.mention(heading, Form::Heading) {
                container = Some(key);
            }
            continue;
        }

        for sentence in split_sentences(line) {
            let mut seen: Vec<String> = Vec::new();
            let tokens = code_tokens(sentence);

            for pair in tokens.windows(2) {
                let Some(kind) = definition_kind(pair[0]) else {
                    continue;
                };
                let name = pair[1].trim_matches(':');
                if !is_identifier(name) {
                    continue;
                }
                let Some(key) = collector.mention(name, Form::Definition(kind)) else {
                    continue;
                };
                if kind == "function" {
                    if let Some(owner) = &container {
                        collector.relate(owner, &key, "defines");
                    }
                } else {
                    container = Some(key.clone());
                }
                seen.push(key);
            }

            for token in &tokens {
                if definition_kind(token).is_some() {
                    continue;
                }
                let form = if token.contains("::") {
                    Form::Path
                } else if is_camel_case(token) || is_snake_case(token) {
                    Form::Identifier
                } else {
                    continue;
                };
                if let Some(key) = collector.mention(token, form) {
                    seen.push(key);
                }
            }

            for name in capitalized_names(sentence) {
                if let Some(key) = collector.mention(&name, Form::Name) {
                    seen.push(key);
                }
            }

            let mut linked: Vec<String> = Vec::new();
            for key in seen {
                if !linked.contains(&key) {
                    linked.push(key);
                }
            }
            linked.truncate(MAX_LINKED_PER_SENTENCE);
            for (i, a) in linked.iter().enumerate() {
                for b in &linked[i + 1..] {
                    collector.relate(a, b, "mentions_with");
                }
            }
        }
    }

    collector.finish()
}

fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    (!title.is_empty()).then_some(title)
}

/// Split on `.`, `!` or `?` followed by whitespace or the end of the line.
fn split_sentences(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let boundary = match chars.peek() {
                None => true,
                Some((_, next)) => next.is_whitespace(),
            };
            if boundary {
                let end = i + c.len_utf8();
                let sentence = line[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        }
    }
    let tail = line[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Runs of identifier characters, keeping `::` path separators.
fn code_tokens(sentence: &str) -> Vec<&str> {
    sentence
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == ':'))
        .map(|t| t.trim_matches(':'))
        .filter(|t| !t.is_empty())
        .collect()
}

fn definition_kind(token: &str) -> Option<&'static str> {
    match token {
        "fn" | "def" | "func" | "function" => Some("function"),
        "struct" | "class" | "enum" | "trait" | "interface" | "impl" => Some("type"),
        "mod" | "module" | "package" => Some("module"),
        _ => None,
    }
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && token.chars().all(|c| c.is_alphanumeric() || c == '_')
        && token.len() >= 2
}

fn is_camel_case(token: &str) -> bool {
    if token.len() < 4 || !token.chars().all(|c| c.is_alphanumeric()) {
        return false;
    }
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_alphabetic()
        && token.chars().any(|c| c.is_lowercase())
        && chars.any(|c| c.is_uppercase())
}

fn is_snake_case(token: &str) -> bool {
    let inner = token.trim_matches('_');
    inner.contains('_')
        && inner.len() >= 4
        && inner.chars().all(|c| c.is_alphanumeric() || c == '_')
        && inner
            .split('_')
            .filter(|part| !part.is_empty())
            .all(|part| part.chars().any(|c| c.is_alphabetic()))
}

fn is_capitalized_word(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_uppercase())
        && word.chars().count() >= 2
        && chars.all(|c| c.is_lowercase())
}

fn close_name(run: &mut Vec<&str>, names: &mut Vec<String>) {
    while run.first().is_some_and(|w| is_stopword(&w.to_lowercase())) {
        run.remove(0);
    }
    if run.len() >= 2 {
        names.push(run.join(" "));
    }
    run.clear();
}

/// Runs of two or more capitalized words within one clause, without a
/// leading stopword (`The Quick Brown Fox` → `Quick Brown Fox`).
fn capitalized_names(sentence: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut run: Vec<&str> = Vec::new();

    for raw in sentence.split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        if is_capitalized_word(word) {
            run.push(word);
            // punctuation after the word closes the name
            if raw.ends_with(|c: char| !c.is_alphanumeric()) {
                close_name(&mut run, &mut names);
            }
        } else {
            close_name(&mut run, &mut names);
        }
    }
    close_name(&mut run, &mut names);
    names
}
