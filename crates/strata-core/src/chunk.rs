//! Structure-aware text chunking.
//!
//! Cleaned text is first segmented into structural blocks according to its
//! content type (fenced code, headings and paragraphs for Markdown;
//! blank-line separated blocks for code; section headers for config), then
//! blocks are packed greedily into chunks of roughly `target_tokens`.
//!
//! # Layout
//!
//! Every chunk *owns* a byte range `start..end` of the input. Owned ranges
//! of consecutive chunks are adjacent and together cover the input exactly,
//! so concatenating [`Chunk::owned_text`] reproduces the cleaned text. A
//! chunk's `text` additionally starts at `overlap_start`, which lies up to
//! `overlap_fraction × target` bytes before `start` (snapped forward to a
//! word boundary and never before the previous chunk's own start).
//!
//! ```text
//!   chunk 0: [=========owned=========]
//!   chunk 1:                  [ovl][=========owned=========]
//!   chunk 2:                                        [ovl][====owned====]
//! ```
//!
//! # Identity
//!
//! A chunk id is the SHA-256 of the document id, the chunk text and a
//! duplicate counter. Re-chunking identical text therefore yields identical
//! ids, which is what lets sync diff chunk sets instead of rewriting them.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::models::{Chunk, ChunkKind, ContentType};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkerConfig {
    pub target_tokens: usize,
    /// Share of the target size repeated at the head of the next chunk.
    pub overlap_fraction: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 512,
            overlap_fraction: 0.15,
        }
    }
}

impl ChunkerConfig {
    pub fn target_chars(&self) -> usize {
        self.target_tokens.max(1) * CHARS_PER_TOKEN
    }

    pub fn overlap_chars(&self) -> usize {
        (self.target_chars() as f32 * self.overlap_fraction.clamp(0.0, 0.5)) as usize
    }
}

/// Position to resume chunking from: the ordinal and byte offset of the
/// next chunk to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkCursor {
    pub ordinal: usize,
    pub offset: usize,
}

/// Ordered chunks of one document.
///
/// [`ChunkStream::cursor`] reports where the stream stands; handing that
/// cursor to [`Chunker::resume`] yields exactly the chunks that were still
/// outstanding.
#[derive(Debug)]
pub struct ChunkStream {
    chunks: std::vec::IntoIter<Chunk>,
    cursor: ChunkCursor,
}

impl ChunkStream {
    pub fn cursor(&self) -> ChunkCursor {
        self.cursor
    }
}

impl Iterator for ChunkStream {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.chunks.next()?;
        self.cursor = ChunkCursor {
            ordinal: chunk.ordinal + 1,
            offset: chunk.end,
        };
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk a whole document.
    pub fn chunk(&self, document_id: &str, text: &str, content_type: &ContentType) -> Vec<Chunk> {
        self.stream(document_id, text, content_type).collect()
    }

    pub fn stream(&self, document_id: &str, text: &str, content_type: &ContentType) -> ChunkStream {
        self.resume(document_id, text, content_type, ChunkCursor::default())
    }

    /// Continue chunking from `cursor`. Chunks owning bytes before the
    /// cursor offset are not produced again.
    pub fn resume(
        &self,
        document_id: &str,
        text: &str,
        content_type: &ContentType,
        cursor: ChunkCursor,
    ) -> ChunkStream {
        let mut chunks = build_chunks(document_id, text, content_type, &self.config);
        chunks.retain(|c| c.start >= cursor.offset);
        ChunkStream {
            chunks: chunks.into_iter(),
            cursor,
        }
    }
}

/// Convenience wrapper around [`Chunker::chunk`].
pub fn chunk_text(
    document_id: &str,
    text: &str,
    content_type: &ContentType,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    Chunker::new(*config).chunk(document_id, text, content_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Heading,
    Fence,
    Code,
    Prose,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    start: usize,
    end: usize,
    kind: BlockKind,
}

impl Block {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitMode {
    Prose,
    Code,
    Fence,
}

struct Span {
    start: usize,
    end: usize,
    kind: ChunkKind,
}

fn build_chunks(
    document_id: &str,
    text: &str,
    content_type: &ContentType,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let blocks = segment(text, content_type);
    let spans = pack(text, &blocks, config.target_chars());
    let overlap = config.overlap_chars();

    let mut dup_counter: HashMap<String, u32> = HashMap::new();
    let mut chunks: Vec<Chunk> = Vec::with_capacity(spans.len());
    let mut prev_start = 0;

    for (ordinal, span) in spans.iter().enumerate() {
        let overlap_start = if ordinal == 0 {
            span.start
        } else {
            overlap_start(text, prev_start, span.start, overlap)
        };
        prev_start = span.start;

        let chunk_text = &text[overlap_start..span.end];
        let hash = sha256_hex(chunk_text.as_bytes());
        let dup = dup_counter.entry(hash.clone()).or_insert(0);
        let id = chunk_id(document_id, chunk_text, *dup);
        *dup += 1;

        chunks.push(Chunk {
            id,
            document_id: document_id.to_string(),
            ordinal,
            start: span.start,
            end: span.end,
            overlap_start,
            text: chunk_text.to_string(),
            kind: span.kind,
            token_estimate: chunk_text.chars().count().div_ceil(CHARS_PER_TOKEN),
            hash,
            prev_id: None,
            next_id: None,
        });
    }

    for i in 0..chunks.len() {
        if i > 0 {
            chunks[i].prev_id = Some(chunks[i - 1].id.clone());
        }
        if i + 1 < chunks.len() {
            chunks[i].next_id = Some(chunks[i + 1].id.clone());
        }
    }

    chunks
}

fn chunk_id(document_id: &str, text: &str, dup: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher.update([0u8]);
    hasher.update(dup.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============ Segmentation ============

fn lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0usize, |pos, line| {
        let start = *pos;
        *pos += line.len();
        Some((start, line))
    })
}

fn segment(text: &str, content_type: &ContentType) -> Vec<Block> {
    let raw = match content_type {
        ContentType::Markdown => segment_markdown(text),
        ContentType::Code(_) => segment_blocks(text, BlockKind::Code, |_| false),
        ContentType::Config => segment_blocks(text, BlockKind::Code, is_config_header),
        _ => segment_blocks(text, BlockKind::Prose, |_| false),
    };
    make_contiguous(raw, text.len())
}

fn segment_markdown(text: &str) -> Vec<Block> {
    let mut raw = Vec::new();
    let mut para: Option<usize> = None;
    // (start, marker, run length)
    let mut fence: Option<(usize, char, usize)> = None;

    for (start, line) in lines(text) {
        let end = start + line.len();
        let content = line.trim_end_matches('\n');

        if let Some((fence_start, marker, run)) = fence {
            if is_fence_close(content, marker, run) {
                raw.push(Block {
                    start: fence_start,
                    end,
                    kind: BlockKind::Fence,
                });
                fence = None;
            }
            continue;
        }

        if let Some((marker, run)) = fence_open(content) {
            close_paragraph(&mut para, start, BlockKind::Prose, &mut raw);
            fence = Some((start, marker, run));
        } else if is_atx_heading(content) {
            close_paragraph(&mut para, start, BlockKind::Prose, &mut raw);
            raw.push(Block {
                start,
                end,
                kind: BlockKind::Heading,
            });
        } else if content.trim().is_empty() {
            close_paragraph(&mut para, start, BlockKind::Prose, &mut raw);
        } else if para.is_none() {
            para = Some(start);
        }
    }

    // An unterminated fence runs to the end of the document.
    if let Some((fence_start, _, _)) = fence {
        raw.push(Block {
            start: fence_start,
            end: text.len(),
            kind: BlockKind::Fence,
        });
    }
    close_paragraph(&mut para, text.len(), BlockKind::Prose, &mut raw);
    raw
}

fn segment_blocks(text: &str, kind: BlockKind, is_header: fn(&str) -> bool) -> Vec<Block> {
    let mut raw = Vec::new();
    let mut para: Option<usize> = None;

    for (start, line) in lines(text) {
        let content = line.trim_end_matches('\n');
        if is_header(content) {
            close_paragraph(&mut para, start, kind, &mut raw);
            raw.push(Block {
                start,
                end: start + line.len(),
                kind: BlockKind::Heading,
            });
        } else if content.trim().is_empty() {
            close_paragraph(&mut para, start, kind, &mut raw);
        } else if para.is_none() {
            para = Some(start);
        }
    }
    close_paragraph(&mut para, text.len(), kind, &mut raw);
    raw
}

fn close_paragraph(para: &mut Option<usize>, at: usize, kind: BlockKind, raw: &mut Vec<Block>) {
    if let Some(start) = para.take() {
        raw.push(Block {
            start,
            end: at,
            kind,
        });
    }
}

/// Stretch blocks so that they tile `0..len`: separators (blank lines)
/// are owned by the block before them.
fn make_contiguous(mut raw: Vec<Block>, len: usize) -> Vec<Block> {
    if raw.is_empty() {
        return vec![Block {
            start: 0,
            end: len,
            kind: BlockKind::Prose,
        }];
    }
    raw[0].start = 0;
    for i in 0..raw.len() - 1 {
        raw[i].end = raw[i + 1].start;
    }
    if let Some(last) = raw.last_mut() {
        last.end = len;
    }
    raw
}

fn fence_open(line: &str) -> Option<(char, usize)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let t = &line[indent..];
    let marker = t.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = t.chars().take_while(|c| *c == marker).count();
    (run >= 3).then_some((marker, run))
}

fn is_fence_close(line: &str, marker: char, run: usize) -> bool {
    let t = line.trim();
    t.len() >= run && t.chars().all(|c| c == marker)
}

fn is_atx_heading(line: &str) -> bool {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return false;
    }
    let t = &line[indent..];
    let hashes = t.bytes().take_while(|b| *b == b'#').count();
    (1..=6).contains(&hashes) && (t.len() == hashes || t[hashes..].starts_with([' ', '\t']))
}

/// `[section]` / `[[array]]` lines and top-level YAML mapping keys.
fn is_config_header(line: &str) -> bool {
    let t = line.trim_end();
    if t.starts_with('[') && t.ends_with(']') && t.len() > 2 {
        return true;
    }
    match t.strip_suffix(':') {
        Some(key) => {
            !key.is_empty()
                && !line.starts_with([' ', '\t', '-', '#'])
                && key
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        None => false,
    }
}

// ============ Packing ============

fn pack(text: &str, blocks: &[Block], target: usize) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut current: Vec<Block> = Vec::new();

    for block in blocks {
        let limit = if block.kind == BlockKind::Fence {
            target + target / 2
        } else {
            target
        };

        if block.len() > limit {
            let carried = take_trailing_headings(&mut current);
            flush(&mut current, &mut spans);
            let from = carried.first().map_or(block.start, |h| h.start);
            let mode = match block.kind {
                BlockKind::Fence => SplitMode::Fence,
                BlockKind::Code => SplitMode::Code,
                BlockKind::Heading | BlockKind::Prose => SplitMode::Prose,
            };
            for (i, (start, end)) in split_range(text, from, block.end, target, mode)
                .into_iter()
                .enumerate()
            {
                let kind = if i == 0 && !carried.is_empty() {
                    ChunkKind::Heading
                } else {
                    chunk_kind_of(block.kind)
                };
                spans.push(Span { start, end, kind });
            }
            continue;
        }

        let size = span_len(&current);
        let only_headings = current.iter().all(|b| b.kind == BlockKind::Heading);
        let overflow = size + block.len() > target;
        let heading_break = block.kind == BlockKind::Heading && size >= target / 2;
        if !current.is_empty() && !only_headings && (overflow || heading_break) {
            let carried = take_trailing_headings(&mut current);
            flush(&mut current, &mut spans);
            current = carried;
        }
        current.push(*block);
    }
    flush(&mut current, &mut spans);
    spans
}

fn span_len(blocks: &[Block]) -> usize {
    match (blocks.first(), blocks.last()) {
        (Some(first), Some(last)) => last.end - first.start,
        _ => 0,
    }
}

/// Pop headings off the tail of `current` so they open the next chunk.
fn take_trailing_headings(current: &mut Vec<Block>) -> Vec<Block> {
    let keep = current
        .iter()
        .rposition(|b| b.kind != BlockKind::Heading)
        .map_or(0, |i| i + 1);
    current.split_off(keep)
}

fn flush(current: &mut Vec<Block>, spans: &mut Vec<Span>) {
    let (Some(first), Some(last)) = (current.first(), current.last()) else {
        return;
    };
    let total = last.end - first.start;
    let code: usize = current
        .iter()
        .filter(|b| matches!(b.kind, BlockKind::Fence | BlockKind::Code))
        .map(Block::len)
        .sum();
    let kind = if first.kind == BlockKind::Heading {
        ChunkKind::Heading
    } else if code * 2 >= total {
        ChunkKind::Code
    } else {
        ChunkKind::Prose
    };
    spans.push(Span {
        start: first.start,
        end: last.end,
        kind,
    });
    current.clear();
}

fn chunk_kind_of(kind: BlockKind) -> ChunkKind {
    match kind {
        BlockKind::Heading => ChunkKind::Heading,
        BlockKind::Fence | BlockKind::Code => ChunkKind::Code,
        BlockKind::Prose => ChunkKind::Prose,
    }
}

/// Cut `from..to` into pieces of at most `max` bytes, preferring the
/// strongest boundary available in each window.
fn split_range(text: &str, from: usize, to: usize, max: usize, mode: SplitMode) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut pos = from;
    let min_piece = max / 4;

    while to - pos > max {
        let window_end = floor_char_boundary(text, pos + max);
        let window = &text[pos..window_end];
        let cut = find_cut(window, mode, min_piece).map_or(window_end, |c| pos + c);
        let cut = if cut <= pos {
            next_char_boundary(text, pos)
        } else {
            cut
        };
        pieces.push((pos, cut));
        pos = cut;
    }
    if pos < to {
        pieces.push((pos, to));
    }
    pieces
}

/// Offset just past the best boundary in `window`, if one lies at least
/// `min` bytes in.
fn find_cut(window: &str, mode: SplitMode, min: usize) -> Option<usize> {
    let accept = |cut: Option<usize>| cut.filter(|c| *c >= min && *c > 0);

    if mode == SplitMode::Prose {
        if let Some(c) = accept(window.rfind("\n\n").map(|i| i + 2)) {
            return Some(c);
        }
        let sentence = [". ", "! ", "? ", ".\n", "!\n", "?\n"]
            .iter()
            .filter_map(|p| window.rfind(p).map(|i| i + p.len()))
            .max();
        if let Some(c) = accept(sentence) {
            return Some(c);
        }
    }
    if let Some(c) = accept(window.rfind('\n').map(|i| i + 1)) {
        return Some(c);
    }
    if mode != SplitMode::Fence {
        if let Some(c) = accept(window.rfind([' ', '\t']).map(|i| i + 1)) {
            return Some(c);
        }
    }
    None
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(text: &str, pos: usize) -> usize {
    text[pos..]
        .chars()
        .next()
        .map_or(text.len(), |c| pos + c.len_utf8())
}

fn overlap_start(text: &str, prev_start: usize, start: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return start;
    }
    let mut from = start.saturating_sub(overlap).max(prev_start);
    while !text.is_char_boundary(from) {
        from += 1;
    }
    if from == prev_start || from >= start {
        return from.min(start);
    }

    let starts_word = text[..from]
        .chars()
        .next_back()
        .map_or(true, char::is_whitespace);
    if starts_word {
        return from;
    }
    // Move forward to the beginning of the next word.
    match text[from..start].char_indices().find(|(_, c)| c.is_whitespace()) {
        Some((i, c)) => from + i + c.len_utf8(),
        None => from,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ChunkerConfig {
        ChunkerConfig {
            target_tokens: 16,
            overlap_fraction: 0.15,
        }
    }

    fn reassemble(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.owned_text()).collect()
    }

    const MARKDOWN: &str = "# Title\n\nIntro paragraph with a few words in it.\n\n\
## Install\n\n```sh\ncargo install strata\nstrata init\n```\n\n\
Second paragraph follows the code. It has two sentences.\n\n\
## Usage\n\nRun the search command with a query string and see ranked results ünïcödé.\n";

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("d", "", &ContentType::Markdown, &small()).is_empty());
    }

    #[test]
    fn owned_spans_cover_input() {
        for ct in [
            ContentType::Markdown,
            ContentType::PlainText,
            ContentType::Code("rust".into()),
            ContentType::Config,
        ] {
            let chunks = chunk_text("doc", MARKDOWN, &ct, &small());
            assert!(chunks.len() > 1, "{ct} should produce several chunks");
            assert_eq!(reassemble(&chunks), MARKDOWN, "coverage for {ct}");
            for pair in chunks.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn single_small_document_is_one_chunk() {
        let chunks = chunk_text("d", "hello world", &ContentType::PlainText, &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].overlap_start, 0);
        assert!(chunks[0].prev_id.is_none() && chunks[0].next_id.is_none());
    }

    #[test]
    fn deterministic_ids() {
        let a = chunk_text("doc", MARKDOWN, &ContentType::Markdown, &small());
        let b = chunk_text("doc", MARKDOWN, &ContentType::Markdown, &small());
        assert_eq!(a, b);
        let other = chunk_text("other", MARKDOWN, &ContentType::Markdown, &small());
        assert_ne!(a[0].id, other[0].id);
    }

    #[test]
    fn duplicate_text_gets_distinct_ids() {
        let text = "same words here\n\nsame words here\n\n";
        let cfg = ChunkerConfig {
            target_tokens: 5,
            overlap_fraction: 0.0,
        };
        let chunks = chunk_text("d", text, &ContentType::PlainText, &cfg);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, chunks[1].text);
        assert_ne!(chunks[0].id, chunks[1].id);
    }

    #[test]
    fn fence_stays_whole() {
        let chunks = chunk_text("d", MARKDOWN, &ContentType::Markdown, &small());
        let fence = "```sh\ncargo install strata\nstrata init\n```";
        assert!(chunks.iter().any(|c| c.owned_text().contains(fence)));
        let code = chunks
            .iter()
            .find(|c| c.owned_text().contains("cargo install"))
            .map(|c| c.kind);
        assert!(matches!(code, Some(ChunkKind::Code) | Some(ChunkKind::Heading)));
    }

    #[test]
    fn heading_never_trails_a_chunk() {
        let chunks = chunk_text("d", MARKDOWN, &ContentType::Markdown, &small());
        for chunk in &chunks[..chunks.len() - 1] {
            let last_line = chunk.owned_text().trim_end().lines().last().unwrap_or("");
            assert!(!last_line.starts_with('#'), "chunk ends with heading: {:?}", chunk.owned_text());
        }
        assert_eq!(chunks[0].kind, ChunkKind::Heading);
    }

    #[test]
    fn overlap_bounded_and_word_aligned() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu nu xi omicron pi rho sigma tau";
        let cfg = small();
        let chunks = chunk_text("d", text, &ContentType::PlainText, &cfg);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert!(next.overlap_start >= prev.start);
            assert!(next.overlap_len() <= cfg.overlap_chars());
            assert!(next.text.ends_with(next.owned_text()));
            if next.overlap_len() > 0 {
                let before = &text[..next.overlap_start];
                assert!(before.ends_with(' '), "overlap starts mid-word");
            }
        }
    }

    #[test]
    fn oversized_multibyte_block_is_cut_on_char_boundaries() {
        let text = "é".repeat(300);
        let chunks = chunk_text("d", &text, &ContentType::PlainText, &small());
        assert!(chunks.len() > 1);
        assert_eq!(reassemble(&chunks), text);
        for c in &chunks {
            assert!(c.end - c.start <= small().target_chars());
        }
    }

    #[test]
    fn resume_produces_identical_tail() {
        let chunker = Chunker::new(small());
        let mut stream = chunker.stream("d", MARKDOWN, &ContentType::Markdown);
        let first: Vec<Chunk> = stream.by_ref().take(2).collect();
        let cursor = stream.cursor();
        let rest: Vec<Chunk> = stream.collect();

        assert_eq!(cursor.ordinal, 2);
        assert_eq!(cursor.offset, first[1].end);
        let resumed: Vec<Chunk> = chunker.resume("d", MARKDOWN, &ContentType::Markdown, cursor).collect();
        assert_eq!(resumed, rest);
    }

    #[test]
    fn links_neighbours() {
        let chunks = chunk_text("d", MARKDOWN, &ContentType::Markdown, &small());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].next_id.as_deref(), Some(pair[1].id.as_str()));
            assert_eq!(pair[1].prev_id.as_deref(), Some(pair[0].id.as_str()));
        }
    }

    #[test]
    fn config_sections_start_chunks() {
        let toml = "[server]\nport = 8080\nhost = \"localhost\"\nworkers = 4\n\n[database]\npath = \"./data/app.sqlite\"\npool = 5\n";
        let cfg = ChunkerConfig {
            target_tokens: 10,
            overlap_fraction: 0.0,
        };
        let chunks = chunk_text("d", toml, &ContentType::Config, &cfg);
        assert!(chunks.iter().any(|c| c.owned_text().starts_with("[database]")));
        assert!(is_config_header("services:"));
        assert!(!is_config_header("  nested:"));
    }
}
