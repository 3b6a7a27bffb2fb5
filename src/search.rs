use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{MemoryErr, Result};
use crate::store::{cosine_similarity, StoredCodeRecord, StoredSolutionRecord, SymbolMatch, VectorStore};

// ---------------------------------------------------------------------------
// Hybrid retrieval: vector kNN + full-text + exact-symbol, fused with
// Reciprocal Rank Fusion, thinned by cosine de-duplication, then re-ranked
// by recency / file overlap / keyword density / symbol match.
//
// Per request the flow is QUEUED → FETCH(V,F,E) → FUSE → FILTER → DEDUP →
// RERANK → RETURN; an empty table short-circuits straight to an empty
// return, and a failing backend only contributes an empty candidate list.
// ---------------------------------------------------------------------------

/// RRF constant. Contribution of a list member is 1/(K + rank + 1).
const RRF_K: f32 = 60.0;

/// Candidate rows whose vectors are this similar to a kept row are dropped.
const DEDUP_COSINE: f32 = 0.95;

/// Exact-symbol boosts, added on top of the RRF contribution.
const EXACT_BOOST: f32 = 0.5;
const PREFIX_BOOST: f32 = 0.2;

/// Unified search weighs code hits slightly below transcript hits.
const CODE_SOURCE_WEIGHT: f32 = 0.85;

/// Re-rank factor weights (multiplicative on the fused score).
const W_RECENCY: f32 = 0.15;
const W_FILE_OVERLAP: f32 = 0.25;
const W_KEYWORD: f32 = 0.35;
const W_SYMBOL: f32 = 0.25;

/// Recency half-life factor: score halves every 14 days.
const RECENCY_DECAY_DAYS: f32 = 14.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Restrict to records captured by this agent.
    pub agent: Option<String>,
    /// Keep only rows whose changed files contain one of these needles
    /// (case-insensitive substring).
    pub files: Vec<String>,
    /// Drop results scoring below this.
    pub min_score: Option<f32>,
    /// Raw query text; enables the FTS backend and the re-ranker.
    pub query_text: Option<String>,
    /// Re-ranking opt-out (defaults to on).
    pub rerank: Option<bool>,
}

impl SearchFilter {
    fn rerank_enabled(&self) -> bool {
        self.rerank.unwrap_or(true)
    }

    /// Stable representation for the search-result cache key.
    pub fn cache_repr(&self) -> String {
        format!(
            "agent={:?};files={:?};min={:?};rerank={:?}",
            self.agent, self.files, self.min_score, self.rerank
        )
    }
}

#[derive(Debug, Clone)]
pub struct SolutionHit {
    pub chunk: StoredSolutionRecord,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct CodeHit {
    pub chunk: StoredCodeRecord,
    pub score: f32,
}

/// Which table a unified result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Transcript,
    Code,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedResult {
    pub source: ResultSource,
    pub id: String,
    pub score: f32,
    pub summary: String,
    /// Prompt text (transcript) or `path:symbol` (code).
    pub headline: String,
    pub language: String,
}

/// Lookup result for one symbol's neighborhood in the code graph.
#[derive(Debug, Clone)]
pub struct SymbolContext {
    pub definition: StoredCodeRecord,
    pub callers: Vec<StoredCodeRecord>,
    /// Names this symbol calls (resolved or not).
    pub callees: Vec<String>,
    pub importers: Vec<StoredCodeRecord>,
}

fn candidate_pool(top_k: usize) -> usize {
    (5 * top_k).max(50)
}

// ---------------------------------------------------------------------------
// Fusion
// ---------------------------------------------------------------------------

/// Accumulate RRF contributions for one ranked list.
fn rrf_accumulate<T>(scores: &mut HashMap<String, (f32, T)>, list: Vec<(String, T)>) {
    for (rank, (id, payload)) in list.into_iter().enumerate() {
        let contribution = 1.0 / (RRF_K + rank as f32 + 1.0);
        scores
            .entry(id)
            .and_modify(|(s, _)| *s += contribution)
            .or_insert((contribution, payload));
    }
}

/// Sort best-first with a stable id tie-break, so identical inputs always
/// produce identical output orderings (RRF sums can tie exactly).
fn sort_desc<T>(rows: &mut [(f32, T)], id_of: impl Fn(&T) -> &str) {
    rows.sort_by(|a, b| {
        b.0
            .partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| id_of(&a.1).cmp(id_of(&b.1)))
    });
}

// ---------------------------------------------------------------------------
// Re-ranker
// ---------------------------------------------------------------------------

fn token_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[a-z0-9_]+").expect("token regex"))
}

fn symbol_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\b([A-Za-z_$][A-Za-z0-9_$]*[A-Z_$][A-Za-z0-9_$]*|[a-z$][a-z0-9]*_[a-z0-9_]+)\b")
            .expect("symbol regex")
    })
}

fn tokenize(query: &str, min_len: usize) -> Vec<String> {
    token_regex()
        .find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|t| t.len() >= min_len)
        .collect()
}

/// Identifier-looking tokens of the query: symbol-regex matches plus any
/// token of length ≥ 4 that starts with a letter.
fn query_symbols(query: &str) -> Vec<String> {
    let mut out: Vec<String> = symbol_regex()
        .captures_iter(query)
        .map(|c| c[1].to_string())
        .collect();
    for tok in query.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '$') {
        if tok.len() >= 4 && tok.chars().next().map(|c| c.is_alphabetic()).unwrap_or(false) {
            let t = tok.to_string();
            if !out.contains(&t) {
                out.push(t);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RerankFactors {
    pub recency: f32,
    pub file_overlap: f32,
    pub keyword_density: f32,
    pub symbol_match: f32,
}

impl RerankFactors {
    fn multiplier(&self) -> f32 {
        1.0 + W_RECENCY * self.recency
            + W_FILE_OVERLAP * self.file_overlap
            + W_KEYWORD * self.keyword_density
            + W_SYMBOL * self.symbol_match
    }
}

/// All four factors land in [0, 1], so the multiplier lands in [1, 2].
pub(crate) fn rerank_factors(
    record: &StoredSolutionRecord,
    query_text: &str,
    filter_files: &[String],
) -> RerankFactors {
    // Recency: halves every RECENCY_DECAY_DAYS.
    let recency = record
        .timestamp
        .map(|ts| {
            let age_days = (Utc::now() - ts).num_seconds().max(0) as f32 / 86_400.0;
            2f32.powf(-age_days / RECENCY_DECAY_DAYS)
        })
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    // File overlap: fraction of filter needles present in the stored paths.
    let file_overlap = if filter_files.is_empty() {
        0.0
    } else {
        let stored: Vec<String> = record
            .files_changed
            .iter()
            .map(|f| f.to_lowercase())
            .collect();
        let matched = filter_files
            .iter()
            .filter(|needle| {
                let n = needle.to_lowercase();
                stored.iter().any(|f| f.contains(&n))
            })
            .count();
        matched as f32 / filter_files.len() as f32
    };

    // Keyword density: fraction of query tokens present in the record text.
    let tokens = tokenize(query_text, 3);
    let keyword_density = if tokens.is_empty() {
        0.0
    } else {
        let haystack = format!(
            "{}\n{}\n{}",
            record.prompt, record.summary, record.embedding_text
        )
        .to_lowercase();
        let matched = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
        matched as f32 / tokens.len() as f32
    };

    // Symbol match: fraction of query identifiers present in embedding text.
    let symbols = query_symbols(query_text);
    let symbol_match = if symbols.is_empty() {
        0.0
    } else {
        let haystack = record.embedding_text.to_lowercase();
        let matched = symbols
            .iter()
            .filter(|s| haystack.contains(&s.to_lowercase()))
            .count();
        matched as f32 / symbols.len() as f32
    };

    RerankFactors {
        recency,
        file_overlap,
        keyword_density,
        symbol_match,
    }
}

// ---------------------------------------------------------------------------
// Transcript search
// ---------------------------------------------------------------------------

/// Hybrid search over the solutions table.
pub fn search_solutions(
    store: &mut VectorStore,
    query_vector: &[f32],
    top_k: usize,
    filter: &SearchFilter,
) -> Vec<SolutionHit> {
    if top_k == 0 || !store.has_solutions() {
        return vec![];
    }
    let pool = candidate_pool(top_k);
    let agent = filter.agent.as_deref();

    // ── Fetch ────────────────────────────────────────────────────────────
    let vector_list: Vec<(String, StoredSolutionRecord)> = store
        .knn_solutions(query_vector, pool, agent)
        .into_iter()
        .map(|(_, r)| (r.id.clone(), r))
        .collect();

    let fts_list: Vec<(String, StoredSolutionRecord)> = match filter.query_text.as_deref() {
        Some(q) if !q.trim().is_empty() => store
            .fts_solutions(q, pool, agent)
            .into_iter()
            .map(|(_, r)| (r.id.clone(), r))
            .collect(),
        _ => vec![],
    };

    // ── Fuse ─────────────────────────────────────────────────────────────
    let mut fused: HashMap<String, (f32, StoredSolutionRecord)> = HashMap::new();
    rrf_accumulate(&mut fused, vector_list);
    rrf_accumulate(&mut fused, fts_list);

    let mut rows: Vec<(f32, StoredSolutionRecord)> = fused.into_values().collect();
    sort_desc(&mut rows, |r| r.id.as_str());
    rows.truncate(pool);

    // ── File filter ──────────────────────────────────────────────────────
    if !filter.files.is_empty() {
        let needles: Vec<String> = filter.files.iter().map(|f| f.to_lowercase()).collect();
        rows.retain(|(_, r)| {
            r.files_changed
                .iter()
                .any(|f| needles.iter().any(|n| f.to_lowercase().contains(n)))
        });
    }

    // ── De-dup by vector similarity ──────────────────────────────────────
    let mut kept: Vec<(f32, StoredSolutionRecord)> = Vec::new();
    for (score, record) in rows {
        let duplicate = kept
            .iter()
            .any(|(_, k)| cosine_similarity(&record.vector, &k.vector) > DEDUP_COSINE);
        if !duplicate {
            kept.push((score, record));
        }
    }

    // ── Re-rank ──────────────────────────────────────────────────────────
    if let Some(q) = filter.query_text.as_deref() {
        if filter.rerank_enabled() && !q.trim().is_empty() {
            for (score, record) in kept.iter_mut() {
                *score *= rerank_factors(record, q, &filter.files).multiplier();
            }
            sort_desc(&mut kept, |r| r.id.as_str());
        }
    }

    // ── Threshold + cap ──────────────────────────────────────────────────
    let min_score = filter.min_score.unwrap_or(0.0);
    kept.into_iter()
        .filter(|(s, _)| *s >= min_score)
        .take(top_k)
        .map(|(score, chunk)| SolutionHit { chunk, score })
        .collect()
}

// ---------------------------------------------------------------------------
// Code search
// ---------------------------------------------------------------------------

/// Hybrid search over the code table, with the exact-symbol fast path.
pub fn search_code(
    store: &mut VectorStore,
    query_vector: &[f32],
    top_k: usize,
    query_text: Option<&str>,
    min_score: Option<f32>,
) -> Vec<CodeHit> {
    if top_k == 0 || !store.has_code() {
        return vec![];
    }
    let pool = candidate_pool(top_k);

    let vector_list: Vec<(String, StoredCodeRecord)> = store
        .knn_code(query_vector, pool)
        .into_iter()
        .map(|(_, r)| (r.id.clone(), r))
        .collect();

    let (fts_list, exact_list) = match query_text {
        Some(q) if !q.trim().is_empty() => {
            let fts: Vec<(String, StoredCodeRecord)> = store
                .fts_code(q, pool)
                .into_iter()
                .map(|(_, r)| (r.id.clone(), r))
                .collect();
            (fts, store.exact_symbol_matches(q))
        }
        _ => (vec![], vec![]),
    };

    let mut fused: HashMap<String, (f32, StoredCodeRecord)> = HashMap::new();
    rrf_accumulate(&mut fused, vector_list);
    rrf_accumulate(&mut fused, fts_list);
    rrf_accumulate(
        &mut fused,
        exact_list
            .iter()
            .map(|(_, r)| (r.id.clone(), r.clone()))
            .collect(),
    );

    // Exact hits get their additive boost on top of the RRF contribution.
    for (tier, record) in &exact_list {
        let boost = match tier {
            SymbolMatch::Exact => EXACT_BOOST,
            SymbolMatch::Prefix => PREFIX_BOOST,
        };
        if let Some((score, _)) = fused.get_mut(&record.id) {
            *score += boost;
        }
    }

    let mut rows: Vec<(f32, StoredCodeRecord)> = fused.into_values().collect();
    sort_desc(&mut rows, |r| r.id.as_str());

    let min_score = min_score.unwrap_or(0.0);
    rows.into_iter()
        .filter(|(s, _)| *s >= min_score)
        .take(top_k)
        .map(|(score, chunk)| CodeHit { chunk, score })
        .collect()
}

// ---------------------------------------------------------------------------
// Unified search
// ---------------------------------------------------------------------------

/// Sources a unified search may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedSource {
    #[default]
    All,
    Transcript,
    Code,
}

/// Merge transcript and code hits into one ranked list. Code scores carry a
/// 0.85 source weight so session knowledge outranks raw symbols at parity.
pub fn unified_search(
    store: &mut VectorStore,
    query_vector: &[f32],
    top_k: usize,
    source: UnifiedSource,
    filter: &SearchFilter,
) -> Vec<UnifiedResult> {
    if top_k == 0 {
        return vec![];
    }

    let mut merged: Vec<UnifiedResult> = Vec::new();

    if matches!(source, UnifiedSource::All | UnifiedSource::Transcript) {
        for hit in search_solutions(store, query_vector, top_k * 2, filter) {
            merged.push(UnifiedResult {
                source: ResultSource::Transcript,
                id: hit.chunk.id.clone(),
                score: hit.score,
                summary: if hit.chunk.summary.is_empty() {
                    crate::source::cap_chars(&hit.chunk.prompt, 200)
                } else {
                    hit.chunk.summary.clone()
                },
                headline: crate::source::cap_chars(&hit.chunk.prompt, 120),
                language: hit.chunk.language.clone(),
            });
        }
    }

    if matches!(source, UnifiedSource::All | UnifiedSource::Code) {
        for hit in search_code(
            store,
            query_vector,
            top_k * 2,
            filter.query_text.as_deref(),
            None,
        ) {
            merged.push(UnifiedResult {
                source: ResultSource::Code,
                id: hit.chunk.id.clone(),
                score: hit.score * CODE_SOURCE_WEIGHT,
                summary: hit.chunk.summary.clone(),
                headline: format!("{}:{}", hit.chunk.path, hit.chunk.symbol),
                language: hit.chunk.language.clone(),
            });
        }
    }

    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    let min_score = filter.min_score.unwrap_or(0.0);
    merged.retain(|r| r.score >= min_score);
    merged.truncate(top_k);
    merged
}

// ---------------------------------------------------------------------------
// Symbol context
// ---------------------------------------------------------------------------

fn csv_contains(csv: &str, name: &str) -> bool {
    csv.split(',').any(|c| c.trim() == name)
}

fn csv_import_names(csv: &str) -> Vec<String> {
    csv.split(',')
        .filter_map(|pair| pair.split(':').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The call/import neighborhood of one symbol.
pub fn symbol_context(store: &VectorStore, name: &str) -> Result<SymbolContext> {
    let mut definitions = store.find_symbol_definitions(name);
    if definitions.is_empty() {
        return Err(MemoryErr::NotFound(format!("symbol `{name}`")));
    }
    let definition = definitions.remove(0);
    let bare = definition
        .symbol
        .rsplit('.')
        .next()
        .unwrap_or(&definition.symbol)
        .to_string();

    let mut callers = Vec::new();
    let mut importers = Vec::new();
    for row in store.scan_code_rows() {
        if row.id == definition.id {
            continue;
        }
        if csv_contains(&row.calls, &bare) {
            callers.push(row.clone());
        }
        if csv_import_names(&row.imports).iter().any(|n| n == &bare) {
            importers.push(row.clone());
        }
    }

    let callees: Vec<String> = definition
        .calls
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(SymbolContext {
        definition,
        callers,
        callees,
        importers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SCHEMA_VERSION;
    use chrono::Utc;
    use std::path::Path;

    fn solution(id: &str, vector: Vec<f32>, prompt: &str) -> StoredSolutionRecord {
        StoredSolutionRecord {
            id: id.to_string(),
            checkpoint_id: id.split('-').next().unwrap_or(id).to_string(),
            session_index: 0,
            prompt: prompt.to_string(),
            response: String::new(),
            diff_summary: String::new(),
            summary: String::new(),
            embedding_text: format!("Question: {prompt}\n\nAnswer: "),
            vector,
            agent: "claude".to_string(),
            timestamp: Some(Utc::now()),
            files_changed: vec![],
            tokens_used: 0,
            symbols: vec![],
            language: "typescript".to_string(),
            content_hash: None,
            source: "transcript".to_string(),
            version: SCHEMA_VERSION,
        }
    }

    fn code(id: &str, symbol: &str, vector: Vec<f32>) -> StoredCodeRecord {
        StoredCodeRecord {
            id: id.to_string(),
            path: id.split(':').next().unwrap_or("x.ts").to_string(),
            symbol: symbol.to_string(),
            symbol_type: "function".to_string(),
            language: "typescript".to_string(),
            body: String::new(),
            summary: format!("function {symbol}"),
            embedding_text: format!("function {symbol} in file"),
            vector,
            calls: String::new(),
            imports: String::new(),
            start_line: 1,
            last_modified: Some(Utc::now()),
            source: "code".to_string(),
            version: SCHEMA_VERSION,
        }
    }

    fn store_with(dir: &Path, solutions: Vec<StoredSolutionRecord>, codes: Vec<StoredCodeRecord>) -> VectorStore {
        let mut store = VectorStore::open(dir, 3);
        if !solutions.is_empty() {
            store.insert_chunks(solutions).unwrap();
        }
        if !codes.is_empty() {
            store.insert_code_chunks(codes).unwrap();
        }
        store.ensure_fts_index();
        store
    }

    #[test]
    fn empty_store_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 3);
        assert!(search_solutions(&mut store, &[1.0, 0.0, 0.0], 5, &SearchFilter::default()).is_empty());
        assert!(search_code(&mut store, &[1.0, 0.0, 0.0], 5, None, None).is_empty());
    }

    #[test]
    fn top_k_zero_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            vec![solution("cp-0-0", vec![1.0, 0.0, 0.0], "anything")],
            vec![],
        );
        assert!(search_solutions(&mut store, &[1.0, 0.0, 0.0], 0, &SearchFilter::default()).is_empty());
    }

    #[test]
    fn query_text_ranks_matching_chunk_first() {
        // S1: "unit tests" query must rank the unit-test chunk first even
        // though the other chunk's vector is closer.
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            vec![
                solution("cp-0-0", vec![1.0, 0.0, 0.0], "How does X work?"),
                solution("cp-0-1", vec![0.9, 0.43, 0.0], "Write unit tests"),
            ],
            vec![],
        );

        let filter = SearchFilter {
            query_text: Some("unit tests".to_string()),
            ..Default::default()
        };
        let hits = search_solutions(&mut store, &[1.0, 0.0, 0.0], 2, &filter);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "cp-0-1");
        assert!(hits[0].score > hits[1].score);
        assert!(hits[1].score > 0.0);
    }

    #[test]
    fn search_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            vec![
                solution("cp-0-0", vec![1.0, 0.0, 0.0], "alpha work"),
                solution("cp-0-1", vec![0.5, 0.5, 0.0], "beta work"),
                solution("cp-0-2", vec![0.0, 1.0, 0.0], "gamma work"),
            ],
            vec![],
        );
        let filter = SearchFilter {
            query_text: Some("work".to_string()),
            ..Default::default()
        };
        let a: Vec<(String, f32)> = search_solutions(&mut store, &[0.7, 0.3, 0.0], 3, &filter)
            .into_iter()
            .map(|h| (h.chunk.id, h.score))
            .collect();
        let b: Vec<(String, f32)> = search_solutions(&mut store, &[0.7, 0.3, 0.0], 3, &filter)
            .into_iter()
            .map(|h| (h.chunk.id, h.score))
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn near_duplicate_vectors_collapse() {
        // S3: two chunks with cosine ≈ 0.97 — exactly one survives dedup.
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            vec![
                solution("cp-0-0", vec![1.0, 0.0, 0.0], "first"),
                solution("cp-0-1", vec![0.97, 0.243, 0.0], "second"),
                solution("cp-0-2", vec![0.0, 0.0, 1.0], "distinct"),
            ],
            vec![],
        );
        let hits = search_solutions(&mut store, &[1.0, 0.0, 0.0], 10, &SearchFilter::default());
        let near: Vec<&str> = hits
            .iter()
            .filter(|h| h.chunk.id.starts_with("cp-0-0") || h.chunk.id.starts_with("cp-0-1"))
            .map(|h| h.chunk.id.as_str())
            .collect();
        assert_eq!(near.len(), 1, "one of the two near-duplicates must be dropped");

        // P6: all surviving pairs are ≤ the dedup threshold.
        for (i, a) in hits.iter().enumerate() {
            for b in hits.iter().skip(i + 1) {
                assert!(cosine_similarity(&a.chunk.vector, &b.chunk.vector) <= DEDUP_COSINE);
            }
        }
    }

    #[test]
    fn file_filter_keeps_matching_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut with_files = solution("cp-0-0", vec![1.0, 0.0, 0.0], "auth change");
        with_files.files_changed = vec!["src/Auth/login.ts".to_string()];
        let without = solution("cp-0-1", vec![0.99, 0.14, 0.0], "other change");
        let mut store = store_with(dir.path(), vec![with_files, without], vec![]);

        let filter = SearchFilter {
            files: vec!["auth".to_string()],
            ..Default::default()
        };
        let hits = search_solutions(&mut store, &[1.0, 0.0, 0.0], 10, &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "cp-0-0");
    }

    #[test]
    fn min_score_threshold_applies() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            vec![solution("cp-0-0", vec![1.0, 0.0, 0.0], "x")],
            vec![],
        );
        let filter = SearchFilter {
            min_score: Some(10.0),
            ..Default::default()
        };
        assert!(search_solutions(&mut store, &[1.0, 0.0, 0.0], 5, &filter).is_empty());
    }

    #[test]
    fn rerank_factors_are_bounded() {
        // P7: every factor in [0,1]; multiplier in [1,2].
        let mut record = solution("cp-0-0", vec![1.0, 0.0, 0.0], "refactor the parser module");
        record.files_changed = vec!["src/parser.ts".to_string()];
        record.summary = "TASK: refactor parser".to_string();

        let f = rerank_factors(
            &record,
            "refactor parser parseConfig",
            &["parser".to_string(), "nomatch".to_string()],
        );
        for factor in [f.recency, f.file_overlap, f.keyword_density, f.symbol_match] {
            assert!((0.0..=1.0).contains(&factor), "factor out of range: {factor}");
        }
        let m = f.multiplier();
        assert!((1.0..=2.0).contains(&m));
        // Fresh record → recency near 1; one of two needles matches.
        assert!(f.recency > 0.99);
        assert!((f.file_overlap - 0.5).abs() < 1e-6);
    }

    #[test]
    fn exact_symbol_boost_wins_code_search() {
        // S2: the chunk defining parseConfig must come first on an exact
        // symbol query, regardless of vector proximity.
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            vec![],
            vec![
                code("a.ts:parseConfig:1", "parseConfig", vec![0.0, 1.0, 0.0]),
                code("b.ts:loadData:1", "loadData", vec![1.0, 0.0, 0.0]),
                code("c.ts:writeOutput:1", "writeOutput", vec![0.99, 0.1, 0.0]),
            ],
        );
        let hits = search_code(&mut store, &[1.0, 0.0, 0.0], 3, Some("parseConfig"), None);
        assert_eq!(hits[0].chunk.symbol, "parseConfig");
        assert!(hits[0].score > hits[1].score + 0.2, "boost must dominate RRF spread");
    }

    #[test]
    fn unified_merges_and_weighs_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            vec![solution("cp-0-0", vec![1.0, 0.0, 0.0], "How to parse config?")],
            vec![code("a.ts:parseConfig:1", "parseConfig", vec![1.0, 0.0, 0.0])],
        );
        let filter = SearchFilter {
            query_text: Some("parse config".to_string()),
            ..Default::default()
        };
        let results = unified_search(&mut store, &[1.0, 0.0, 0.0], 5, UnifiedSource::All, &filter);
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.source == ResultSource::Transcript));
        assert!(results.iter().any(|r| r.source == ResultSource::Code));

        let code_only = unified_search(&mut store, &[1.0, 0.0, 0.0], 5, UnifiedSource::Code, &filter);
        assert!(code_only.iter().all(|r| r.source == ResultSource::Code));
    }

    #[test]
    fn symbol_context_walks_the_graph() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = code("b.ts:validate:1", "validate", vec![0.0, 1.0, 0.0]);
        target.calls = "normalize".to_string();
        let mut caller = code("a.ts:save:1", "save", vec![1.0, 0.0, 0.0]);
        caller.calls = "validate,log".to_string();
        let mut importer = code("c.ts:Form:1", "Form", vec![0.0, 0.0, 1.0]);
        importer.imports = "validate:./validate".to_string();

        let store = store_with(dir.path(), vec![], vec![target, caller, importer]);
        let ctx = symbol_context(&store, "validate").unwrap();
        assert_eq!(ctx.definition.symbol, "validate");
        assert_eq!(ctx.callers.len(), 1);
        assert_eq!(ctx.callers[0].symbol, "save");
        assert_eq!(ctx.importers.len(), 1);
        assert_eq!(ctx.importers[0].symbol, "Form");
        assert_eq!(ctx.callees, vec!["normalize".to_string()]);

        assert!(matches!(
            symbol_context(&store, "missing"),
            Err(MemoryErr::NotFound(_))
        ));
    }
}
