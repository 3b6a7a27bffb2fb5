use bm25::{Document, Language, SearchEngine, SearchEngineBuilder, Tokenizer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::chunker::{CodeChunk, SolutionChunk};
use crate::error::{MemoryErr, Result};

// ---------------------------------------------------------------------------
// Dual-table vector + full-text store.
//
// Two logical tables, `solutions` and `code_symbols`, persisted as one JSON
// document each under `.engram/vectors/`. Every record carries one embedding
// vector (fixed width = the embedding model's declared dimension), the
// FTS-indexed `embedding_text`, and its record metadata.
//
// Schema evolution: records carry a `version`; a fixed migration list
// upgrades old rows on load, and every non-key field is `#[serde(default)]`
// so readers tolerate columns the writer didn't know about. Migration
// failures log and continue — the effective schema is best-effort.
//
// The FTS modality is a bm25 engine rebuilt from the rows; `ensure_fts_index`
// is the single (idempotent) rebuild point, re-run after every sync.
// ---------------------------------------------------------------------------

/// Current record schema version.
pub const SCHEMA_VERSION: u32 = 3;

/// Insights and stats scans cap out here.
pub const MAX_SCAN_ROWS: usize = 10_000;

/// Fixed migration list: (introduced-in version, column). Rows below a
/// version get that column defaulted; the list is the documented history.
const SOLUTION_MIGRATIONS: &[(u32, &str)] = &[(2, "source"), (3, "language")];
const CODE_MIGRATIONS: &[(u32, &str)] = &[(2, "source"), (3, "imports")];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSolutionRecord {
    pub id: String,
    #[serde(default)]
    pub checkpoint_id: String,
    #[serde(default)]
    pub session_index: usize,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub diff_summary: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub embedding_text: String,
    #[serde(default)]
    pub vector: Vec<f32>,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub language: String,
    /// Set only for `local-` checkpoints (the upsert key).
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCodeRecord {
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub symbol_type: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub embedding_text: String,
    #[serde(default)]
    pub vector: Vec<f32>,
    /// CSV of called identifiers.
    #[serde(default)]
    pub calls: String,
    /// CSV of `name:source` imports.
    #[serde(default)]
    pub imports: String,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub version: u32,
}

impl StoredSolutionRecord {
    pub fn from_chunk(chunk: &SolutionChunk, vector: Vec<f32>, content_hash: Option<String>) -> Self {
        Self {
            id: chunk.id.clone(),
            checkpoint_id: chunk.checkpoint_id.clone(),
            session_index: chunk.session_index,
            prompt: chunk.prompt.clone(),
            response: chunk.response.clone(),
            diff_summary: chunk.diff_summary.clone(),
            summary: chunk.summary.clone(),
            embedding_text: chunk.embedding_text.clone(),
            vector,
            agent: chunk.metadata.agent.clone(),
            timestamp: Some(chunk.metadata.timestamp),
            files_changed: chunk.metadata.files_changed.clone(),
            tokens_used: chunk.metadata.tokens_used,
            symbols: chunk.metadata.symbols.clone(),
            language: chunk.metadata.language.clone(),
            content_hash,
            source: "transcript".to_string(),
            version: SCHEMA_VERSION,
        }
    }
}

impl StoredCodeRecord {
    pub fn from_chunk(chunk: &CodeChunk, vector: Vec<f32>) -> Self {
        Self {
            id: chunk.id.clone(),
            path: chunk.path.clone(),
            symbol: chunk.symbol.clone(),
            symbol_type: chunk.symbol_type.to_string(),
            language: chunk.language.clone(),
            body: chunk.body.clone(),
            summary: chunk.summary.clone(),
            embedding_text: chunk.embedding_text.clone(),
            vector,
            calls: chunk.calls.clone(),
            imports: chunk.imports.clone(),
            start_line: chunk.start_line,
            last_modified: Some(chunk.last_modified),
            source: "code".to_string(),
            version: SCHEMA_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// Table document
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct TableFile<R> {
    schema_version: u32,
    rows: Vec<R>,
}

impl<R> Default for TableFile<R> {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            rows: Vec::new(),
        }
    }
}

fn load_table<R: serde::de::DeserializeOwned>(path: &Path) -> Option<TableFile<R>> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<TableFile<R>>(&text) {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "table unreadable, treating as absent");
            None
        }
    }
}

fn save_table<R: Serialize>(path: &Path, table: &TableFile<R>) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string(table)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Best-effort row upgrade per the fixed migration list. A row that cannot
/// be upgraded keeps whatever fields it has — readers default the rest.
fn migrate_rows<R>(
    table: &mut TableFile<R>,
    table_name: &str,
    migrations: &[(u32, &str)],
    version_of: impl Fn(&R) -> u32,
    upgrade: impl Fn(&mut R, u32),
) {
    if table.schema_version >= SCHEMA_VERSION && table.rows.iter().all(|r| version_of(r) >= SCHEMA_VERSION)
    {
        return;
    }
    for (target, column) in migrations {
        let stale = table.rows.iter().filter(|r| version_of(r) < *target).count();
        if stale > 0 {
            tracing::warn!(
                table = table_name,
                column,
                rows = stale,
                "migrating rows missing column (defaults applied)"
            );
        }
        for row in table.rows.iter_mut().filter(|r| version_of(r) < *target) {
            upgrade(row, *target);
        }
    }
    table.schema_version = SCHEMA_VERSION;
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ---------------------------------------------------------------------------
// The store
// ---------------------------------------------------------------------------

/// Exact-symbol match strength (code search boost tiers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolMatch {
    /// Equality or `.name` suffix — the strong tier.
    Exact,
    /// Name prefix — the weak tier.
    Prefix,
}

pub struct VectorStore {
    dir: PathBuf,
    dims: usize,
    solutions: Option<TableFile<StoredSolutionRecord>>,
    code: Option<TableFile<StoredCodeRecord>>,
    solutions_fts: Option<SearchEngine<String>>,
    code_fts: Option<SearchEngine<String, u32, CodeTokenizer>>,
    /// Bumped on every successful code write; the insights cache keys off it.
    code_generation: u64,
}

impl VectorStore {
    pub fn open(vectors_dir: &Path, dims: usize) -> Self {
        let solutions_path = vectors_dir.join("solutions.json");
        let code_path = vectors_dir.join("code_symbols.json");

        let mut solutions = load_table::<StoredSolutionRecord>(&solutions_path);
        if let Some(t) = solutions.as_mut() {
            migrate_rows(
                t,
                "solutions",
                SOLUTION_MIGRATIONS,
                |r| r.version,
                |row, target| {
                    match target {
                        2 => {
                            if row.source.is_empty() {
                                row.source = "transcript".to_string();
                            }
                        }
                        3 => {
                            if row.language.is_empty() {
                                row.language = "unknown".to_string();
                            }
                        }
                        _ => {}
                    }
                    row.version = target;
                },
            );
        }

        let mut code = load_table::<StoredCodeRecord>(&code_path);
        if let Some(t) = code.as_mut() {
            migrate_rows(
                t,
                "code_symbols",
                CODE_MIGRATIONS,
                |r| r.version,
                |row, target| {
                    match target {
                        2 => {
                            if row.source.is_empty() {
                                row.source = "code".to_string();
                            }
                        }
                        // v3 added the imports CSV; absent stays empty.
                        _ => {}
                    }
                    row.version = target;
                },
            );
        }

        Self {
            dir: vectors_dir.to_path_buf(),
            dims,
            solutions,
            code,
            solutions_fts: None,
            code_fts: None,
            code_generation: 0,
        }
    }

    fn solutions_path(&self) -> PathBuf {
        self.dir.join("solutions.json")
    }

    fn code_path(&self) -> PathBuf {
        self.dir.join("code_symbols.json")
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn has_solutions(&self) -> bool {
        self.solutions.is_some()
    }

    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }

    /// Generation counter for the code table; any write bumps it.
    pub fn code_generation(&self) -> u64 {
        self.code_generation
    }

    // ── Init / drop ──────────────────────────────────────────────────────

    /// Create the solutions table if absent (idempotent).
    pub fn init_store(&mut self) -> Result<()> {
        if self.solutions.is_none() {
            let table = TableFile::default();
            save_table(&self.solutions_path(), &table)?;
            self.solutions = Some(table);
        }
        Ok(())
    }

    /// Create the code table if absent (idempotent).
    pub fn init_code_store(&mut self) -> Result<()> {
        if self.code.is_none() {
            let table = TableFile::default();
            save_table(&self.code_path(), &table)?;
            self.code = Some(table);
            self.code_generation += 1;
        }
        Ok(())
    }

    /// Full reset of the solutions table.
    pub fn drop_table(&mut self) -> Result<()> {
        let path = self.solutions_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.solutions = None;
        self.solutions_fts = None;
        Ok(())
    }

    /// Full reset of the code table.
    pub fn drop_code_table(&mut self) -> Result<()> {
        let path = self.code_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.code = None;
        self.code_fts = None;
        self.code_generation += 1;
        Ok(())
    }

    // ── Writes ───────────────────────────────────────────────────────────

    fn check_width(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims {
            return Err(MemoryErr::Internal(format!(
                "vector width {} != store dimension {}",
                vector.len(),
                self.dims
            )));
        }
        Ok(())
    }

    /// Append solution records in a single call.
    pub fn insert_chunks(&mut self, records: Vec<StoredSolutionRecord>) -> Result<()> {
        for r in &records {
            self.check_width(&r.vector)?;
        }
        self.init_store()?;
        let path = self.solutions_path();
        let table = self.solutions.as_mut().expect("initialised above");
        table.rows.extend(records);
        save_table(&path, table)?;
        self.solutions_fts = None;
        Ok(())
    }

    /// Replace every record of the checkpoints covered by `records`:
    /// delete-by-checkpoint then insert, with the content hash attached.
    /// From the caller's perspective the swap is atomic (single save).
    pub fn upsert_chunks(
        &mut self,
        records: Vec<StoredSolutionRecord>,
        content_hash: &str,
    ) -> Result<()> {
        for r in &records {
            self.check_width(&r.vector)?;
        }
        self.init_store()?;
        let checkpoint_ids: HashSet<String> =
            records.iter().map(|r| r.checkpoint_id.clone()).collect();

        let path = self.solutions_path();
        let table = self.solutions.as_mut().expect("initialised above");
        table.rows.retain(|r| !checkpoint_ids.contains(&r.checkpoint_id));
        table.rows.extend(records.into_iter().map(|mut r| {
            r.content_hash = Some(content_hash.to_string());
            r
        }));
        save_table(&path, table)?;
        self.solutions_fts = None;
        Ok(())
    }

    /// Append code records in a single call.
    pub fn insert_code_chunks(&mut self, records: Vec<StoredCodeRecord>) -> Result<()> {
        for r in &records {
            self.check_width(&r.vector)?;
        }
        self.init_code_store()?;
        let path = self.code_path();
        let table = self.code.as_mut().expect("initialised above");
        table.rows.extend(records);
        save_table(&path, table)?;
        self.code_fts = None;
        self.code_generation += 1;
        Ok(())
    }

    /// Remove every code record under `path`. Required before re-indexing a
    /// file — new line numbers mint new ids, so stale ids must go first.
    pub fn delete_code_chunks_by_path(&mut self, path: &str) -> Result<usize> {
        let save_path = self.code_path();
        let Some(table) = self.code.as_mut() else {
            return Ok(0);
        };
        let before = table.rows.len();
        table.rows.retain(|r| r.path != path);
        let removed = before - table.rows.len();
        if removed > 0 {
            save_table(&save_path, table)?;
            self.code_fts = None;
            self.code_generation += 1;
        }
        Ok(removed)
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    /// Ids of every stored solution chunk.
    pub fn get_indexed_chunk_ids(&self) -> HashSet<String> {
        self.solutions
            .as_ref()
            .map(|t| t.rows.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    /// checkpointId → stored content hash (None for non-local records).
    pub fn indexed_checkpoints(&self) -> HashMap<String, Option<String>> {
        let mut out = HashMap::new();
        if let Some(t) = self.solutions.as_ref() {
            for r in &t.rows {
                out.entry(r.checkpoint_id.clone())
                    .or_insert_with(|| r.content_hash.clone());
            }
        }
        out
    }

    /// Paths with at least one indexed code record.
    pub fn get_indexed_code_paths(&self) -> HashSet<String> {
        self.code
            .as_ref()
            .map(|t| t.rows.iter().map(|r| r.path.clone()).collect())
            .unwrap_or_default()
    }

    /// Up to `MAX_SCAN_ROWS` code rows for analytics.
    pub fn scan_code_rows(&self) -> Vec<&StoredCodeRecord> {
        self.code
            .as_ref()
            .map(|t| t.rows.iter().take(MAX_SCAN_ROWS).collect())
            .unwrap_or_default()
    }

    /// Vector width of the data already on disk (None when both tables are
    /// empty). A mismatch with the configured model means the store must be
    /// dropped and rebuilt.
    pub fn stored_width(&self) -> Option<usize> {
        self.solutions
            .as_ref()
            .and_then(|t| t.rows.first())
            .map(|r| r.vector.len())
            .or_else(|| {
                self.code
                    .as_ref()
                    .and_then(|t| t.rows.first())
                    .map(|r| r.vector.len())
            })
    }

    /// Chunk ids currently stored for one file path.
    pub fn code_ids_for_path(&self, path: &str) -> HashSet<String> {
        self.code
            .as_ref()
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|r| r.path == path)
                    .map(|r| r.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn solution_count(&self) -> usize {
        self.solutions.as_ref().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn code_count(&self) -> usize {
        self.code.as_ref().map(|t| t.rows.len()).unwrap_or(0)
    }

    // ── FTS ──────────────────────────────────────────────────────────────

    /// Rebuild both FTS engines from the current rows (idempotent).
    pub fn ensure_fts_index(&mut self) {
        self.solutions_fts = self.solutions.as_ref().map(|t| {
            build_fts(
                t.rows
                    .iter()
                    .map(|r| (r.id.clone(), r.embedding_text.clone())),
            )
        });
        self.code_fts = self.code.as_ref().map(|t| {
            build_code_fts(
                t.rows
                    .iter()
                    .map(|r| (r.id.clone(), r.embedding_text.clone())),
            )
        });
    }

    fn solutions_fts_engine(&mut self) -> Option<&SearchEngine<String>> {
        if self.solutions_fts.is_none() {
            if let Some(t) = self.solutions.as_ref() {
                self.solutions_fts = Some(build_fts(
                    t.rows
                        .iter()
                        .map(|r| (r.id.clone(), r.embedding_text.clone())),
                ));
            }
        }
        self.solutions_fts.as_ref()
    }

    fn code_fts_engine(&mut self) -> Option<&SearchEngine<String, u32, CodeTokenizer>> {
        if self.code_fts.is_none() {
            if let Some(t) = self.code.as_ref() {
                self.code_fts = Some(build_code_fts(
                    t.rows
                        .iter()
                        .map(|r| (r.id.clone(), r.embedding_text.clone())),
                ));
            }
        }
        self.code_fts.as_ref()
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Vector kNN over solutions (exact cosine scan), best first.
    pub fn knn_solutions(
        &self,
        query: &[f32],
        k: usize,
        agent: Option<&str>,
    ) -> Vec<(f32, StoredSolutionRecord)> {
        let Some(t) = self.solutions.as_ref() else {
            return vec![];
        };
        let mut scored: Vec<(f32, &StoredSolutionRecord)> = t
            .rows
            .iter()
            .filter(|r| agent.map(|a| r.agent == a).unwrap_or(true))
            .map(|r| (cosine_similarity(query, &r.vector), r))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(s, r)| (s, r.clone()))
            .collect()
    }

    /// FTS over solutions' embedding text, best first.
    pub fn fts_solutions(
        &mut self,
        query_text: &str,
        k: usize,
        agent: Option<&str>,
    ) -> Vec<(f32, StoredSolutionRecord)> {
        let by_id: HashMap<String, StoredSolutionRecord> = match self.solutions.as_ref() {
            Some(t) => t
                .rows
                .iter()
                .filter(|r| agent.map(|a| r.agent == a).unwrap_or(true))
                .map(|r| (r.id.clone(), r.clone()))
                .collect(),
            None => return vec![],
        };
        let Some(engine) = self.solutions_fts_engine() else {
            return vec![];
        };
        // Over-fetch so a post-hoc agent filter still fills k.
        engine
            .search(query_text, k * 4)
            .into_iter()
            .filter_map(|hit| by_id.get(&hit.document.id).map(|r| (hit.score, r.clone())))
            .take(k)
            .collect()
    }

    /// Vector kNN over code symbols.
    pub fn knn_code(&self, query: &[f32], k: usize) -> Vec<(f32, StoredCodeRecord)> {
        let Some(t) = self.code.as_ref() else {
            return vec![];
        };
        let mut scored: Vec<(f32, &StoredCodeRecord)> = t
            .rows
            .iter()
            .map(|r| (cosine_similarity(query, &r.vector), r))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(s, r)| (s, r.clone()))
            .collect()
    }

    /// FTS over code symbols' embedding text.
    pub fn fts_code(&mut self, query_text: &str, k: usize) -> Vec<(f32, StoredCodeRecord)> {
        let by_id: HashMap<String, StoredCodeRecord> = match self.code.as_ref() {
            Some(t) => t.rows.iter().map(|r| (r.id.clone(), r.clone())).collect(),
            None => return vec![],
        };
        let Some(engine) = self.code_fts_engine() else {
            return vec![];
        };
        engine
            .search(query_text, k)
            .into_iter()
            .filter_map(|hit| by_id.get(&hit.document.id).map(|r| (hit.score, r.clone())))
            .collect()
    }

    /// Exact-symbol lookup: equality / `.name` suffix (strong) and name
    /// prefix (weak) matches.
    pub fn exact_symbol_matches(&self, query_text: &str) -> Vec<(SymbolMatch, StoredCodeRecord)> {
        let Some(t) = self.code.as_ref() else {
            return vec![];
        };
        let needle = query_text.trim();
        if needle.is_empty() {
            return vec![];
        }
        let suffix = format!(".{needle}");
        t.rows
            .iter()
            .filter_map(|r| {
                if r.symbol == needle || r.symbol.ends_with(&suffix) {
                    Some((SymbolMatch::Exact, r.clone()))
                } else if r.symbol.starts_with(needle) {
                    Some((SymbolMatch::Prefix, r.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// All code records defining `name` (bare or `Class.name`).
    pub fn find_symbol_definitions(&self, name: &str) -> Vec<StoredCodeRecord> {
        let suffix = format!(".{name}");
        self.code
            .as_ref()
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|r| r.symbol == name || r.symbol.ends_with(&suffix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Stats ────────────────────────────────────────────────────────────

    /// Distinct agents with record counts, most active first.
    pub fn agents(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        if let Some(t) = self.solutions.as_ref() {
            for r in &t.rows {
                *counts.entry(r.agent.clone()).or_insert(0) += 1;
            }
        }
        let mut out: Vec<_> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Most frequently changed files across solution records.
    pub fn top_files(&self, limit: usize) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        if let Some(t) = self.solutions.as_ref() {
            for r in &t.rows {
                for f in &r.files_changed {
                    *counts.entry(f.clone()).or_insert(0) += 1;
                }
            }
        }
        let mut out: Vec<_> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out.truncate(limit);
        out
    }
}

// ---------------------------------------------------------------------------
// FTS engines
// ---------------------------------------------------------------------------

/// Tokenizer for the code table's FTS engine.
///
/// The stock English tokenizer treats `parseConfig` or `retry_with_backoff`
/// as single opaque words; code text needs them split so identifier queries
/// match. Splits member access (`a.b`, `a::b`, `a->b`), snake_case,
/// camelCase/PascalCase and acronym runs (`HTTPServer` → `HTTP Server`),
/// strips punctuation, lowercases, and drops tokens shorter than 2 chars.
#[derive(Debug, Clone, Default)]
pub struct CodeTokenizer;

impl CodeTokenizer {
    fn preprocess(&self, text: &str) -> String {
        static SEPARATOR_RE: OnceLock<regex::Regex> = OnceLock::new();
        static SNAKE_RE: OnceLock<regex::Regex> = OnceLock::new();
        static CAMEL_RE: OnceLock<regex::Regex> = OnceLock::new();
        static ACRONYM_RE: OnceLock<regex::Regex> = OnceLock::new();
        static SYMBOL_RE: OnceLock<regex::Regex> = OnceLock::new();

        let separators = SEPARATOR_RE
            .get_or_init(|| regex::Regex::new(r"(::|\->|\.|\-|/|\\)").expect("separator regex"));
        let snake = SNAKE_RE.get_or_init(|| regex::Regex::new(r"_+").expect("snake regex"));
        let camel = CAMEL_RE
            .get_or_init(|| regex::Regex::new(r"([a-z0-9])([A-Z])").expect("camel regex"));
        let acronym = ACRONYM_RE
            .get_or_init(|| regex::Regex::new(r"([A-Z]+)([A-Z][a-z])").expect("acronym regex"));
        let symbols = SYMBOL_RE.get_or_init(|| {
            regex::Regex::new(r#"[(){}\[\]<>;,:=+*&|!?@#$%^~`"']"#).expect("symbol regex")
        });

        let text = separators.replace_all(text, " ");
        let text = snake.replace_all(&text, " ");
        let text = camel.replace_all(&text, "$1 $2");
        let text = acronym.replace_all(&text, "$1 $2");
        symbols.replace_all(&text, " ").into_owned()
    }
}

impl Tokenizer for CodeTokenizer {
    fn tokenize(&self, input_text: &str) -> Vec<String> {
        self.preprocess(input_text)
            .split_whitespace()
            .filter_map(|token| {
                let token = token.to_lowercase();
                if token.len() >= 2 {
                    Some(token)
                } else {
                    None
                }
            })
            .collect()
    }
}

fn fts_documents(rows: impl Iterator<Item = (String, String)>) -> Vec<Document<String>> {
    rows.filter(|(_, text)| !text.trim().is_empty())
        .map(|(id, text)| Document::new(id, text))
        .collect()
}

/// Transcript engine: embedding text is mostly prose, so the stock English
/// tokenizer (with stemming) fits.
fn build_fts(rows: impl Iterator<Item = (String, String)>) -> SearchEngine<String> {
    SearchEngineBuilder::<String>::with_documents(Language::English, fts_documents(rows)).build()
}

/// Code engine: identifier-heavy text goes through the code tokenizer.
fn build_code_fts(
    rows: impl Iterator<Item = (String, String)>,
) -> SearchEngine<String, u32, CodeTokenizer> {
    SearchEngineBuilder::with_tokenizer_and_documents(CodeTokenizer, fts_documents(rows)).build()
}
