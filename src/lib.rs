//! engram — project-scoped agent memory.
//!
//! Captures past AI coding sessions (checkpoints of prompts, responses and
//! diffs) together with the project's current source symbols, indexes both
//! into one semantic substrate (vector kNN + full-text + exact symbol), and
//! serves hybrid retrieval and code-graph insights back to coding agents.
//!
//! The [`Memory`] handle is the single runtime context: it owns the store,
//! the caches and the insight engine for one workspace, and every adapter
//! (CLI here, HTTP/MCP elsewhere) goes through it. No module-level state.

pub mod cache;
pub mod checkpoint;
pub mod chunker;
pub mod config;
pub mod error;
pub mod insights;
pub mod lock;
pub mod provider;
pub mod scanner;
pub mod search;
pub mod source;
pub mod store;
pub mod sync;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{EmbeddingCache, SearchCache};
use crate::config::{MemoryConfig, Workspace};
use crate::error::Result;
use crate::insights::{CodeInsights, InsightEngine};
use crate::provider::{build_provider, Embedder, Provider};
use crate::search::{SearchFilter, SymbolContext, UnifiedResult, UnifiedSource};
use crate::store::VectorStore;
use crate::sync::{ProgressEvent, SyncOptions, SyncReport};

/// Transcript-table stats (`getStats`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub agents: Vec<(String, usize)>,
    pub top_files: Vec<(String, usize)>,
    pub has_table: bool,
}

/// Code-table stats (`getCodeStats`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CodeStoreStats {
    pub records: usize,
    pub files: usize,
    pub by_language: BTreeMap<String, usize>,
    pub has_table: bool,
}

/// Process-lifetime handle on one workspace's memory.
pub struct Memory {
    ws: Workspace,
    cfg: MemoryConfig,
    store: VectorStore,
    embed_cache: EmbeddingCache,
    search_cache: SearchCache,
    insight_engine: InsightEngine,
    /// Built on first use — loading a provider may hit the network.
    embedder: Option<Embedder>,
}

impl Memory {
    /// Open an initialised workspace.
    pub fn open(root: &Path) -> Result<Self> {
        let ws = Workspace::open(root)?;
        Ok(Self::from_workspace(ws))
    }

    /// Initialise (or re-open) the workspace state directory.
    pub fn init(root: &Path) -> Result<Self> {
        let ws = Workspace::init(root)?;
        let mem = Self::from_workspace(ws);
        mem.ws.save_config(&mem.cfg)?;
        Ok(mem)
    }

    fn from_workspace(ws: Workspace) -> Self {
        let cfg = ws.load_config();
        let store = VectorStore::open(&ws.vectors_dir(), cfg.dimensions());
        let embed_cache = EmbeddingCache::open(&ws.cache_dir());
        let search_cache = SearchCache::open(&ws.cache_dir());
        Self {
            ws,
            cfg,
            store,
            embed_cache,
            search_cache,
            insight_engine: InsightEngine::new(),
            embedder: None,
        }
    }

    /// Construct with an explicit provider (tests, embedded callers).
    pub fn with_provider(root: &Path, provider: Arc<dyn Provider>) -> Result<Self> {
        let ws = Workspace::init(root)?;
        let mut mem = Self::from_workspace(ws);
        // The store must match the injected provider's width, not the
        // configured model's.
        mem.store = VectorStore::open(&mem.ws.vectors_dir(), provider.dimensions());
        mem.embedder = Some(Embedder::new(provider));
        Ok(mem)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.cfg
    }

    pub fn workspace(&self) -> &Workspace {
        &self.ws
    }

    fn embedder(&mut self) -> Result<&Embedder> {
        if self.embedder.is_none() {
            self.embedder = Some(Embedder::new(build_provider(&self.cfg)?));
        }
        Ok(self.embedder.as_ref().expect("set above"))
    }

    // ── Pipeline ─────────────────────────────────────────────────────────

    /// Run one sync (transcripts, then optionally code), emitting progress.
    pub async fn sync(
        &mut self,
        opts: SyncOptions,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ProgressEvent>,
    ) -> Result<SyncReport> {
        self.embedder()?;
        let embedder = self.embedder.as_ref().expect("built above");
        sync::run_sync(
            &self.ws,
            &mut self.cfg,
            &mut self.store,
            &mut self.embed_cache,
            &mut self.search_cache,
            embedder,
            opts,
            cancel,
            progress,
        )
        .await
    }

    /// Append a local capture to the metadata directory.
    pub fn capture(&self, payload: &serde_json::Value) -> Result<String> {
        checkpoint::write_local_capture(&self.ws.metadata_dir(), payload)
    }

    // ── Retrieval ────────────────────────────────────────────────────────

    /// Text-in unified search, with the 5-minute result cache in front.
    pub async fn search(
        &mut self,
        query_text: &str,
        top_k: usize,
        source: UnifiedSource,
        mut filter: SearchFilter,
    ) -> Result<Vec<UnifiedResult>> {
        filter.query_text = Some(query_text.to_string());

        let cache_key = SearchCache::key(
            query_text,
            top_k,
            &format!("{source:?}|{}", filter.cache_repr()),
        );
        if let Some(cached) = self.search_cache.get(&cache_key) {
            if let Ok(results) = serde_json::from_value::<Vec<UnifiedResult>>(cached) {
                return Ok(results);
            }
        }

        self.embedder()?;
        let embedder = self.embedder.as_ref().expect("built above");
        let query_vector = embedder.embed_one(&mut self.embed_cache, query_text).await?;

        let results = search::unified_search(&mut self.store, &query_vector, top_k, source, &filter);

        if let Ok(value) = serde_json::to_value(&results) {
            self.search_cache.put(&cache_key, value);
            self.search_cache.save();
        }
        Ok(results)
    }

    /// Text-in transcript search (no result cache; callers that need raw
    /// chunk records rather than the unified shape).
    pub async fn search_solutions(
        &mut self,
        query_text: &str,
        top_k: usize,
        mut filter: SearchFilter,
    ) -> Result<Vec<search::SolutionHit>> {
        filter.query_text = Some(query_text.to_string());
        self.embedder()?;
        let embedder = self.embedder.as_ref().expect("built above");
        let query_vector = embedder.embed_one(&mut self.embed_cache, query_text).await?;
        Ok(search::search_solutions(
            &mut self.store,
            &query_vector,
            top_k,
            &filter,
        ))
    }

    /// Text-in code search.
    pub async fn search_code(
        &mut self,
        query_text: &str,
        top_k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<search::CodeHit>> {
        self.embedder()?;
        let embedder = self.embedder.as_ref().expect("built above");
        let query_vector = embedder.embed_one(&mut self.embed_cache, query_text).await?;
        Ok(search::search_code(
            &mut self.store,
            &query_vector,
            top_k,
            Some(query_text),
            min_score,
        ))
    }

    /// Definition + callers + callees + importers for one symbol.
    pub fn symbol_context(&self, name: &str) -> Result<SymbolContext> {
        search::symbol_context(&self.store, name)
    }

    /// Repository insight report; `None` until a code table exists.
    pub fn code_insights(&mut self) -> Option<CodeInsights> {
        self.insight_engine.get(&self.store)
    }

    // ── Stats / lifecycle ────────────────────────────────────────────────

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            records: self.store.solution_count(),
            agents: self.store.agents(),
            top_files: self.store.top_files(10),
            has_table: self.store.has_solutions(),
        }
    }

    pub fn code_stats(&self) -> CodeStoreStats {
        let mut by_language = BTreeMap::new();
        for row in self.store.scan_code_rows() {
            *by_language.entry(row.language.clone()).or_insert(0) += 1;
        }
        CodeStoreStats {
            records: self.store.code_count(),
            files: self.store.get_indexed_code_paths().len(),
            by_language,
            has_table: self.store.has_code(),
        }
    }

    /// Drop the transcript table (the only way records ever leave it).
    pub fn reset_solutions(&mut self) -> Result<()> {
        self.store.drop_table()?;
        self.search_cache.clear();
        Ok(())
    }

    /// Drop the code table.
    pub fn reset_code(&mut self) -> Result<()> {
        self.store.drop_code_table()?;
        self.search_cache.clear();
        Ok(())
    }
}
