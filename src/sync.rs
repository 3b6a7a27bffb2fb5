use futures::StreamExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{EmbeddingCache, SearchCache};
use crate::checkpoint::{CheckpointSource, ParsedCheckpoint};
use crate::chunker::{chunk_checkpoint, chunk_code_file, SolutionChunk};
use crate::config::{MemoryConfig, Workspace, ABSOLUTE_MAX_FILE_BYTES};
use crate::error::{MemoryErr, Result};
use crate::lock::{SyncLock, DEFAULT_LOCK_TIMEOUT};
use crate::provider::Embedder;
use crate::scanner::{scan_workspace, FileEntry, ScanOptions};
use crate::source::extract_symbols;
use crate::store::{StoredCodeRecord, StoredSolutionRecord, VectorStore};

// ---------------------------------------------------------------------------
// Sync orchestration: parse → diff-against-index → chunk → summarize →
// embed → index → FTS refresh → cache clear → code-index → done.
//
// The sync lock linearizes writers; readers are never blocked and may see
// the previous consistent snapshot. Cancellation is cooperative: no new
// provider calls are issued after the token fires, and partial writes that
// already committed stay (re-running the sync is idempotent).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStep {
    Parsing,
    Chunking,
    Summarizing,
    Embedding,
    Indexing,
    CodeIndex,
    Done,
}

/// One progress notification. `progress` is a 0..=1 fraction when a step
/// can quantify itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: SyncStep,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
}

/// Progress is lossy on a congested channel (try_send, oldest effectively
/// wins); `done` is the one event that must always land.
fn emit(progress: &mpsc::Sender<ProgressEvent>, step: SyncStep, message: impl Into<String>, fraction: Option<f32>) {
    let _ = progress.try_send(ProgressEvent {
        step,
        message: message.into(),
        progress: fraction,
    });
}

async fn emit_done(progress: &mpsc::Sender<ProgressEvent>, message: impl Into<String>) {
    let _ = progress
        .send(ProgressEvent {
            step: SyncStep::Done,
            message: message.into(),
            progress: Some(1.0),
        })
        .await;
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Also re-index changed source files after the transcript phase.
    pub code_index: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { code_index: true }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub checkpoints_inserted: usize,
    pub checkpoints_upserted: usize,
    pub chunks_indexed: usize,
    pub code_files_indexed: usize,
    pub code_chunks_indexed: usize,
    /// Per-item failures absorbed along the way.
    pub warnings: Vec<String>,
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(MemoryErr::Cancelled);
    }
    Ok(())
}

/// Run one end-to-end sync. Holds the sync lock for the whole run.
#[allow(clippy::too_many_arguments)]
pub async fn run_sync(
    ws: &Workspace,
    cfg: &mut MemoryConfig,
    store: &mut VectorStore,
    embed_cache: &mut EmbeddingCache,
    search_cache: &mut SearchCache,
    embedder: &Embedder,
    opts: SyncOptions,
    cancel: &CancellationToken,
    progress: &mpsc::Sender<ProgressEvent>,
) -> Result<SyncReport> {
    let mut lock = SyncLock::open(&ws.lock_path())?;
    let _guard = lock.acquire(DEFAULT_LOCK_TIMEOUT)?;

    // A model change leaves differently-sized vectors behind; refuse to mix.
    if let Some(width) = store.stored_width() {
        if width != embedder.dimensions() {
            return Err(MemoryErr::Internal(format!(
                "store holds {width}-dim vectors but the model produces {} — run `engram reset` first",
                embedder.dimensions()
            )));
        }
    }

    let mut report = SyncReport::default();

    // ── Parse + diff against the index ───────────────────────────────────
    emit(progress, SyncStep::Parsing, "reading checkpoints", None);
    let source = CheckpointSource::new(ws.root(), &ws.metadata_dir(), &cfg.checkpoint_branch);
    let known = store.indexed_checkpoints();

    // Committed checkpoints are immutable: once indexed, always skipped.
    // Local ones re-enter whenever their content hash moved (I4).
    let skip: HashSet<String> = known
        .keys()
        .filter(|id| !id.starts_with("local-"))
        .cloned()
        .collect();

    let mut new_remote: Vec<ParsedCheckpoint> = Vec::new();
    let mut changed_local: Vec<(ParsedCheckpoint, String)> = Vec::new();

    for cp in source.stream(&skip) {
        check_cancel(cancel)?;
        if cp.is_local() {
            let hash = cp.content_hash();
            if known.get(&cp.id).cloned().flatten().as_deref() == Some(hash.as_str()) {
                continue; // unchanged capture
            }
            changed_local.push((cp, hash));
        } else {
            new_remote.push(cp);
        }
    }

    emit(
        progress,
        SyncStep::Parsing,
        format!(
            "{} new, {} changed local checkpoints",
            new_remote.len(),
            changed_local.len()
        ),
        None,
    );

    // ── Chunk ────────────────────────────────────────────────────────────
    emit(progress, SyncStep::Chunking, "splitting transcripts", None);
    let mut batches: Vec<(ParsedCheckpoint, Option<String>, Vec<SolutionChunk>)> = Vec::new();
    for cp in new_remote {
        let chunks = chunk_checkpoint(&cp, cfg);
        if !chunks.is_empty() {
            batches.push((cp, None, chunks));
        }
    }
    for (cp, hash) in changed_local {
        let chunks = chunk_checkpoint(&cp, cfg);
        if !chunks.is_empty() {
            batches.push((cp, Some(hash), chunks));
        }
    }

    // ── Summarize (bounded concurrency, per-item degradation) ────────────
    let total_chunks: usize = batches.iter().map(|(_, _, c)| c.len()).sum();
    emit(
        progress,
        SyncStep::Summarizing,
        format!("summarizing {total_chunks} chunks"),
        Some(0.0),
    );
    let concurrency = embedder.provider().max_concurrency().max(1);
    let mut summarized = 0usize;
    for (_, _, chunks) in batches.iter_mut() {
        check_cancel(cancel)?;

        // Sliding-window concurrency: a new summarize call launches as soon
        // as any in-flight one completes, up to the provider's bound. Each
        // future checks the token before issuing its call, so cancellation
        // stops new provider work without waiting for the pool to drain.
        let digests: Vec<(usize, Result<String>)> =
            futures::stream::iter(chunks.iter().enumerate())
                .map(|(idx, chunk)| {
                    let provider = embedder.provider();
                    async move {
                        if cancel.is_cancelled() {
                            return (idx, Err(MemoryErr::Cancelled));
                        }
                        let digest = provider
                            .summarize(&chunk.prompt, &chunk.response, &chunk.diff_summary)
                            .await;
                        (idx, digest)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;
        check_cancel(cancel)?;

        for (idx, digest) in digests {
            match digest {
                Ok(d) => chunks[idx].apply_summary(d),
                Err(e) => {
                    // Absorbed: the deterministic digest still indexes.
                    report
                        .warnings
                        .push(format!("summarize {}: {e}", chunks[idx].id));
                    let digest = crate::provider::fallback_digest(
                        &chunks[idx].prompt,
                        &chunks[idx].response,
                        &chunks[idx].diff_summary,
                    );
                    chunks[idx].apply_summary(digest);
                }
            }
        }

        summarized += chunks.len();
        emit(
            progress,
            SyncStep::Summarizing,
            format!("{summarized}/{total_chunks}"),
            Some(summarized as f32 / total_chunks.max(1) as f32),
        );
    }

    // ── Embed + index, one checkpoint at a time ──────────────────────────
    emit(progress, SyncStep::Embedding, "vectorizing", Some(0.0));
    let total_batches = batches.len();
    for (done, (cp, hash, chunks)) in batches.into_iter().enumerate() {
        check_cancel(cancel)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.embedding_text.clone()).collect();
        let vectors = embedder.embed_batch(embed_cache, &texts).await?;
        emit(
            progress,
            SyncStep::Embedding,
            format!("{}/{}", done + 1, total_batches),
            Some((done + 1) as f32 / total_batches.max(1) as f32),
        );

        emit(progress, SyncStep::Indexing, cp.id.clone(), None);
        let records: Vec<StoredSolutionRecord> = chunks
            .iter()
            .zip(&vectors)
            .map(|(chunk, vector)| {
                StoredSolutionRecord::from_chunk(chunk, vector.clone(), hash.clone())
            })
            .collect();
        report.chunks_indexed += records.len();

        match hash {
            Some(ref h) => {
                store.upsert_chunks(records, h)?;
                report.checkpoints_upserted += 1;
                // Remember how much of the session is captured so a later
                // re-capture can tell growth from change.
                let pairs: usize = chunks.len();
                cfg.session_offsets.insert(cp.id.clone(), pairs);
            }
            None => {
                store.insert_chunks(records)?;
                report.checkpoints_inserted += 1;
            }
        }
    }

    // ── FTS refresh + cache clear ────────────────────────────────────────
    store.ensure_fts_index();
    search_cache.clear();

    // ── Optional code phase (failures are warnings, never aborts) ────────
    if opts.code_index {
        emit(progress, SyncStep::CodeIndex, "scanning source files", None);
        match index_code(ws, store, embed_cache, embedder, cancel, progress).await {
            Ok((files, chunks)) => {
                report.code_files_indexed = files;
                report.code_chunks_indexed = chunks;
            }
            Err(MemoryErr::Cancelled) => return Err(MemoryErr::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "code index phase failed");
                report.warnings.push(format!("code-index: {e}"));
            }
        }
        store.ensure_fts_index();
        search_cache.clear();
    }

    // ── Advance the branch cursor ────────────────────────────────────────
    if let Some(tip) = source.latest_commit() {
        cfg.last_indexed_commit = Some(tip);
    }
    ws.save_config(cfg)?;
    embed_cache.save();

    emit_done(
        progress,
        format!(
            "indexed {} chunks ({} new, {} updated checkpoints)",
            report.chunks_indexed, report.checkpoints_inserted, report.checkpoints_upserted
        ),
    )
    .await;

    Ok(report)
}

/// Re-index every changed source file: parse in parallel, then per file
/// delete-then-insert. A file whose chunk-id set is unchanged is skipped
/// without touching the provider.
async fn index_code(
    ws: &Workspace,
    store: &mut VectorStore,
    embed_cache: &mut EmbeddingCache,
    embedder: &Embedder,
    cancel: &CancellationToken,
    progress: &mpsc::Sender<ProgressEvent>,
) -> Result<(usize, usize)> {
    let entries = scan_workspace(&ScanOptions {
        repo_root: ws.root().to_path_buf(),
        max_file_bytes: ABSOLUTE_MAX_FILE_BYTES.min(512 * 1024),
    })?;

    // Parse is CPU-bound: fan out on the rayon pool.
    let parsed: Vec<(FileEntry, Vec<crate::source::EnhancedCodeSymbol>)> = entries
        .into_par_iter()
        .filter_map(|entry| {
            let text = std::fs::read_to_string(&entry.abs_path).ok()?;
            let rel = entry.rel_path.clone();
            Some((entry, extract_symbols(&rel, &text)))
        })
        .filter(|(_, symbols)| !symbols.is_empty())
        .collect();

    // Stale paths: indexed before, gone (or symbol-less) now.
    let parsed_paths: HashSet<String> = parsed
        .iter()
        .map(|(e, _)| e.rel_path.to_string_lossy().replace('\\', "/"))
        .collect();
    let stale: Vec<String> = store
        .get_indexed_code_paths()
        .into_iter()
        .filter(|p| !parsed_paths.contains(p))
        .collect();
    for path in stale {
        store.delete_code_chunks_by_path(&path)?;
    }

    let total = parsed.len();
    let mut files_indexed = 0usize;
    let mut chunks_indexed = 0usize;

    for (done, (entry, symbols)) in parsed.into_iter().enumerate() {
        check_cancel(cancel)?;
        let rel = entry.rel_path.to_string_lossy().replace('\\', "/");

        let modified = std::fs::metadata(&entry.abs_path)
            .and_then(|m| m.modified())
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(|_| chrono::Utc::now());
        let chunks = chunk_code_file(&rel, &symbols, modified);

        // Unchanged file ⇒ identical id set ⇒ nothing to do.
        let new_ids: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        if new_ids == store.code_ids_for_path(&rel) {
            continue;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.embedding_text.clone()).collect();
        let vectors = match embedder.embed_batch(embed_cache, &texts).await {
            Ok(v) => v,
            Err(MemoryErr::Cancelled) => return Err(MemoryErr::Cancelled),
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "skipping file, embedding failed");
                continue;
            }
        };

        let records: Vec<StoredCodeRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| StoredCodeRecord::from_chunk(chunk, vector))
            .collect();

        store.delete_code_chunks_by_path(&rel)?;
        let count = records.len();
        store.insert_code_chunks(records)?;
        files_indexed += 1;
        chunks_indexed += count;

        emit(
            progress,
            SyncStep::CodeIndex,
            format!("{}/{} {}", done + 1, total, rel),
            Some((done + 1) as f32 / total.max(1) as f32),
        );
    }

    Ok((files_indexed, chunks_indexed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{fallback_digest, Provider};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Deterministic offline provider: embeds by hashed token counts.
    struct StubProvider;

    fn stub_vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        for token in text.split_whitespace() {
            let mut h = 0usize;
            for b in token.bytes() {
                h = h.wrapping_mul(31).wrapping_add(b as usize);
            }
            v[h % 8] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        v.iter().map(|x| x / norm).collect()
    }

    #[async_trait(?Send)]
    impl Provider for StubProvider {
        fn dimensions(&self) -> usize {
            8
        }

        async fn embed(&self, text: &str) -> crate::error::Result<Vec<f32>> {
            Ok(stub_vector(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| stub_vector(t)).collect())
        }

        async fn summarize(&self, p: &str, r: &str, d: &str) -> crate::error::Result<String> {
            Ok(fallback_digest(p, r, d))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ws: Workspace,
        cfg: MemoryConfig,
        store: VectorStore,
        embed_cache: EmbeddingCache,
        search_cache: SearchCache,
        embedder: Embedder,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();
        let cfg = MemoryConfig::default();
        let store = VectorStore::open(&ws.vectors_dir(), 8);
        let embed_cache = EmbeddingCache::open(&ws.cache_dir());
        let search_cache = SearchCache::open(&ws.cache_dir());
        let embedder = Embedder::new(Arc::new(StubProvider));
        Fixture {
            _dir: dir,
            ws,
            cfg,
            store,
            embed_cache,
            search_cache,
            embedder,
        }
    }

    fn write_capture(ws: &Workspace, name: &str, answer: &str) {
        std::fs::write(
            ws.metadata_dir().join(format!("{name}.json")),
            format!(
                r#"{{
                    "id": "{name}",
                    "timestamp": 1700000000,
                    "sessions": [{{
                        "agent": "claude",
                        "transcript": [
                            {{"role": "user", "content": "How does the sync work?"}},
                            {{"role": "assistant", "content": "{answer}"}}
                        ]
                    }}]
                }}"#
            ),
        )
        .unwrap();
    }

    async fn sync(f: &mut Fixture, code_index: bool) -> Result<SyncReport> {
        let (tx, mut rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let report = run_sync(
            &f.ws,
            &mut f.cfg,
            &mut f.store,
            &mut f.embed_cache,
            &mut f.search_cache,
            &f.embedder,
            SyncOptions { code_index },
            &cancel,
            &tx,
        )
        .await;
        drop(tx);
        let mut saw_done = false;
        while let Some(ev) = rx.recv().await {
            if ev.step == SyncStep::Done {
                saw_done = true;
            }
        }
        if report.is_ok() {
            assert!(saw_done, "done event must always be delivered");
        }
        report
    }

    #[tokio::test]
    async fn local_capture_indexes_once() {
        let mut f = fixture();
        write_capture(&f.ws, "abc", "It streams and embeds.");

        let first = sync(&mut f, false).await.unwrap();
        assert_eq!(first.checkpoints_upserted, 1);
        assert_eq!(first.chunks_indexed, 1);
        let ids = f.store.get_indexed_chunk_ids();
        assert!(ids.contains("local-abc-0-0"));

        // Unchanged content → no writes on the second run.
        let second = sync(&mut f, false).await.unwrap();
        assert_eq!(second.chunks_indexed, 0);
        assert_eq!(f.store.get_indexed_chunk_ids(), ids);
    }

    #[tokio::test]
    async fn edited_capture_is_upserted() {
        let mut f = fixture();
        write_capture(&f.ws, "abc", "First answer.");
        sync(&mut f, false).await.unwrap();

        // Edit the transcript: the content hash moves, so the checkpoint's
        // chunks are replaced wholesale.
        write_capture(&f.ws, "abc", "Second, better answer with more detail.");
        let report = sync(&mut f, false).await.unwrap();
        assert_eq!(report.checkpoints_upserted, 1);

        let rows = f.store.knn_solutions(&stub_vector("sync"), 10, None);
        assert_eq!(rows.len(), 1, "old chunks must be gone");
        assert!(rows[0].1.response.contains("Second"));
        assert_eq!(f.cfg.session_offsets.get("local-abc"), Some(&1));
    }

    #[tokio::test]
    async fn code_index_is_idempotent() {
        let mut f = fixture();
        std::fs::create_dir_all(f.ws.root().join("src")).unwrap();
        std::fs::write(
            f.ws.root().join("src/app.ts"),
            "export function greet(name: string) {\n    return formatName(name);\n}\n",
        )
        .unwrap();

        let first = sync(&mut f, true).await.unwrap();
        assert_eq!(first.code_files_indexed, 1);
        let ids_after_first = f.store.code_ids_for_path("src/app.ts");
        assert!(!ids_after_first.is_empty());

        // Same content → second run rewrites nothing.
        let second = sync(&mut f, true).await.unwrap();
        assert_eq!(second.code_files_indexed, 0);
        assert_eq!(f.store.code_ids_for_path("src/app.ts"), ids_after_first);
    }

    #[tokio::test]
    async fn reindex_purges_stale_line_numbers() {
        let mut f = fixture();
        std::fs::create_dir_all(f.ws.root().join("src")).unwrap();
        let path = f.ws.root().join("src/app.ts");
        std::fs::write(&path, "export function greet() {\n    return 1;\n}\n").unwrap();
        sync(&mut f, true).await.unwrap();
        assert!(f.store.code_ids_for_path("src/app.ts").contains("src/app.ts:greet:1"));

        // Shift the symbol down two lines: new id, old id purged.
        std::fs::write(&path, "// moved\n// down\nexport function greet() {\n    return 1;\n}\n").unwrap();
        sync(&mut f, true).await.unwrap();
        let ids = f.store.code_ids_for_path("src/app.ts");
        assert!(ids.contains("src/app.ts:greet:3"), "ids: {ids:?}");
        assert!(!ids.contains("src/app.ts:greet:1"));
    }

    #[tokio::test]
    async fn cancellation_stops_before_new_provider_calls() {
        let mut f = fixture();
        write_capture(&f.ws, "abc", "answer");

        let (tx, _rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_sync(
            &f.ws,
            &mut f.cfg,
            &mut f.store,
            &mut f.embed_cache,
            &mut f.search_cache,
            &f.embedder,
            SyncOptions { code_index: false },
            &cancel,
            &tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MemoryErr::Cancelled));
        assert_eq!(f.store.solution_count(), 0);
    }

    #[tokio::test]
    async fn sync_records_branch_tip_absent_gracefully() {
        // No git repo at all: the branch cursor simply stays unset.
        let mut f = fixture();
        write_capture(&f.ws, "abc", "answer");
        sync(&mut f, false).await.unwrap();
        assert!(f.cfg.last_indexed_commit.is_none());
    }
}
