//! End-to-end pipeline test: capture → sync → hybrid retrieval → insights,
//! against a real temp workspace with a deterministic offline provider.

use std::sync::Arc;

use async_trait::async_trait;
use engram::error::Result;
use engram::provider::{fallback_digest, Provider};
use engram::search::{SearchFilter, UnifiedSource};
use engram::sync::SyncOptions;
use engram::Memory;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DIMS: usize = 16;

/// Deterministic bag-of-tokens embedding: close texts share buckets, so
/// ranking behaves like a (crude) semantic model without any network.
struct HashingProvider;

fn hash_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 2)
    {
        let mut h = 7usize;
        for b in token.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        v[h % DIMS] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter().map(|x| x / norm).collect()
}

#[async_trait(?Send)]
impl Provider for HashingProvider {
    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }

    async fn summarize(&self, prompt: &str, response: &str, diff: &str) -> Result<String> {
        Ok(fallback_digest(prompt, response, diff))
    }
}

fn capture_payload(id: &str, question: &str, answer: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "timestamp": 1700000000,
        "sessions": [{
            "agent": "claude",
            "tokens_used": 900,
            "transcript": [
                {"role": "user", "content": question},
                {"role": "assistant", "content": answer}
            ]
        }]
    })
}

async fn synced_memory(dir: &std::path::Path, code_index: bool) -> Memory {
    let mut mem = Memory::with_provider(dir, Arc::new(HashingProvider)).unwrap();
    let (tx, _rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    mem.sync(SyncOptions { code_index }, &cancel, &tx)
        .await
        .unwrap();
    mem
}

#[tokio::test]
async fn capture_sync_and_retrieve() {
    let dir = tempfile::tempdir().unwrap();
    let mem = Memory::with_provider(dir.path(), Arc::new(HashingProvider)).unwrap();
    mem.capture(&capture_payload(
        "auth",
        "How do we refresh expired auth tokens?",
        "The refresh endpoint rotates the token pair before expiry.",
    ))
    .unwrap();
    mem.capture(&capture_payload(
        "tests",
        "Write unit tests for the retry queue",
        "Added table-driven tests covering backoff and max attempts.",
    ))
    .unwrap();
    drop(mem);

    let mut mem = synced_memory(dir.path(), false).await;

    let stats = mem.stats();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.agents[0].0, "claude");

    // The chunk about unit tests must outrank the auth chunk on this query.
    let results = mem
        .search("unit tests retry", 5, UnifiedSource::All, SearchFilter::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].id.starts_with("local-tests-0-"), "got {}", results[0].id);
    assert!(results[0].score > 0.0);

    // Identical repeat query — served from the result cache, same answer.
    let again = mem
        .search("unit tests retry", 5, UnifiedSource::All, SearchFilter::default())
        .await
        .unwrap();
    let ids: Vec<_> = results.iter().map(|r| &r.id).collect();
    let ids_again: Vec<_> = again.iter().map(|r| &r.id).collect();
    assert_eq!(ids, ids_again);
}

#[tokio::test]
async fn code_indexing_feeds_search_context_and_insights() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/config.ts"),
        r#"/**
 * Parses the raw configuration file.
 */
export function parseConfig(raw: string): Config {
    return normalize(JSON.parse(raw));
}

export function normalize(cfg: Config): Config {
    if (!cfg.name) { cfg.name = "default"; }
    return cfg;
}

export interface Config {
    name: string;
}
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("src/loader.ts"),
        r#"import { parseConfig } from "./config";

export function loadFromDisk(path: string) {
    const raw = readFile(path);
    return parseConfig(raw);
}
"#,
    )
    .unwrap();

    let mut mem = synced_memory(dir.path(), true).await;

    let code_stats = mem.code_stats();
    assert!(code_stats.has_table);
    assert_eq!(code_stats.files, 2);
    assert!(code_stats.records >= 4);

    // Exact-symbol query puts the definition first.
    let hits = mem.search_code("parseConfig", 5, None).await.unwrap();
    assert_eq!(hits[0].chunk.symbol, "parseConfig");
    assert_eq!(hits[0].chunk.path, "src/config.ts");

    // Symbol context stitches the call/import graph together.
    let ctx = mem.symbol_context("parseConfig").unwrap();
    assert_eq!(ctx.definition.path, "src/config.ts");
    assert!(ctx.callers.iter().any(|c| c.symbol == "loadFromDisk"));
    assert!(ctx.callees.contains(&"normalize".to_string()));
    assert!(ctx.importers.iter().any(|c| c.symbol == "loadFromDisk"));

    // Insights over the same graph.
    let insights = mem.code_insights().expect("code table exists");
    assert_eq!(insights.total_files, 2);
    assert!(insights.total_symbols >= 4);
    assert!(insights.documentation_coverage > 0.0);
    assert!(
        !insights.dead_code.iter().any(|id| id.contains("parseConfig")),
        "called symbols are not dead"
    );
}

#[tokio::test]
async fn unified_search_merges_transcripts_and_code() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/retry.ts"),
        "export function retryWithBackoff(op: () => void) {\n    return scheduleRetry(op);\n}\n",
    )
    .unwrap();

    let mem = Memory::with_provider(dir.path(), Arc::new(HashingProvider)).unwrap();
    mem.capture(&capture_payload(
        "retry",
        "Add retry with backoff to the fetch layer",
        "Wrapped the fetch call in retryWithBackoff.",
    ))
    .unwrap();
    drop(mem);

    let mut mem = synced_memory(dir.path(), true).await;
    let results = mem
        .search(
            "retry backoff",
            10,
            UnifiedSource::All,
            SearchFilter::default(),
        )
        .await
        .unwrap();

    let has_transcript = results
        .iter()
        .any(|r| r.source == engram::search::ResultSource::Transcript);
    let has_code = results
        .iter()
        .any(|r| r.source == engram::search::ResultSource::Code);
    assert!(has_transcript, "expected a session hit: {results:?}");
    assert!(has_code, "expected a code hit: {results:?}");
}

#[tokio::test]
async fn reset_drops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mem = Memory::with_provider(dir.path(), Arc::new(HashingProvider)).unwrap();
    mem.capture(&capture_payload("x", "q", "a")).unwrap();
    drop(mem);

    let mut mem = synced_memory(dir.path(), false).await;
    assert_eq!(mem.stats().records, 1);

    mem.reset_solutions().unwrap();
    assert_eq!(mem.stats().records, 0);
    assert!(!mem.stats().has_table);

    let results = mem
        .search("q", 5, UnifiedSource::All, SearchFilter::default())
        .await
        .unwrap();
    assert!(results.is_empty());
}
