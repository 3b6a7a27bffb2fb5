use async_trait::async_trait;
use model2vec_rs::model::StaticModel;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::EmbeddingCache;
use crate::config::{MemoryConfig, ProviderKind};
use crate::error::{MemoryErr, Result};
use crate::source::cap_chars;

// ---------------------------------------------------------------------------
// Providers: the two model-backed capabilities the pipeline needs.
//
//   embed(text | batch)               → fixed-width vectors
//   summarize(prompt, response, diff) → 2–3 sentence digest
//
// Models are data (configured ids), not types. All remote calls retry with
// bounded exponential backoff; the summarizer additionally degrades to a
// deterministic digest so a dead chat endpoint never blocks indexing.
//
// Futures here are deliberately `?Send`: the whole pipeline is a single
// cooperative task (the local static model is not thread-safe), and the
// orchestrator never spawns provider work onto other threads.
// ---------------------------------------------------------------------------

/// Provider calls are attempted this many times before surfacing.
const MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles per attempt.
const BACKOFF_BASE_MS: u64 = 500;

/// Summarizer input is head+tail truncated to this many chars.
const SUMMARY_INPUT_CAP: usize = 8_000;

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize one exchange from an AI coding session. \
Reply with 2-3 sentences structured as TASK: what was asked. APPROACH: how it was solved. \
SCOPE: which files or areas changed. Use the raw answer text, never invent details.";

#[async_trait(?Send)]
pub trait Provider {
    /// Declared vector width; every embedding this provider returns has
    /// exactly this many components.
    fn dimensions(&self) -> usize;

    /// Max in-flight summarize calls the backend tolerates.
    fn max_concurrency(&self) -> usize {
        5
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn summarize(&self, prompt: &str, response: &str, diff: &str) -> Result<String>;
}

/// Build the configured provider, checking readiness first.
pub fn build_provider(cfg: &MemoryConfig) -> Result<Arc<dyn Provider>> {
    match cfg.provider {
        ProviderKind::OpenAi => {
            let api_key = cfg.resolved_api_key().ok_or_else(|| MemoryErr::ProviderUnavailable {
                provider: "openai".to_string(),
                cause: "no API key (set OPENAI_API_KEY or config.api_key)".to_string(),
            })?;
            Ok(Arc::new(OpenAiProvider::new(
                &cfg.api_base,
                &api_key,
                &cfg.embedding_model,
                &cfg.summary_model,
                cfg.dimensions(),
            )))
        }
        ProviderKind::Local => Ok(Arc::new(LocalProvider::load(&cfg.embedding_model)?)),
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

async fn retry<T, F, Fut>(provider: &str, what: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, String>>,
{
    let mut last_err = String::new();
    for n in 0..MAX_ATTEMPTS {
        if n > 0 {
            let delay = Duration::from_millis(BACKOFF_BASE_MS << (n - 1));
            tokio::time::sleep(delay).await;
        }
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::warn!(provider, what, attempt = n + 1, error = %e, "provider call failed");
                last_err = e;
            }
        }
    }
    Err(MemoryErr::ProviderUnavailable {
        provider: provider.to_string(),
        cause: format!("{what} failed after {MAX_ATTEMPTS} attempts: {last_err}"),
    })
}

// ---------------------------------------------------------------------------
// Deterministic summary fallback
// ---------------------------------------------------------------------------

fn first_meaningful_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .find(|l| l.len() > 2 && !l.starts_with("```") && !l.starts_with('#'))
}

/// Files named in diff headers, for the fallback digest's SCOPE sentence.
fn diff_file_list(diff: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in diff.lines() {
        let Some(rest) = line
            .strip_prefix("+++ ")
            .or_else(|| line.strip_prefix("--- "))
        else {
            continue;
        };
        let path = rest.trim().trim_start_matches("a/").trim_start_matches("b/");
        if path == "/dev/null" || path.is_empty() {
            continue;
        }
        if !out.contains(&path.to_string()) {
            out.push(path.to_string());
        }
        if out.len() >= 5 {
            break;
        }
    }
    out
}

/// Digest built without any model: first meaningful prompt/response lines
/// plus the diff's file list.
pub fn fallback_digest(prompt: &str, response: &str, diff: &str) -> String {
    let task = first_meaningful_line(prompt).unwrap_or("(no prompt)");
    let approach = first_meaningful_line(response).unwrap_or("(no recorded answer)");
    let mut digest = format!("TASK: {} APPROACH: {}", cap_chars(task, 200), cap_chars(approach, 200));
    let files = diff_file_list(diff);
    if !files.is_empty() {
        digest.push_str(&format!(" SCOPE: {}", files.join(", ")));
    }
    digest
}

/// Keep the head and tail of an over-long summarizer input.
fn truncate_head_tail(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let half = cap / 2;
    let head: String = text.chars().take(half).collect();
    let tail_start = text.chars().count() - half;
    let tail: String = text.chars().skip(tail_start).collect();
    format!("{head}\n…\n{tail}")
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP provider
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    embed_model: String,
    chat_model: String,
    dims: usize,
}

impl OpenAiProvider {
    pub fn new(
        api_base: &str,
        api_key: &str,
        embed_model: &str,
        chat_model: &str,
        dims: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            embed_model: embed_model.to_string(),
            chat_model: chat_model.to_string(),
            dims,
        }
    }

    async fn embeddings_request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, String> {
        let resp = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.embed_model, "input": texts }))
            .send()
            .await
            .map_err(|e| format!("request: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| format!("body: {e}"))?;
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| "missing data array".to_string())?;

        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let vec: Vec<f32> = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| "missing embedding".to_string())?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if vec.len() != self.dims {
                return Err(format!(
                    "embedding width {} does not match declared {}",
                    vec.len(),
                    self.dims
                ));
            }
            out.push(vec);
        }
        if out.len() != texts.len() {
            return Err(format!("got {} embeddings for {} inputs", out.len(), texts.len()));
        }
        Ok(out)
    }

    async fn chat_request(&self, system: &str, user: &str) -> std::result::Result<String, String> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.chat_model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
                "temperature": 0.2,
                "max_tokens": 160,
            }))
            .send()
            .await
            .map_err(|e| format!("request: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| format!("body: {e}"))?;
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "empty completion".to_string())
    }
}

#[async_trait(?Send)]
impl Provider for OpenAiProvider {
    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let one = [text.to_string()];
        let batch = self.embed_batch(&one).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| MemoryErr::internal("empty embedding batch"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        retry("openai", "embeddings", || self.embeddings_request(texts)).await
    }

    async fn summarize(&self, prompt: &str, response: &str, diff: &str) -> Result<String> {
        let input = truncate_head_tail(
            &format!("QUESTION:\n{prompt}\n\nANSWER:\n{response}\n\nDIFF:\n{diff}"),
            SUMMARY_INPUT_CAP,
        );
        match retry("openai", "summarize", || {
            self.chat_request(SUMMARY_SYSTEM_PROMPT, &input)
        })
        .await
        {
            Ok(s) => Ok(s),
            Err(e) => {
                tracing::warn!(error = %e, "summarizer unavailable, using deterministic digest");
                Ok(fallback_digest(prompt, response, diff))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Local static-model provider
// ---------------------------------------------------------------------------

pub struct LocalProvider {
    model: StaticModel,
    dims: usize,
}

impl LocalProvider {
    pub fn load(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None).map_err(|e| {
            MemoryErr::ProviderUnavailable {
                provider: "local".to_string(),
                cause: format!("failed to load {model_id}: {e}"),
            }
        })?;
        // Probe once rather than trusting the id→dim table for local models.
        let dims = model.encode_single("probe").len();
        Ok(Self { model, dims })
    }
}

#[async_trait(?Send)]
impl Provider for LocalProvider {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn max_concurrency(&self) -> usize {
        1
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.model.encode_single(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.model.encode_single(t)).collect())
    }

    async fn summarize(&self, prompt: &str, response: &str, diff: &str) -> Result<String> {
        // No chat capability offline; the deterministic digest is the product.
        Ok(fallback_digest(prompt, response, diff))
    }
}

// ---------------------------------------------------------------------------
// Cache-aware embedding front
// ---------------------------------------------------------------------------

/// Thin wrapper that consults the disk LRU before touching the provider.
pub struct Embedder {
    provider: Arc<dyn Provider>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Single-text path: cache first, provider on miss, write-back after.
    pub async fn embed_one(&self, cache: &mut EmbeddingCache, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = cache.get(text) {
            return Ok(hit);
        }
        let vector = self.provider.embed(text).await?;
        cache.put(text, &vector);
        cache.save();
        Ok(vector)
    }

    /// Batch path: cached hits are split off, one provider call covers the
    /// misses, and new vectors are written back. Output order matches input.
    pub async fn embed_batch(
        &self,
        cache: &mut EmbeddingCache,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let lookup = cache.lookup_batch(texts);
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for (idx, vector) in lookup.hits {
            out[idx] = Some(vector);
        }

        if !lookup.misses.is_empty() {
            let miss_texts: Vec<String> =
                lookup.misses.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.provider.embed_batch(&miss_texts).await?;
            for (&idx, vector) in lookup.misses.iter().zip(fresh) {
                cache.put(&texts[idx], &vector);
                out[idx] = Some(vector);
            }
            cache.save();
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| MemoryErr::internal("embedding batch hole")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_digest_reads_first_meaningful_lines() {
        let digest = fallback_digest(
            "\n\n# heading\nFix the flaky login test\nmore context",
            "```\ncode\n```\nI stabilised the retry loop.",
            "--- a/src/login.test.ts\n+++ b/src/login.test.ts\n",
        );
        assert!(digest.contains("TASK: Fix the flaky login test"));
        assert!(digest.contains("APPROACH: I stabilised the retry loop."));
        assert!(digest.contains("SCOPE: src/login.test.ts"));
    }

    #[test]
    fn head_tail_truncation_keeps_both_ends() {
        let text = format!("START{}END", "x".repeat(20_000));
        let cut = truncate_head_tail(&text, 8_000);
        assert!(cut.chars().count() < 8_100);
        assert!(cut.starts_with("START"));
        assert!(cut.ends_with("END"));
        assert!(cut.contains('…'));
    }

    #[test]
    fn short_input_is_not_truncated() {
        assert_eq!(truncate_head_tail("short", 8_000), "short");
    }

    struct CountingProvider {
        calls: std::cell::RefCell<usize>,
    }

    #[async_trait(?Send)]
    impl Provider for CountingProvider {
        fn dimensions(&self) -> usize {
            3
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(self.embed_batch(&[text.to_string()]).await?.remove(0))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            *self.calls.borrow_mut() += 1;
            Ok(texts.iter().map(|t| vec![t.len() as f32, 0.0, 1.0]).collect())
        }

        async fn summarize(&self, p: &str, r: &str, d: &str) -> Result<String> {
            Ok(fallback_digest(p, r, d))
        }
    }

    #[tokio::test]
    async fn embed_batch_hits_cache_on_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EmbeddingCache::open(dir.path());
        let provider = Arc::new(CountingProvider {
            calls: std::cell::RefCell::new(0),
        });
        let embedder = Embedder::new(provider.clone());

        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let first = embedder.embed_batch(&mut cache, &texts).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(*provider.calls.borrow(), 1);

        // Everything cached now — no further provider calls.
        let second = embedder.embed_batch(&mut cache, &texts).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(*provider.calls.borrow(), 1);

        // One new text → exactly one more call, order preserved.
        let mixed = vec!["beta".to_string(), "gamma".to_string()];
        let third = embedder.embed_batch(&mut cache, &mixed).await.unwrap();
        assert_eq!(third[0], first[1]);
        assert_eq!(*provider.calls.borrow(), 2);
    }

    #[tokio::test]
    async fn embed_one_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EmbeddingCache::open(dir.path());
        let provider = Arc::new(CountingProvider {
            calls: std::cell::RefCell::new(0),
        });
        let embedder = Embedder::new(provider.clone());

        let a = embedder.embed_one(&mut cache, "query text").await.unwrap();
        let b = embedder.embed_one(&mut cache, "query text").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(*provider.calls.borrow(), 1);
    }
}
