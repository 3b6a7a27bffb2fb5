use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{MemoryErr, Result};

/// Name of the per-workspace state directory.
pub const STATE_DIR: &str = ".engram";

/// Hard safety ceiling: source files larger than this are **always** skipped
/// when code-indexing, regardless of config.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 1_000_000; // 1 MB

/// Embedding provider selection. Models are data; the provider is the
/// capability that turns text into vectors and digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP endpoints (embeddings + chat completions).
    OpenAi,
    /// Model2Vec static models, fully offline.
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Local => write!(f, "local"),
        }
    }
}

/// Declared output width for each known embedding model.
///
/// Every stored vector must be exactly this wide (a model change requires
/// dropping and re-creating the affected table).
pub fn embedding_dimensions(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        "nomic-embed-text" => 768,
        "minishlab/potion-base-8M" => 256,
        "minishlab/potion-retrieval-32M" => 512,
        _ => 1536,
    }
}

/// File names that the diff scraper routinely mistakes for changed files.
fn default_file_denylist() -> Vec<String> {
    ["node.js", "next.js", "vue.js", "express.js", "react.js", "angular.js"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub provider: ProviderKind,

    /// Embedding model id; its declared dimension fixes the vector width
    /// of both tables.
    pub embedding_model: String,

    /// Chat model used by the summarizer.
    pub summary_model: String,

    /// Base URL for the OpenAI-compatible endpoints.
    pub api_base: String,

    /// API key; `OPENAI_API_KEY` wins when set in the environment.
    pub api_key: Option<String>,

    /// Git branch holding committed checkpoints (one commit ≈ one capture).
    pub checkpoint_branch: String,

    /// Last commit on the checkpoint branch the indexer has fully consumed.
    pub last_indexed_commit: Option<String>,

    /// checkpointId → number of transcript pairs already captured for a
    /// still-running session; lets re-capture append instead of duplicate.
    pub session_offsets: HashMap<String, usize>,

    /// File names never reported as "changed" even when a diff mentions
    /// them (framework names that match the path regex by accident).
    pub file_denylist: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            embedding_model: "text-embedding-3-small".to_string(),
            summary_model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            checkpoint_branch: "checkpoints".to_string(),
            last_indexed_commit: None,
            session_offsets: HashMap::new(),
            file_denylist: default_file_denylist(),
        }
    }
}

impl MemoryConfig {
    /// Vector width for the configured embedding model.
    pub fn dimensions(&self) -> usize {
        embedding_dimensions(&self.embedding_model)
    }

    /// Resolved API key: environment beats the config file.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }

    /// Whether the configured provider can actually serve requests.
    pub fn provider_ready(&self) -> bool {
        match self.provider {
            ProviderKind::Local => true,
            ProviderKind::OpenAi => self.resolved_api_key().is_some(),
        }
    }

    /// Whether a file name is a known false-positive capture.
    pub fn is_denylisted_file(&self, name: &str) -> bool {
        self.file_denylist.iter().any(|d| d.eq_ignore_ascii_case(name))
    }
}

/// Handle on one workspace's persisted state. All paths derive from here;
/// nothing else in the crate touches the state layout directly.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    state_dir: PathBuf,
}

impl Workspace {
    /// Open an existing workspace. Fails when the state directory is absent.
    pub fn open(root: &Path) -> Result<Self> {
        let state_dir = root.join(STATE_DIR);
        if !state_dir.is_dir() {
            return Err(MemoryErr::NotInitialised(root.to_path_buf()));
        }
        Ok(Self {
            root: root.to_path_buf(),
            state_dir,
        })
    }

    /// Create the state directory tree (idempotent) and return the handle.
    pub fn init(root: &Path) -> Result<Self> {
        let state_dir = root.join(STATE_DIR);
        std::fs::create_dir_all(state_dir.join("vectors"))?;
        std::fs::create_dir_all(state_dir.join("cache"))?;
        std::fs::create_dir_all(state_dir.join("metadata"))?;
        Ok(Self {
            root: root.to_path_buf(),
            state_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.state_dir.join("vectors")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.state_dir.join("metadata")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("sync.lock")
    }

    /// Read the typed config, falling back to defaults on absence or a
    /// corrupt file (the corrupt case logs a warning and keeps going).
    pub fn load_config(&self) -> MemoryConfig {
        let path = self.config_path();
        let Ok(text) = std::fs::read_to_string(&path) else {
            return MemoryConfig::default();
        };
        match serde_json::from_str::<MemoryConfig>(&text) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
                MemoryConfig::default()
            }
        }
    }

    /// Persist the config atomically (tmp + rename).
    pub fn save_config(&self, cfg: &MemoryConfig) -> Result<()> {
        let path = self.config_path();
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(cfg)?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Workspace::open(dir.path()),
            Err(MemoryErr::NotInitialised(_))
        ));
        let ws = Workspace::init(dir.path()).unwrap();
        assert!(ws.vectors_dir().is_dir());
        assert!(Workspace::open(dir.path()).is_ok());
    }

    #[test]
    fn config_roundtrip_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();

        // Absent file → defaults.
        let cfg = ws.load_config();
        assert_eq!(cfg.checkpoint_branch, "checkpoints");
        assert_eq!(cfg.dimensions(), 1536);

        let mut cfg = cfg;
        cfg.provider = ProviderKind::Local;
        cfg.embedding_model = "minishlab/potion-base-8M".to_string();
        cfg.last_indexed_commit = Some("abc123def456".to_string());
        ws.save_config(&cfg).unwrap();

        let loaded = ws.load_config();
        assert_eq!(loaded.dimensions(), 256);
        assert_eq!(loaded.last_indexed_commit.as_deref(), Some("abc123def456"));
        assert!(loaded.provider_ready(), "local provider needs no credentials");
    }

    #[test]
    fn denylist_filters_framework_names() {
        let cfg = MemoryConfig::default();
        assert!(cfg.is_denylisted_file("node.js"));
        assert!(cfg.is_denylisted_file("Next.js"));
        assert!(!cfg.is_denylisted_file("server.js"));
    }

    #[test]
    fn unknown_model_defaults_to_1536() {
        assert_eq!(embedding_dimensions("some-future-model"), 1536);
    }
}
