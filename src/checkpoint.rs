use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::cache::sha256_16;

// ---------------------------------------------------------------------------
// Checkpoint parsing — two sources feed one lazy stream:
//
//   1. Commits on a dedicated git branch (one commit ≈ one checkpoint),
//      read via the `git` subprocess. Payload is the committed
//      `checkpoint.json`; commits without one degrade to a single-session
//      checkpoint built from the commit subject + patch.
//   2. Files under `.engram/metadata/` — captures taken between commits.
//      Their ids always carry the `local-` prefix, which marks them as
//      content-addressed (re-indexed on hash change) rather than immutable.
//
// Malformed entries are dropped with a warning; parsing continues.
// ---------------------------------------------------------------------------

/// Max characters of commit patch text kept for the fallback session.
const PATCH_FALLBACK_CAP: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

/// One agent session inside a checkpoint.
#[derive(Debug, Clone)]
pub struct Session {
    pub checkpoint_id: String,
    /// 0-based position within the checkpoint.
    pub session_index: usize,
    pub transcript: Vec<TranscriptEntry>,
    pub agent: Option<String>,
    pub tokens_used: Option<u64>,
    /// Fallback text for sessions captured without a full transcript.
    pub prompts: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedCheckpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sessions: Vec<Session>,
}

impl ParsedCheckpoint {
    /// Uncommitted captures are content-addressed; branch commits are not.
    pub fn is_local(&self) -> bool {
        self.id.starts_with("local-")
    }

    /// sha256-16 over the concatenated transcript content — the upsert key
    /// for local checkpoints.
    pub fn content_hash(&self) -> String {
        let mut joined = String::new();
        for session in &self.sessions {
            for entry in &session.transcript {
                joined.push_str(&entry.content);
            }
        }
        sha256_16(&joined)
    }
}

// ---------------------------------------------------------------------------
// Wire format (tolerant)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EntryFile {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct SessionFile {
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    tokens_used: Option<u64>,
    #[serde(default)]
    prompts: Option<String>,
    #[serde(default)]
    transcript: Vec<EntryFile>,
}

#[derive(Debug, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    sessions: Vec<SessionFile>,
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "user" | "human" => Some(Role::User),
        "assistant" | "model" => Some(Role::Assistant),
        "tool" | "tool_result" | "function" => Some(Role::Tool),
        _ => None,
    }
}

fn convert_sessions(checkpoint_id: &str, files: Vec<SessionFile>) -> Vec<Session> {
    files
        .into_iter()
        .enumerate()
        .map(|(idx, s)| Session {
            checkpoint_id: checkpoint_id.to_string(),
            session_index: idx,
            transcript: s
                .transcript
                .into_iter()
                .filter_map(|e| {
                    // Unknown roles (system, developer, …) carry no
                    // retrievable Q/A content — drop the entry, keep going.
                    parse_role(&e.role).map(|role| TranscriptEntry {
                        role,
                        content: e.content,
                    })
                })
                .collect(),
            agent: s.agent,
            tokens_used: s.tokens_used,
            prompts: s.prompts,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Git subprocess helpers
// ---------------------------------------------------------------------------

fn run_git(repo_root: &Path, args: &[&str]) -> Option<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn short_id(sha: &str) -> String {
    sha.chars().take(12).collect()
}

// ---------------------------------------------------------------------------
// The source
// ---------------------------------------------------------------------------

/// Reads checkpoints from the branch and the metadata directory.
///
/// `stream` is lazy on the expensive part: the commit *list* is fetched
/// up front (one `git log`), but each commit's payload is only read when
/// the iterator reaches it, so a caller that stops early never pays for
/// the tail.
pub struct CheckpointSource {
    repo_root: PathBuf,
    metadata_dir: PathBuf,
    branch: String,
}

impl CheckpointSource {
    pub fn new(repo_root: &Path, metadata_dir: &Path, branch: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            metadata_dir: metadata_dir.to_path_buf(),
            branch: branch.to_string(),
        }
    }

    /// All checkpoints not in `skip`, branch commits first (oldest→newest),
    /// then local metadata captures ordered by timestamp.
    pub fn stream<'a>(
        &'a self,
        skip: &'a HashSet<String>,
    ) -> impl Iterator<Item = ParsedCheckpoint> + 'a {
        let commits = self.branch_commits();
        let branch_iter = commits.into_iter().filter_map(move |(sha, ts)| {
            let id = short_id(&sha);
            if skip.contains(&id) {
                return None;
            }
            self.parse_commit(&sha, ts)
        });

        let mut local = self.local_checkpoints();
        local.sort_by_key(|cp| cp.timestamp);
        let local_iter = local.into_iter().filter(move |cp| !skip.contains(&cp.id));

        branch_iter.chain(local_iter)
    }

    /// Tip commit of the checkpoint branch, if it exists.
    pub fn latest_commit(&self) -> Option<String> {
        run_git(
            &self.repo_root,
            &["rev-parse", "--verify", "--quiet", &self.branch],
        )
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    }

    /// (sha, commit unix time) for every commit on the checkpoint branch,
    /// oldest first. Missing branch ⇒ empty — that is a normal state for a
    /// repo that has never captured anything.
    fn branch_commits(&self) -> Vec<(String, i64)> {
        if run_git(
            &self.repo_root,
            &["rev-parse", "--verify", "--quiet", &self.branch],
        )
        .is_none()
        {
            return vec![];
        }

        let Some(log) = run_git(
            &self.repo_root,
            &["log", &self.branch, "--reverse", "--format=%H%x1f%ct"],
        ) else {
            return vec![];
        };

        log.lines()
            .filter_map(|line| {
                let (sha, ts) = line.split_once('\u{1f}')?;
                Some((sha.trim().to_string(), ts.trim().parse::<i64>().ok()?))
            })
            .collect()
    }

    fn parse_commit(&self, sha: &str, unix_ts: i64) -> Option<ParsedCheckpoint> {
        let id = short_id(sha);
        let timestamp = Utc
            .timestamp_opt(unix_ts, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let payload = run_git(&self.repo_root, &["show", &format!("{sha}:checkpoint.json")]);
        if let Some(text) = payload {
            match serde_json::from_str::<CheckpointFile>(&text) {
                Ok(file) => {
                    return Some(ParsedCheckpoint {
                        sessions: convert_sessions(&id, file.sessions),
                        id,
                        timestamp,
                    });
                }
                Err(e) => {
                    tracing::warn!(commit = %sha, error = %e, "malformed checkpoint.json, using patch fallback");
                }
            }
        }

        // Fallback: commit subject + truncated patch as a one-session capture.
        let subject = run_git(&self.repo_root, &["log", "-1", "--format=%s", sha])
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let patch = run_git(&self.repo_root, &["show", sha, "--format=", "--patch"])
            .map(|mut p| {
                p.truncate(p.char_indices().nth(PATCH_FALLBACK_CAP).map_or(p.len(), |(i, _)| i));
                p
            })
            .unwrap_or_default();

        if subject.is_empty() && patch.trim().is_empty() {
            tracing::warn!(commit = %sha, "checkpoint commit carries no usable payload, skipping");
            return None;
        }

        let transcript = if patch.trim().is_empty() {
            vec![]
        } else {
            vec![TranscriptEntry {
                role: Role::Tool,
                content: patch,
            }]
        };

        Some(ParsedCheckpoint {
            sessions: vec![Session {
                checkpoint_id: id.clone(),
                session_index: 0,
                transcript,
                agent: None,
                tokens_used: None,
                prompts: if subject.is_empty() { None } else { Some(subject) },
            }],
            id,
            timestamp,
        })
    }

    /// Captures living under the metadata directory.
    fn local_checkpoints(&self) -> Vec<ParsedCheckpoint> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.metadata_dir) else {
            return out;
        };

        for ent in entries.flatten() {
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                tracing::warn!(path = %path.display(), "unreadable metadata capture, skipping");
                continue;
            };
            let file = match serde_json::from_str::<CheckpointFile>(&text) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "malformed metadata capture, skipping");
                    continue;
                }
            };

            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "capture".to_string());
            let id = match file.id {
                Some(raw) if raw.starts_with("local-") => raw,
                Some(raw) => format!("local-{raw}"),
                None => format!("local-{stem}"),
            };

            let timestamp = file
                .timestamp
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .or_else(|| {
                    ent.metadata()
                        .and_then(|m| m.modified())
                        .ok()
                        .map(DateTime::<Utc>::from)
                })
                .unwrap_or_else(Utc::now);

            out.push(ParsedCheckpoint {
                sessions: convert_sessions(&id, file.sessions),
                id,
                timestamp,
            });
        }

        out
    }
}

/// Write a local capture into the metadata directory (the counterpart the
/// parser reads back). Returns the assigned checkpoint id.
pub fn write_local_capture(
    metadata_dir: &Path,
    payload: &serde_json::Value,
) -> crate::error::Result<String> {
    std::fs::create_dir_all(metadata_dir)?;

    let id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .map(|raw| {
            if raw.starts_with("local-") {
                raw.to_string()
            } else {
                format!("local-{raw}")
            }
        })
        .unwrap_or_else(|| format!("local-{}", Utc::now().timestamp_millis()));

    let mut doc = payload.clone();
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("id".to_string(), serde_json::Value::String(id.clone()));
        obj.entry("timestamp")
            .or_insert_with(|| serde_json::Value::from(Utc::now().timestamp()));
    }

    let final_path = metadata_dir.join(format!("{id}.json"));
    let tmp_path = final_path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_string_pretty(&doc)?)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_capture(dir: &Path, name: &str, json: &str) {
        std::fs::write(dir.join(name), json).unwrap();
    }

    #[test]
    fn missing_branch_yields_empty_stream() {
        // A tempdir is not a git repo, so rev-parse fails for the branch.
        let dir = tempfile::tempdir().unwrap();
        let src = CheckpointSource::new(dir.path(), &dir.path().join("metadata"), "checkpoints");
        let skip = HashSet::new();
        assert_eq!(src.stream(&skip).count(), 0);
    }

    #[test]
    fn local_captures_parse_and_get_prefixed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("metadata");
        std::fs::create_dir_all(&meta).unwrap();

        write_capture(
            &meta,
            "abc.json",
            r#"{
                "id": "abc",
                "timestamp": 1700000000,
                "sessions": [{
                    "agent": "claude",
                    "tokens_used": 420,
                    "transcript": [
                        {"role": "user", "content": "How does parsing work?"},
                        {"role": "assistant", "content": "It streams commits."},
                        {"role": "system", "content": "ignored"}
                    ]
                }]
            }"#,
        );

        let src = CheckpointSource::new(dir.path(), &meta, "checkpoints");
        let skip = HashSet::new();
        let all: Vec<_> = src.stream(&skip).collect();
        assert_eq!(all.len(), 1);

        let cp = &all[0];
        assert_eq!(cp.id, "local-abc");
        assert!(cp.is_local());
        assert_eq!(cp.sessions.len(), 1);
        assert_eq!(cp.sessions[0].session_index, 0);
        // The system entry was dropped.
        assert_eq!(cp.sessions[0].transcript.len(), 2);
        assert_eq!(cp.sessions[0].agent.as_deref(), Some("claude"));
    }

    #[test]
    fn malformed_capture_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("metadata");
        std::fs::create_dir_all(&meta).unwrap();

        write_capture(&meta, "bad.json", "{not json at all");
        write_capture(
            &meta,
            "good.json",
            r#"{"sessions": [{"transcript": [{"role": "user", "content": "hi"}]}]}"#,
        );

        let src = CheckpointSource::new(dir.path(), &meta, "checkpoints");
        let skip = HashSet::new();
        let all: Vec<_> = src.stream(&skip).collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "local-good");
    }

    #[test]
    fn skip_set_filters_known_ids() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("metadata");
        std::fs::create_dir_all(&meta).unwrap();
        write_capture(
            &meta,
            "seen.json",
            r#"{"sessions": [{"transcript": [{"role": "user", "content": "x"}]}]}"#,
        );

        let src = CheckpointSource::new(dir.path(), &meta, "checkpoints");
        let mut skip = HashSet::new();
        skip.insert("local-seen".to_string());
        assert_eq!(src.stream(&skip).count(), 0);
    }

    #[test]
    fn content_hash_tracks_transcript_content() {
        let mk = |answer: &str| ParsedCheckpoint {
            id: "local-x".to_string(),
            timestamp: Utc::now(),
            sessions: vec![Session {
                checkpoint_id: "local-x".to_string(),
                session_index: 0,
                transcript: vec![
                    TranscriptEntry {
                        role: Role::User,
                        content: "q".to_string(),
                    },
                    TranscriptEntry {
                        role: Role::Assistant,
                        content: answer.to_string(),
                    },
                ],
                agent: None,
                tokens_used: None,
                prompts: None,
            }],
        };

        assert_eq!(mk("a").content_hash(), mk("a").content_hash());
        assert_ne!(mk("a").content_hash(), mk("b").content_hash());
        assert_eq!(mk("a").content_hash().len(), 16);
    }

    #[test]
    fn write_local_capture_roundtrips_through_parser() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("metadata");

        let id = write_local_capture(
            &meta,
            &serde_json::json!({
                "sessions": [{"transcript": [{"role": "user", "content": "capture me"}]}]
            }),
        )
        .unwrap();
        assert!(id.starts_with("local-"));

        let src = CheckpointSource::new(dir.path(), &meta, "checkpoints");
        let skip = HashSet::new();
        let all: Vec<_> = src.stream(&skip).collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
    }
}
