use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::checkpoint::{ParsedCheckpoint, Role, Session};
use crate::config::MemoryConfig;
use crate::source::{cap_chars, detect_language, EnhancedCodeSymbol, SymbolKind};

// ---------------------------------------------------------------------------
// Chunking: the step that turns parsed inputs into the indexable unit.
//
//   SolutionChunk — one user↔assistant pair of a session, with the session's
//                   diff attached to its first pair only.
//   CodeChunk     — one extracted symbol (class methods are separate chunks
//                   with `Class.method` names).
//
// Both carry a deterministic id (the documented contract) and the embedding
// text the vectorizer will consume.
// ---------------------------------------------------------------------------

/// Assistant responses stored per chunk are capped here.
const MAX_RESPONSE_CHARS: usize = 2_000;

/// Session diff summaries are capped here.
const MAX_DIFF_CHARS: usize = 1_000;

/// Final embedding text cap for both chunk kinds.
pub const MAX_EMBED_CHARS: usize = 4_000;

/// Body prefix included in code embedding text.
const EMBED_BODY_CHARS: usize = 1_800;

/// At most this many changed files are recorded per chunk.
const MAX_FILES_CHANGED: usize = 20;

/// At most this many symbols are recorded per solution chunk.
const MAX_CHUNK_SYMBOLS: usize = 30;

#[derive(Debug, Clone)]
pub struct SolutionMetadata {
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    pub files_changed: Vec<String>,
    pub tokens_used: u64,
    pub symbols: Vec<String>,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct SolutionChunk {
    /// `{checkpointId}-{sessionIndex}-{pairIndex}` — stable contract.
    pub id: String,
    pub checkpoint_id: String,
    pub session_index: usize,
    pub prompt: String,
    pub response: String,
    /// Non-empty only on the first pair of a session.
    pub diff_summary: String,
    /// Natural-language digest; filled by the summarizer stage.
    pub summary: String,
    pub embedding_text: String,
    pub metadata: SolutionMetadata,
}

impl SolutionChunk {
    /// Prepend the digest to the embedding text (done after summarization,
    /// before vectorization).
    pub fn apply_summary(&mut self, summary: String) {
        let base = build_solution_embedding_text(
            &self.metadata.symbols,
            &self.prompt,
            &self.response,
            &self.diff_summary,
        );
        self.embedding_text = cap_chars(&format!("{summary}\n\n{base}"), MAX_EMBED_CHARS);
        self.summary = summary;
    }
}

#[derive(Debug, Clone)]
pub struct CodeChunk {
    /// `{path}:{symbol}:{startLine}` — stable contract.
    pub id: String,
    pub path: String,
    pub symbol: String,
    pub symbol_type: SymbolKind,
    pub language: String,
    pub body: String,
    /// Doc-comment prefix, or `"{type} {name}"` when undocumented.
    pub summary: String,
    pub embedding_text: String,
    /// CSV of identifiers called in the body.
    pub calls: String,
    /// CSV of `name:source` imported bindings.
    pub imports: String,
    pub start_line: u32,
    pub last_modified: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Solution chunking
// ---------------------------------------------------------------------------

fn decl_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"\b(?:function|class|const|let|var|def|fn|interface|type|enum|struct|trait)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        )
        .expect("decl regex")
    })
}

fn identifier_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\b([A-Za-z_$][A-Za-z0-9_$]{3,})\b").expect("ident regex"))
}

fn path_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"([A-Za-z0-9_@][A-Za-z0-9_@./-]*\.[A-Za-z]{1,5})\b").expect("path regex")
    })
}

/// Looks like a code identifier rather than an English word: has an
/// underscore, a dollar, or an internal case hump.
fn looks_like_identifier(token: &str) -> bool {
    if token.contains('_') || token.contains('$') {
        return true;
    }
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let mut prev_lower = first.is_lowercase();
    for c in chars {
        if c.is_uppercase() && prev_lower {
            return true;
        }
        prev_lower = c.is_lowercase();
    }
    false
}

/// Fenced ``` blocks inside markdown-ish content.
fn code_blocks(content: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = content;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(close) = after.find("```") else {
            break;
        };
        // Skip the info string line.
        let block = &after[..close];
        let body = block.split_once('\n').map(|(_, b)| b).unwrap_or(block);
        out.push(body);
        rest = &after[close + 3..];
    }
    out
}

/// Union of declared names and code-block identifiers, capped.
fn collect_symbols(prompt: &str, response: &str, diff: &str, session: &Session) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let mut push = |name: &str| {
        if out.len() < MAX_CHUNK_SYMBOLS && seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    };

    for text in [prompt, response, diff] {
        for cap in decl_regex().captures_iter(text) {
            push(&cap[1]);
        }
    }

    // Identifiers surfacing in assistant/tool output, code blocks first.
    for entry in &session.transcript {
        if !matches!(entry.role, Role::Assistant | Role::Tool) {
            continue;
        }
        for block in code_blocks(&entry.content) {
            for cap in identifier_regex().captures_iter(block) {
                let token = &cap[1];
                if looks_like_identifier(token) {
                    push(token);
                }
            }
        }
    }

    out
}

/// Diff text carried by tool entries (unified-diff markers only).
fn extract_diff(session: &Session) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for entry in &session.transcript {
        if !matches!(entry.role, Role::Tool) {
            continue;
        }
        let c = entry.content.as_str();
        if c.contains("diff") || c.contains("+++") || c.contains("---") {
            parts.push(c);
        }
    }
    cap_chars(&parts.join("\n"), MAX_DIFF_CHARS)
}

/// File paths mentioned by the diff, denylist-filtered, capped at 20.
fn extract_files_changed(diff: &str, cfg: &MemoryConfig) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for cap in path_regex().captures_iter(diff) {
        let raw = cap[1].trim_start_matches("a/").trim_start_matches("b/");
        if raw == "/dev/null" || raw.is_empty() {
            continue;
        }
        let base = raw.rsplit('/').next().unwrap_or(raw);
        if cfg.is_denylisted_file(base) {
            continue;
        }
        if seen.insert(raw.to_string()) {
            out.push(raw.to_string());
            if out.len() >= MAX_FILES_CHANGED {
                break;
            }
        }
    }
    out
}

/// Majority language across the changed files' extensions.
fn infer_language(files_changed: &[String]) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for f in files_changed {
        let lang = detect_language(Path::new(f));
        if lang != "unknown" {
            *counts.entry(lang).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(lang, _)| lang)
        .unwrap_or_else(|| "unknown".to_string())
}

fn build_solution_embedding_text(
    symbols: &[String],
    prompt: &str,
    response: &str,
    diff: &str,
) -> String {
    let text = format!(
        "Symbols: {}\n\nQuestion: {}\n\nAnswer: {}\n\nChanges: {}",
        symbols.join(", "),
        prompt,
        response,
        diff
    );
    cap_chars(&text, MAX_EMBED_CHARS)
}

/// Split one session into (user, assistant) pairs. Consecutive user entries
/// concatenate until an assistant entry closes the pair; tool entries never
/// participate in pairing.
fn pair_transcript(session: &Session) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut pending_user = String::new();

    for entry in &session.transcript {
        match entry.role {
            Role::User => {
                if !pending_user.is_empty() {
                    pending_user.push_str("\n\n");
                }
                pending_user.push_str(&entry.content);
            }
            Role::Assistant => {
                if !pending_user.trim().is_empty() || !entry.content.trim().is_empty() {
                    pairs.push((std::mem::take(&mut pending_user), entry.content.clone()));
                } else {
                    pending_user.clear();
                }
            }
            Role::Tool => {}
        }
    }

    pairs
}

/// Chunk a whole checkpoint: every session, every pair.
pub fn chunk_checkpoint(cp: &ParsedCheckpoint, cfg: &MemoryConfig) -> Vec<SolutionChunk> {
    cp.sessions
        .iter()
        .flat_map(|session| chunk_session(cp, session, cfg))
        .collect()
}

fn chunk_session(cp: &ParsedCheckpoint, session: &Session, cfg: &MemoryConfig) -> Vec<SolutionChunk> {
    let mut pairs = pair_transcript(session);

    // A session captured without a transcript still indexes its prompt text.
    if pairs.is_empty() {
        match &session.prompts {
            Some(p) if !p.trim().is_empty() => pairs.push((p.clone(), String::new())),
            _ => return vec![],
        }
    }

    let diff = extract_diff(session);
    let files_changed = extract_files_changed(&diff, cfg);
    let language = infer_language(&files_changed);
    let agent = session.agent.clone().unwrap_or_else(|| "unknown".to_string());
    let tokens_used = session.tokens_used.unwrap_or(0);

    pairs
        .into_iter()
        .enumerate()
        .map(|(pair_index, (prompt, response))| {
            let response = cap_chars(&response, MAX_RESPONSE_CHARS);
            // Diff context belongs to the session's opening exchange only.
            let diff_summary = if pair_index == 0 { diff.clone() } else { String::new() };
            let symbols = collect_symbols(&prompt, &response, &diff_summary, session);
            let embedding_text =
                build_solution_embedding_text(&symbols, &prompt, &response, &diff_summary);

            SolutionChunk {
                id: format!("{}-{}-{}", cp.id, session.session_index, pair_index),
                checkpoint_id: cp.id.clone(),
                session_index: session.session_index,
                prompt,
                response,
                diff_summary,
                summary: String::new(),
                embedding_text,
                metadata: SolutionMetadata {
                    agent: agent.clone(),
                    timestamp: cp.timestamp,
                    files_changed: files_changed.clone(),
                    tokens_used,
                    symbols,
                    language: language.clone(),
                },
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Code chunking
// ---------------------------------------------------------------------------

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// One chunk per extracted symbol.
pub fn chunk_code_file(
    rel_path: &str,
    symbols: &[EnhancedCodeSymbol],
    last_modified: DateTime<Utc>,
) -> Vec<CodeChunk> {
    symbols
        .iter()
        .map(|sym| {
            let calls = sym.calls.join(",");
            let imports = sym
                .imports
                .iter()
                .map(|(name, source)| format!("{name}:{source}"))
                .collect::<Vec<_>>()
                .join(",");

            let summary = match &sym.doc {
                Some(doc) if !doc.trim().is_empty() => cap_chars(doc.trim(), 200),
                _ => format!("{} {}", sym.kind, sym.name),
            };

            let embedding_text = cap_chars(
                &format!(
                    "{} {} in {}\n\n{}\n\ncalls: {}\n\nimports: {}\n\n{}",
                    sym.kind,
                    sym.name,
                    basename(rel_path),
                    sym.doc.as_deref().unwrap_or(""),
                    calls,
                    imports,
                    cap_chars(&sym.body, EMBED_BODY_CHARS),
                ),
                MAX_EMBED_CHARS,
            );

            CodeChunk {
                id: format!("{}:{}:{}", rel_path, sym.name, sym.start_line),
                path: rel_path.to_string(),
                symbol: sym.name.clone(),
                symbol_type: sym.kind,
                language: sym.language.clone(),
                body: sym.body.clone(),
                summary,
                embedding_text,
                calls,
                imports,
                start_line: sym.start_line,
                last_modified,
            }
        })
        .collect()
}
