use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::store::{StoredCodeRecord, VectorStore};

// ---------------------------------------------------------------------------
// Code-graph analytics. The dependency graph is materialized from stored
// symbols (calls + imports CSVs), then rolled up into per-repository
// insights: connectivity, complexity, duplication, dead code, directory
// aggregates. The report is cached per code-store write generation — any
// write invalidates it, and nothing else does.
// ---------------------------------------------------------------------------

/// Duplication clustering counts bodies at or above this token similarity.
const DUPLICATE_SIMILARITY: f32 = 0.7;

/// Duplication is O(n²) over bodies; larger stores are sampled down to this.
const MAX_DUPLICATE_ROWS: usize = 2_000;

/// Top-N length for every ranked list in the report.
const TOP_N: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConnectivity {
    pub symbol: String,
    pub path: String,
    pub callers: usize,
    pub callees: usize,
    pub importers: usize,
    pub total_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityEntry {
    pub symbol: String,
    pub path: String,
    pub cyclomatic: u32,
    pub cognitive: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCluster {
    /// `path:symbol` labels of the cluster members.
    pub members: Vec<String>,
    /// Mean pairwise similarity against the cluster seed.
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryInsight {
    pub directory: String,
    pub symbol_count: usize,
    pub file_count: usize,
    pub avg_complexity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeInsights {
    pub total_symbols: usize,
    pub total_files: usize,
    pub by_language: BTreeMap<String, usize>,
    pub by_symbol_type: BTreeMap<String, usize>,
    /// Files with the most symbols.
    pub hot_files: Vec<(String, usize)>,
    pub most_connected: Vec<SymbolConnectivity>,
    pub top_complex_symbols: Vec<ComplexityEntry>,
    /// (id, body chars), largest first.
    pub largest_symbols: Vec<(String, usize)>,
    /// Cyclomatic buckets: 1-5, 6-10, 11-20, 21+.
    pub complexity_distribution: BTreeMap<String, usize>,
    /// Ids of symbols with no connection into or out of the graph.
    pub dead_code: Vec<String>,
    pub duplicate_clusters: Vec<DuplicateCluster>,
    pub directory_insights: Vec<DirectoryInsight>,
    /// Connectivity ≥ max(3·median, 5).
    pub god_symbols: Vec<String>,
    /// importerCount ≥ max(30% of files, 3).
    pub high_fan_in_symbols: Vec<String>,
    pub cross_directory_imports: usize,
    pub median_connections: f32,
    pub documentation_coverage: f32,
    pub avg_complexity: f32,
    pub avg_symbols_per_file: f32,
}

// ---------------------------------------------------------------------------
// Complexity calculator
// ---------------------------------------------------------------------------

const BRANCH_KEYWORDS: &[&str] = &[
    "if ", "if(", "else if", "for ", "for(", "while ", "while(", "case ", "catch ", "catch(",
    "elif ", "when ", "match ",
];
const BRANCH_OPERATORS: &[&str] = &["&&", "||", "??", "? "];

/// Cyclomatic: 1 + branching keywords/operators in the body.
pub fn cyclomatic_complexity(body: &str) -> u32 {
    let mut count = 1u32;
    for line in body.lines() {
        let t = line.trim_start();
        for kw in BRANCH_KEYWORDS {
            count += t.matches(kw).count() as u32;
        }
        for op in BRANCH_OPERATORS {
            count += t.matches(op).count() as u32;
        }
    }
    count
}

/// Cognitive: like cyclomatic but each branch pays an extra unit per level
/// of brace nesting it sits at.
pub fn cognitive_complexity(body: &str) -> u32 {
    let mut score = 0u32;
    let mut depth = 0i32;
    for line in body.lines() {
        let t = line.trim_start();
        let branches = BRANCH_KEYWORDS
            .iter()
            .map(|kw| t.matches(kw).count())
            .sum::<usize>() as u32;
        if branches > 0 {
            score += branches * (1 + depth.max(0) as u32);
        }
        depth += line.matches('{').count() as i32;
        depth -= line.matches('}').count() as i32;
    }
    score
}

/// A stored summary equal to `"{type} {name}"` means the symbol had no doc.
fn has_doc(row: &StoredCodeRecord) -> bool {
    !row.summary.is_empty() && row.summary != format!("{} {}", row.symbol_type, row.symbol)
}

// ---------------------------------------------------------------------------
// Duplication
// ---------------------------------------------------------------------------

fn body_tokens(body: &str) -> HashSet<String> {
    body.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f32;
    let union = (a.len() + b.len()) as f32 - inter;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn duplicate_clusters(rows: &[&StoredCodeRecord]) -> Vec<DuplicateCluster> {
    let sample: Vec<&StoredCodeRecord> = rows
        .iter()
        .filter(|r| r.body.len() >= 80)
        .take(MAX_DUPLICATE_ROWS)
        .copied()
        .collect();

    let tokens: Vec<HashSet<String>> = sample.iter().map(|r| body_tokens(&r.body)).collect();
    let mut clustered = vec![false; sample.len()];
    let mut clusters = Vec::new();

    for i in 0..sample.len() {
        if clustered[i] {
            continue;
        }
        let mut members = vec![i];
        let mut sim_sum = 0.0f32;
        for j in (i + 1)..sample.len() {
            if clustered[j] {
                continue;
            }
            let sim = jaccard(&tokens[i], &tokens[j]);
            if sim >= DUPLICATE_SIMILARITY {
                members.push(j);
                sim_sum += sim;
            }
        }
        if members.len() >= 2 {
            let len = members.len();
            for &m in &members {
                clustered[m] = true;
            }
            clusters.push(DuplicateCluster {
                members: members
                    .into_iter()
                    .map(|m| format!("{}:{}", sample[m].path, sample[m].symbol))
                    .collect(),
                similarity: sim_sum / (len - 1) as f32,
            });
        }
    }

    clusters
}

// ---------------------------------------------------------------------------
// Directory rollup
// ---------------------------------------------------------------------------

/// Two meaningful path components, skipping `src` (so `src/auth/login.ts`
/// and `auth/login.ts` both land in `auth`).
fn directory_key(path: &str) -> String {
    let components: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != "src" && *c != ".")
        .collect();
    // Last component is the file itself.
    let dirs = &components[..components.len().saturating_sub(1)];
    match dirs.len() {
        0 => "(root)".to_string(),
        1 => dirs[0].to_string(),
        _ => format!("{}/{}", dirs[0], dirs[1]),
    }
}

fn top_directory(path: &str) -> &str {
    path.split('/').find(|c| !c.is_empty() && *c != "src" && *c != ".").unwrap_or("")
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InsightEngine {
    cached: Option<(u64, CodeInsights)>,
}

impl InsightEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build (or reuse) the insight report. Returns `None` when no code
    /// table exists. The cache is valid for exactly one store generation.
    pub fn get(&mut self, store: &VectorStore) -> Option<CodeInsights> {
        if !store.has_code() {
            return None;
        }
        let generation = store.code_generation();
        if let Some((cached_gen, report)) = &self.cached {
            if *cached_gen == generation {
                return Some(report.clone());
            }
        }
        let report = compute_insights(&store.scan_code_rows());
        self.cached = Some((generation, report.clone()));
        Some(report)
    }
}

fn bare_name(symbol: &str) -> &str {
    symbol.rsplit('.').next().unwrap_or(symbol)
}

pub fn compute_insights(rows: &[&StoredCodeRecord]) -> CodeInsights {
    let total_symbols = rows.len();

    // Name → row indices defining it (bare names, so `Class.method` counts
    // as a definition of `method` for call resolution).
    let mut defined: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        defined.entry(bare_name(&row.symbol)).or_default().push(i);
        if row.symbol.contains('.') {
            defined.entry(row.symbol.as_str()).or_default().push(i);
        }
    }

    let split_csv = |csv: &str| -> Vec<String> {
        csv.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    // ── Graph edges ──────────────────────────────────────────────────────
    let mut callers = vec![0usize; rows.len()];
    let mut callees = vec![0usize; rows.len()];
    let mut importers = vec![0usize; rows.len()];
    let mut cross_directory_imports = 0usize;

    for (i, row) in rows.iter().enumerate() {
        for call in split_csv(&row.calls) {
            if let Some(targets) = defined.get(call.as_str()) {
                let mut resolved = false;
                for &t in targets {
                    if t != i {
                        callers[t] += 1;
                        resolved = true;
                    }
                }
                if resolved {
                    callees[i] += 1;
                }
            }
        }
        for import in split_csv(&row.imports) {
            let Some(name) = import.split(':').next().map(str::trim) else {
                continue;
            };
            // Only imports that name an existing symbol count.
            if let Some(targets) = defined.get(name) {
                for &t in targets {
                    if t != i {
                        importers[t] += 1;
                        if top_directory(&rows[t].path) != top_directory(&row.path) {
                            cross_directory_imports += 1;
                        }
                    }
                }
            }
        }
    }

    let totals: Vec<usize> = (0..rows.len())
        .map(|i| callers[i] + callees[i] + importers[i])
        .collect();

    let median_connections = {
        let mut sorted = totals.clone();
        sorted.sort_unstable();
        match sorted.len() {
            0 => 0.0,
            n if n % 2 == 1 => sorted[n / 2] as f32,
            n => (sorted[n / 2 - 1] + sorted[n / 2]) as f32 / 2.0,
        }
    };

    // ── Distributions ────────────────────────────────────────────────────
    let mut by_language: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_symbol_type: BTreeMap<String, usize> = BTreeMap::new();
    let mut per_file: HashMap<&str, usize> = HashMap::new();
    for row in rows {
        *by_language.entry(row.language.clone()).or_insert(0) += 1;
        *by_symbol_type.entry(row.symbol_type.clone()).or_insert(0) += 1;
        *per_file.entry(row.path.as_str()).or_insert(0) += 1;
    }
    let total_files = per_file.len();

    let mut hot_files: Vec<(String, usize)> = per_file
        .iter()
        .map(|(p, c)| (p.to_string(), *c))
        .collect();
    hot_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    hot_files.truncate(TOP_N);

    // ── Connectivity rankings ────────────────────────────────────────────
    let mut most_connected: Vec<SymbolConnectivity> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| SymbolConnectivity {
            symbol: row.symbol.clone(),
            path: row.path.clone(),
            callers: callers[i],
            callees: callees[i],
            importers: importers[i],
            total_connections: totals[i],
        })
        .collect();
    most_connected.sort_by(|a, b| {
        b.total_connections
            .cmp(&a.total_connections)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    most_connected.truncate(TOP_N);

    let god_threshold = ((3.0 * median_connections).ceil() as usize).max(5);
    let god_symbols: Vec<String> = rows
        .iter()
        .enumerate()
        .filter(|(i, _)| totals[*i] >= god_threshold)
        .map(|(_, r)| r.symbol.clone())
        .collect();

    let fan_in_threshold = ((total_files as f32 * 0.3).ceil() as usize).max(3);
    let high_fan_in_symbols: Vec<String> = rows
        .iter()
        .enumerate()
        .filter(|(i, _)| importers[*i] >= fan_in_threshold)
        .map(|(_, r)| r.symbol.clone())
        .collect();

    // ── Complexity ───────────────────────────────────────────────────────
    let complexities: Vec<(u32, u32)> = rows
        .iter()
        .map(|r| (cyclomatic_complexity(&r.body), cognitive_complexity(&r.body)))
        .collect();

    let mut complexity_distribution: BTreeMap<String, usize> = BTreeMap::new();
    for (cyc, _) in &complexities {
        let bucket = match cyc {
            1..=5 => "1-5",
            6..=10 => "6-10",
            11..=20 => "11-20",
            _ => "21+",
        };
        *complexity_distribution.entry(bucket.to_string()).or_insert(0) += 1;
    }

    let mut top_complex_symbols: Vec<ComplexityEntry> = rows
        .iter()
        .zip(&complexities)
        .map(|(row, (cyc, cog))| ComplexityEntry {
            symbol: row.symbol.clone(),
            path: row.path.clone(),
            cyclomatic: *cyc,
            cognitive: *cog,
        })
        .collect();
    top_complex_symbols.sort_by(|a, b| {
        b.cyclomatic
            .cmp(&a.cyclomatic)
            .then_with(|| b.cognitive.cmp(&a.cognitive))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    top_complex_symbols.truncate(TOP_N);

    let avg_complexity = if rows.is_empty() {
        0.0
    } else {
        complexities.iter().map(|(c, _)| *c as f32).sum::<f32>() / rows.len() as f32
    };

    let mut largest_symbols: Vec<(String, usize)> = rows
        .iter()
        .map(|r| (r.id.clone(), r.body.chars().count()))
        .collect();
    largest_symbols.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    largest_symbols.truncate(TOP_N);

    // ── Dead code ────────────────────────────────────────────────────────
    // Dead ⇔ no incoming reference: nobody calls it and nobody imports it.
    // Outgoing edges do not keep a symbol alive. Types and interfaces are
    // exempt (consumed via type positions the CSV graph cannot see).
    let dead_code: Vec<String> = rows
        .iter()
        .enumerate()
        .filter(|(i, r)| {
            r.symbol_type != "type"
                && r.symbol_type != "interface"
                && callers[*i] == 0
                && importers[*i] == 0
        })
        .map(|(_, r)| r.id.clone())
        .collect();

    // ── Directory rollup ─────────────────────────────────────────────────
    let mut dir_symbols: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        dir_symbols.entry(directory_key(&row.path)).or_default().push(i);
    }
    let mut directory_insights: Vec<DirectoryInsight> = dir_symbols
        .into_iter()
        .map(|(directory, members)| {
            let files: HashSet<&str> = members.iter().map(|&i| rows[i].path.as_str()).collect();
            let avg = members
                .iter()
                .map(|&i| complexities[i].0 as f32)
                .sum::<f32>()
                / members.len() as f32;
            DirectoryInsight {
                directory,
                symbol_count: members.len(),
                file_count: files.len(),
                avg_complexity: avg,
            }
        })
        .collect();
    directory_insights.sort_by(|a, b| {
        b.symbol_count
            .cmp(&a.symbol_count)
            .then_with(|| a.directory.cmp(&b.directory))
    });

    // ── Scalars ──────────────────────────────────────────────────────────
    let documentation_coverage = if rows.is_empty() {
        0.0
    } else {
        rows.iter().filter(|r| has_doc(r)).count() as f32 / rows.len() as f32
    };
    let avg_symbols_per_file = if total_files == 0 {
        0.0
    } else {
        total_symbols as f32 / total_files as f32
    };

    CodeInsights {
        total_symbols,
        total_files,
        by_language,
        by_symbol_type,
        hot_files,
        most_connected,
        top_complex_symbols,
        largest_symbols,
        complexity_distribution,
        dead_code,
        duplicate_clusters: duplicate_clusters(rows),
        directory_insights,
        god_symbols,
        high_fan_in_symbols,
        cross_directory_imports,
        median_connections,
        documentation_coverage,
        avg_complexity,
        avg_symbols_per_file,
    }
}
