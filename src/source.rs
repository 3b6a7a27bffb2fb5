use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::MemoryErr;
use std::path::Path;
use std::sync::OnceLock;
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator};

// ---------------------------------------------------------------------------
// Symbol extraction.
//
// TypeScript / JavaScript (incl. JSX) go through the real AST: top-level
// functions, classes (plus `Class.method` entries per method), interfaces,
// type aliases, enums, arrow/function-expression consts, and exported
// non-function consts, refined into component/hook kinds where the naming
// and file type say so. Every other language takes a line-oriented regex
// fallback. An AST parse failure also degrades to the fallback — a file
// never fails extraction outright, it just gets coarser symbols.
// ---------------------------------------------------------------------------

/// Body text stored per symbol is capped here.
pub const MAX_BODY_CHARS: usize = 3_000;

/// Outgoing-call and import lists are capped here.
pub const MAX_REFS: usize = 30;

/// A file with any single line longer than this is treated as minified;
/// parsing it wastes CPU for no retrievable symbols.
const MAX_SAFE_LINE_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
    Interface,
    Type,
    Enum,
    Component,
    Constant,
    Hook,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Class => "class",
            SymbolKind::Method => "method",
            SymbolKind::Interface => "interface",
            SymbolKind::Type => "type",
            SymbolKind::Enum => "enum",
            SymbolKind::Component => "component",
            SymbolKind::Constant => "constant",
            SymbolKind::Hook => "hook",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "function" => SymbolKind::Function,
            "class" => SymbolKind::Class,
            "method" => SymbolKind::Method,
            "interface" => SymbolKind::Interface,
            "type" => SymbolKind::Type,
            "enum" => SymbolKind::Enum,
            "component" => SymbolKind::Component,
            "constant" => SymbolKind::Constant,
            "hook" => SymbolKind::Hook,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted symbol, carrying everything the chunker needs.
#[derive(Debug, Clone)]
pub struct EnhancedCodeSymbol {
    /// Bare name, or `Class.method` for methods.
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based line of the declaration.
    pub start_line: u32,
    /// 1-based last line (inclusive).
    pub end_line: u32,
    /// JSDoc block or contiguous `//` / `#` run immediately above.
    pub doc: Option<String>,
    /// Declaration text, capped at `MAX_BODY_CHARS`.
    pub body: String,
    /// Identifiers called inside the body, deduped, capped at `MAX_REFS`.
    pub calls: Vec<String>,
    /// (binding, module specifier) for imported bindings this file uses.
    pub imports: Vec<(String, String)>,
    pub language: String,
    pub exported: bool,
}

/// Language tag from the file extension.
pub fn detect_language(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "rs" => "rust",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        _ => {
            if ext.is_empty() {
                "unknown"
            } else {
                ext.as_str()
            }
        }
    }
    .to_string()
}

fn is_ts_family(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase().as_str(),
        "ts" | "tsx" | "mts" | "cts" | "js" | "jsx" | "mjs" | "cjs"
    )
}

fn is_jsx_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase().as_str(),
        "tsx" | "jsx"
    )
}

fn is_minified(source_text: &str) -> bool {
    source_text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(5)
        .any(|l| l.len() > MAX_SAFE_LINE_CHARS)
}

/// Extract symbols from a file on disk. Unreadable or binary ⇒ empty list.
pub fn extract_symbols_from_file(abs_path: &Path, rel_path: &Path) -> Vec<EnhancedCodeSymbol> {
    let Ok(raw) = std::fs::read(abs_path) else {
        return vec![];
    };
    if raw.contains(&0u8) {
        return vec![];
    }
    let text = String::from_utf8_lossy(&raw).into_owned();
    extract_symbols(rel_path, &text)
}

/// Extract symbols from source text.
pub fn extract_symbols(path: &Path, source_text: &str) -> Vec<EnhancedCodeSymbol> {
    if source_text.trim().is_empty() || is_minified(source_text) {
        return vec![];
    }

    let language = detect_language(path);

    if is_ts_family(path) {
        match extract_typescript(path, source_text, &language) {
            Ok(mut syms) => {
                syms.sort_by(|a, b| a.start_line.cmp(&b.start_line).then_with(|| a.name.cmp(&b.name)));
                return syms;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "AST extraction failed, using regex fallback");
            }
        }
    }

    let mut syms = extract_fallback(source_text, &language);
    syms.sort_by(|a, b| a.start_line.cmp(&b.start_line).then_with(|| a.name.cmp(&b.name)));
    syms
}

// ---------------------------------------------------------------------------
// Shared helpers: doc comments + outgoing calls
// ---------------------------------------------------------------------------

/// Doc comment immediately above `decl_row` (0-based): a `/** … */` block or
/// a contiguous run of `//` / `#` lines.
fn doc_comment_above(lines: &[&str], decl_row: usize) -> Option<String> {
    if decl_row == 0 {
        return None;
    }
    let mut row = decl_row - 1;

    // Skip at most one decorator/attribute line between doc and decl.
    let t = lines.get(row)?.trim();
    if t.starts_with('@') || t.starts_with("#[") {
        if row == 0 {
            return None;
        }
        row -= 1;
    }

    let trimmed = lines.get(row)?.trim();

    if trimmed.ends_with("*/") {
        // Walk up to the opening `/**` (or `/*`).
        let mut start = row;
        loop {
            let t = lines[start].trim();
            if t.starts_with("/**") || t.starts_with("/*") {
                break;
            }
            if start == 0 {
                return None;
            }
            start -= 1;
        }
        let block: Vec<String> = lines[start..=row]
            .iter()
            .map(|l| {
                l.trim()
                    .trim_start_matches("/**")
                    .trim_start_matches("/*")
                    .trim_end_matches("*/")
                    .trim_start_matches('*')
                    .trim()
                    .to_string()
            })
            .filter(|l| !l.is_empty())
            .collect();
        if block.is_empty() {
            return None;
        }
        return Some(block.join(" "));
    }

    if trimmed.starts_with("//") || (trimmed.starts_with('#') && !trimmed.starts_with("#[")) {
        let mut start = row;
        while start > 0 {
            let above = lines[start - 1].trim();
            let is_comment =
                above.starts_with("//") || (above.starts_with('#') && !above.starts_with("#["));
            if !is_comment {
                break;
            }
            start -= 1;
        }
        let block: Vec<String> = lines[start..=row]
            .iter()
            .map(|l| {
                l.trim()
                    .trim_start_matches("///")
                    .trim_start_matches("//")
                    .trim_start_matches('#')
                    .trim()
                    .to_string()
            })
            .filter(|l| !l.is_empty())
            .collect();
        if block.is_empty() {
            return None;
        }
        return Some(block.join(" "));
    }

    None
}

fn call_keywords() -> &'static HashSet<&'static str> {
    static KW: OnceLock<HashSet<&'static str>> = OnceLock::new();
    KW.get_or_init(|| {
        [
            "if", "for", "while", "switch", "catch", "return", "function", "typeof", "new",
            "super", "constructor", "await", "yield", "throw", "delete", "void", "in", "of",
            "do", "else", "try", "finally", "case", "default", "import", "export", "require",
            "console", "assert", "match", "loop", "fn", "def", "print", "println", "len",
            "Some", "None", "Ok", "Err", "vec",
        ]
        .into_iter()
        .collect()
    })
}

/// Identifiers invoked inside `body`, order-preserving, deduped, ≤ MAX_REFS.
pub fn extract_calls(body: &str) -> Vec<String> {
    static CALL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CALL_RE
        .get_or_init(|| regex::Regex::new(r"([A-Za-z_$][A-Za-z0-9_$]*)\s*\(").expect("call regex"));

    let kw = call_keywords();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cap in re.captures_iter(body) {
        let name = cap[1].to_string();
        if kw.contains(name.as_str()) {
            continue;
        }
        if seen.insert(name.clone()) {
            out.push(name);
            if out.len() >= MAX_REFS {
                break;
            }
        }
    }
    out
}

pub(crate) fn cap_chars(text: &str, cap: usize) -> String {
    match text.char_indices().nth(cap) {
        Some((i, _)) => text[..i].to_string(),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// TypeScript / JavaScript via tree-sitter
// ---------------------------------------------------------------------------

fn ts_language(path: &Path) -> Language {
    if is_jsx_file(path) {
        tree_sitter_typescript::language_tsx()
    } else {
        // Plain JS shares the TypeScript grammar for our purposes.
        tree_sitter_typescript::language_typescript()
    }
}

fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

/// Run `query_src` and hand each match's captures to `f` as name → node.
fn for_each_match<F>(
    source: &[u8],
    root: Node,
    language: &Language,
    query_src: &str,
    mut f: F,
) -> Result<(), MemoryErr>
where
    F: FnMut(&HashMap<String, Node>),
{
    let query = Query::new(language, query_src).map_err(|e| MemoryErr::ParseError {
        item: "tree-sitter query".to_string(),
        cause: e.to_string(),
    })?;
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(&query, root, source);
    while let Some(m) = matches.next() {
        let mut caps: HashMap<String, Node> = HashMap::new();
        for cap in m.captures {
            let cap_name = query.capture_names()[cap.index as usize];
            caps.insert(cap_name.to_string(), cap.node);
        }
        f(&caps);
    }
    Ok(())
}

/// Is this declaration at the top level (directly under the program, or
/// under a top-level `export` statement)?
fn is_top_level(node: Node) -> bool {
    match node.parent() {
        None => true,
        Some(p) => match p.kind() {
            "program" => true,
            "export_statement" => p
                .parent()
                .map(|gp| gp.kind() == "program")
                .unwrap_or(true),
            _ => false,
        },
    }
}

fn is_exported(node: Node) -> bool {
    node.parent()
        .map(|p| p.kind() == "export_statement")
        .unwrap_or(false)
}

/// `const Foo = memo(...)` / `forwardRef(...)` / `lazy(...)` marks a component.
fn is_component_wrapper(value_text: &str) -> bool {
    let t = value_text.trim_start();
    ["memo", "forwardRef", "lazy", "React.memo", "React.forwardRef", "React.lazy"]
        .iter()
        .any(|w| t.starts_with(w) && t[w.len()..].trim_start().starts_with('('))
}

fn is_camel_case(name: &str) -> bool {
    name.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
}

fn is_hook_name(name: &str) -> bool {
    name.len() > 3
        && name.starts_with("use")
        && name.as_bytes()[3].is_ascii_uppercase()
}

/// Classify a function-shaped symbol by naming convention + file type.
fn classify_function(name: &str, jsx_file: bool) -> SymbolKind {
    if is_hook_name(name) {
        SymbolKind::Hook
    } else if jsx_file && is_camel_case(name) {
        SymbolKind::Component
    } else {
        SymbolKind::Function
    }
}

/// Bindings declared by an import clause: `Foo`, `{ a, b as c }`, `* as ns`.
fn parse_import_clause(clause_text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let cleaned = clause_text.replace(['\n', '\r'], " ");

    for part in cleaned.split(',') {
        let part = part.trim().trim_matches(|c| c == '{' || c == '}').trim();
        if part.is_empty() || part == "type" {
            continue;
        }
        // `orig as alias` / `* as ns` → the local binding is the alias.
        let binding = match part.rsplit_once(" as ") {
            Some((_, alias)) => alias.trim(),
            None => part,
        };
        let binding = binding.trim_start_matches("type ").trim();
        if binding
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
            && !binding.is_empty()
        {
            out.push(binding.to_string());
        }
    }
    out
}

fn extract_typescript(
    path: &Path,
    source_text: &str,
    language_tag: &str,
) -> Result<Vec<EnhancedCodeSymbol>, MemoryErr> {
    let language = ts_language(path);
    let source = source_text.as_bytes();
    let lines: Vec<&str> = source_text.lines().collect();
    let jsx_file = is_jsx_file(path);

    let parse_err = |cause: String| MemoryErr::ParseError {
        item: path.display().to_string(),
        cause,
    };

    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| parse_err(format!("set_language: {e}")))?;
    let tree = parser
        .parse(source_text, None)
        .ok_or_else(|| parse_err("tree-sitter parse returned nothing".to_string()))?;
    let root = tree.root_node();

    // ── Imports (file-wide): binding → module specifier ──────────────────
    let mut import_map: HashMap<String, String> = HashMap::new();
    for_each_match(
        source,
        root,
        &language,
        r#"(import_statement (import_clause) @clause source: (string) @src)"#,
        |caps| {
            let (Some(clause), Some(src)) = (caps.get("clause"), caps.get("src")) else {
                return;
            };
            let module = node_text(source, *src).trim_matches(['"', '\'', '`']).to_string();
            for binding in parse_import_clause(node_text(source, *clause)) {
                import_map.entry(binding).or_insert_with(|| module.clone());
            }
        },
    )?;

    let mut symbols: Vec<EnhancedCodeSymbol> = Vec::new();

    let mut push_symbol = |name: String, kind: SymbolKind, def: Node, exported: bool| {
        let start_row = def.start_position().row;
        let body_full = node_text(source, def);
        let body = cap_chars(body_full, MAX_BODY_CHARS);
        let calls = extract_calls(body_full);

        // Imports resolved per symbol: only bindings this body references.
        let imports: Vec<(String, String)> = import_map
            .iter()
            .filter(|(binding, _)| body_full.contains(binding.as_str()))
            .map(|(b, m)| (b.clone(), m.clone()))
            .take(MAX_REFS)
            .collect();

        symbols.push(EnhancedCodeSymbol {
            name,
            kind,
            start_line: start_row as u32 + 1,
            end_line: def.end_position().row as u32 + 1,
            doc: doc_comment_above(&lines, start_row),
            body,
            calls,
            imports,
            language: language_tag.to_string(),
            exported,
        });
    };

    // ── Top-level function declarations ──────────────────────────────────
    for_each_match(
        source,
        root,
        &language,
        r#"(function_declaration name: (identifier) @name) @def"#,
        |caps| {
            let (Some(name), Some(def)) = (caps.get("name"), caps.get("def")) else {
                return;
            };
            if !is_top_level(*def) {
                return;
            }
            let n = node_text(source, *name).to_string();
            let kind = classify_function(&n, jsx_file);
            push_symbol(n, kind, *def, is_exported(*def));
        },
    )?;

    // ── Classes ──────────────────────────────────────────────────────────
    for_each_match(
        source,
        root,
        &language,
        r#"(class_declaration name: (type_identifier) @name) @def"#,
        |caps| {
            let (Some(name), Some(def)) = (caps.get("name"), caps.get("def")) else {
                return;
            };
            if !is_top_level(*def) {
                return;
            }
            push_symbol(
                node_text(source, *name).to_string(),
                SymbolKind::Class,
                *def,
                is_exported(*def),
            );
        },
    )?;

    // ── Class methods, qualified `Class.method` ──────────────────────────
    for_each_match(
        source,
        root,
        &language,
        r#"(class_declaration
              name: (type_identifier) @class
              body: (class_body
                (method_definition name: (property_identifier) @name) @def))"#,
        |caps| {
            let (Some(class), Some(name), Some(def)) =
                (caps.get("class"), caps.get("name"), caps.get("def"))
            else {
                return;
            };
            let method = node_text(source, *name);
            if method == "constructor" {
                return;
            }
            push_symbol(
                format!("{}.{}", node_text(source, *class), method),
                SymbolKind::Method,
                *def,
                false,
            );
        },
    )?;

    // ── Interfaces, type aliases, enums ──────────────────────────────────
    for (query, kind) in [
        (
            r#"(interface_declaration name: (type_identifier) @name) @def"#,
            SymbolKind::Interface,
        ),
        (
            r#"(type_alias_declaration name: (type_identifier) @name) @def"#,
            SymbolKind::Type,
        ),
        (r#"(enum_declaration name: (identifier) @name) @def"#, SymbolKind::Enum),
    ] {
        for_each_match(source, root, &language, query, |caps| {
            let (Some(name), Some(def)) = (caps.get("name"), caps.get("def")) else {
                return;
            };
            if !is_top_level(*def) {
                return;
            }
            push_symbol(
                node_text(source, *name).to_string(),
                kind,
                *def,
                is_exported(*def),
            );
        })?;
    }

    // ── Const bindings: arrow/function values, component wrappers, plain
    //    exported constants ─────────────────────────────────────────────
    for_each_match(
        source,
        root,
        &language,
        r#"(lexical_declaration
              (variable_declarator
                name: (identifier) @name
                value: (_) @value)) @def"#,
        |caps| {
            let (Some(name), Some(value), Some(def)) =
                (caps.get("name"), caps.get("value"), caps.get("def"))
            else {
                return;
            };
            if !is_top_level(*def) {
                return;
            }
            let n = node_text(source, *name).to_string();
            let exported = is_exported(*def);
            let value_kind = value.kind();
            let is_function_value = value_kind == "arrow_function"
                || value_kind == "function_expression"
                || value_kind == "function";

            let kind = if is_function_value {
                classify_function(&n, jsx_file)
            } else if is_component_wrapper(node_text(source, *value)) && is_camel_case(&n) {
                SymbolKind::Component
            } else if exported {
                SymbolKind::Constant
            } else {
                // Un-exported plain consts are noise at the file level.
                return;
            };
            push_symbol(n, kind, *def, exported);
        },
    )?;

    Ok(symbols)
}

// ---------------------------------------------------------------------------
// Regex fallback for every other language
// ---------------------------------------------------------------------------

fn fallback_decl_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?x)^\s*
              (?:export\s+)?(?:default\s+)?(?:pub(?:\([^)]*\))?\s+)?
              (?:static\s+)?(?:async\s+)?
              (fn|def|func|function|class|struct|enum|trait|interface|impl|type|const)
              \s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("fallback decl regex")
    })
}

fn fallback_kind(keyword: &str) -> SymbolKind {
    match keyword {
        "fn" | "def" | "func" | "function" => SymbolKind::Function,
        "class" | "struct" | "impl" => SymbolKind::Class,
        "enum" => SymbolKind::Enum,
        "trait" | "interface" => SymbolKind::Interface,
        "type" => SymbolKind::Type,
        _ => SymbolKind::Constant,
    }
}

fn extract_fallback(source_text: &str, language_tag: &str) -> Vec<EnhancedCodeSymbol> {
    let lines: Vec<&str> = source_text.lines().collect();
    let re = fallback_decl_regex();

    // Declaration rows first, so each symbol's region runs to the next one.
    let mut decls: Vec<(usize, SymbolKind, String, bool)> = Vec::new();
    for (row, line) in lines.iter().enumerate() {
        if let Some(cap) = re.captures(line) {
            let exported = line.trim_start().starts_with("export")
                || line.trim_start().starts_with("pub");
            decls.push((row, fallback_kind(&cap[1]), cap[2].to_string(), exported));
        }
    }

    let mut out = Vec::new();
    for (i, (row, kind, name, exported)) in decls.iter().enumerate() {
        let end_row = if i + 1 < decls.len() {
            decls[i + 1].0.saturating_sub(1)
        } else {
            lines.len().saturating_sub(1)
        };
        let body_full = lines[*row..=end_row].join("\n");

        out.push(EnhancedCodeSymbol {
            name: name.clone(),
            kind: *kind,
            start_line: *row as u32 + 1,
            end_line: end_row as u32 + 1,
            doc: doc_comment_above(&lines, *row),
            calls: extract_calls(&body_full),
            body: cap_chars(&body_full, MAX_BODY_CHARS),
            imports: vec![],
            language: language_tag.to_string(),
            exported: *exported,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ts(source: &str) -> Vec<EnhancedCodeSymbol> {
        extract_symbols(&PathBuf::from("src/app.ts"), source)
    }

    fn tsx(source: &str) -> Vec<EnhancedCodeSymbol> {
        extract_symbols(&PathBuf::from("src/App.tsx"), source)
    }

    fn find<'a>(syms: &'a [EnhancedCodeSymbol], name: &str) -> &'a EnhancedCodeSymbol {
        syms.iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("symbol `{name}` not found in {:?}", syms.iter().map(|s| &s.name).collect::<Vec<_>>()))
    }

    #[test]
    fn extracts_top_level_declarations() {
        let syms = ts(r#"
export function parseConfig(raw: string): Config {
    return JSON.parse(raw);
}

export interface Config {
    name: string;
}

type Alias = string;

enum Mode { A, B }

export class Store {
    save(item: Config) {
        validate(item);
    }
}
"#);
        assert_eq!(find(&syms, "parseConfig").kind, SymbolKind::Function);
        assert!(find(&syms, "parseConfig").exported);
        assert_eq!(find(&syms, "Config").kind, SymbolKind::Interface);
        assert_eq!(find(&syms, "Alias").kind, SymbolKind::Type);
        assert_eq!(find(&syms, "Mode").kind, SymbolKind::Enum);
        assert_eq!(find(&syms, "Store").kind, SymbolKind::Class);

        let method = find(&syms, "Store.save");
        assert_eq!(method.kind, SymbolKind::Method);
        assert!(method.calls.contains(&"validate".to_string()));
    }

    #[test]
    fn arrow_consts_components_and_hooks() {
        let syms = tsx(r#"
import { memo } from "react";

export const useCounter = () => {
    return 0;
};

export const Button = (props: Props) => {
    return <button>{props.label}</button>;
};

export const Wrapped = memo(InnerThing);

export const MAX_RETRIES = 3;

const internal = 42;
"#);
        assert_eq!(find(&syms, "useCounter").kind, SymbolKind::Hook);
        assert_eq!(find(&syms, "Button").kind, SymbolKind::Component);
        assert_eq!(find(&syms, "Wrapped").kind, SymbolKind::Component);
        assert_eq!(find(&syms, "MAX_RETRIES").kind, SymbolKind::Constant);
        // Un-exported plain const is not a symbol.
        assert!(syms.iter().all(|s| s.name != "internal"));
    }

    #[test]
    fn hook_detection_needs_upper_after_use() {
        assert!(is_hook_name("useMemoryStore"));
        assert!(!is_hook_name("user"));
        assert!(!is_hook_name("useful"));
        assert!(!is_hook_name("use"));
    }

    #[test]
    fn doc_comments_attach_to_symbols() {
        let syms = ts(r#"
/**
 * Parses the raw config file.
 * Trims whitespace first.
 */
export function parseConfig(raw: string) {
    return raw.trim();
}

// Upper bound on retries.
// Keep in sync with the server.
export const LIMIT = 5;
"#);
        let doc = find(&syms, "parseConfig").doc.clone().unwrap();
        assert!(doc.contains("Parses the raw config file."));
        let doc2 = find(&syms, "LIMIT").doc.clone().unwrap();
        assert!(doc2.contains("Upper bound on retries."));
    }

    #[test]
    fn imports_resolve_to_referenced_bindings() {
        let syms = ts(r#"
import { fetchUser, unusedThing } from "./api";
import axios from "axios";

export function loadProfile(id: string) {
    return fetchUser(id);
}
"#);
        let sym = find(&syms, "loadProfile");
        let bindings: Vec<&str> = sym.imports.iter().map(|(b, _)| b.as_str()).collect();
        assert!(bindings.contains(&"fetchUser"));
        assert!(!bindings.contains(&"unusedThing"));
        let src = sym
            .imports
            .iter()
            .find(|(b, _)| b == "fetchUser")
            .map(|(_, m)| m.as_str());
        assert_eq!(src, Some("./api"));
    }

    #[test]
    fn nested_functions_are_not_top_level_symbols() {
        let syms = ts(r#"
export function outer() {
    function inner() {}
    return inner;
}
"#);
        assert!(syms.iter().any(|s| s.name == "outer"));
        assert!(syms.iter().all(|s| s.name != "inner"));
    }

    #[test]
    fn fallback_handles_rust_and_python() {
        let rust = extract_symbols(
            &PathBuf::from("src/store.rs"),
            r#"
/// Opens the store.
pub fn open_store(path: &Path) -> Store {
    migrate(path)
}

pub struct Store {
    rows: Vec<Row>,
}
"#,
        );
        let open = find(&rust, "open_store");
        assert_eq!(open.kind, SymbolKind::Function);
        assert!(open.exported);
        assert!(open.calls.contains(&"migrate".to_string()));
        assert!(open.doc.clone().unwrap().contains("Opens the store."));
        assert_eq!(find(&rust, "Store").kind, SymbolKind::Class);

        let py = extract_symbols(
            &PathBuf::from("lib/util.py"),
            "def helper(x):\n    return transform(x)\n\nclass Widget:\n    pass\n",
        );
        assert_eq!(find(&py, "helper").kind, SymbolKind::Function);
        assert_eq!(find(&py, "Widget").kind, SymbolKind::Class);
    }

    #[test]
    fn symbol_with_no_calls_or_imports_still_extracts() {
        let syms = ts("export const EMPTY = {};\n");
        let sym = find(&syms, "EMPTY");
        assert!(sym.calls.is_empty());
        assert!(sym.imports.is_empty());
        assert_eq!(sym.start_line, 1);
    }

    #[test]
    fn minified_input_yields_nothing() {
        let long_line = format!("export const x = \"{}\";", "a".repeat(3000));
        assert!(ts(&long_line).is_empty());
    }

    #[test]
    fn calls_are_deduped_and_capped() {
        let mut body = String::from("function f() {\n");
        for i in 0..50 {
            body.push_str(&format!("  call{i}(); call{i}();\n"));
        }
        body.push('}');
        let calls = extract_calls(&body);
        assert_eq!(calls.len(), MAX_REFS);
        // Order preserved, no duplicates.
        assert_eq!(calls[0], "call0");
        assert_eq!(calls.iter().collect::<std::collections::HashSet<_>>().len(), MAX_REFS);
    }
}
