use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use crate::error::{MemoryErr, Result};

// Workspace file discovery for the code indexer. `.gitignore` is always
// respected; the override list below adds hard skips for high-noise
// artifacts that gitignore files routinely miss.

fn default_overrides(repo_root: &Path) -> Result<Override> {
    let mut ob = OverrideBuilder::new(repo_root);

    let add = |ob: &mut OverrideBuilder, pat: &str| -> Result<()> {
        ob.add(pat)
            .map(|_| ())
            .map_err(|e| MemoryErr::Internal(format!("bad override pattern {pat}: {e}")))
    };

    // Lockfiles
    add(&mut ob, "**/*.lock")?;
    add(&mut ob, "**/package-lock.json")?;
    add(&mut ob, "**/pnpm-lock.yaml")?;
    add(&mut ob, "**/yarn.lock")?;
    add(&mut ob, "**/Cargo.lock")?;

    // Sourcemaps + images
    add(&mut ob, "**/*.map")?;
    add(&mut ob, "**/*.svg")?;
    add(&mut ob, "**/*.png")?;
    add(&mut ob, "**/*.ico")?;
    add(&mut ob, "**/*.jpg")?;
    add(&mut ob, "**/*.jpeg")?;
    add(&mut ob, "**/*.gif")?;

    // Build outputs / heavy dirs. Include both the dir entry and its
    // descendants, otherwise walkers may still descend into it.
    for d in [
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        "coverage",
        ".next",
        ".nuxt",
        ".vscode",
        "out",
        ".engram",
    ] {
        add(&mut ob, &format!("**/{d}"))?;
        add(&mut ob, &format!("**/{d}/**"))?;
    }

    ob.build()
        .map_err(|e| MemoryErr::Internal(format!("override build: {e}")))
}

/// Extensions the code indexer considers source code. TS/JS get the real
/// AST; everything else takes the regex fallback extractor.
pub fn is_source_extension(ext: &str) -> bool {
    matches!(
        ext,
        "ts" | "tsx"
            | "js"
            | "jsx"
            | "mts"
            | "cts"
            | "mjs"
            | "cjs"
            | "rs"
            | "py"
            | "go"
            | "java"
            | "kt"
            | "cs"
            | "rb"
            | "php"
            | "swift"
            | "c"
            | "h"
            | "cpp"
            | "cc"
            | "hpp"
    )
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub abs_path: PathBuf,
    pub rel_path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub repo_root: PathBuf,
    pub max_file_bytes: u64,
}

/// Walk the workspace and return all indexable source files, sorted by
/// relative path for deterministic downstream ordering.
pub fn scan_workspace(opts: &ScanOptions) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let overrides = default_overrides(&opts.repo_root)?;
    let walker = WalkBuilder::new(&opts.repo_root)
        .standard_filters(true) // .gitignore, .ignore, hidden, etc.
        .overrides(overrides)
        .build();

    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };

        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();

        let ext = abs_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !is_source_extension(&ext) {
            continue;
        }

        let bytes = match std::fs::metadata(&abs_path).map(|m| m.len()) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if bytes == 0 || bytes > opts.max_file_bytes {
            continue;
        }

        let Ok(rel) = abs_path.strip_prefix(&opts.repo_root) else {
            continue;
        };

        entries.push(FileEntry {
            rel_path: rel.to_path_buf(),
            abs_path,
            bytes,
        });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_skips_junk_and_non_source() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("src/app.ts"), "export const x = 1;\n").unwrap();
        std::fs::write(root.join("src/util.py"), "def f():\n    pass\n").unwrap();
        std::fs::write(root.join("README.md"), "# readme\n").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "module.exports = {};\n").unwrap();

        let found = scan_workspace(&ScanOptions {
            repo_root: root.to_path_buf(),
            max_file_bytes: 512 * 1024,
        })
        .unwrap();

        let rels: Vec<String> = found
            .iter()
            .map(|f| f.rel_path.to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rels, vec!["src/app.ts", "src/util.py"]);
    }

    #[test]
    fn oversize_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("big.ts"), "x".repeat(4096)).unwrap();

        let found = scan_workspace(&ScanOptions {
            repo_root: root.to_path_buf(),
            max_file_bytes: 1024,
        })
        .unwrap();
        assert!(found.is_empty());
    }
}
