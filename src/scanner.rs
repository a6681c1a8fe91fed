//! Filesystem scanning with glob filters, gitignore support, and size caps.

use crate::error::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory names never descended into.
const SKIP_DIRS: &[&str] = &[".git", "vendor", "node_modules", "dist", "build", ".morfx"];

/// Collects candidate files under target roots.
#[derive(Default, Clone)]
pub struct Scanner {
    extensions: Vec<String>,
    include_globs: Vec<String>,
    exclude_globs: Vec<String>,
    max_file_size: u64,
    follow_symlinks: bool,
    skip_gitignore: bool,
}

impl Scanner {
    /// Creates a scanner with default filters: gitignore on, symlinks off,
    /// 5 MiB size cap.
    pub fn new() -> Self {
        Self {
            max_file_size: 5 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Restricts results to files with the given extension (without dot).
    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extensions.push(ext.into());
        self
    }

    /// Restricts results to files with any of the given extensions.
    pub fn extensions(mut self, exts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extensions.extend(exts.into_iter().map(Into::into));
        self
    }

    /// Includes only files matching the glob pattern.
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include_globs.push(pattern.into());
        self
    }

    /// Excludes files matching the glob pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_globs.push(pattern.into());
        self
    }

    /// Caps file size in bytes. 0 = unlimited.
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Follows symlinks (off by default; cycles are detected and skipped).
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Disables gitignore evaluation.
    pub fn skip_gitignore(mut self, skip: bool) -> Self {
        self.skip_gitignore = skip;
        self
    }

    /// Walks `root` and returns the deduplicated list of matching absolute
    /// paths in lexicographic order.
    pub fn scan(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let root = root.canonicalize()?;
        let include_set = build_glob_set(&self.include_globs)?;
        let exclude_set = build_glob_set(&self.exclude_globs)?;
        let mut gitignores: HashMap<PathBuf, Option<Gitignore>> = HashMap::new();

        let mut matched = Vec::new();

        let walker = WalkDir::new(&root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !SKIP_DIRS.contains(&name.as_ref()) && !name.starts_with('.')
            });

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();

            if !entry.file_type().is_file() {
                continue;
            }

            if !self.extensions.is_empty() {
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if !self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                    continue;
                }
            }

            let rel_path = path.strip_prefix(&root).unwrap_or(path);
            let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            if !self.include_globs.is_empty()
                && !(include_set.is_match(rel_path) || include_set.is_match(basename))
            {
                continue;
            }

            if !self.exclude_globs.is_empty()
                && (exclude_set.is_match(rel_path) || exclude_set.is_match(basename))
            {
                continue;
            }

            if self.max_file_size > 0 {
                if let Ok(metadata) = fs::metadata(path) {
                    if metadata.len() > self.max_file_size {
                        continue;
                    }
                }
            }

            if !self.skip_gitignore && is_gitignored(&root, path, &mut gitignores) {
                continue;
            }

            matched.push(path.to_path_buf());
        }

        matched.sort();
        matched.dedup();
        Ok(matched)
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Evaluates `.gitignore` files from the file's directory up to the scan
/// root; the nearest file with an opinion wins.
fn is_gitignored(
    root: &Path,
    path: &Path,
    cache: &mut HashMap<PathBuf, Option<Gitignore>>,
) -> bool {
    let mut dir = path.parent();
    while let Some(current) = dir {
        let gitignore = cache
            .entry(current.to_path_buf())
            .or_insert_with(|| load_gitignore(current));
        if let Some(gitignore) = gitignore {
            match gitignore.matched(path, false) {
                ignore::Match::Ignore(_) => return true,
                ignore::Match::Whitelist(_) => return false,
                ignore::Match::None => {}
            }
        }
        if current == root {
            break;
        }
        dir = current.parent();
    }
    false
}

fn load_gitignore(dir: &Path) -> Option<Gitignore> {
    let file = dir.join(".gitignore");
    if !file.is_file() {
        return None;
    }
    let mut builder = GitignoreBuilder::new(dir);
    builder.add(file);
    builder.build().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(path).unwrap().write_all(content).unwrap();
    }

    #[test]
    fn test_extension_filter_and_ordering() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b.go"), b"package b");
        touch(&dir.path().join("a.go"), b"package a");
        touch(&dir.path().join("notes.txt"), b"hi");

        let files = Scanner::new().extension("go").scan(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.go"));
        assert!(files[1].ends_with("b.go"));
        assert!(files.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn test_builtin_skip_dirs() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("src/main.go"), b"package main");
        touch(&dir.path().join("vendor/dep/dep.go"), b"package dep");
        touch(&dir.path().join("node_modules/x/y.go"), b"package y");
        touch(&dir.path().join(".hidden/z.go"), b"package z");
        touch(&dir.path().join(".morfx/t.go"), b"package t");

        let files = Scanner::new().extension("go").scan(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/main.go"));
    }

    #[test]
    fn test_exclude_glob_on_basename() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("a.go"), b"x");
        touch(&dir.path().join("a_test.go"), b"x");

        let files = Scanner::new()
            .extension("go")
            .exclude("*_test.go")
            .scan(dir.path())
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.go"));
    }

    #[test]
    fn test_include_glob() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("handlers/user.go"), b"x");
        touch(&dir.path().join("models/user.go"), b"x");

        let files = Scanner::new()
            .include("handlers/**")
            .scan(dir.path())
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("handlers/user.go"));
    }

    #[test]
    fn test_size_cap() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("small.go"), b"package p");
        touch(&dir.path().join("big.go"), &vec![b'x'; 4096]);

        let files = Scanner::new()
            .extension("go")
            .max_file_size(100)
            .scan(dir.path())
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("small.go"));

        // 0 means unlimited.
        let files = Scanner::new()
            .extension("go")
            .max_file_size(0)
            .scan(dir.path())
            .unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_gitignore_is_respected() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join(".gitignore"), b"generated.go\n");
        touch(&dir.path().join("main.go"), b"x");
        touch(&dir.path().join("generated.go"), b"x");

        let files = Scanner::new().extension("go").scan(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("main.go"));
    }

    #[test]
    fn test_nearer_gitignore_wins() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join(".gitignore"), b"*.go\n");
        touch(&dir.path().join("sub/.gitignore"), b"!keep.go\n");
        touch(&dir.path().join("sub/keep.go"), b"x");
        touch(&dir.path().join("sub/drop.go"), b"x");
        touch(&dir.path().join("top.go"), b"x");

        let files = Scanner::new().extension("go").scan(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"keep.go".to_string()));
        assert!(!names.contains(&"drop.go".to_string()));
        assert!(!names.contains(&"top.go".to_string()));
    }

    #[test]
    fn test_gitignore_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join(".gitignore"), b"*.go\n");
        touch(&dir.path().join("main.go"), b"x");

        let files = Scanner::new()
            .extension("go")
            .skip_gitignore(true)
            .scan(dir.path())
            .unwrap();
        assert_eq!(files.len(), 1);
    }
}
