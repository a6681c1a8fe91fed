//! Diff previews for planned rewrites.
//!
//! A preview is computed once per file after the rewrite engine has run:
//! the rewritten content is line-diffed against the original, the edited
//! lines are grouped into hunks, and each hunk is annotated with the ids of
//! the rewrites whose spans fall inside it, so a report can tie every hunk
//! back to the edit that produced it.

use crate::rewrite::Rewrite;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use std::fmt;
use std::path::{Path, PathBuf};

const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// How one preview line relates to the original file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEdit {
    Context,
    Removed,
    Added,
}

/// One contiguous run of edited lines with its surrounding context.
///
/// `old_start`/`new_start` follow the unified-diff convention: 1-based, and
/// for a zero-length side they name the line the hunk sits after.
#[derive(Debug, Clone)]
pub struct Hunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    /// Rule ids of the rewrites that landed in this hunk.
    pub rules: Vec<String>,
    lines: Vec<(LineEdit, String)>,
}

impl Hunk {
    /// Stable `@@` header; rewrite rule ids ride in the section-heading
    /// slot after the closing marker.
    pub fn header(&self) -> String {
        let mut header = format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_lines, self.new_start, self.new_lines
        );
        if !self.rules.is_empty() {
            header.push(' ');
            header.push_str(&self.rules.join(","));
        }
        header
    }

    /// The hunk's lines, with their edit kinds.
    pub fn lines(&self) -> &[(LineEdit, String)] {
        &self.lines
    }
}

/// Line-change totals for one file, or a whole batch once absorbed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub hunks: usize,
    pub insertions: usize,
    pub deletions: usize,
}

impl DiffStats {
    /// Folds another file's totals into this one.
    pub fn absorb(&mut self, other: &DiffStats) {
        self.files_changed += other.files_changed;
        self.hunks += other.hunks;
        self.insertions += other.insertions;
        self.deletions += other.deletions;
    }
}

impl fmt::Display for DiffStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} file(s), {} hunk(s), +{} -{}",
            self.files_changed, self.hunks, self.insertions, self.deletions
        )
    }
}

/// The diff preview for one file's planned change set.
#[derive(Debug, Clone)]
pub struct DiffPreview {
    path: PathBuf,
    hunks: Vec<Hunk>,
}

impl DiffPreview {
    /// Diffs rewritten content against the original. `rewrites` are the
    /// edits that produced `modified`; their rule ids are attached to the
    /// hunks they fall into. `context` is the number of unchanged lines
    /// kept around each hunk.
    pub fn new(
        original: &str,
        modified: &str,
        rewrites: &[Rewrite],
        path: &Path,
        context: usize,
    ) -> Self {
        let hunks = if original == modified {
            Vec::new()
        } else {
            build_hunks(original, modified, rewrites, context)
        };
        Self {
            path: path.to_path_buf(),
            hunks,
        }
    }

    /// True when the contents were byte-identical.
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// The grouped hunks.
    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    /// Counts lines added and removed across all hunks.
    pub fn stats(&self) -> DiffStats {
        let mut stats = DiffStats {
            files_changed: usize::from(!self.hunks.is_empty()),
            hunks: self.hunks.len(),
            ..DiffStats::default()
        };
        for hunk in &self.hunks {
            for (edit, _) in &hunk.lines {
                match edit {
                    LineEdit::Added => stats.insertions += 1,
                    LineEdit::Removed => stats.deletions += 1,
                    LineEdit::Context => {}
                }
            }
        }
        stats
    }

    /// Stable unified-diff text: `--- a/`, `+++ b/`, `@@` headers, no ANSI.
    /// Empty when nothing changed.
    pub fn unified(&self) -> String {
        self.render(false)
    }

    /// Terminal rendering of the same hunks; coloring never changes the
    /// hunk structure.
    pub fn colorized(&self) -> String {
        self.render(true)
    }

    fn render(&self, color: bool) -> String {
        if self.hunks.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        push_line(&mut out, color, CYAN, &format!("--- a/{}", self.path.display()));
        push_line(&mut out, color, CYAN, &format!("+++ b/{}", self.path.display()));

        for hunk in &self.hunks {
            push_line(&mut out, color, CYAN, &hunk.header());
            for (edit, text) in &hunk.lines {
                let (sign, code) = match edit {
                    LineEdit::Context => (' ', ""),
                    LineEdit::Removed => ('-', RED),
                    LineEdit::Added => ('+', GREEN),
                };
                push_line(
                    &mut out,
                    color && !code.is_empty(),
                    code,
                    &format!("{sign}{text}"),
                );
            }
        }
        out
    }
}

fn push_line(out: &mut String, color: bool, code: &str, text: &str) {
    if color {
        out.push_str(code);
    }
    out.push_str(text);
    if color {
        out.push_str(RESET);
    }
    out.push('\n');
}

struct LineRecord {
    edit: LineEdit,
    old: Option<usize>,
    new: Option<usize>,
    text: String,
}

fn build_hunks(
    original: &str,
    modified: &str,
    rewrites: &[Rewrite],
    context: usize,
) -> Vec<Hunk> {
    let diff = TextDiff::from_lines(original, modified);
    let mut records = Vec::new();
    for change in diff.iter_all_changes() {
        let edit = match change.tag() {
            ChangeTag::Equal => LineEdit::Context,
            ChangeTag::Delete => LineEdit::Removed,
            ChangeTag::Insert => LineEdit::Added,
        };
        let mut text = change.value().to_string();
        if text.ends_with('\n') {
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }
        }
        records.push(LineRecord {
            edit,
            old: change.old_index(),
            new: change.new_index(),
            text,
        });
    }
    if records.is_empty() {
        return Vec::new();
    }

    // Inclusive record ranges: each edited line widened by the context
    // window, touching ranges merged.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (index, record) in records.iter().enumerate() {
        if record.edit == LineEdit::Context {
            continue;
        }
        let start = index.saturating_sub(context);
        let end = (index + context).min(records.len() - 1);
        match ranges.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => ranges.push((start, end)),
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            let slice = &records[start..=end];
            let old_lines = slice.iter().filter(|r| r.old.is_some()).count();
            let new_lines = slice.iter().filter(|r| r.new.is_some()).count();
            let old_before = records[..start].iter().filter(|r| r.old.is_some()).count();
            let new_before = records[..start].iter().filter(|r| r.new.is_some()).count();
            let old_start = if old_lines == 0 { old_before } else { old_before + 1 };
            let new_start = if new_lines == 0 { new_before } else { new_before + 1 };

            Hunk {
                old_start,
                old_lines,
                new_start,
                new_lines,
                rules: rules_in_span(rewrites, old_start, old_lines),
                lines: slice.iter().map(|r| (r.edit, r.text.clone())).collect(),
            }
        })
        .collect()
}

/// Rewrites whose original line span intersects the hunk's old side, with
/// one line of slack so insertions at a hunk edge still attach.
fn rules_in_span(rewrites: &[Rewrite], old_start: usize, old_lines: usize) -> Vec<String> {
    let first = old_start.max(1);
    let last = old_start + old_lines.max(1) - 1;
    rewrites
        .iter()
        .filter(|r| r.line_start <= last + 1 && r.line_end + 1 >= first)
        .map(|r| r.rule_id.clone())
        .collect()
}

/// Plain unified diff of two texts, with no rewrite annotations.
pub fn unified_diff(original: &str, modified: &str, path: &Path, context: usize) -> String {
    DiffPreview::new(original, modified, &[], path, context).unified()
}

/// Colorized variant of [`unified_diff`].
pub fn colorized_diff(original: &str, modified: &str, path: &Path, context: usize) -> String {
    DiffPreview::new(original, modified, &[], path, context).colorized()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(rule_id: &str, line_start: usize, line_end: usize) -> Rewrite {
        Rewrite {
            rule_id: rule_id.to_string(),
            start: 0,
            end: 0,
            new_text: String::new(),
            line_start,
            line_end,
        }
    }

    #[test]
    fn test_identical_inputs_produce_empty_preview() {
        let path = PathBuf::from("a.go");
        let preview = DiffPreview::new("same\n", "same\n", &[], &path, 3);
        assert!(preview.is_empty());
        assert_eq!(preview.unified(), "");
        assert_eq!(preview.stats().files_changed, 0);
        assert_eq!(unified_diff("", "", &path, 0), "");
        assert_eq!(colorized_diff("x\n", "x\n", &path, 3), "");
    }

    #[test]
    fn test_single_line_replacement() {
        let path = PathBuf::from("a.go");
        let diff = unified_diff("one\ntwo\nthree\n", "one\n2\nthree\n", &path, 3);

        assert!(diff.starts_with("--- a/a.go\n+++ b/a.go\n"));
        assert!(diff.contains("@@ -1,3 +1,3 @@"));
        assert!(diff.contains("-two\n"));
        assert!(diff.contains("+2\n"));
        assert_eq!(diff.matches("@@").count(), 2);
    }

    #[test]
    fn test_hunks_carry_their_rewrite_rules() {
        let path = PathBuf::from("a.go");
        let original: String = (1..=30).map(|i| format!("line{i}\n")).collect();
        let modified = original
            .replace("line5\n", "five\n")
            .replace("line25\n", "twentyfive\n");
        let rewrites = [rewrite("replace-1", 5, 5), rewrite("replace-2", 25, 25)];

        let preview = DiffPreview::new(&original, &modified, &rewrites, &path, 2);
        assert_eq!(preview.hunks().len(), 2);
        assert_eq!(preview.hunks()[0].rules, vec!["replace-1".to_string()]);
        assert_eq!(preview.hunks()[1].rules, vec!["replace-2".to_string()]);

        let unified = preview.unified();
        assert!(unified.contains("@@ replace-1\n"), "got: {unified}");
        assert!(unified.contains("@@ replace-2\n"), "got: {unified}");
    }

    #[test]
    fn test_nearby_rewrites_merge_into_one_hunk() {
        let path = PathBuf::from("a.go");
        let original: String = (1..=10).map(|i| format!("line{i}\n")).collect();
        let modified = original
            .replace("line4\n", "four\n")
            .replace("line6\n", "six\n");
        let rewrites = [rewrite("delete-1", 4, 4), rewrite("delete-2", 6, 6)];

        let preview = DiffPreview::new(&original, &modified, &rewrites, &path, 3);
        assert_eq!(preview.hunks().len(), 1);
        assert_eq!(
            preview.hunks()[0].rules,
            vec!["delete-1".to_string(), "delete-2".to_string()]
        );
    }

    #[test]
    fn test_context_limits_mentioned_lines() {
        let original: String = (1..=20).map(|i| format!("line{i}\n")).collect();
        let modified = original.replace("line10\n", "changed\n");
        let path = PathBuf::from("big.txt");

        let diff = unified_diff(&original, &modified, &path, 1);
        assert!(diff.contains(" line9\n"));
        assert!(diff.contains("-line10\n"));
        assert!(diff.contains(" line11\n"));
        assert!(!diff.contains("line7"));
        assert!(!diff.contains("line13"));
    }

    #[test]
    fn test_pure_insertion_hunk_counts() {
        let path = PathBuf::from("a.txt");
        let diff = unified_diff("a\nb\n", "a\nnew\nb\n", &path, 0);
        // Zero-context insertion: no old lines, one new line.
        assert!(diff.contains("@@ -1,0 +2,1 @@"), "got: {diff}");
        assert!(diff.contains("+new\n"));
    }

    #[test]
    fn test_missing_trailing_newline_is_terminated() {
        let path = PathBuf::from("a.txt");
        let diff = unified_diff("a", "b", &path, 3);
        assert!(diff.ends_with('\n'));
        assert!(diff.contains("-a\n"));
        assert!(diff.contains("+b\n"));
    }

    #[test]
    fn test_colorized_has_same_hunk_structure() {
        let path = PathBuf::from("a.go");
        let preview = DiffPreview::new("one\ntwo\n", "one\n2\n", &[], &path, 3);
        assert_eq!(
            preview.unified().matches("@@").count(),
            preview.colorized().matches("@@").count()
        );
        assert!(preview.colorized().contains(RED));
        assert!(!preview.unified().contains('\x1b'));
    }

    #[test]
    fn test_stats_count_lines_and_absorb() {
        let path = PathBuf::from("a.go");
        let preview = DiffPreview::new("a\nb\n", "a\nc\nd\n", &[], &path, 3);
        let stats = preview.stats();
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.hunks, 1);
        assert_eq!(stats.insertions, 2);
        assert_eq!(stats.deletions, 1);

        let mut total = DiffStats::default();
        total.absorb(&stats);
        total.absorb(&DiffPreview::new("x\n", "x\n", &[], &path, 3).stats());
        assert_eq!(total.files_changed, 1);
        assert_eq!(total.to_string(), "1 file(s), 1 hunk(s), +2 -1");
    }
}
