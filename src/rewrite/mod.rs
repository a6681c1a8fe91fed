//! The rewrite engine: turns matches into byte-accurate edits and applies
//! them while preserving indentation and line-ending style.

use crate::error::{MorfxError, Result};
use crate::lang::LanguageProvider;
use crate::matcher::NodeMatch;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A structured operation applied to matched nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get,
    Replace,
    Delete,
    InsertBefore,
    InsertAfter,
    AppendToBody,
}

impl Operation {
    /// Whether the operation produces edits.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Operation::Get)
    }

    /// Whether the operation needs caller-supplied replacement text.
    pub fn needs_replacement(&self) -> bool {
        matches!(
            self,
            Operation::Replace
                | Operation::InsertBefore
                | Operation::InsertAfter
                | Operation::AppendToBody
        )
    }

    /// The canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Replace => "replace",
            Operation::Delete => "delete",
            Operation::InsertBefore => "insert_before",
            Operation::InsertAfter => "insert_after",
            Operation::AppendToBody => "append_to_body",
        }
    }
}

/// The atomic edit: replace `start..end` with `new_text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rewrite {
    pub rule_id: String,
    pub start: usize,
    pub end: usize,
    pub new_text: String,
    pub line_start: usize,
    pub line_end: usize,
}

/// Record of one applied rewrite: what was there, and what replaced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub original: String,
    pub replacement: String,
    pub line_start: usize,
    pub line_end: usize,
}

/// Plans and applies rewrites for one file at a time.
pub struct RewriteEngine<'a> {
    provider: &'a dyn LanguageProvider,
}

impl<'a> RewriteEngine<'a> {
    /// Creates an engine bound to the file's language provider.
    pub fn new(provider: &'a dyn LanguageProvider) -> Self {
        Self { provider }
    }

    /// Computes the rewrites for `operation` over `matches`.
    ///
    /// Mutating operations reject overlapping match spans up front.
    pub fn plan(
        &self,
        source: &str,
        path: &Path,
        matches: &[NodeMatch],
        operation: Operation,
        replacement: Option<&str>,
    ) -> Result<Vec<Rewrite>> {
        if !operation.is_mutating() {
            return Ok(Vec::new());
        }
        if operation.needs_replacement() && replacement.is_none() {
            return Err(MorfxError::BadQuery(format!(
                "operation '{}' requires replacement text",
                operation.as_str()
            )));
        }
        assert_no_overlap(path, matches)?;

        let eol = dominant_eol(source);
        let mut rewrites = Vec::with_capacity(matches.len());
        for (index, m) in matches.iter().enumerate() {
            let rule_id = format!("{}-{}", operation.as_str(), index + 1);
            let rewrite = match operation {
                Operation::Get => continue,
                Operation::Replace => Rewrite {
                    rule_id,
                    start: m.start_byte,
                    end: m.end_byte,
                    new_text: replacement.unwrap_or_default().to_string(),
                    line_start: m.start_line,
                    line_end: m.end_line,
                },
                Operation::Delete => self.plan_delete(source, m, rule_id),
                Operation::InsertBefore => {
                    self.plan_insert_before(source, m, replacement.unwrap_or_default(), eol, rule_id)
                }
                Operation::InsertAfter => {
                    self.plan_insert_after(source, m, replacement.unwrap_or_default(), eol, rule_id)
                }
                Operation::AppendToBody => self.plan_append_to_body(
                    source,
                    path,
                    m,
                    replacement.unwrap_or_default(),
                    eol,
                    rule_id,
                )?,
            };
            rewrites.push(rewrite);
        }
        Ok(rewrites)
    }

    fn plan_delete(&self, source: &str, m: &NodeMatch, rule_id: String) -> Rewrite {
        let mut end = m.end_byte;
        if self.provider.is_block_level(m.kind) {
            let bytes = source.as_bytes();
            if bytes.get(end) == Some(&b'\r') && bytes.get(end + 1) == Some(&b'\n') {
                end += 2;
            } else if bytes.get(end) == Some(&b'\n') {
                end += 1;
            }
        }
        Rewrite {
            rule_id,
            start: m.start_byte,
            end,
            new_text: String::new(),
            line_start: m.start_line,
            line_end: m.end_line,
        }
    }

    fn plan_insert_before(
        &self,
        source: &str,
        m: &NodeMatch,
        replacement: &str,
        eol: &str,
        rule_id: String,
    ) -> Rewrite {
        let anchor = line_start(source, m.start_byte);
        let indent = line_indent(source, m.start_byte);
        let mut text = indent_lines(replacement, indent, eol);
        text.push_str(eol);
        if self.provider.is_block_level(m.kind) {
            // Blank separator line between the insertion and the node.
            text.push_str(eol);
        }
        Rewrite {
            rule_id,
            start: anchor,
            end: anchor,
            new_text: text,
            line_start: m.start_line,
            line_end: m.start_line,
        }
    }

    fn plan_insert_after(
        &self,
        source: &str,
        m: &NodeMatch,
        replacement: &str,
        eol: &str,
        rule_id: String,
    ) -> Rewrite {
        let indent = line_indent(source, m.start_byte);
        let end_of_line = line_end(source, m.end_byte.saturating_sub(1).max(m.start_byte));
        let (anchor, mut text) = if end_of_line < source.len() {
            // Right after the node's final line break.
            (end_of_line + 1, String::new())
        } else {
            // Node closes the file without a newline.
            (source.len(), eol.to_string())
        };
        if self.provider.is_block_level(m.kind) {
            text.push_str(eol);
        }
        text.push_str(&indent_lines(replacement, indent, eol));
        text.push_str(eol);
        Rewrite {
            rule_id,
            start: anchor,
            end: anchor,
            new_text: text,
            line_start: m.end_line,
            line_end: m.end_line,
        }
    }

    fn plan_append_to_body(
        &self,
        source: &str,
        path: &Path,
        m: &NodeMatch,
        replacement: &str,
        eol: &str,
        rule_id: String,
    ) -> Result<Rewrite> {
        let tree = self.provider.parse(source)?;
        let node = find_node_at(tree.root_node(), m.start_byte, m.end_byte).ok_or_else(|| {
            MorfxError::ParseFailed {
                path: path.to_path_buf(),
                message: format!(
                    "matched node at bytes {}..{} disappeared on re-parse",
                    m.start_byte, m.end_byte
                ),
            }
        })?;
        let point = self
            .provider
            .body_insertion_point(&node)
            .ok_or_else(|| MorfxError::BadQuery(format!(
                "{} nodes have no body to append to",
                m.kind
            )))?;

        let outer_indent = line_indent(source, m.start_byte);
        let inner_indent = body_indent(source, m, outer_indent);

        let closing_line_start = line_start(source, point);
        let prefix_is_blank = source[closing_line_start..point]
            .chars()
            .all(|c| c == ' ' || c == '\t');

        let (anchor, text) = if prefix_is_blank {
            // Closing delimiter sits on its own line; slot in above it.
            let mut text = indent_lines(replacement, &inner_indent, eol);
            text.push_str(eol);
            (closing_line_start, text)
        } else {
            // No delimiter line of its own (single-line body, or an
            // indentation-based block): break after the insertion point.
            let mut text = eol.to_string();
            text.push_str(&indent_lines(replacement, &inner_indent, eol));
            (point, text)
        };

        let line = m.start_line + source[m.start_byte..anchor.min(source.len())]
            .matches('\n')
            .count();
        Ok(Rewrite {
            rule_id,
            start: anchor,
            end: anchor,
            new_text: text,
            line_start: line,
            line_end: line,
        })
    }

    /// Runs the provider's syntax check over modified content.
    pub fn validate(&self, modified: &str, path: &Path) -> Result<()> {
        let diagnostics = self.provider.quick_check(modified)?;
        if let Some(first) = diagnostics
            .iter()
            .find(|d| d.severity >= crate::lang::Severity::Error)
        {
            return Err(MorfxError::ValidationFailed {
                path: path.to_path_buf(),
                message: format!("{} (line {})", first.message, first.line),
            });
        }
        Ok(())
    }
}

/// Applies rewrites to `source` by byte-splicing in descending start order
/// and returns the modified content with one [`Change`] per rewrite.
pub fn apply_rewrites(
    source: &str,
    path: &Path,
    rewrites: &[Rewrite],
) -> Result<(String, Vec<Change>)> {
    let mut sorted: Vec<&Rewrite> = rewrites.iter().collect();
    sorted.sort_by_key(|r| r.start);
    for pair in sorted.windows(2) {
        if pair[1].start < pair[0].end {
            return Err(MorfxError::OverlappingMatches {
                path: path.to_path_buf(),
                first: pair[0].start,
                second: pair[1].start,
            });
        }
    }

    let mut result = source.to_string();
    let mut changes = Vec::with_capacity(sorted.len());
    for rewrite in sorted.iter().rev() {
        if rewrite.end > result.len() {
            return Err(MorfxError::OverlappingMatches {
                path: path.to_path_buf(),
                first: rewrite.start,
                second: rewrite.end,
            });
        }
        changes.push(Change {
            original: result[rewrite.start..rewrite.end].to_string(),
            replacement: rewrite.new_text.clone(),
            line_start: rewrite.line_start,
            line_end: rewrite.line_end,
        });
        result.replace_range(rewrite.start..rewrite.end, &rewrite.new_text);
    }
    changes.reverse();
    Ok((result, changes))
}

fn assert_no_overlap(path: &Path, matches: &[NodeMatch]) -> Result<()> {
    let mut spans: Vec<(usize, usize)> = matches
        .iter()
        .map(|m| (m.start_byte, m.end_byte))
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(MorfxError::OverlappingMatches {
                path: path.to_path_buf(),
                first: pair[0].0,
                second: pair[1].0,
            });
        }
    }
    Ok(())
}

/// Byte offset of the start of the line containing `byte`.
fn line_start(source: &str, byte: usize) -> usize {
    let byte = byte.min(source.len());
    source[..byte].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

/// Byte offset of the `\n` ending the line containing `byte`, or the end
/// of the source.
fn line_end(source: &str, byte: usize) -> usize {
    let byte = byte.min(source.len());
    source[byte..]
        .find('\n')
        .map(|i| byte + i)
        .unwrap_or(source.len())
}

/// Whitespace prefix of the line containing `byte`.
fn line_indent(source: &str, byte: usize) -> &str {
    let start = line_start(source, byte);
    let line = &source[start..line_end(source, byte)];
    let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
    &line[..indent_len]
}

/// Detects the dominant line-ending style of the file.
fn dominant_eol(source: &str) -> &'static str {
    let crlf = source.matches("\r\n").count();
    let lf = source.matches('\n').count() - crlf;
    if crlf > lf { "\r\n" } else { "\n" }
}

/// Prefixes every line of `text` with `indent`, joining with `eol`.
fn indent_lines(text: &str, indent: &str, eol: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{indent}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join(eol)
}

/// Indentation one level inside the node's body: the first indented body
/// line wins, falling back to the outer indent plus four spaces.
fn body_indent(source: &str, m: &NodeMatch, outer_indent: &str) -> String {
    for line in source[m.start_byte..m.end_byte].lines().skip(1) {
        let trimmed = line.trim_start_matches([' ', '\t']);
        if trimmed.is_empty() {
            continue;
        }
        let indent = &line[..line.len() - trimmed.len()];
        if indent.len() > outer_indent.len() {
            return indent.to_string();
        }
    }
    format!("{outer_indent}    ")
}

/// Finds the node whose byte range exactly equals `start..end`.
fn find_node_at(root: tree_sitter::Node, start: usize, end: usize) -> Option<tree_sitter::Node> {
    let mut node = root;
    loop {
        if node.start_byte() == start && node.end_byte() == end {
            return Some(node);
        }
        let mut cursor = node.walk();
        let next = node
            .named_children(&mut cursor)
            .find(|c| c.start_byte() <= start && end <= c.end_byte());
        drop(cursor);
        match next {
            Some(child) => node = child,
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{Go, PatternCache};
    use crate::matcher::CodeMatcher;
    use crate::query::parse;

    const SOURCE: &str = r#"package p

func GetUser(id int) User { return User{} }

func helper() {
    x := 1
}
"#;

    fn matches_for(query: &str, source: &str) -> Vec<NodeMatch> {
        let cache = PatternCache::new();
        let matcher = CodeMatcher::new(&cache);
        matcher
            .find_matches(source, Path::new("a.go"), &Go, &parse(query).unwrap())
            .unwrap()
    }

    #[test]
    fn test_replace_single_function() {
        let matches = matches_for("func:GetUser", SOURCE);
        let engine = RewriteEngine::new(&Go);
        let replacement = "func GetUserByID(id int) User { return User{} }";
        let rewrites = engine
            .plan(SOURCE, Path::new("a.go"), &matches, Operation::Replace, Some(replacement))
            .unwrap();
        assert_eq!(rewrites.len(), 1);

        let (modified, changes) = apply_rewrites(SOURCE, Path::new("a.go"), &rewrites).unwrap();
        assert!(modified.contains("GetUserByID"));
        assert!(modified.starts_with("package p\n"));
        assert_eq!(changes.len(), 1);
        assert!(changes[0].original.starts_with("func GetUser"));
    }

    #[test]
    fn test_noop_replace_round_trips() {
        let matches = matches_for("func:*", SOURCE);
        let engine = RewriteEngine::new(&Go);
        let mut result = SOURCE.to_string();
        // Replacing each match with its own text changes nothing.
        for m in &matches {
            let rewrites = engine
                .plan(
                    &result,
                    Path::new("a.go"),
                    std::slice::from_ref(m),
                    Operation::Replace,
                    Some(&m.content),
                )
                .unwrap();
            let (next, _) = apply_rewrites(&result, Path::new("a.go"), &rewrites).unwrap();
            result = next;
        }
        assert_eq!(result, SOURCE);
    }

    #[test]
    fn test_delete_block_level_swallows_newline() {
        let matches = matches_for("func:helper", SOURCE);
        let engine = RewriteEngine::new(&Go);
        let rewrites = engine
            .plan(SOURCE, Path::new("a.go"), &matches, Operation::Delete, None)
            .unwrap();
        let (modified, _) = apply_rewrites(SOURCE, Path::new("a.go"), &rewrites).unwrap();
        assert!(!modified.contains("helper"));
        assert!(!modified.contains("\n\n\n"));
    }

    #[test]
    fn test_insert_before_block_level() {
        let source = "package p\nfunc F() {\n    x := 1\n}\n";
        let matches = matches_for("func:F", source);
        let engine = RewriteEngine::new(&Go);
        let rewrites = engine
            .plan(source, Path::new("a.go"), &matches, Operation::InsertBefore, Some("// added"))
            .unwrap();
        let (modified, _) = apply_rewrites(source, Path::new("a.go"), &rewrites).unwrap();
        // Zero-indent comment, blank line, then the function.
        assert!(modified.contains("// added\n\nfunc F() {"), "got: {modified}");
    }

    #[test]
    fn test_insert_before_preserves_indentation() {
        let source = "package p\nfunc F() {\n    x := 1\n}\n";
        let matches = matches_for("var:x", source);
        let engine = RewriteEngine::new(&Go);
        let rewrites = engine
            .plan(source, Path::new("a.go"), &matches, Operation::InsertBefore, Some("y := 0"))
            .unwrap();
        let (modified, _) = apply_rewrites(source, Path::new("a.go"), &rewrites).unwrap();
        assert!(modified.contains("    y := 0\n    x := 1"), "got: {modified}");
    }

    #[test]
    fn test_insert_after() {
        let source = "package p\nfunc F() {\n    x := 1\n}\n";
        let matches = matches_for("var:x", source);
        let engine = RewriteEngine::new(&Go);
        let rewrites = engine
            .plan(source, Path::new("a.go"), &matches, Operation::InsertAfter, Some("use(x)"))
            .unwrap();
        let (modified, _) = apply_rewrites(source, Path::new("a.go"), &rewrites).unwrap();
        assert!(modified.contains("    x := 1\n    use(x)\n"), "got: {modified}");
    }

    #[test]
    fn test_append_to_body() {
        let source = "package p\nfunc F() {\n    x := 1\n}\n";
        let matches = matches_for("func:F", source);
        let engine = RewriteEngine::new(&Go);
        let rewrites = engine
            .plan(source, Path::new("a.go"), &matches, Operation::AppendToBody, Some("return"))
            .unwrap();
        let (modified, _) = apply_rewrites(source, Path::new("a.go"), &rewrites).unwrap();
        assert!(modified.contains("    x := 1\n    return\n}"), "got: {modified}");
    }

    #[test]
    fn test_crlf_preserved() {
        let source = "package p\r\nfunc F() {\r\n    x := 1\r\n}\r\n";
        let matches = matches_for("var:x", source);
        let engine = RewriteEngine::new(&Go);
        let rewrites = engine
            .plan(source, Path::new("a.go"), &matches, Operation::InsertAfter, Some("use(x)"))
            .unwrap();
        let (modified, _) = apply_rewrites(source, Path::new("a.go"), &rewrites).unwrap();
        assert!(modified.contains("    x := 1\r\n    use(x)\r\n"), "got: {modified}");
    }

    #[test]
    fn test_overlap_is_rejected() {
        // A function and a call inside it overlap byte-wise.
        let matches_outer = matches_for("func:GetUser", SOURCE);
        let matches_inner = matches_for("block:*", SOURCE);
        let mut combined = matches_outer;
        combined.extend(matches_inner);

        let engine = RewriteEngine::new(&Go);
        let err = engine
            .plan(SOURCE, Path::new("a.go"), &combined, Operation::Delete, None)
            .unwrap_err();
        assert!(matches!(err, MorfxError::OverlappingMatches { .. }));
    }

    #[test]
    fn test_descending_application_matches_any_order() {
        let matches = matches_for("func:*", SOURCE);
        let engine = RewriteEngine::new(&Go);
        let rewrites = engine
            .plan(SOURCE, Path::new("a.go"), &matches, Operation::Replace, Some("// gone"))
            .unwrap();

        let (a, _) = apply_rewrites(SOURCE, Path::new("a.go"), &rewrites).unwrap();
        let mut reversed = rewrites.clone();
        reversed.reverse();
        let (b, _) = apply_rewrites(SOURCE, Path::new("a.go"), &reversed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_flags_broken_syntax() {
        let engine = RewriteEngine::new(&Go);
        assert!(engine.validate("package p\nfunc F() {}\n", Path::new("a.go")).is_ok());
        let err = engine
            .validate("package p\nfunc F( {\n", Path::new("a.go"))
            .unwrap_err();
        assert!(matches!(err, MorfxError::ValidationFailed { .. }));
    }

    #[test]
    fn test_missing_replacement_is_rejected() {
        let matches = matches_for("func:GetUser", SOURCE);
        let engine = RewriteEngine::new(&Go);
        let err = engine
            .plan(SOURCE, Path::new("a.go"), &matches, Operation::Replace, None)
            .unwrap_err();
        assert!(matches!(err, MorfxError::BadQuery(_)));
    }
}
