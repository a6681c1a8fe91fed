//! Query execution against parsed source.

use crate::bytemap::ByteMap;
use crate::error::{MorfxError, Result};
use crate::lang::{LanguageProvider, LanguageRegistry, PatternCache};
use crate::query::{Combinator, NodeKind, Query, QueryExpr, glob_match};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Tree};

/// Attribute key reserved for regex matching over the node's
/// whitespace-normalized text.
pub const PATTERN_ATTRIBUTE: &str = "pattern";

/// The result of locating a query on a parsed source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMatch {
    pub file_path: PathBuf,
    pub language: String,
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<String, String>,
    /// Whether the node sits inside another declaration rather than at the
    /// file top level.
    pub nested: bool,
}

impl NodeMatch {
    /// Key used for de-duplication and match-set algebra.
    pub fn identity(&self) -> (usize, usize, NodeKind) {
        (self.start_byte, self.end_byte, self.kind)
    }

    /// True when the byte spans of two matches intersect.
    pub fn overlaps(&self, other: &NodeMatch) -> bool {
        self.start_byte < other.end_byte && other.start_byte < self.end_byte
    }
}

/// Executes queries against source text through a language provider.
///
/// The pattern cache is owned by the dispatcher and threaded in here; the
/// matcher itself is stateless and cheap to construct per call.
pub struct CodeMatcher<'a> {
    cache: &'a PatternCache,
}

impl<'a> CodeMatcher<'a> {
    /// Creates a matcher over the given compiled-pattern cache.
    pub fn new(cache: &'a PatternCache) -> Self {
        Self { cache }
    }

    /// Finds all matches for `expr` in `source`, in document order.
    pub fn find_matches(
        &self,
        source: &str,
        path: &Path,
        provider: &dyn LanguageProvider,
        expr: &QueryExpr,
    ) -> Result<Vec<NodeMatch>> {
        let tree = provider.parse(source)?;
        let mut matches = self.eval_expr(&tree, source, path, provider, expr)?;
        sort_document_order(&mut matches);
        matches.dedup_by_key(|m| m.identity());
        Ok(matches)
    }

    /// Convenience wrapper that reads the file and detects its language.
    pub fn find_matches_in_file(
        &self,
        path: &Path,
        registry: &LanguageRegistry,
        expr: &QueryExpr,
    ) -> Result<Vec<NodeMatch>> {
        let source = std::fs::read_to_string(path)?;
        let provider = registry.detect(path).ok_or_else(|| {
            MorfxError::UnsupportedLanguage(
                path.extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("unknown")
                    .to_string(),
            )
        })?;
        self.find_matches(&source, path, provider, expr)
    }

    fn eval_expr(
        &self,
        tree: &Tree,
        source: &str,
        path: &Path,
        provider: &dyn LanguageProvider,
        expr: &QueryExpr,
    ) -> Result<Vec<NodeMatch>> {
        match expr {
            QueryExpr::Leaf(query) => self.eval_leaf(tree, source, path, provider, query),
            QueryExpr::Group { op, terms } => {
                let mut sets = Vec::with_capacity(terms.len());
                for term in terms {
                    sets.push(self.eval_expr(tree, source, path, provider, term)?);
                }
                Ok(combine_sets(*op, sets))
            }
        }
    }

    fn eval_leaf(
        &self,
        tree: &Tree,
        source: &str,
        path: &Path,
        provider: &dyn LanguageProvider,
        query: &Query,
    ) -> Result<Vec<NodeMatch>> {
        let Some(pattern) = self.cache.get_or_compile(provider, query)? else {
            return Ok(Vec::new());
        };

        let mut matches = Vec::new();
        for node in provider.find(tree, &pattern, source) {
            if !provider.node_matches_kind(&node, query.kind, source) {
                continue;
            }
            let satisfied = self.predicate_body_matches(source, provider, &node, query)?;
            let selected = if query.negated { !satisfied } else { satisfied };
            if selected {
                matches.push(self.build_match(source, path, provider, &node, query.kind));
            }
        }
        Ok(matches)
    }

    /// Evaluates name, attributes, and descendant constraints; the kind has
    /// already selected the candidate, so negation inverts only this part.
    fn predicate_body_matches(
        &self,
        source: &str,
        provider: &dyn LanguageProvider,
        node: &Node,
        query: &Query,
    ) -> Result<bool> {
        if let Some(name_glob) = &query.name {
            // Unnamed nodes match as the empty string, so `block:*` works.
            let name = provider.node_name(node, source).unwrap_or_default();
            if !glob_match(name_glob, &name) {
                return Ok(false);
            }
        }

        if !query.attributes.is_empty() {
            let actual = provider.node_attributes(node, source);
            for (key, expected) in &query.attributes {
                if key == PATTERN_ATTRIBUTE {
                    if !self.content_pattern_matches(source, node, expected)? {
                        return Ok(false);
                    }
                    continue;
                }
                let matched = actual
                    .get(key)
                    .is_some_and(|value| glob_match(expected, value));
                if !matched {
                    return Ok(false);
                }
            }
        }

        if !query.children.is_empty() {
            let mut results = Vec::with_capacity(query.children.len());
            for child in &query.children {
                let found = self.descendant_matches(source, provider, node, child)?;
                // A negated child constraint means "no descendant matches".
                results.push(if child.negated { !found } else { found });
            }
            let combined = match query.combinator {
                Combinator::And => results.iter().all(|r| *r),
                Combinator::Or => results.iter().any(|r| *r),
            };
            if !combined {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn descendant_matches(
        &self,
        source: &str,
        provider: &dyn LanguageProvider,
        node: &Node,
        child: &Query,
    ) -> Result<bool> {
        let mut positive = child.clone();
        positive.negated = false;

        let mut stack: Vec<Node> = Vec::new();
        let mut cursor = node.walk();
        for c in node.named_children(&mut cursor) {
            stack.push(c);
        }

        while let Some(candidate) = stack.pop() {
            if provider.node_matches_kind(&candidate, positive.kind, source)
                && self.predicate_body_matches(source, provider, &candidate, &positive)?
            {
                return Ok(true);
            }
            let mut cursor = candidate.walk();
            for c in candidate.named_children(&mut cursor) {
                stack.push(c);
            }
        }
        Ok(false)
    }

    /// Matches a regex against the node's whitespace-normalized text, so
    /// patterns written with natural spacing hit real source.
    fn content_pattern_matches(
        &self,
        source: &str,
        node: &Node,
        pattern: &str,
    ) -> Result<bool> {
        let slice = &source.as_bytes()[node.start_byte()..node.end_byte()];
        let map = ByteMap::build(slice);
        let regex = Regex::new(pattern)?;
        Ok(regex.is_match(map.normalized()))
    }

    fn build_match(
        &self,
        source: &str,
        path: &Path,
        provider: &dyn LanguageProvider,
        node: &Node,
        kind: NodeKind,
    ) -> NodeMatch {
        let (start_byte, end_byte, start_line, end_line) = provider.node_range(node);
        let content = source[start_byte..end_byte].to_string();
        NodeMatch {
            file_path: path.to_path_buf(),
            language: provider.canonical_name().to_string(),
            start_byte,
            end_byte,
            start_line,
            end_line,
            kind,
            name: provider.node_name(node, source),
            content,
            attributes: provider.node_attributes(node, source),
            nested: is_nested(provider, node),
        }
    }
}

fn is_nested(provider: &dyn LanguageProvider, node: &Node) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        if provider.node_kind(&parent).is_some_and(|k| {
            matches!(
                k,
                NodeKind::Function
                    | NodeKind::Method
                    | NodeKind::Class
                    | NodeKind::Struct
                    | NodeKind::Interface
            )
        }) {
            return true;
        }
        current = parent.parent();
    }
    false
}

fn sort_document_order(matches: &mut [NodeMatch]) {
    matches.sort_by(|a, b| {
        a.start_byte
            .cmp(&b.start_byte)
            .then(b.end_byte.cmp(&a.end_byte))
            .then(a.kind.cmp(&b.kind))
    });
}

fn combine_sets(op: Combinator, sets: Vec<Vec<NodeMatch>>) -> Vec<NodeMatch> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let mut result = first;
    for set in iter {
        match op {
            Combinator::And => {
                let keys: std::collections::HashSet<_> =
                    set.iter().map(|m| m.identity()).collect();
                result.retain(|m| keys.contains(&m.identity()));
            }
            Combinator::Or => {
                let existing: std::collections::HashSet<_> =
                    result.iter().map(|m| m.identity()).collect();
                for m in set {
                    if !existing.contains(&m.identity()) {
                        result.push(m);
                    }
                }
            }
        }
    }
    result
}
