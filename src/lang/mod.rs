//! Language abstraction for multi-language parsing and matching.
//!
//! The engine consumes languages through the [`LanguageProvider`] trait:
//! parsing, query translation, node classification, and syntax validation
//! all live behind it. AST handles are parsed per call and never retained
//! across calls, so providers stay free to pool parsers however they like.

mod go;
mod python;
mod rust;
mod typescript;

pub use go::Go;
pub use python::Python;
pub use rust::Rust;
pub use typescript::TypeScript;

use crate::error::{MorfxError, Result};
use crate::query::{NodeKind, Query};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use streaming_iterator::StreamingIterator;
use tree_sitter::{Language as TsLanguage, Node, Parser, Query as TsQuery, QueryCursor, Tree};

/// Severity of a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// A syntax problem reported by [`LanguageProvider::quick_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub start_byte: usize,
    pub end_byte: usize,
    pub line: usize,
}

/// A programming language plugged into the engine.
pub trait LanguageProvider: Send + Sync {
    /// Canonical lowercase name of the language.
    fn canonical_name(&self) -> &'static str;

    /// Alternative names accepted by lookups.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// File extensions (without dot) handled by this provider.
    fn extensions(&self) -> &'static [&'static str];

    /// The tree-sitter grammar.
    fn grammar(&self) -> TsLanguage;

    /// Bumped when kind mappings change, to invalidate cached patterns.
    fn provider_version(&self) -> u32 {
        1
    }

    /// Grammar node types that can host the given kind. Empty = the
    /// language has no construct for it (the query then matches nothing).
    fn kind_node_types(&self, kind: NodeKind) -> &'static [&'static str];

    /// Translates a query into this grammar's native pattern syntax.
    ///
    /// `None` means the kind has no representation in this language.
    fn translate_query(&self, query: &Query) -> Result<Option<String>> {
        let types = self.kind_node_types(query.kind);
        if types.is_empty() {
            return Ok(None);
        }
        let pattern: Vec<String> = types.iter().map(|t| format!("({t}) @target")).collect();
        Ok(Some(pattern.join("\n")))
    }

    /// Parses source code into a tree-sitter AST.
    fn parse(&self, source: &str) -> Result<Tree> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.grammar())
            .map_err(|e| MorfxError::ParseFailed {
                path: Path::new("<source>").to_path_buf(),
                message: format!("Failed to set language: {e}"),
            })?;

        parser
            .parse(source, None)
            .ok_or_else(|| MorfxError::ParseFailed {
                path: Path::new("<source>").to_path_buf(),
                message: "Failed to parse source".to_string(),
            })
    }

    /// Compiles a native pattern for this grammar.
    fn compile_pattern(&self, pattern: &str) -> Result<TsQuery> {
        Ok(TsQuery::new(&self.grammar(), pattern)?)
    }

    /// Runs a compiled pattern over a parsed tree and returns candidate
    /// nodes in document order.
    fn find<'t>(&self, tree: &'t Tree, pattern: &TsQuery, source: &str) -> Vec<Node<'t>> {
        let mut cursor = QueryCursor::new();
        let source_bytes = source.as_bytes();
        let mut nodes = Vec::new();

        let mut matches = cursor.matches(pattern, tree.root_node(), source_bytes);
        while let Some(query_match) = matches.next() {
            for capture in query_match.captures {
                nodes.push(capture.node);
            }
        }

        // Document order: pre-order means outer nodes before inner ones.
        nodes.sort_by(|a, b| {
            a.start_byte()
                .cmp(&b.start_byte())
                .then(b.end_byte().cmp(&a.end_byte()))
        });
        nodes.dedup_by(|a, b| a.id() == b.id());
        nodes
    }

    /// Classifies a node into the engine's kind vocabulary.
    fn node_kind(&self, node: &Node) -> Option<NodeKind>;

    /// Whether a node can be read as the given kind. The default accepts
    /// only the primary classification; providers with overlapping kinds
    /// (e.g. constants expressed as assignments) widen this.
    fn node_matches_kind(&self, node: &Node, kind: NodeKind, source: &str) -> bool {
        let _ = source;
        self.node_kind(node) == Some(kind)
    }

    /// The declared name of a node, when it has one.
    fn node_name(&self, node: &Node, source: &str) -> Option<String>;

    /// Provider-defined attributes of a node (`exported`, `receiver`, ...).
    fn node_attributes(&self, node: &Node, source: &str) -> BTreeMap<String, String>;

    /// Byte and line extent of a node. Lines are 1-based.
    fn node_range(&self, node: &Node) -> (usize, usize, usize, usize) {
        (
            node.start_byte(),
            node.end_byte(),
            node.start_position().row + 1,
            node.end_position().row + 1,
        )
    }

    /// Whether nodes of this kind occupy whole lines (declarations,
    /// blocks), which affects deletion and insertion spacing.
    fn is_block_level(&self, kind: NodeKind) -> bool {
        matches!(
            kind,
            NodeKind::Function
                | NodeKind::Method
                | NodeKind::Class
                | NodeKind::Struct
                | NodeKind::Interface
                | NodeKind::Block
                | NodeKind::Import
        )
    }

    /// Byte offset just before the closing delimiter of the node's body,
    /// where appended statements go. `None` when the node has no body.
    fn body_insertion_point(&self, node: &Node) -> Option<usize>;

    /// Fast syntax validation of (modified) source. The default reports
    /// tree-sitter ERROR and MISSING nodes as error diagnostics.
    fn quick_check(&self, source: &str) -> Result<Vec<Diagnostic>> {
        let tree = self.parse(source)?;
        let mut diagnostics = Vec::new();
        collect_syntax_errors(tree.root_node(), &mut diagnostics);
        Ok(diagnostics)
    }

    /// Globs and symbol prefixes that scans of this language skip by
    /// default.
    fn default_ignore_patterns(&self) -> (&'static [&'static str], &'static [&'static str]) {
        (&[], &[])
    }

    /// Checks if this provider handles the given file extension.
    fn matches_extension(&self, ext: &str) -> bool {
        self.extensions()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext))
    }
}

fn collect_syntax_errors(node: Node, out: &mut Vec<Diagnostic>) {
    if node.is_error() || node.is_missing() {
        let what = if node.is_missing() { "missing" } else { "invalid" };
        out.push(Diagnostic {
            severity: Severity::Error,
            message: format!("{what} syntax near byte {}", node.start_byte()),
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            line: node.start_position().row + 1,
        });
        return;
    }
    if !node.has_error() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_syntax_errors(child, out);
    }
}

/// Registry of supported languages.
#[derive(Default)]
pub struct LanguageRegistry {
    providers: Vec<Box<dyn LanguageProvider>>,
}

impl LanguageRegistry {
    /// Creates a new registry with all built-in providers.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(Go));
        registry.register(Box::new(Rust));
        registry.register(Box::new(TypeScript));
        registry.register(Box::new(Python));
        registry
    }

    /// Registers an additional provider.
    pub fn register(&mut self, provider: Box<dyn LanguageProvider>) {
        self.providers.push(provider);
    }

    /// Finds a provider by file extension.
    pub fn by_extension(&self, ext: &str) -> Option<&dyn LanguageProvider> {
        self.providers
            .iter()
            .find(|p| p.matches_extension(ext))
            .map(|p| p.as_ref())
    }

    /// Finds a provider by canonical name or alias.
    pub fn by_name(&self, name: &str) -> Option<&dyn LanguageProvider> {
        self.providers
            .iter()
            .find(|p| {
                p.canonical_name().eq_ignore_ascii_case(name)
                    || p.aliases().iter().any(|a| a.eq_ignore_ascii_case(name))
            })
            .map(|p| p.as_ref())
    }

    /// Detects the provider for a given file path.
    pub fn detect(&self, path: &Path) -> Option<&dyn LanguageProvider> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.by_extension(ext))
    }

    /// Returns all registered providers.
    pub fn all(&self) -> &[Box<dyn LanguageProvider>] {
        &self.providers
    }
}

type CacheKey = (String, String, u32);

/// Compiled-pattern cache shared across workers.
///
/// Entries are immutable once inserted; the first compiler wins and later
/// callers reuse its result. The cache is owned by the dispatcher and
/// threaded into the matcher explicitly.
#[derive(Default)]
pub struct PatternCache {
    entries: RwLock<HashMap<CacheKey, Arc<TsQuery>>>,
}

impl PatternCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled pattern for `query` under `provider`, compiling
    /// and caching it on first use. `None` when the language has no
    /// representation for the query's kind.
    pub fn get_or_compile(
        &self,
        provider: &dyn LanguageProvider,
        query: &Query,
    ) -> Result<Option<Arc<TsQuery>>> {
        let Some(pattern) = provider.translate_query(query)? else {
            return Ok(None);
        };

        let key: CacheKey = (
            provider.canonical_name().to_string(),
            query.canonical(),
            provider.provider_version(),
        );

        {
            let entries = self
                .entries
                .read()
                .map_err(|_| MorfxError::StoreFailed("pattern cache poisoned".into()))?;
            if let Some(compiled) = entries.get(&key) {
                return Ok(Some(Arc::clone(compiled)));
            }
        }

        let compiled = Arc::new(provider.compile_pattern(&pattern)?);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MorfxError::StoreFailed("pattern cache poisoned".into()))?;
        let entry = entries.entry(key).or_insert(compiled);
        Ok(Some(Arc::clone(entry)))
    }

    /// Number of cached patterns.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// True when nothing has been compiled yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returns the text of a node's field, when present.
pub(crate) fn field_text(node: &Node, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .and_then(|n| n.utf8_text(source.as_bytes()).ok())
        .map(|s| s.to_string())
}

/// Finds the first named descendant (breadth-first) with one of the given
/// grammar types.
pub(crate) fn first_descendant_of_type<'t>(
    node: &Node<'t>,
    types: &[&str],
) -> Option<Node<'t>> {
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(*node);
    while let Some(current) = queue.pop_front() {
        if current.id() != node.id() && types.contains(&current.kind()) {
            return Some(current);
        }
        let mut cursor = current.walk();
        for child in current.named_children(&mut cursor) {
            queue.push_back(child);
        }
    }
    None
}

/// Walks ancestors until one of the given grammar types is found.
pub(crate) fn nearest_ancestor_of_type<'t>(
    node: &Node<'t>,
    types: &[&str],
) -> Option<Node<'t>> {
    let mut current = node.parent();
    while let Some(parent) = current {
        if types.contains(&parent.kind()) {
            return Some(parent);
        }
        current = parent.parent();
    }
    None
}

/// Strips matching quotes from a string literal's text.
pub(crate) fn unquote(text: &str) -> String {
    let trimmed = text.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'' || first == b'`') {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}
