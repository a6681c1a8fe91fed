//! The query model: language-agnostic node kinds, predicate trees, and the
//! free-text surface syntax.

pub mod parser;

pub use parser::parse;

use crate::error::{MorfxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Language-agnostic category of an AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Function,
    Method,
    Class,
    Struct,
    Interface,
    Variable,
    Constant,
    Field,
    Call,
    Import,
    Block,
    Assignment,
}

impl NodeKind {
    /// All supported kinds, in declaration order.
    pub const ALL: [NodeKind; 12] = [
        NodeKind::Function,
        NodeKind::Method,
        NodeKind::Class,
        NodeKind::Struct,
        NodeKind::Interface,
        NodeKind::Variable,
        NodeKind::Constant,
        NodeKind::Field,
        NodeKind::Call,
        NodeKind::Import,
        NodeKind::Block,
        NodeKind::Assignment,
    ];

    /// The canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Function => "function",
            NodeKind::Method => "method",
            NodeKind::Class => "class",
            NodeKind::Struct => "struct",
            NodeKind::Interface => "interface",
            NodeKind::Variable => "variable",
            NodeKind::Constant => "constant",
            NodeKind::Field => "field",
            NodeKind::Call => "call",
            NodeKind::Import => "import",
            NodeKind::Block => "block",
            NodeKind::Assignment => "assignment",
        }
    }

    /// Parses a kind name, accepting the short aliases used in the
    /// free-text syntax (`func`, `fn`, `var`, `const`).
    pub fn parse(name: &str) -> Result<Self> {
        let kind = match name {
            "function" | "func" | "fn" => NodeKind::Function,
            "method" => NodeKind::Method,
            "class" => NodeKind::Class,
            "struct" => NodeKind::Struct,
            "interface" => NodeKind::Interface,
            "variable" | "var" => NodeKind::Variable,
            "constant" | "const" => NodeKind::Constant,
            "field" => NodeKind::Field,
            "call" => NodeKind::Call,
            "import" => NodeKind::Import,
            "block" => NodeKind::Block,
            "assignment" | "assign" => NodeKind::Assignment,
            other => return Err(MorfxError::BadQuery(format!("unknown kind '{other}'"))),
        };
        Ok(kind)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a list of sibling predicates combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

/// A predicate over AST nodes.
///
/// `children` are descendant constraints: the node matches when, per the
/// combinator, its subtree contains matches for the child queries. `negated`
/// inverts the name/attribute/children test; the kind always selects the
/// candidate set so mutating operations stay bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Query>,
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default)]
    pub negated: bool,
}

impl Query {
    /// Creates a bare predicate for a kind.
    pub fn of(kind: NodeKind) -> Self {
        Self {
            kind,
            name: None,
            attributes: BTreeMap::new(),
            children: Vec::new(),
            combinator: Combinator::And,
            negated: false,
        }
    }

    /// Adds a name matcher; glob-style with `*` and `?`, case-sensitive.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an attribute equality constraint (values may be globs).
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds a descendant constraint.
    pub fn child(mut self, child: Query) -> Self {
        self.children.push(child);
        self
    }

    /// Sets how the children list combines.
    pub fn combine(mut self, combinator: Combinator) -> Self {
        self.combinator = combinator;
        self
    }

    /// Inverts the predicate.
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Deterministic textual form, used as the pattern-cache key. Two
    /// structurally equal queries produce the same string.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if self.negated {
            out.push('!');
        }
        out.push_str(self.kind.as_str());
        if let Some(name) = &self.name {
            out.push(':');
            out.push_str(name);
        }
        if !self.attributes.is_empty() {
            out.push('[');
            let mut first = true;
            for (key, value) in &self.attributes {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(key);
                out.push('=');
                out.push_str(value);
            }
            out.push(']');
        }
        if !self.children.is_empty() {
            let joiner = match self.combinator {
                Combinator::And => "&&",
                Combinator::Or => "||",
            };
            out.push_str(">(");
            let parts: Vec<String> = self.children.iter().map(|c| c.canonical()).collect();
            out.push_str(&parts.join(joiner));
            out.push(')');
        }
        out
    }
}

/// A full query expression: a predicate, or a combination of expressions
/// whose match sets intersect (`&&`) or union (`||`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryExpr {
    Leaf(Query),
    Group {
        #[serde(rename = "combinator")]
        op: Combinator,
        terms: Vec<QueryExpr>,
    },
}

impl QueryExpr {
    /// Deterministic textual form of the whole expression.
    pub fn canonical(&self) -> String {
        match self {
            QueryExpr::Leaf(query) => query.canonical(),
            QueryExpr::Group { op, terms } => {
                let joiner = match op {
                    Combinator::And => " && ",
                    Combinator::Or => " || ",
                };
                let parts: Vec<String> = terms.iter().map(|t| t.canonical()).collect();
                format!("({})", parts.join(joiner))
            }
        }
    }
}

impl From<Query> for QueryExpr {
    fn from(query: Query) -> Self {
        QueryExpr::Leaf(query)
    }
}

/// Matches `name` against a glob `pattern`.
///
/// `*` matches any run of non-`/` characters, `?` matches exactly one
/// non-`/` character. Matching is case-sensitive.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = name.chars().collect();

    let mut pi = 0;
    let mut ti = 0;
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti] || (p[pi] == '?' && t[ti] != '/')) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi + 1, ti));
            pi += 1;
        } else if let Some((bp, bt)) = backtrack {
            if bt >= t.len() || t[bt] == '/' {
                return false;
            }
            backtrack = Some((bp, bt + 1));
            pi = bp;
            ti = bt + 1;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_and_aliases() {
        assert_eq!(NodeKind::parse("function").unwrap(), NodeKind::Function);
        assert_eq!(NodeKind::parse("func").unwrap(), NodeKind::Function);
        assert_eq!(NodeKind::parse("fn").unwrap(), NodeKind::Function);
        assert_eq!(NodeKind::parse("const").unwrap(), NodeKind::Constant);
        assert!(NodeKind::parse("enum").is_err());
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("Get*", "GetUser"));
        assert!(glob_match("Get*", "Get"));
        assert!(glob_match("*User", "GetUser"));
        assert!(glob_match("G*t*r", "GetUser"));
        assert!(!glob_match("Get*", "SetUser"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("Get?ser", "GetUser"));
        assert!(!glob_match("Get?", "GetUser"));
        assert!(!glob_match("?", ""));
    }

    #[test]
    fn test_glob_is_case_sensitive() {
        assert!(!glob_match("get*", "GetUser"));
        assert!(glob_match("GetUser", "GetUser"));
    }

    #[test]
    fn test_glob_does_not_cross_slashes() {
        assert!(!glob_match("fmt*", "fmt/Println"));
        assert!(glob_match("fmt.*", "fmt.Println"));
        assert!(!glob_match("?", "/"));
    }

    #[test]
    fn test_glob_empty_pattern() {
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn test_canonical_is_deterministic() {
        let a = Query::of(NodeKind::Function)
            .named("Get*")
            .attr("exported", "true")
            .attr("async", "false");
        let b = Query::of(NodeKind::Function)
            .named("Get*")
            .attr("async", "false")
            .attr("exported", "true");
        // BTreeMap ordering makes attribute insertion order irrelevant.
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), "function:Get*[async=false,exported=true]");
    }

    #[test]
    fn test_canonical_children_and_negation() {
        let query = Query::of(NodeKind::Function)
            .named("Get*")
            .child(Query::of(NodeKind::Call).named("fmt.Println"))
            .negate();
        assert_eq!(query.canonical(), "!function:Get*>(call:fmt.Println)");
    }

    #[test]
    fn test_structured_deserialization_defaults() {
        let query: Query =
            serde_json::from_str(r#"{"kind": "function", "name": "Get*"}"#).unwrap();
        assert_eq!(query.kind, NodeKind::Function);
        assert_eq!(query.name.as_deref(), Some("Get*"));
        assert!(!query.negated);
        assert!(query.children.is_empty());
        assert_eq!(query.combinator, Combinator::And);
    }
}
