//! Python language support.

use super::{LanguageProvider, field_text, nearest_ancestor_of_type};
use crate::query::NodeKind;
use std::collections::BTreeMap;
use tree_sitter::{Language as TsLanguage, Node};

/// Python programming language.
pub struct Python;

impl LanguageProvider for Python {
    fn canonical_name(&self) -> &'static str {
        "python"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn grammar(&self) -> TsLanguage {
        tree_sitter_python::LANGUAGE.into()
    }

    fn kind_node_types(&self, kind: NodeKind) -> &'static [&'static str] {
        match kind {
            NodeKind::Function | NodeKind::Method => &["function_definition"],
            NodeKind::Class => &["class_definition"],
            NodeKind::Struct | NodeKind::Interface | NodeKind::Field => &[],
            NodeKind::Variable | NodeKind::Constant | NodeKind::Assignment => &["assignment"],
            NodeKind::Call => &["call"],
            NodeKind::Import => &["import_statement", "import_from_statement"],
            NodeKind::Block => &["block"],
        }
    }

    fn node_kind(&self, node: &Node) -> Option<NodeKind> {
        match node.kind() {
            "function_definition" => {
                // def inside a class body is a method; def inside another
                // def stays a function.
                match nearest_ancestor_of_type(
                    node,
                    &["class_definition", "function_definition"],
                ) {
                    Some(ancestor) if ancestor.kind() == "class_definition" => {
                        Some(NodeKind::Method)
                    }
                    _ => Some(NodeKind::Function),
                }
            }
            "class_definition" => Some(NodeKind::Class),
            "assignment" => Some(NodeKind::Assignment),
            "call" => Some(NodeKind::Call),
            "import_statement" | "import_from_statement" => Some(NodeKind::Import),
            "block" => Some(NodeKind::Block),
            _ => None,
        }
    }

    fn node_matches_kind(&self, node: &Node, kind: NodeKind, source: &str) -> bool {
        if node.kind() == "assignment" {
            return match kind {
                NodeKind::Assignment | NodeKind::Variable => true,
                // Python spells constants as SCREAMING_CASE module bindings.
                NodeKind::Constant => field_text(node, "left", source).is_some_and(|name| {
                    !name.is_empty()
                        && name
                            .chars()
                            .all(|c| c.is_uppercase() || c == '_' || c.is_ascii_digit())
                }),
                _ => false,
            };
        }
        self.node_kind(node) == Some(kind)
    }

    fn node_name(&self, node: &Node, source: &str) -> Option<String> {
        match node.kind() {
            "function_definition" | "class_definition" => field_text(node, "name", source),
            "assignment" => field_text(node, "left", source),
            "call" => field_text(node, "function", source),
            "import_statement" => field_text(node, "name", source),
            "import_from_statement" => field_text(node, "module_name", source),
            _ => None,
        }
    }

    fn node_attributes(&self, node: &Node, source: &str) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();

        if let Some(name) = self.node_name(node, source) {
            // Leading underscore is Python's convention for private names.
            let exported = !name.starts_with('_');
            attrs.insert("exported".to_string(), exported.to_string());
        }

        if node.kind() == "function_definition" {
            let mut cursor = node.walk();
            let is_async = node.children(&mut cursor).any(|c| c.kind() == "async");
            attrs.insert("async".to_string(), is_async.to_string());
        }

        attrs
    }

    fn is_block_level(&self, kind: NodeKind) -> bool {
        matches!(
            kind,
            NodeKind::Function
                | NodeKind::Method
                | NodeKind::Class
                | NodeKind::Block
                | NodeKind::Import
        )
    }

    fn body_insertion_point(&self, node: &Node) -> Option<usize> {
        // Python bodies have no closing delimiter; append at the block end.
        match node.kind() {
            "function_definition" | "class_definition" => {
                node.child_by_field_name("body").map(|body| body.end_byte())
            }
            "block" => Some(node.end_byte()),
            _ => None,
        }
    }

    fn default_ignore_patterns(&self) -> (&'static [&'static str], &'static [&'static str]) {
        (&["__pycache__/**", ".venv/**", "*.pyc"], &["_"])
    }
}
