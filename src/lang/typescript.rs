//! TypeScript and JavaScript language support.

use super::{LanguageProvider, field_text, first_descendant_of_type, unquote};
use crate::query::NodeKind;
use std::collections::BTreeMap;
use tree_sitter::{Language as TsLanguage, Node};

/// TypeScript programming language.
pub struct TypeScript;

impl LanguageProvider for TypeScript {
    fn canonical_name(&self) -> &'static str {
        "typescript"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["ts", "javascript", "js"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "js", "jsx", "mjs", "cjs"]
    }

    fn grammar(&self) -> TsLanguage {
        tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
    }

    fn kind_node_types(&self, kind: NodeKind) -> &'static [&'static str] {
        match kind {
            NodeKind::Function => &["function_declaration"],
            NodeKind::Method => &["method_definition"],
            NodeKind::Class => &["class_declaration"],
            NodeKind::Struct => &[],
            NodeKind::Interface => &["interface_declaration"],
            NodeKind::Variable => &["lexical_declaration", "variable_declaration"],
            NodeKind::Constant => &["lexical_declaration"],
            NodeKind::Field => &["public_field_definition"],
            NodeKind::Call => &["call_expression"],
            NodeKind::Import => &["import_statement"],
            NodeKind::Block => &["statement_block"],
            NodeKind::Assignment => &["assignment_expression"],
        }
    }

    fn node_kind(&self, node: &Node) -> Option<NodeKind> {
        match node.kind() {
            "function_declaration" => Some(NodeKind::Function),
            "method_definition" => Some(NodeKind::Method),
            "class_declaration" => Some(NodeKind::Class),
            "interface_declaration" => Some(NodeKind::Interface),
            "lexical_declaration" => {
                if is_const_declaration(node) {
                    Some(NodeKind::Constant)
                } else {
                    Some(NodeKind::Variable)
                }
            }
            "variable_declaration" => Some(NodeKind::Variable),
            "public_field_definition" => Some(NodeKind::Field),
            "call_expression" => Some(NodeKind::Call),
            "import_statement" => Some(NodeKind::Import),
            "statement_block" => Some(NodeKind::Block),
            "assignment_expression" => Some(NodeKind::Assignment),
            _ => None,
        }
    }

    fn node_matches_kind(&self, node: &Node, kind: NodeKind, _source: &str) -> bool {
        // `const` declarations satisfy both constant and variable queries.
        if kind == NodeKind::Variable && node.kind() == "lexical_declaration" {
            return true;
        }
        self.node_kind(node) == Some(kind)
    }

    fn node_name(&self, node: &Node, source: &str) -> Option<String> {
        match node.kind() {
            "function_declaration"
            | "method_definition"
            | "class_declaration"
            | "interface_declaration" => field_text(node, "name", source),
            "lexical_declaration" | "variable_declaration" => {
                first_descendant_of_type(node, &["variable_declarator"])
                    .and_then(|decl| field_text(&decl, "name", source))
            }
            "public_field_definition" => field_text(node, "name", source),
            "call_expression" => field_text(node, "function", source),
            "import_statement" => field_text(node, "source", source).map(|s| unquote(&s)),
            "assignment_expression" => field_text(node, "left", source),
            _ => None,
        }
    }

    fn node_attributes(&self, node: &Node, _source: &str) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();

        if self.node_kind(node).is_some() && node.kind() != "statement_block" {
            let exported = node
                .parent()
                .is_some_and(|p| p.kind() == "export_statement");
            attrs.insert("exported".to_string(), exported.to_string());
        }

        if matches!(node.kind(), "function_declaration" | "method_definition") {
            let mut cursor = node.walk();
            let is_async = node.children(&mut cursor).any(|c| c.kind() == "async");
            attrs.insert("async".to_string(), is_async.to_string());
        }

        attrs
    }

    fn body_insertion_point(&self, node: &Node) -> Option<usize> {
        match node.kind() {
            "function_declaration" | "method_definition" => node
                .child_by_field_name("body")
                .map(|body| body.end_byte().saturating_sub(1)),
            "class_declaration" | "interface_declaration" => node
                .child_by_field_name("body")
                .map(|body| body.end_byte().saturating_sub(1)),
            "statement_block" => Some(node.end_byte().saturating_sub(1)),
            _ => None,
        }
    }

    fn default_ignore_patterns(&self) -> (&'static [&'static str], &'static [&'static str]) {
        (&["node_modules/**", "dist/**", "build/**"], &[])
    }
}

fn is_const_declaration(node: &Node) -> bool {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .next()
        .is_some_and(|c| c.kind() == "const")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::PatternCache;
    use crate::query::Query;

    const SAMPLE: &str = r#"
import { api } from "./api";

export class Widget {
    label = "w";

    render(): void {
        api.draw(this.label);
    }
}

export interface Drawable {
    draw(): void;
}

function helper() {
    const limit = 3;
    let count = 0;
    count = count + 1;
}
"#;

    fn first_of<'t>(
        tree: &'t tree_sitter::Tree,
        kind: NodeKind,
        source: &str,
    ) -> Option<tree_sitter::Node<'t>> {
        let cache = PatternCache::new();
        let pattern = cache.get_or_compile(&TypeScript, &Query::of(kind)).unwrap()?;
        TypeScript.find(tree, &pattern, source).into_iter().next()
    }

    #[test]
    fn test_class_and_method() {
        let tree = TypeScript.parse(SAMPLE).unwrap();
        let class = first_of(&tree, NodeKind::Class, SAMPLE).unwrap();
        assert_eq!(TypeScript.node_name(&class, SAMPLE).as_deref(), Some("Widget"));
        let attrs = TypeScript.node_attributes(&class, SAMPLE);
        assert_eq!(attrs.get("exported").map(String::as_str), Some("true"));

        let method = first_of(&tree, NodeKind::Method, SAMPLE).unwrap();
        assert_eq!(TypeScript.node_name(&method, SAMPLE).as_deref(), Some("render"));
    }

    #[test]
    fn test_const_vs_let() {
        let tree = TypeScript.parse(SAMPLE).unwrap();

        let constant = first_of(&tree, NodeKind::Constant, SAMPLE).unwrap();
        assert_eq!(TypeScript.node_kind(&constant), Some(NodeKind::Constant));
        assert_eq!(TypeScript.node_name(&constant, SAMPLE).as_deref(), Some("limit"));
        // A const declaration still satisfies a variable query.
        assert!(TypeScript.node_matches_kind(&constant, NodeKind::Variable, SAMPLE));
    }

    #[test]
    fn test_import_source() {
        let tree = TypeScript.parse(SAMPLE).unwrap();
        let import = first_of(&tree, NodeKind::Import, SAMPLE).unwrap();
        assert_eq!(
            TypeScript.node_name(&import, SAMPLE).as_deref(),
            Some("./api")
        );
    }

    #[test]
    fn test_call_and_assignment() {
        let tree = TypeScript.parse(SAMPLE).unwrap();
        let call = first_of(&tree, NodeKind::Call, SAMPLE).unwrap();
        assert_eq!(
            TypeScript.node_name(&call, SAMPLE).as_deref(),
            Some("api.draw")
        );

        let assign = first_of(&tree, NodeKind::Assignment, SAMPLE).unwrap();
        assert_eq!(TypeScript.node_name(&assign, SAMPLE).as_deref(), Some("count"));
    }

    #[test]
    fn test_interface_body_insertion() {
        let tree = TypeScript.parse(SAMPLE).unwrap();
        let iface = first_of(&tree, NodeKind::Interface, SAMPLE).unwrap();
        let point = TypeScript.body_insertion_point(&iface).unwrap();
        assert_eq!(&SAMPLE[point..point + 1], "}");
    }
}
