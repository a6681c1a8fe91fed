//! Rust language support.

use super::{LanguageProvider, field_text, first_descendant_of_type, nearest_ancestor_of_type};
use crate::query::NodeKind;
use std::collections::BTreeMap;
use tree_sitter::{Language as TsLanguage, Node};

/// Rust programming language.
pub struct Rust;

impl LanguageProvider for Rust {
    fn canonical_name(&self) -> &'static str {
        "rust"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn grammar(&self) -> TsLanguage {
        tree_sitter_rust::LANGUAGE.into()
    }

    fn kind_node_types(&self, kind: NodeKind) -> &'static [&'static str] {
        match kind {
            NodeKind::Function | NodeKind::Method => &["function_item"],
            NodeKind::Class => &[],
            NodeKind::Struct => &["struct_item"],
            NodeKind::Interface => &["trait_item"],
            NodeKind::Variable => &["let_declaration"],
            NodeKind::Constant => &["const_item", "static_item"],
            NodeKind::Field => &["field_declaration"],
            NodeKind::Call => &["call_expression"],
            NodeKind::Import => &["use_declaration"],
            NodeKind::Block => &["block"],
            NodeKind::Assignment => &["assignment_expression"],
        }
    }

    fn node_kind(&self, node: &Node) -> Option<NodeKind> {
        match node.kind() {
            "function_item" => {
                // A function inside an impl or trait block is a method;
                // a fn nested in another fn stays a function.
                match nearest_ancestor_of_type(
                    node,
                    &["impl_item", "trait_item", "function_item"],
                ) {
                    Some(ancestor) if ancestor.kind() != "function_item" => {
                        Some(NodeKind::Method)
                    }
                    _ => Some(NodeKind::Function),
                }
            }
            "struct_item" => Some(NodeKind::Struct),
            "trait_item" => Some(NodeKind::Interface),
            "let_declaration" => Some(NodeKind::Variable),
            "const_item" | "static_item" => Some(NodeKind::Constant),
            "field_declaration" => Some(NodeKind::Field),
            "call_expression" => Some(NodeKind::Call),
            "use_declaration" => Some(NodeKind::Import),
            "block" => Some(NodeKind::Block),
            "assignment_expression" => Some(NodeKind::Assignment),
            _ => None,
        }
    }

    fn node_name(&self, node: &Node, source: &str) -> Option<String> {
        match node.kind() {
            "function_item" | "struct_item" | "trait_item" | "const_item" | "static_item"
            | "field_declaration" => field_text(node, "name", source),
            "let_declaration" => field_text(node, "pattern", source),
            "call_expression" => field_text(node, "function", source),
            "use_declaration" => field_text(node, "argument", source),
            "assignment_expression" => field_text(node, "left", source),
            _ => None,
        }
    }

    fn node_attributes(&self, node: &Node, source: &str) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();

        let mut cursor = node.walk();
        let mut exported = false;
        let mut is_async = false;
        for child in node.children(&mut cursor) {
            match child.kind() {
                "visibility_modifier" => exported = true,
                "function_modifiers" => {
                    if let Ok(text) = child.utf8_text(source.as_bytes()) {
                        is_async = text.contains("async");
                    }
                }
                _ => {}
            }
        }

        if self.node_kind(node).is_some_and(|k| {
            matches!(
                k,
                NodeKind::Function
                    | NodeKind::Method
                    | NodeKind::Struct
                    | NodeKind::Interface
                    | NodeKind::Constant
                    | NodeKind::Field
            )
        }) {
            attrs.insert("exported".to_string(), exported.to_string());
        }
        if node.kind() == "function_item" {
            attrs.insert("async".to_string(), is_async.to_string());
        }

        attrs
    }

    fn body_insertion_point(&self, node: &Node) -> Option<usize> {
        match node.kind() {
            "function_item" => node
                .child_by_field_name("body")
                .map(|body| body.end_byte().saturating_sub(1)),
            "struct_item" => first_descendant_of_type(node, &["field_declaration_list"])
                .map(|list| list.end_byte().saturating_sub(1)),
            "trait_item" | "impl_item" => {
                first_descendant_of_type(node, &["declaration_list"])
                    .map(|list| list.end_byte().saturating_sub(1))
            }
            "block" => Some(node.end_byte().saturating_sub(1)),
            _ => None,
        }
    }

    fn default_ignore_patterns(&self) -> (&'static [&'static str], &'static [&'static str]) {
        (&["target/**"], &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::PatternCache;
    use crate::query::Query;

    const SAMPLE: &str = r#"
use std::fmt;

pub struct Point {
    pub x: i32,
}

pub trait Shape {
    fn area(&self) -> f64;
}

impl Point {
    pub fn norm(&self) -> f64 {
        let sum = (self.x * self.x) as f64;
        sum.sqrt()
    }
}

fn helper() {
    print(1);
}
"#;

    fn all_of(kind: NodeKind, source: &str) -> Vec<(NodeKind, Option<String>)> {
        let tree = Rust.parse(source).unwrap();
        let cache = PatternCache::new();
        let Some(pattern) = cache.get_or_compile(&Rust, &Query::of(kind)).unwrap() else {
            return Vec::new();
        };
        Rust.find(&tree, &pattern, source)
            .into_iter()
            .filter_map(|node| {
                Rust.node_kind(&node)
                    .map(|k| (k, Rust.node_name(&node, source)))
            })
            .collect()
    }

    #[test]
    fn test_function_vs_method() {
        let results = all_of(NodeKind::Function, SAMPLE);
        // Both function_items are found; classification splits them.
        let methods: Vec<_> = results
            .iter()
            .filter(|(k, _)| *k == NodeKind::Method)
            .collect();
        let functions: Vec<_> = results
            .iter()
            .filter(|(k, _)| *k == NodeKind::Function)
            .collect();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].1.as_deref(), Some("norm"));
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].1.as_deref(), Some("helper"));
    }

    #[test]
    fn test_struct_and_trait_names() {
        let structs = all_of(NodeKind::Struct, SAMPLE);
        assert_eq!(structs[0].1.as_deref(), Some("Point"));

        let traits = all_of(NodeKind::Interface, SAMPLE);
        assert_eq!(traits[0].1.as_deref(), Some("Shape"));
    }

    #[test]
    fn test_visibility_attribute() {
        let tree = Rust.parse(SAMPLE).unwrap();
        let cache = PatternCache::new();
        let pattern = cache
            .get_or_compile(&Rust, &Query::of(NodeKind::Struct))
            .unwrap()
            .unwrap();
        let node = Rust.find(&tree, &pattern, SAMPLE).into_iter().next().unwrap();
        let attrs = Rust.node_attributes(&node, SAMPLE);
        assert_eq!(attrs.get("exported").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_import_and_call_names() {
        let imports = all_of(NodeKind::Import, SAMPLE);
        assert_eq!(imports[0].1.as_deref(), Some("std::fmt"));

        let calls = all_of(NodeKind::Call, SAMPLE);
        let names: Vec<_> = calls.iter().filter_map(|(_, n)| n.as_deref()).collect();
        assert!(names.contains(&"print"));
    }

    #[test]
    fn test_body_insertion_point() {
        let tree = Rust.parse(SAMPLE).unwrap();
        let cache = PatternCache::new();
        let pattern = cache
            .get_or_compile(&Rust, &Query::of(NodeKind::Function))
            .unwrap()
            .unwrap();
        for node in Rust.find(&tree, &pattern, SAMPLE) {
            if Rust.node_name(&node, SAMPLE).as_deref() == Some("helper") {
                let point = Rust.body_insertion_point(&node).unwrap();
                assert_eq!(&SAMPLE[point..point + 1], "}");
                return;
            }
        }
        panic!("helper not found");
    }
}
