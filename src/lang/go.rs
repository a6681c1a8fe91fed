//! Go language support.

use super::{LanguageProvider, field_text, first_descendant_of_type, unquote};
use crate::error::Result;
use crate::query::{NodeKind, Query};
use std::collections::BTreeMap;
use tree_sitter::{Language as TsLanguage, Node};

/// Go programming language.
pub struct Go;

impl LanguageProvider for Go {
    fn canonical_name(&self) -> &'static str {
        "go"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["golang"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn grammar(&self) -> TsLanguage {
        tree_sitter_go::LANGUAGE.into()
    }

    fn kind_node_types(&self, kind: NodeKind) -> &'static [&'static str] {
        match kind {
            NodeKind::Function => &["function_declaration"],
            NodeKind::Method => &["method_declaration"],
            NodeKind::Class => &[],
            NodeKind::Struct | NodeKind::Interface => &["type_spec"],
            NodeKind::Variable => &["var_declaration", "short_var_declaration"],
            NodeKind::Constant => &["const_declaration"],
            NodeKind::Field => &["field_declaration"],
            NodeKind::Call => &["call_expression"],
            NodeKind::Import => &["import_declaration"],
            NodeKind::Block => &["block"],
            NodeKind::Assignment => &["assignment_statement"],
        }
    }

    fn translate_query(&self, query: &Query) -> Result<Option<String>> {
        // type_spec hosts both structs and interfaces; narrow by body type.
        match query.kind {
            NodeKind::Struct => Ok(Some("(type_spec type: (struct_type)) @target".to_string())),
            NodeKind::Interface => {
                Ok(Some("(type_spec type: (interface_type)) @target".to_string()))
            }
            _ => {
                let types = self.kind_node_types(query.kind);
                if types.is_empty() {
                    return Ok(None);
                }
                let pattern: Vec<String> =
                    types.iter().map(|t| format!("({t}) @target")).collect();
                Ok(Some(pattern.join("\n")))
            }
        }
    }

    fn node_kind(&self, node: &Node) -> Option<NodeKind> {
        match node.kind() {
            "function_declaration" => Some(NodeKind::Function),
            "method_declaration" => Some(NodeKind::Method),
            "type_spec" => match node.child_by_field_name("type").map(|t| t.kind()) {
                Some("struct_type") => Some(NodeKind::Struct),
                Some("interface_type") => Some(NodeKind::Interface),
                _ => None,
            },
            "var_declaration" | "short_var_declaration" => Some(NodeKind::Variable),
            "const_declaration" => Some(NodeKind::Constant),
            "field_declaration" => Some(NodeKind::Field),
            "call_expression" => Some(NodeKind::Call),
            "import_declaration" => Some(NodeKind::Import),
            "block" => Some(NodeKind::Block),
            "assignment_statement" => Some(NodeKind::Assignment),
            _ => None,
        }
    }

    fn node_name(&self, node: &Node, source: &str) -> Option<String> {
        match node.kind() {
            "function_declaration" | "method_declaration" | "type_spec" => {
                field_text(node, "name", source)
            }
            "var_declaration" => first_descendant_of_type(node, &["var_spec"])
                .and_then(|spec| field_text(&spec, "name", source)),
            "const_declaration" => first_descendant_of_type(node, &["const_spec"])
                .and_then(|spec| field_text(&spec, "name", source)),
            "short_var_declaration" | "assignment_statement" => node
                .child_by_field_name("left")
                .and_then(|left| first_identifier_text(&left, source)),
            "field_declaration" => field_text(node, "name", source)
                .or_else(|| first_identifier_text(node, source)),
            "call_expression" => field_text(node, "function", source),
            "import_declaration" => first_descendant_of_type(node, &["import_spec"])
                .and_then(|spec| field_text(&spec, "path", source))
                .map(|path| unquote(&path)),
            _ => None,
        }
    }

    fn node_attributes(&self, node: &Node, source: &str) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();

        if let Some(name) = self.node_name(node, source) {
            let exported = name.chars().next().is_some_and(|c| c.is_uppercase());
            attrs.insert("exported".to_string(), exported.to_string());
        }

        if node.kind() == "method_declaration" {
            if let Some(receiver_type) = node
                .child_by_field_name("receiver")
                .and_then(|r| first_descendant_of_type(&r, &["parameter_declaration"]))
                .and_then(|p| field_text(&p, "type", source))
            {
                attrs.insert("receiver".to_string(), receiver_type);
            }
        }

        attrs
    }

    fn body_insertion_point(&self, node: &Node) -> Option<usize> {
        match node.kind() {
            "function_declaration" | "method_declaration" => node
                .child_by_field_name("body")
                .map(|body| body.end_byte().saturating_sub(1)),
            "type_spec" => node.child_by_field_name("type").and_then(|t| match t.kind() {
                "struct_type" => first_descendant_of_type(&t, &["field_declaration_list"])
                    .map(|list| list.end_byte().saturating_sub(1)),
                "interface_type" => Some(t.end_byte().saturating_sub(1)),
                _ => None,
            }),
            "block" => Some(node.end_byte().saturating_sub(1)),
            _ => None,
        }
    }

    fn default_ignore_patterns(&self) -> (&'static [&'static str], &'static [&'static str]) {
        (&["vendor/**"], &["_"])
    }
}

fn first_identifier_text(node: &Node, source: &str) -> Option<String> {
    if node.kind() == "identifier" || node.kind() == "field_identifier" {
        return node.utf8_text(source.as_bytes()).ok().map(str::to_string);
    }
    first_descendant_of_type(node, &["identifier", "field_identifier"])
        .and_then(|n| n.utf8_text(source.as_bytes()).ok().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::PatternCache;

    const SAMPLE: &str = r#"package p

import "fmt"

type User struct {
    Name string
}

type Store interface {
    Get(id int) User
}

func GetUser(id int) User {
    u := User{}
    fmt.Println(u)
    return u
}

func (s *Server) Handle() {
    count = count + 1
}
"#;

    fn find_first<'t>(
        tree: &'t tree_sitter::Tree,
        kind: NodeKind,
    ) -> Option<tree_sitter::Node<'t>> {
        let cache = PatternCache::new();
        let pattern = cache.get_or_compile(&Go, &Query::of(kind)).unwrap()?;
        Go.find(tree, &pattern, SAMPLE).into_iter().next()
    }

    #[test]
    fn test_function_classification_and_name() {
        let tree = Go.parse(SAMPLE).unwrap();
        let node = find_first(&tree, NodeKind::Function).unwrap();
        assert_eq!(Go.node_kind(&node), Some(NodeKind::Function));
        assert_eq!(Go.node_name(&node, SAMPLE).as_deref(), Some("GetUser"));
    }

    #[test]
    fn test_method_receiver_attribute() {
        let tree = Go.parse(SAMPLE).unwrap();
        let node = find_first(&tree, NodeKind::Method).unwrap();
        assert_eq!(Go.node_name(&node, SAMPLE).as_deref(), Some("Handle"));
        let attrs = Go.node_attributes(&node, SAMPLE);
        assert_eq!(attrs.get("receiver").map(String::as_str), Some("*Server"));
        assert_eq!(attrs.get("exported").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_struct_vs_interface() {
        let tree = Go.parse(SAMPLE).unwrap();
        let s = find_first(&tree, NodeKind::Struct).unwrap();
        assert_eq!(Go.node_kind(&s), Some(NodeKind::Struct));
        assert_eq!(Go.node_name(&s, SAMPLE).as_deref(), Some("User"));

        let i = find_first(&tree, NodeKind::Interface).unwrap();
        assert_eq!(Go.node_kind(&i), Some(NodeKind::Interface));
        assert_eq!(Go.node_name(&i, SAMPLE).as_deref(), Some("Store"));
    }

    #[test]
    fn test_call_name_includes_package() {
        let tree = Go.parse(SAMPLE).unwrap();
        let call = find_first(&tree, NodeKind::Call).unwrap();
        assert_eq!(Go.node_name(&call, SAMPLE).as_deref(), Some("fmt.Println"));
    }

    #[test]
    fn test_import_name_is_unquoted() {
        let tree = Go.parse(SAMPLE).unwrap();
        let import = find_first(&tree, NodeKind::Import).unwrap();
        assert_eq!(Go.node_name(&import, SAMPLE).as_deref(), Some("fmt"));
    }

    #[test]
    fn test_short_var_and_assignment() {
        let tree = Go.parse(SAMPLE).unwrap();
        let var = find_first(&tree, NodeKind::Variable).unwrap();
        assert_eq!(Go.node_name(&var, SAMPLE).as_deref(), Some("u"));

        let assign = find_first(&tree, NodeKind::Assignment).unwrap();
        assert_eq!(Go.node_name(&assign, SAMPLE).as_deref(), Some("count"));
    }

    #[test]
    fn test_body_insertion_point_is_before_closing_brace() {
        let tree = Go.parse(SAMPLE).unwrap();
        let node = find_first(&tree, NodeKind::Function).unwrap();
        let point = Go.body_insertion_point(&node).unwrap();
        assert_eq!(&SAMPLE[point..point + 1], "}");
    }

    #[test]
    fn test_unexported_name() {
        let source = "package p\nfunc helper() {}\n";
        let tree = Go.parse(source).unwrap();
        let cache = PatternCache::new();
        let pattern = cache
            .get_or_compile(&Go, &Query::of(NodeKind::Function))
            .unwrap()
            .unwrap();
        let node = Go.find(&tree, &pattern, source).into_iter().next().unwrap();
        let attrs = Go.node_attributes(&node, source);
        assert_eq!(attrs.get("exported").map(String::as_str), Some("false"));
    }
}
