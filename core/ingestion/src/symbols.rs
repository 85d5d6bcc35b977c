use memory_graph_schemas::{ParsedSymbol, SymbolKind};
use tracing::{debug, warn};
use tree_sitter::{Node, Parser};

use crate::error::{IngestError, Result};

/// Parses Python source into module- and class-level definitions.
///
/// Fails with `IngestError::Parse` when the syntax tree contains errors.
pub fn try_parse_python_symbols(path: &str, source: &str) -> Result<Vec<ParsedSymbol>> {
    let mut parser = Parser::new();
    let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
    parser
        .set_language(&language)
        .map_err(|e| IngestError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

    let tree = parser.parse(source, None).ok_or_else(|| IngestError::Parse {
        path: path.to_string(),
        reason: "parser produced no tree".to_string(),
    })?;

    let root = tree.root_node();
    if root.has_error() {
        return Err(IngestError::Parse {
            path: path.to_string(),
            reason: "syntax error".to_string(),
        });
    }

    let mut symbols = Vec::new();
    collect_definitions(root, source.as_bytes(), &mut symbols);
    debug!("Parsed {} symbols from {}", symbols.len(), path);
    Ok(symbols)
}

/// Same as [`try_parse_python_symbols`], but unparseable input yields an
/// empty list.
pub fn parse_python_symbols(path: &str, source: &str) -> Vec<ParsedSymbol> {
    match try_parse_python_symbols(path, source) {
        Ok(symbols) => symbols,
        Err(e) => {
            warn!("Skipping symbols: {}", e);
            Vec::new()
        }
    }
}

/// Walks a module or class body. Function bodies are not searched for
/// nested definitions.
fn collect_definitions(body: Node, src: &[u8], out: &mut Vec<ParsedSymbol>) {
    let mut cursor = body.walk();
    let children: Vec<Node> = body.named_children(&mut cursor).collect();

    for child in children {
        let definition = match child.kind() {
            "decorated_definition" => match child.child_by_field_name("definition") {
                Some(def) => def,
                None => continue,
            },
            _ => child,
        };

        match definition.kind() {
            "function_definition" => {
                if let Some(symbol) = function_symbol(definition, src) {
                    out.push(symbol);
                }
            }
            "class_definition" => {
                let Some(name) = field_text(definition, "name", src) else {
                    continue;
                };
                out.push(ParsedSymbol {
                    signature: format!("class {}", name),
                    name,
                    kind: SymbolKind::Class,
                    start_line: line_of(definition.start_position().row),
                    end_line: line_of(definition.end_position().row),
                    calls: Vec::new(),
                });
                if let Some(class_body) = definition.child_by_field_name("body") {
                    collect_definitions(class_body, src, out);
                }
            }
            _ => {}
        }
    }
}

fn function_symbol(node: Node, src: &[u8]) -> Option<ParsedSymbol> {
    let name = field_text(node, "name", src)?;

    let params: Vec<String> = match node.child_by_field_name("parameters") {
        Some(parameters) => {
            let mut cursor = parameters.walk();
            let nodes: Vec<Node> = parameters.named_children(&mut cursor).collect();
            nodes
                .into_iter()
                .filter_map(|p| parameter_name(p, src))
                .collect()
        }
        None => Vec::new(),
    };

    let mut calls = Vec::new();
    if let Some(body) = node.child_by_field_name("body") {
        collect_calls(body, src, &mut calls);
    }

    Some(ParsedSymbol {
        signature: format!("def {}({})", name, params.join(", ")),
        name,
        kind: SymbolKind::Function,
        start_line: line_of(node.start_position().row),
        end_line: line_of(node.end_position().row),
        calls,
    })
}

/// Parameter names only: annotations and defaults are dropped, splats keep
/// their `*` / `**` prefix.
fn parameter_name(node: Node, src: &[u8]) -> Option<String> {
    match node.kind() {
        "identifier" => text(node, src),
        "typed_parameter" => {
            let mut cursor = node.walk();
            let first = node.named_children(&mut cursor).next();
            first.and_then(|inner| parameter_name(inner, src))
        }
        "default_parameter" | "typed_default_parameter" => field_text(node, "name", src),
        "list_splat_pattern" => {
            let mut cursor = node.walk();
            let inner = node.named_children(&mut cursor).next();
            inner
                .and_then(|n| text(n, src))
                .map(|name| format!("*{}", name))
        }
        "dictionary_splat_pattern" => {
            let mut cursor = node.walk();
            let inner = node.named_children(&mut cursor).next();
            inner
                .and_then(|n| text(n, src))
                .map(|name| format!("**{}", name))
        }
        _ => None,
    }
}

/// Call targets in source order, first occurrence only. `obj.method()`
/// contributes `method`.
fn collect_calls(node: Node, src: &[u8], out: &mut Vec<String>) {
    if node.kind() == "call" {
        if let Some(function) = node.child_by_field_name("function") {
            let target = match function.kind() {
                "identifier" => text(function, src),
                "attribute" => field_text(function, "attribute", src),
                _ => None,
            };
            if let Some(target) = target {
                if !out.contains(&target) {
                    out.push(target);
                }
            }
        }
    }

    let mut cursor = node.walk();
    let children: Vec<Node> = node.named_children(&mut cursor).collect();
    for child in children {
        collect_calls(child, src, out);
    }
}

fn field_text(node: Node, field: &str, src: &[u8]) -> Option<String> {
    node.child_by_field_name(field).and_then(|n| text(n, src))
}

fn text(node: Node, src: &[u8]) -> Option<String> {
    node.utf8_text(src).ok().map(str::to_string)
}

fn line_of(row: usize) -> u32 {
    row as u32 + 1
}
