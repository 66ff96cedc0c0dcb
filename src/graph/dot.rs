//! DOT rendering of a block graph for diagnostics.
//!
//! The output can be fed to Graphviz to inspect how a transform reshaped the graph.

use std::fmt::Write;

use crate::graph::{BlockGraph, BlockType};

/// Escapes a string for safe use in DOT labels.
#[must_use]
pub fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "")
        .replace('<', "\\<")
        .replace('>', "\\>")
}

/// Renders the graph in DOT format.
///
/// Blocks become nodes (code blocks as boxes, data blocks as ellipses), references become
/// edges annotated with their type and base offset.
#[must_use]
pub fn to_dot(graph: &BlockGraph<'_>) -> String {
    let mut out = String::from("digraph block_graph {\n");
    for block in graph.blocks() {
        let shape = match block.block_type() {
            BlockType::Code => "box",
            BlockType::Data => "ellipse",
        };
        let _ = writeln!(
            out,
            "  n{} [shape={}, label=\"{}\\n{} bytes\"];",
            block.id().raw(),
            shape,
            escape_dot(block.name()),
            block.size()
        );
    }
    for block in graph.blocks() {
        for (offset, reference) in block.references() {
            let _ = writeln!(
                out,
                "  n{} -> n{} [label=\"{}@{:#x}->{:#x}\"];",
                block.id().raw(),
                reference.target().raw(),
                reference.ref_type(),
                offset,
                reference.base()
            );
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Reference, ReferenceType};

    #[test]
    fn escape_handles_special_characters() {
        assert_eq!(escape_dot("plain"), "plain");
        assert_eq!(escape_dot("a\"b"), "a\\\"b");
        assert_eq!(escape_dot("operator<<"), "operator\\<\\<");
    }

    #[test]
    fn renders_nodes_and_edges() {
        let mut graph = BlockGraph::new();
        let a = graph.add_block(BlockType::Code, 8, "caller");
        let b = graph.add_block(BlockType::Data, 4, "table");
        graph
            .set_reference(a, 0, Reference::direct(ReferenceType::Absolute, 4, b, 0))
            .unwrap();

        let dot = to_dot(&graph);
        assert!(dot.contains("n1 [shape=box"));
        assert!(dot.contains("n2 [shape=ellipse"));
        assert!(dot.contains("n1 -> n2"));
    }
}
