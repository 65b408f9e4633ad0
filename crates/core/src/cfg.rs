/// Control flow graph view over a function body.
///
/// The IR stores control flow implicitly in block terminators. Analyses and the Graphviz
/// exporter want an explicit graph, so this module projects a function onto a
/// `petgraph::DiGraph` whose nodes are blocks plus one virtual exit node that every returning
/// or trapping block flows into.
use crate::ir::{BlockId, Function, Terminator};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node of the block graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CfgNode {
    Block(BlockId),
    /// Virtual sink for `ret` and `unreachable`.
    Exit,
}

/// Kind of control transfer an edge represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    /// Unconditional branch.
    Jump,
    /// Conditional branch taken when the condition is true.
    BranchTrue,
    /// Conditional branch taken when the condition is false.
    BranchFalse,
    /// Switch case.
    Case(u64),
    /// Switch default.
    Default,
    /// Declared destination of an indirect branch.
    Indirect,
    /// Edge into the virtual exit node.
    Exit,
}

/// Block graph of one function together with its node lookup table.
#[derive(Debug, Clone)]
pub struct BlockGraph {
    pub graph: DiGraph<CfgNode, EdgeType>,
    pub nodes: HashMap<BlockId, NodeIndex>,
    pub entry: NodeIndex,
    pub exit: NodeIndex,
}

impl BlockGraph {
    pub fn node(&self, block: BlockId) -> Option<NodeIndex> {
        self.nodes.get(&block).copied()
    }

    /// Number of edges between real blocks, exit edges excluded.
    pub fn block_edge_count(&self) -> usize {
        self.graph
            .edge_weights()
            .filter(|kind| **kind != EdgeType::Exit)
            .count()
    }
}

/// Builds the block graph of `func`. Declarations yield a graph holding only the exit node.
///
/// Conditional branches whose arms coincide produce two parallel edges, one per arm; the
/// graph mirrors the terminators rather than the deduplicated successor sets.
pub fn block_graph(func: &Function) -> BlockGraph {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for block in func.block_ids() {
        nodes.insert(block, graph.add_node(CfgNode::Block(block)));
    }
    let exit = graph.add_node(CfgNode::Exit);
    let entry = nodes.get(&func.entry).copied().unwrap_or(exit);

    for block in func.block_ids() {
        let from = nodes[&block];
        let Some(term) = func.terminator(block) else {
            continue;
        };
        let targets: Vec<(BlockId, EdgeType)> = match term {
            Terminator::Br(dest) => vec![(*dest, EdgeType::Jump)],
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![
                (*then_dest, EdgeType::BranchTrue),
                (*else_dest, EdgeType::BranchFalse),
            ],
            Terminator::Switch { default, cases, .. } => {
                std::iter::once((*default, EdgeType::Default))
                    .chain(cases.iter().map(|(value, dest)| (*dest, EdgeType::Case(*value))))
                    .collect()
            }
            Terminator::IndirectBr { dests, .. } => {
                dests.iter().map(|dest| (*dest, EdgeType::Indirect)).collect()
            }
            Terminator::Ret(_) | Terminator::Unreachable => {
                graph.add_edge(from, exit, EdgeType::Exit);
                continue;
            }
        };
        for (to, kind) in targets {
            if let Some(&to) = nodes.get(&to) {
                graph.add_edge(from, to, kind);
            }
        }
    }

    BlockGraph {
        graph,
        nodes,
        entry,
        exit,
    }
}

/// Renders the block graph of `func` in Graphviz dot format, one node per block labelled with
/// its name and instruction count.
pub fn to_dot(func: &Function) -> String {
    let bg = block_graph(func);
    let mut out = format!("digraph \"{}\" {{\n  node [shape=box];\n", func.name);
    for index in bg.graph.node_indices() {
        let label = match bg.graph[index] {
            CfgNode::Block(block) => {
                let b = func.block(block);
                format!("{block} {}\\n{} insts", b.name, b.insts.len())
            }
            CfgNode::Exit => "exit".to_string(),
        };
        out.push_str(&format!("  n{} [label=\"{label}\"];\n", index.index()));
    }
    for edge in bg.graph.raw_edges() {
        let label = match edge.weight {
            EdgeType::Jump | EdgeType::Exit => String::new(),
            EdgeType::BranchTrue => "T".to_string(),
            EdgeType::BranchFalse => "F".to_string(),
            EdgeType::Case(value) => value.to_string(),
            EdgeType::Default => "default".to_string(),
            EdgeType::Indirect => "*".to_string(),
        };
        out.push_str(&format!(
            "  n{} -> n{} [label=\"{label}\"];\n",
            edge.source().index(),
            edge.target().index()
        ));
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples;

    #[test]
    fn loop_graph_has_exit_and_back_edge() {
        let module = samples::sum_to_n();
        let func = module.function("sum_to_n").unwrap();
        let bg = block_graph(func);

        assert_eq!(bg.graph.node_count(), func.blocks.len() + 1);
        let exits = bg
            .graph
            .edge_weights()
            .filter(|kind| **kind == EdgeType::Exit)
            .count();
        assert_eq!(exits, 1);
        assert!(petgraph::algo::is_cyclic_directed(&bg.graph));
        assert!(to_dot(func).starts_with("digraph \"sum_to_n\""));
    }
}
