/// Module for computing structural metrics to evaluate obfuscation transforms.
///
/// Implements a minimal set of metrics quantified by instruction count, control flow
/// complexity and dominator overlap to assess transform potency (analyst effort) against code
/// growth. Metrics are computed per function from the block graph produced by
/// `phantom_core::cfg::block_graph`, and aggregated per module.
///
/// # Usage
/// ```rust,ignore
/// let module = phantom_core::samples::sum_to_n();
/// let metrics = metrics::collect_metrics(module.function("sum_to_n").unwrap()).unwrap();
/// println!("{}", serde_json::to_string_pretty(&metrics).unwrap());
/// ```
use phantom_core::cfg::{CfgNode, EdgeType, block_graph};
use phantom_core::ir::{Function, Module};
use phantom_utils::errors::MetricsError;
use petgraph::{
    algo::dominators::simple_fast,
    graph::{DiGraph, NodeIndex},
    visit::Reversed,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Structural metrics of a function or module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Number of live instructions, terminators excluded.
    pub inst_cnt: usize,
    /// Number of basic blocks.
    pub block_cnt: usize,
    /// Number of control flow edges between blocks.
    pub edge_cnt: usize,
    /// Fraction of blocks whose immediate dominator is also their immediate post-dominator.
    pub dom_overlap: f64,
    /// Composite potency score (heuristic based on blocks, edges and overlap).
    pub potency: f64,
}

/// Collects metrics for one function body.
///
/// # Errors
/// Returns [`MetricsError::NoBody`] for declarations.
pub fn collect_metrics(func: &Function) -> Result<Metrics, MetricsError> {
    if func.is_declaration() {
        return Err(MetricsError::NoBody(func.name.clone()));
    }
    let bg = block_graph(func);
    let (doms, post_doms) = dominator_pairs(&bg.graph, bg.entry, bg.exit);
    let overlap = dom_overlap(&doms, &post_doms);
    let block_cnt = func.blocks.len();
    let edge_cnt = bg.block_edge_count();
    tracing::trace!(
        "@{}: {} blocks, {} edges, overlap {:.2}",
        func.name,
        block_cnt,
        edge_cnt,
        overlap
    );

    Ok(Metrics {
        inst_cnt: func.inst_count(),
        block_cnt,
        edge_cnt,
        dom_overlap: overlap,
        potency: score(overlap, block_cnt, edge_cnt),
    })
}

/// Collects metrics for every function body in `module`.
///
/// Counts are summed; the overlap is the block-weighted mean of the per-function overlaps.
pub fn collect_module_metrics(module: &Module) -> Result<Metrics, MetricsError> {
    let per_function: Vec<Metrics> = module
        .functions
        .values()
        .filter(|f| !f.is_declaration())
        .map(collect_metrics)
        .collect::<Result<_, _>>()?;
    if per_function.is_empty() {
        return Err(MetricsError::NoBodies);
    }
    let inst_cnt = per_function.iter().map(|m| m.inst_cnt).sum();
    let block_cnt: usize = per_function.iter().map(|m| m.block_cnt).sum();
    let edge_cnt = per_function.iter().map(|m| m.edge_cnt).sum();
    let weighted: f64 = per_function
        .iter()
        .map(|m| m.dom_overlap * m.block_cnt as f64)
        .sum();
    let overlap = weighted / block_cnt.max(1) as f64;

    Ok(Metrics {
        inst_cnt,
        block_cnt,
        edge_cnt,
        dom_overlap: overlap,
        potency: score(overlap, block_cnt, edge_cnt),
    })
}

// Define a type alias for the HashMap used in dominator pairs
type DominatorMap = HashMap<NodeIndex, NodeIndex>;

/// Computes immediate dominators from `entry` and immediate post-dominators from `exit`.
///
/// Only block nodes are reported; the virtual exit node never appears as a key.
fn dominator_pairs(
    g: &DiGraph<CfgNode, EdgeType>,
    entry: NodeIndex,
    exit: NodeIndex,
) -> (DominatorMap, DominatorMap) {
    let doms = simple_fast(g, entry);
    let mut dom_map = HashMap::new();
    for n in g.node_indices().filter(|&n| n != exit) {
        if let Some(idom) = doms.immediate_dominator(n) {
            dom_map.insert(n, idom);
        }
    }

    let post = simple_fast(Reversed(g), exit);
    let mut pdom_map = HashMap::new();
    for n in g.node_indices().filter(|&n| n != exit) {
        if let Some(ipdom) = post.immediate_dominator(n) {
            pdom_map.insert(n, ipdom);
        }
    }

    (dom_map, pdom_map)
}

/// Fraction of dominated nodes whose immediate dominator equals their immediate
/// post-dominator. A higher overlap means a more linear CFG.
fn dom_overlap(doms: &DominatorMap, pdoms: &DominatorMap) -> f64 {
    let common = doms
        .iter()
        .filter(|(n, d)| pdoms.get(*n) == Some(*d))
        .count();
    if doms.is_empty() {
        0.0
    } else {
        common as f64 / doms.len() as f64
    }
}

/// Heuristic potency: control flow complexity rewarded, dominator overlap penalised.
fn score(overlap: f64, nodes: usize, edges: usize) -> f64 {
    5.0 * (nodes.max(1) as f64).log2() + edges as f64 + 30.0 * (1.0 - overlap)
}

/// Compares metrics before and after a transform.
///
/// Returns the potency gain, discounted by instruction growth. Positive means the transform
/// added complexity at a reasonable size cost.
pub fn compare(before: &Metrics, after: &Metrics) -> f64 {
    after.potency - before.potency - 0.1 * (after.inst_cnt as f64 - before.inst_cnt as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_core::ir::{Builder, Type, Value};
    use phantom_core::samples;

    fn straight_line() -> Function {
        let mut f = Function::new("line", vec![Type::I32], Some(Type::I32));
        let entry = f.entry;
        let mut b = Builder::at_end(&mut f, entry);
        let v = b.add(Value::Param(0), Value::i32(1));
        b.ret(Some(v));
        f
    }

    #[test]
    fn single_block_metrics() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let metrics = collect_metrics(&straight_line()).unwrap();
        assert_eq!(metrics.block_cnt, 1);
        assert_eq!(metrics.edge_cnt, 0);
        assert_eq!(metrics.inst_cnt, 1);
        assert!((0.0..=1.0).contains(&metrics.dom_overlap));
    }

    #[test]
    fn loops_score_higher_than_straight_lines() {
        let module = samples::sum_to_n();
        let looped = collect_metrics(module.function("sum_to_n").unwrap()).unwrap();
        let line = collect_metrics(&straight_line()).unwrap();
        assert_eq!(looped.block_cnt, 4);
        assert_eq!(looped.edge_cnt, 4);
        assert!(looped.potency > line.potency);
        assert!(compare(&line, &looped) > 0.0);
    }

    #[test]
    fn dominators_of_a_diamond() {
        let module = samples::classify();
        let func = module.function("classify").unwrap();
        let bg = block_graph(func);
        let (doms, post_doms) = dominator_pairs(&bg.graph, bg.entry, bg.exit);

        // entry -> check.neg is a straight edge, so check.neg's idom is entry
        let entry = bg.node(func.entry).unwrap();
        let check_neg = bg.node(phantom_core::ir::BlockId(1)).unwrap();
        assert_eq!(doms.get(&check_neg), Some(&entry));
        // every path from the sign blocks meets at `done`
        let done = bg.node(phantom_core::ir::BlockId(6)).unwrap();
        let neg = bg.node(phantom_core::ir::BlockId(2)).unwrap();
        assert_eq!(post_doms.get(&neg), Some(&done));
        assert!(!doms.contains_key(&bg.exit));
    }

    #[test]
    fn declarations_have_no_metrics() {
        let module = samples::calls();
        assert!(matches!(
            collect_metrics(module.function("host_scale").unwrap()),
            Err(MetricsError::NoBody(_))
        ));
        let total = collect_module_metrics(&module).unwrap();
        assert_eq!(total.block_cnt, 4);
        assert!(matches!(
            collect_module_metrics(&Module::new("empty")),
            Err(MetricsError::NoBodies)
        ));
    }
}
