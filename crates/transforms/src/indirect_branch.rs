//! Replaces direct branches with loads from a shuffled table of block addresses followed by an
//! indirect branch.

use crate::selector::{FunctionSelector, rewrite_functions};
use crate::{FunctionOutcome, PassConfig, SkipReason, Transform, TransformReport};
use phantom_core::ir::{
    BlockId, Builder, ConstValue, Global, Module, Symbol, Terminator, Type, Value,
};
use phantom_utils::errors::TransformError;
use rand::RngCore;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tracing::debug;

pub const NAME: &str = "indirect-branch";

/// Routes every `br` and conditional `br` through a per-function jump table.
#[derive(Debug, Clone, Default)]
pub struct IndirectBranch {
    config: PassConfig,
}

impl IndirectBranch {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }
}

impl Transform for IndirectBranch {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply(
        &self,
        module: &mut Module,
        rng: &mut dyn RngCore,
    ) -> Result<TransformReport, TransformError> {
        let selector = FunctionSelector::from_config(&self.config);
        Ok(rewrite_functions(module, NAME, &selector, |module, name| {
            rewrite_branches(module, name, rng)
        }))
    }
}

/// Rewrites the branches of `name`, creating its jump table as a module global.
pub fn rewrite_branches(
    module: &mut Module,
    name: &str,
    rng: &mut dyn RngCore,
) -> Result<FunctionOutcome, TransformError> {
    let func = module.expect_function_mut(name)?;
    let sites: Vec<(BlockId, Terminator)> = func
        .block_ids()
        .filter_map(|b| match func.terminator(b) {
            Some(term) if term.is_branch() => Some((b, term.clone())),
            _ => None,
        })
        .collect();
    if sites.is_empty() {
        return Ok(FunctionOutcome::Skipped(SkipReason::NoEligibleSites));
    }

    let mut targets: Vec<BlockId> = Vec::new();
    for (_, term) in &sites {
        for succ in term.successors() {
            if !targets.contains(&succ) {
                targets.push(succ);
            }
        }
    }
    targets.shuffle(rng);
    let slot: HashMap<BlockId, u64> = targets
        .iter()
        .enumerate()
        .map(|(i, b)| (*b, i as u64))
        .collect();

    let table = module.unique_name(&format!("{name}.jump_table"));
    let init: Vec<ConstValue> = targets
        .iter()
        .map(|&block| {
            ConstValue::addr(Symbol::Block {
                function: name.to_string(),
                block,
            })
        })
        .collect();
    module.get_or_insert_global_with(&table, NAME, || {
        Global::constant(table.clone(), Type::Ptr, init)
    });
    debug!(
        "@{}: jump table @{} with {} slots",
        name,
        table,
        targets.len()
    );

    let func = module.expect_function_mut(name)?;
    let base = Value::global(table.clone());
    for (block, term) in &sites {
        // Re-open the block at its end; the old terminator is replaced below.
        let mut b = Builder::at_end(func, *block);
        match term {
            Terminator::Br(dest) => {
                let ptr = b.element_ptr(base.clone(), Value::i64(slot[dest]), 8);
                let addr = b.load_volatile(Type::Ptr, ptr);
                b.indirect_br(addr, vec![*dest]);
            }
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                let then_ptr = b.element_ptr(base.clone(), Value::i64(slot[then_dest]), 8);
                let else_ptr = b.element_ptr(base.clone(), Value::i64(slot[else_dest]), 8);
                let chosen = b.select(cond.clone(), then_ptr, else_ptr);
                let addr = b.load_volatile(Type::Ptr, chosen);
                b.indirect_br(addr, term.successors());
            }
            _ => {}
        }
    }
    Ok(FunctionOutcome::Rewritten { sites: sites.len() })
}
