//! Control flow flattening.
//!
//! Every block except the entry is moved under a single dispatcher: a state slot holds the ID
//! of the next block to run, and a `switch` in the dispatcher block jumps to it. Block IDs are
//! a random permutation of `0..N`, so the case set is total and collision free by
//! construction; the dispatcher's default case is only reachable through a broken invariant
//! and traps unless [`DispatcherDefault::Loop`] asks for the spin-back behaviour.

use crate::selector::{FunctionSelector, rewrite_functions};
use crate::{
    DispatcherDefault, FunctionOutcome, PassConfig, SkipReason, Transform, TransformReport,
};
use phantom_core::ir::{BlockId, Builder, Function, Module, Terminator, Type, Value};
use phantom_utils::errors::TransformError;
use rand::RngCore;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tracing::debug;

pub const NAME: &str = "flatten-cfg";

/// Flattens each selected function into a dispatcher loop.
#[derive(Debug, Clone, Default)]
pub struct FlattenCfg {
    config: PassConfig,
}

impl FlattenCfg {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }
}

impl Transform for FlattenCfg {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply(
        &self,
        module: &mut Module,
        rng: &mut dyn RngCore,
    ) -> Result<TransformReport, TransformError> {
        let selector = FunctionSelector::from_config(&self.config);
        let default = self.config.dispatcher_default;
        Ok(rewrite_functions(module, NAME, &selector, |module, name| {
            let func = module.expect_function_mut(name)?;
            flatten_function(func, default, rng)
        }))
    }
}

/// Flattens one function in place.
///
/// Returns a skip without touching `func` when there is nothing to flatten or when the entry
/// block does not end in an unconditional branch into the flattened set.
pub fn flatten_function(
    func: &mut Function,
    default: DispatcherDefault,
    rng: &mut dyn RngCore,
) -> Result<FunctionOutcome, TransformError> {
    let entry = func.entry;
    let flattened: Vec<BlockId> = func.block_ids().filter(|&b| b != entry).collect();
    if flattened.is_empty() {
        return Ok(FunctionOutcome::Skipped(SkipReason::NoEligibleSites));
    }
    let first = match func.terminator(entry) {
        Some(Terminator::Br(dest)) if *dest != entry => *dest,
        Some(Terminator::Br(_)) => {
            return Ok(FunctionOutcome::Skipped(SkipReason::UnsupportedShape(
                "entry branches to itself".to_string(),
            )));
        }
        Some(_) => {
            return Ok(FunctionOutcome::Skipped(SkipReason::UnsupportedShape(
                "entry does not end in an unconditional branch".to_string(),
            )));
        }
        None => {
            return Ok(FunctionOutcome::Skipped(SkipReason::UnsupportedShape(
                "entry has no terminator".to_string(),
            )));
        }
    };

    let mut ids: Vec<u64> = (0..flattened.len() as u64).collect();
    ids.shuffle(rng);
    let id_of: HashMap<BlockId, u64> = flattened.iter().copied().zip(ids).collect();
    let id = |block: BlockId| Value::i32(id_of[&block] as i32);

    // Snapshot every terminator before any block is added or rewritten.
    let terminators: Vec<(BlockId, Option<Terminator>)> = flattened
        .iter()
        .map(|&b| (b, func.terminator(b).cloned()))
        .collect();

    let mut b = Builder::at_end(func, entry);
    let state = b.alloca(Type::I32);
    b.store(id(first), state.clone());
    let dispatcher = b.new_block("flatten.dispatch");
    let landing = b.new_block("flatten.default");
    b.br(dispatcher);

    b.position_at_end(dispatcher);
    let current = b.load(Type::I32, state.clone());
    let mut cases: Vec<(u64, BlockId)> = flattened.iter().map(|&blk| (id_of[&blk], blk)).collect();
    cases.sort_unstable();
    b.switch(current, landing, cases);

    b.position_at_end(landing);
    match default {
        DispatcherDefault::Trap => b.unreachable(),
        DispatcherDefault::Loop => b.br(dispatcher),
    }

    let mut rewired = 0usize;
    for (block, term) in terminators {
        let is_flat = |dest: &BlockId| id_of.contains_key(dest);
        match term {
            Some(Terminator::Br(dest)) if is_flat(&dest) => {
                b.position_at_end(block);
                b.store(id(dest), state.clone());
                b.br(dispatcher);
                rewired += 1;
            }
            Some(Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            }) => match (is_flat(&then_dest), is_flat(&else_dest)) {
                (true, true) => {
                    b.position_at_end(block);
                    let next = b.select(cond, id(then_dest), id(else_dest));
                    b.store(next, state.clone());
                    b.br(dispatcher);
                    rewired += 1;
                }
                (true, false) | (false, true) => {
                    let flat_then = is_flat(&then_dest);
                    let target = if flat_then { then_dest } else { else_dest };
                    let tramp = b.new_block("flatten.update");
                    b.position_at_end(tramp);
                    b.store(id(target), state.clone());
                    b.br(dispatcher);
                    b.position_at_end(block);
                    if flat_then {
                        b.cond_br(cond, tramp, else_dest);
                    } else {
                        b.cond_br(cond, then_dest, tramp);
                    }
                    rewired += 1;
                }
                (false, false) => {}
            },
            _ => {}
        }
    }

    check_dispatch(func, dispatcher, flattened.len())?;
    debug!(
        "@{}: flattened {} blocks, {} terminators rewired",
        func.name,
        flattened.len(),
        rewired
    );
    Ok(FunctionOutcome::Rewritten {
        sites: flattened.len(),
    })
}

/// Confirms the dispatcher's case values are exactly `0..n`.
fn check_dispatch(func: &Function, dispatcher: BlockId, n: usize) -> Result<(), TransformError> {
    let violation = |detail: String| TransformError::InvariantViolation {
        function: func.name.clone(),
        detail,
    };
    let Some(Terminator::Switch { cases, .. }) = func.terminator(dispatcher) else {
        return Err(violation("dispatcher lost its switch".to_string()));
    };
    let mut values: Vec<u64> = cases.iter().map(|(v, _)| *v).collect();
    values.sort_unstable();
    if values != (0..n as u64).collect::<Vec<_>>() {
        return Err(violation(format!(
            "dispatch cases {values:?} are not a permutation of 0..{n}"
        )));
    }
    Ok(())
}
