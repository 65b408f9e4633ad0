//! Mixed boolean-arithmetic substitution.
//!
//! Rewrites integer `add` and `sub` into equivalent linear MBA expressions and hides small
//! constants behind an expression over two module cells that always evaluates to the
//! constant, whatever the cells hold. Constants are hidden wherever they appear as data:
//! instruction operands as well as returned, switched and branched-on values.

use crate::selector::{FunctionSelector, rewrite_functions};
use crate::{FunctionOutcome, PassConfig, SkipReason, Transform, TransformReport};
use phantom_core::ir::{
    BinOp, BlockId, Builder, ConstValue, Function, Global, InstId, InstKind, Module, Terminator,
    Type, Value,
};
use phantom_utils::errors::TransformError;
use rand::{Rng, RngCore};
use tracing::debug;

pub const NAME: &str = "mba";

pub const CELL_X: &str = "mba_x";
pub const CELL_Y: &str = "mba_y";
const SEED_X: u64 = 13;
const SEED_Y: u64 = 21;

/// MBA rewriting of additions, subtractions and configured constants.
#[derive(Debug, Clone, Default)]
pub struct MbaSubstitution {
    config: PassConfig,
}

impl MbaSubstitution {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }
}

impl Transform for MbaSubstitution {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply(
        &self,
        module: &mut Module,
        rng: &mut dyn RngCore,
    ) -> Result<TransformReport, TransformError> {
        let selector = FunctionSelector::from_config(&self.config);
        let constants: Vec<u64> = self.config.mba_constants.iter().map(|&k| k as u64).collect();
        Ok(rewrite_functions(module, NAME, &selector, |module, name| {
            substitute(module, name, &constants, rng)
        }))
    }
}

/// Operands eligible for constant hiding. Addresses (load and store pointers, element bases,
/// indirect call targets) are not.
fn hideable_operands(kind: &mut InstKind) -> Vec<&mut Value> {
    match kind {
        InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
        InstKind::Select {
            cond,
            then_value,
            else_value,
        } => vec![cond, then_value, else_value],
        InstKind::Cast { value, .. } => vec![value],
        InstKind::Store { value, .. } => vec![value],
        InstKind::Call { args, .. } => args.iter_mut().collect(),
        InstKind::Alloca { .. } | InstKind::Load { .. } | InstKind::ElementPtr { .. } => {
            Vec::new()
        }
    }
}

fn hideable_term_operands(term: &mut Terminator) -> Vec<&mut Value> {
    match term {
        Terminator::Ret(Some(value)) => vec![value],
        Terminator::CondBr { cond, .. } => vec![cond],
        Terminator::Switch { value, .. } => vec![value],
        _ => Vec::new(),
    }
}

fn is_hidden_constant(value: &Value, constants: &[u64]) -> bool {
    value
        .as_const()
        .is_some_and(|(ty, bits)| ty.is_int() && ty.bits() >= 8 && constants.contains(&bits))
}

/// Replaces every configured constant among `operands` with an expression emitted at `b`.
fn hide_operands(
    b: &mut Builder<'_>,
    operands: Vec<&mut Value>,
    constants: &[u64],
    rng: &mut dyn RngCore,
) -> usize {
    let mut hidden = 0;
    for operand in operands {
        if !is_hidden_constant(operand, constants) {
            continue;
        }
        if let Some((ty, bits)) = operand.as_const() {
            *operand = hide_constant(b, ty, bits as u8, rng);
            hidden += 1;
        }
    }
    hidden
}

fn arithmetic_op(func: &Function, inst: InstId) -> Option<BinOp> {
    let data = func.inst(inst);
    match &data.kind {
        InstKind::Binary {
            op: op @ (BinOp::Add | BinOp::Sub),
            ..
        } if data.ty.is_some_and(|t| t.is_int() && t.bits() >= 8) => Some(*op),
        _ => None,
    }
}

fn substitute(
    module: &mut Module,
    name: &str,
    constants: &[u64],
    rng: &mut dyn RngCore,
) -> Result<FunctionOutcome, TransformError> {
    let func = module.expect_function_mut(name)?;
    let live = func.live_insts();
    // Both site lists are taken up front so the expressions emitted below are never rewritten.
    let constant_sites: Vec<(BlockId, InstId)> = live
        .iter()
        .copied()
        .filter(|(_, inst)| {
            let mut kind = func.inst(*inst).kind.clone();
            hideable_operands(&mut kind)
                .iter()
                .any(|v| is_hidden_constant(v, constants))
        })
        .collect();
    let term_sites: Vec<BlockId> = func
        .block_ids()
        .filter(|&block| {
            func.terminator(block).is_some_and(|term| {
                let mut term = term.clone();
                hideable_term_operands(&mut term)
                    .iter()
                    .any(|v| is_hidden_constant(v, constants))
            })
        })
        .collect();
    let arith_sites: Vec<(BlockId, InstId)> = live
        .iter()
        .copied()
        .filter(|(_, inst)| arithmetic_op(func, *inst).is_some())
        .collect();
    if constant_sites.is_empty() && term_sites.is_empty() && arith_sites.is_empty() {
        return Ok(FunctionOutcome::Skipped(SkipReason::NoEligibleSites));
    }

    if !constant_sites.is_empty() || !term_sites.is_empty() {
        for (cell, seed) in [(CELL_X, SEED_X), (CELL_Y, SEED_Y)] {
            module.get_or_insert_global_with(cell, NAME, || {
                Global::new(cell, Type::I32, vec![ConstValue::Int(seed)])
            });
        }
    }
    let func = module.expect_function_mut(name)?;

    let mut hidden = 0usize;
    for (block, inst) in &constant_sites {
        let mut kind = func.inst(*inst).kind.clone();
        let mut b = Builder::before(func, *block, *inst)?;
        hidden += hide_operands(&mut b, hideable_operands(&mut kind), constants, rng);
        func.insts[inst.index()].kind = kind;
    }
    for block in &term_sites {
        let Some(mut term) = func.take_terminator(*block) else {
            continue;
        };
        // Emitted at the end of the block, right before the terminator is put back.
        let mut b = Builder::at_end(func, *block);
        hidden += hide_operands(&mut b, hideable_term_operands(&mut term), constants, rng);
        func.set_terminator(*block, term);
    }

    for (block, inst) in &arith_sites {
        let data = func.inst(*inst).clone();
        let (InstKind::Binary { op, lhs, rhs }, Some(ty)) = (data.kind, data.ty) else {
            continue;
        };
        let a = draw_coefficient(ty, constants, rng);
        let mut b = Builder::before(func, *block, *inst)?;
        let result = match op {
            BinOp::Add => mba_add(&mut b, ty, a, lhs, rhs),
            _ => mba_sub(&mut b, ty, a, lhs, rhs),
        };
        func.replace_all_uses(*inst, &result);
        func.remove_inst(*block, *inst);
    }

    debug!(
        "@{}: {} constants hidden, {} add/sub rewritten",
        name,
        hidden,
        arith_sites.len()
    );
    Ok(FunctionOutcome::Rewritten {
        sites: hidden + arith_sites.len(),
    })
}

/// Random `a` for the add/sub identities such that neither `a` nor `a - 2` reintroduces a
/// hidden constant at width `ty`.
fn draw_coefficient(ty: Type, constants: &[u64], rng: &mut dyn RngCore) -> u64 {
    let mut a: u64 = rng.random_range(3..=0xffff);
    for _ in 0..64 {
        let clash = [a, a.wrapping_sub(2)]
            .iter()
            .any(|v| constants.contains(&(v & ty.mask())));
        if !clash {
            break;
        }
        a = rng.random_range(3..=0xffff);
    }
    a
}

/// `zext(trunc8(c·x + c·y - c·(x&y) - c·(x|y) - L))` with `L = 256·m - k`. The four cell terms
/// cancel because `x + y == (x & y) + (x | y)`, leaving `-L ≡ k (mod 256)`.
fn hide_constant(b: &mut Builder<'_>, ty: Type, k: u8, rng: &mut dyn RngCore) -> Value {
    let c: i32 = rng.random_range(0x100..=0xffff);
    let m: i32 = rng.random_range(2..=0xff);
    let l = 256 * m - k as i32;
    let x = b.load(Type::I32, Value::global(CELL_X));
    let y = b.load(Type::I32, Value::global(CELL_Y));
    let cx = b.mul(Value::i32(c), x.clone());
    let cy = b.mul(Value::i32(c), y.clone());
    let and = b.and(x.clone(), y.clone());
    let c_and = b.mul(Value::i32(c), and);
    let or = b.or(x, y);
    let c_or = b.mul(Value::i32(c), or);
    let acc = b.add(cx, cy);
    let acc = b.sub(acc, c_and);
    let acc = b.sub(acc, c_or);
    let acc = b.sub(acc, Value::i32(l));
    let byte = b.int_cast(acc, Type::I8, false);
    b.int_cast(byte, ty, false)
}

/// `x + y == a·x + a·y - a·(x&y) - (a-2)·(x|y) - (x^y)`
fn mba_add(b: &mut Builder<'_>, ty: Type, a: u64, x: Value, y: Value) -> Value {
    let ka = Value::int(ty, a);
    let kb = Value::int(ty, a.wrapping_sub(2));
    let ax = b.mul(ka.clone(), x.clone());
    let ay = b.mul(ka.clone(), y.clone());
    mba_tail(b, ka, kb, ax, ay, x, y)
}

/// `x - y == a·x + (a-2)·y - a·(x&y) - (a-2)·(x|y) - (x^y)`
fn mba_sub(b: &mut Builder<'_>, ty: Type, a: u64, x: Value, y: Value) -> Value {
    let ka = Value::int(ty, a);
    let kb = Value::int(ty, a.wrapping_sub(2));
    let ax = b.mul(ka.clone(), x.clone());
    let by = b.mul(kb.clone(), y.clone());
    mba_tail(b, ka, kb, ax, by, x, y)
}

fn mba_tail(
    b: &mut Builder<'_>,
    ka: Value,
    kb: Value,
    first: Value,
    second: Value,
    x: Value,
    y: Value,
) -> Value {
    let and = b.and(x.clone(), y.clone());
    let a_and = b.mul(ka, and);
    let or = b.or(x.clone(), y.clone());
    let b_or = b.mul(kb, or);
    let xor = b.xor(x, y);
    let acc = b.add(first, second);
    let acc = b.sub(acc, a_and);
    let acc = b.sub(acc, b_or);
    b.sub(acc, xor)
}
