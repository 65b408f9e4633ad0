//! Opaque predicate injection.
//!
//! Every conditional branch is ANDed with an arithmetic identity over two module cells that
//! holds for any values the cells may take, so the branch behaves exactly as before.

use crate::selector::{FunctionSelector, rewrite_functions};
use crate::{FunctionOutcome, PassConfig, SkipReason, Transform, TransformReport};
use phantom_core::ir::{
    BlockId, Builder, CmpPred, ConstValue, Global, Module, Terminator, Type, Value,
};
use phantom_utils::errors::TransformError;
use rand::{Rng, RngCore};
use tracing::debug;

pub const NAME: &str = "opaque-predicate";

/// Module-level cell feeding the `x` side of every predicate.
pub const CELL_X: &str = "opaque_x";
/// Module-level cell feeding the `y` side of every predicate.
pub const CELL_Y: &str = "opaque_y";
const SEED_X: u64 = 13;
const SEED_Y: u64 = 37;

/// Integer identities that hold for every pair of 32-bit values under wrapping arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// `7y² - 1 != x²`: squares are 0, 1 or 4 mod 8, `7y² - 1` is 3, 6 or 7.
    SquaresNeverMeet,
    /// `x(x + 1)` is even.
    ConsecutiveProductEven,
    /// `(x | y) - (x & y) == x ^ y`.
    OrMinusAndIsXor,
    /// `(x ^ y) + 2(x & y) == x + y`.
    XorPlusCarryIsSum,
    /// Bit 1 of `x²` is clear.
    SquareBitOneClear,
    /// `(x | 1)² ≡ 1 (mod 8)`.
    OddSquareMod8,
}

impl Predicate {
    pub const ALL: [Self; 6] = [
        Self::SquaresNeverMeet,
        Self::ConsecutiveProductEven,
        Self::OrMinusAndIsXor,
        Self::XorPlusCarryIsSum,
        Self::SquareBitOneClear,
        Self::OddSquareMod8,
    ];

    /// Emits the predicate over the `i32` values `x` and `y`; the result is an `i1`.
    pub fn emit(self, b: &mut Builder<'_>, x: Value, y: Value) -> Value {
        let c = Value::i32;
        match self {
            Self::SquaresNeverMeet => {
                let yy = b.mul(y.clone(), y);
                let seven = b.mul(yy, c(7));
                let lhs = b.sub(seven, c(1));
                let xx = b.mul(x.clone(), x);
                b.icmp(CmpPred::Ne, lhs, xx)
            }
            Self::ConsecutiveProductEven => {
                let next = b.add(x.clone(), c(1));
                let prod = b.mul(x, next);
                let low = b.and(prod, c(1));
                b.icmp(CmpPred::Eq, low, c(0))
            }
            Self::OrMinusAndIsXor => {
                let or = b.or(x.clone(), y.clone());
                let and = b.and(x.clone(), y.clone());
                let lhs = b.sub(or, and);
                let xor = b.xor(x, y);
                b.icmp(CmpPred::Eq, lhs, xor)
            }
            Self::XorPlusCarryIsSum => {
                let xor = b.xor(x.clone(), y.clone());
                let and = b.and(x.clone(), y.clone());
                let carry = b.mul(and, c(2));
                let lhs = b.add(xor, carry);
                let sum = b.add(x, y);
                b.icmp(CmpPred::Eq, lhs, sum)
            }
            Self::SquareBitOneClear => {
                let xx = b.mul(x.clone(), x);
                let bit = b.and(xx, c(2));
                b.icmp(CmpPred::Eq, bit, c(0))
            }
            Self::OddSquareMod8 => {
                let odd = b.or(x, c(1));
                let sq = b.mul(odd.clone(), odd);
                let low = b.and(sq, c(7));
                b.icmp(CmpPred::Eq, low, c(1))
            }
        }
    }

    /// Evaluates the predicate natively with the same wrapping semantics as [`Predicate::emit`].
    pub const fn holds(self, x: u32, y: u32) -> bool {
        match self {
            Self::SquaresNeverMeet => {
                y.wrapping_mul(y).wrapping_mul(7).wrapping_sub(1) != x.wrapping_mul(x)
            }
            Self::ConsecutiveProductEven => x.wrapping_mul(x.wrapping_add(1)) & 1 == 0,
            Self::OrMinusAndIsXor => (x | y).wrapping_sub(x & y) == x ^ y,
            Self::XorPlusCarryIsSum => (x ^ y).wrapping_add((x & y).wrapping_mul(2)) == x.wrapping_add(y),
            Self::SquareBitOneClear => x.wrapping_mul(x) & 2 == 0,
            Self::OddSquareMod8 => {
                let odd = x | 1;
                odd.wrapping_mul(odd) & 7 == 1
            }
        }
    }
}

/// Injects opaque predicates to increase control flow complexity and potency.
///
/// Each conditional branch's condition is AND-ed with a randomly chosen [`Predicate`] over the
/// two module cells [`CELL_X`] and [`CELL_Y`], so the branch decides exactly as before for any
/// runtime contents of the cells.
#[derive(Debug, Clone, Default)]
pub struct OpaquePredicate {
    config: PassConfig,
}

impl OpaquePredicate {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }
}

impl Transform for OpaquePredicate {
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
            inject_predicates(module, name, rng)
        }))
    }
}

fn inject_predicates(
    module: &mut Module,
    name: &str,
    rng: &mut dyn RngCore,
) -> Result<FunctionOutcome, TransformError> {
    let func = module.expect_function_mut(name)?;
    let sites: Vec<(BlockId, Value, BlockId, BlockId)> = func
        .block_ids()
        .filter_map(|b| match func.terminator(b) {
            Some(Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            }) => Some((b, cond.clone(), *then_dest, *else_dest)),
            _ => None,
        })
        .collect();
    if sites.is_empty() {
        return Ok(FunctionOutcome::Skipped(SkipReason::NoEligibleSites));
    }

    for (cell, seed) in [(CELL_X, SEED_X), (CELL_Y, SEED_Y)] {
        module.get_or_insert_global_with(cell, NAME, || {
            Global::new(cell, Type::I32, vec![ConstValue::Int(seed)])
        });
    }

    let func = module.expect_function_mut(name)?;
    for (block, cond, then_dest, else_dest) in &sites {
        let predicate = Predicate::ALL[rng.random_range(0..Predicate::ALL.len())];
        let mut b = Builder::at_end(func, *block);
        let x = b.load(Type::I32, Value::global(CELL_X));
        let y = b.load(Type::I32, Value::global(CELL_Y));
        let opaque = predicate.emit(&mut b, x, y);
        let guarded = b.and(cond.clone(), opaque);
        b.cond_br(guarded, *then_dest, *else_dest);
        debug!("@{} bb{}: guarded with {:?}", name, block.0, predicate);
    }
    Ok(FunctionOutcome::Rewritten { sites: sites.len() })
}
