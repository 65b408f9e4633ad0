//! Indirect call encoding.
//!
//! Each direct call to a defined or declared function becomes a call through a pointer that is
//! rebuilt at runtime from two read-only tables: `.sub_icall.offsets[k]` holds a random offset
//! and `.sub_icall.encoded[k]` the link-time constant `&callee - offset`. Only their sum is the
//! callee address, so neither table alone names the target.

use crate::selector::{FunctionSelector, rewrite_functions};
use crate::{FunctionOutcome, PassConfig, SkipReason, Transform, TransformReport};
use phantom_core::ir::{
    BlockId, Builder, Callee, CastOp, ConstValue, Global, InstId, InstKind, Module,
    RelocationModel, Symbol, Type, Value,
};
use phantom_utils::errors::TransformError;
use rand::{Rng, RngCore};
use tracing::{debug, warn};

pub const NAME: &str = "sub-indirect-call";

pub const OFFSETS: &str = ".sub_icall.offsets";
pub const ENCODED: &str = ".sub_icall.encoded";

/// Rewrites direct calls into calls through encoded function pointers.
#[derive(Debug, Clone, Default)]
pub struct IndirectCall {
    config: PassConfig,
}

impl IndirectCall {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    /// Why the module's target cannot host encoded call tables, if it cannot.
    fn platform_check(&self, module: &Module) -> Option<SkipReason> {
        let target = &module.target;
        if target.pointer_bits != 64 {
            return Some(SkipReason::PlatformUnsupported(format!(
                "{}-bit pointers on {}",
                target.pointer_bits, target.arch
            )));
        }
        if target.relocation == RelocationModel::Pic && !self.config.allow_pic_call_encoding {
            return Some(SkipReason::PlatformUnsupported(format!(
                "position-independent {} code",
                target.arch
            )));
        }
        None
    }
}

impl Transform for IndirectCall {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply(
        &self,
        module: &mut Module,
        rng: &mut dyn RngCore,
    ) -> Result<TransformReport, TransformError> {
        if let Some(reason) = self.platform_check(module) {
            warn!("{}: skipping module {}: {}", NAME, module.name, reason);
            return Ok(TransformReport::skipped_module(NAME, reason));
        }
        let selector = FunctionSelector::from_config(&self.config);
        Ok(rewrite_functions(module, NAME, &selector, |module, name| {
            encode_calls(module, name, rng)
        }))
    }
}

fn encodable(module: &Module, callee: &str) -> bool {
    module
        .function(callee)
        .is_some_and(|f| !f.attrs.intrinsic && !f.attrs.always_inline)
}

fn encode_calls(
    module: &mut Module,
    name: &str,
    rng: &mut dyn RngCore,
) -> Result<FunctionOutcome, TransformError> {
    let func = module
        .function(name)
        .ok_or_else(|| phantom_utils::errors::IrError::UnknownFunction(name.to_string()))?;
    let sites: Vec<(BlockId, InstId, String)> = func
        .live_insts()
        .into_iter()
        .filter_map(|(block, inst)| match &func.inst(inst).kind {
            InstKind::Call {
                callee: Callee::Direct(callee),
                ..
            } if encodable(module, callee) => Some((block, inst, callee.clone())),
            _ => None,
        })
        .collect();
    if sites.is_empty() {
        return Ok(FunctionOutcome::Skipped(SkipReason::NoEligibleSites));
    }

    for table in [OFFSETS, ENCODED] {
        module.get_or_insert_global_with(table, NAME, || {
            Global::constant(table, Type::I64, Vec::new())
        });
    }

    for (block, inst, callee) in &sites {
        let offset: u8 = rng.random_range(1..=255);
        let slot = push_entry(module, callee, offset, name)?;

        let func = module.expect_function_mut(name)?;
        let mut b = Builder::before(func, *block, *inst)?;
        let po = b.element_ptr(Value::global(OFFSETS), Value::i64(slot as u64), 8);
        let off = b.load_volatile(Type::I64, po);
        let pe = b.element_ptr(Value::global(ENCODED), Value::i64(slot as u64), 8);
        let enc = b.load_volatile(Type::I64, pe);
        let sum = b.add(enc, off);
        let target = b.cast(CastOp::IntToPtr, sum, Type::Ptr);
        if let InstKind::Call { callee: c, .. } = &mut func.insts[inst.index()].kind {
            *c = Callee::Indirect(target);
        }
        debug!(
            "@{}: call @{} via slot {} (offset {})",
            name, callee, slot, offset
        );
    }
    check_tables(module, name)?;
    Ok(FunctionOutcome::Rewritten { sites: sites.len() })
}

/// Appends one `(offset, &callee - offset)` pair to the tables and returns its slot.
fn push_entry(
    module: &mut Module,
    callee: &str,
    offset: u8,
    function: &str,
) -> Result<usize, TransformError> {
    let missing = |table: &str| TransformError::InvariantViolation {
        function: function.to_string(),
        detail: format!("call table @{table} missing"),
    };
    let offsets = module.global_mut(OFFSETS).ok_or_else(|| missing(OFFSETS))?;
    let slot = offsets.len();
    offsets.init.push(ConstValue::Int(offset as u64));
    let encoded = module.global_mut(ENCODED).ok_or_else(|| missing(ENCODED))?;
    encoded.init.push(ConstValue::Addr {
        symbol: Symbol::Function(callee.to_string()),
        addend: -(offset as i64),
    });
    Ok(slot)
}

/// Confirms every table slot decodes to its function: `addend + offset == 0`.
fn check_tables(module: &Module, function: &str) -> Result<(), TransformError> {
    let violation = |detail: String| TransformError::InvariantViolation {
        function: function.to_string(),
        detail,
    };
    let (Some(offsets), Some(encoded)) = (module.global(OFFSETS), module.global(ENCODED)) else {
        return Err(violation("call tables missing".to_string()));
    };
    if offsets.len() != encoded.len() {
        return Err(violation(format!(
            "call tables out of step: {} offsets, {} encoded",
            offsets.len(),
            encoded.len()
        )));
    }
    for (slot, pair) in offsets.init.iter().zip(&encoded.init).enumerate() {
        match pair {
            (ConstValue::Int(off), ConstValue::Addr { addend, .. })
                if (1..=255).contains(off) && addend.wrapping_add(*off as i64) == 0 => {}
            _ => return Err(violation(format!("slot {slot} does not decode"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_core::interp::Machine;
    use phantom_core::ir::verify::verify_module;
    use phantom_core::samples;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn machine(module: &Module) -> Machine<'_> {
        let mut m = Machine::new(module).unwrap();
        m.register_host("host_scale", Box::new(|args| args[0] * 10));
        m.register_host(
            "abs",
            Box::new(|args| (args[0] as u32 as i32).unsigned_abs() as u64),
        );
        m
    }

    #[test]
    fn encoded_calls_reach_their_callees() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let mut module = samples::calls();
        let mut rng = StdRng::seed_from_u64(99);
        let report = IndirectCall::default().apply(&mut module, &mut rng).unwrap();
        // square + host_scale in caller, caller in main; `twice` and `abs` stay direct
        assert_eq!(report.sites(), 3);
        verify_module(&module).unwrap();

        let caller = module.function("caller").unwrap();
        let direct: Vec<&str> = caller
            .live_insts()
            .iter()
            .filter_map(|(_, i)| match &caller.inst(*i).kind {
                InstKind::Call {
                    callee: Callee::Direct(name),
                    ..
                } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(direct, vec!["twice", "abs"]);

        let m = machine(&module);
        let offsets = module.global(OFFSETS).unwrap();
        let encoded = module.global(ENCODED).unwrap();
        assert!(offsets.constant && encoded.constant);
        for (k, entry) in encoded.init.iter().enumerate() {
            let ConstValue::Addr {
                symbol: Symbol::Function(callee),
                ..
            } = entry
            else {
                panic!("slot {k} is not a function address");
            };
            let off = m.read_global(OFFSETS, k).unwrap();
            let enc = m.read_global(ENCODED, k).unwrap();
            assert!((1..=255).contains(&off));
            assert_eq!(enc.wrapping_add(off), m.function_address(callee).unwrap());
        }

        let mut m = machine(&module);
        assert_eq!(m.call("main", &[]).unwrap(), Some(48));
    }

    #[test]
    fn pic_targets_are_refused_unless_allowed() {
        let mut module = samples::calls();
        module.target.relocation = RelocationModel::Pic;
        let before = module.clone();
        let mut rng = StdRng::seed_from_u64(1);
        let report = IndirectCall::default().apply(&mut module, &mut rng).unwrap();
        assert!(matches!(
            report.module_skip,
            Some(SkipReason::PlatformUnsupported(_))
        ));
        assert_eq!(module, before);

        let report = IndirectCall::new(PassConfig {
            allow_pic_call_encoding: true,
            ..PassConfig::default()
        })
        .apply(&mut module, &mut rng)
        .unwrap();
        assert!(report.changed());

        let mut narrow = samples::calls();
        narrow.target.pointer_bits = 32;
        let report = IndirectCall::new(PassConfig {
            allow_pic_call_encoding: true,
            ..PassConfig::default()
        })
        .apply(&mut narrow, &mut rng)
        .unwrap();
        assert!(report.module_skip.is_some());
    }

    #[test]
    fn functions_without_calls_are_untouched() {
        let mut module = samples::sum_to_n();
        let before = module.clone();
        let mut rng = StdRng::seed_from_u64(1);
        let report = IndirectCall::default().apply(&mut module, &mut rng).unwrap();
        assert!(!report.changed());
        assert_eq!(module, before);
    }
}
