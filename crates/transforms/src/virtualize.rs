//! Instruction virtualization.
//!
//! Eligible integer binary operations are moved into a shared interpreter function. Operands
//! travel through a module-level register file of 256 `i64` cells: the site widens both
//! operands, stores them into two scratch registers, asks the interpreter to run the opcode,
//! then loads the destination register and narrows it back. The interpreter is `noinline` and
//! `optnone` so the round trip cannot be folded away.
//!
//! Two encodings are supported. [`VmEncoding::RegisterCall`] passes `(op, dst, src0, src1)`
//! directly to `__vm_dispatch`. [`VmEncoding::Bytecode`] appends an XOR-encrypted four-byte
//! record to the constant buffer `__vm_code` and calls `__vm_exec(record, key)`, which
//! decrypts the record before dispatching.

use crate::selector::{FunctionSelector, rewrite_functions};
use crate::{FunctionOutcome, PassConfig, SkipReason, Transform, TransformReport, VmEncoding};
use phantom_core::ir::{
    BinOp, BlockId, Builder, ConstValue, Function, InstId, InstKind, Module, Type, Value,
};
use phantom_utils::errors::TransformError;
use rand::seq::index;
use rand::{Rng, RngCore};
use tracing::debug;

pub const NAME: &str = "virtual-machine";

pub const REGISTERS: &str = "__vm_regs";
pub const DISPATCH: &str = "__vm_dispatch";
pub const EXEC: &str = "__vm_exec";
pub const CODE: &str = "__vm_code";
pub const REGISTER_COUNT: usize = 256;
/// Bytes per bytecode record: `[op, dst, src0, src1]`.
pub const RECORD_LEN: usize = 4;

/// Operations the interpreter implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmOp {
    Add = 1,
    Sub = 2,
    Mul = 3,
    And = 4,
    Or = 5,
    Xor = 6,
    Shl = 7,
    LShr = 8,
}

impl VmOp {
    pub const ALL: [Self; 8] = [
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::And,
        Self::Or,
        Self::Xor,
        Self::Shl,
        Self::LShr,
    ];

    /// Maps a binary operator to its opcode. Division, remainder and `ashr` are not
    /// virtualized: widening then truncating does not preserve their results.
    pub const fn from_binop(op: BinOp) -> Option<Self> {
        Some(match op {
            BinOp::Add => Self::Add,
            BinOp::Sub => Self::Sub,
            BinOp::Mul => Self::Mul,
            BinOp::And => Self::And,
            BinOp::Or => Self::Or,
            BinOp::Xor => Self::Xor,
            BinOp::Shl => Self::Shl,
            BinOp::LShr => Self::LShr,
            _ => return None,
        })
    }

    pub const fn binop(self) -> BinOp {
        match self {
            Self::Add => BinOp::Add,
            Self::Sub => BinOp::Sub,
            Self::Mul => BinOp::Mul,
            Self::And => BinOp::And,
            Self::Or => BinOp::Or,
            Self::Xor => BinOp::Xor,
            Self::Shl => BinOp::Shl,
            Self::LShr => BinOp::LShr,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Virtualizes eligible binary operations.
#[derive(Debug, Clone, Default)]
pub struct Virtualize {
    config: PassConfig,
}

impl Virtualize {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }
}

impl Transform for Virtualize {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply(
        &self,
        module: &mut Module,
        rng: &mut dyn RngCore,
    ) -> Result<TransformReport, TransformError> {
        let selector = FunctionSelector::from_config(&self.config);
        let encoding = self.config.vm_encoding;
        Ok(rewrite_functions(module, NAME, &selector, |module, name| {
            virtualize_function(module, name, encoding, rng)
        }))
    }
}

fn eligible(func: &Function, inst: InstId) -> Option<VmOp> {
    let data = func.inst(inst);
    match &data.kind {
        InstKind::Binary { op, .. } if data.ty.is_some_and(Type::is_int) => VmOp::from_binop(*op),
        _ => None,
    }
}

fn virtualize_function(
    module: &mut Module,
    name: &str,
    encoding: VmEncoding,
    rng: &mut dyn RngCore,
) -> Result<FunctionOutcome, TransformError> {
    let func = module.expect_function_mut(name)?;
    let sites: Vec<(BlockId, InstId)> = func
        .live_insts()
        .into_iter()
        .filter(|(_, inst)| eligible(func, *inst).is_some())
        .collect();
    if sites.is_empty() {
        return Ok(FunctionOutcome::Skipped(SkipReason::NoEligibleSites));
    }

    ensure_runtime(module, encoding);

    for (block, inst) in &sites {
        // Operands are read at rewrite time: earlier sites may have replaced them.
        let func = module.expect_function_mut(name)?;
        let data = func.inst(*inst).clone();
        let (InstKind::Binary { lhs, rhs, .. }, Some(ty)) = (data.kind, data.ty) else {
            continue;
        };
        let Some(op) = eligible(func, *inst) else {
            continue;
        };
        let regs = index::sample(rng, REGISTER_COUNT, 3).into_vec();
        let (rd, r0, r1) = (regs[0] as u8, regs[1] as u8, regs[2] as u8);
        let record = [op.code(), rd, r0, r1];

        let call = match encoding {
            VmEncoding::RegisterCall => Call::Dispatch(record),
            VmEncoding::Bytecode => {
                let key: u8 = rng.random_range(1..=255);
                let code = module
                    .global_mut(CODE)
                    .ok_or_else(|| TransformError::InvariantViolation {
                        function: name.to_string(),
                        detail: format!("@{CODE} missing"),
                    })?;
                let offset = code.len();
                code.init
                    .extend(record.iter().map(|byte| ConstValue::Int((byte ^ key) as u64)));
                Call::Exec { offset, key }
            }
        };

        let func = module.expect_function_mut(name)?;
        let mut b = Builder::before(func, *block, *inst)?;
        // `lshr` needs the shifted value zero-extended or high one-bits would shift in.
        let a = b.int_cast(lhs, Type::I64, op != VmOp::LShr);
        let c = b.int_cast(rhs, Type::I64, true);
        let slot0 = register(&mut b, r0);
        b.store(a, slot0);
        let slot1 = register(&mut b, r1);
        b.store(c, slot1);
        match call {
            Call::Dispatch(args) => {
                b.call(DISPATCH, args.iter().map(|&v| Value::i8(v)).collect(), None);
            }
            Call::Exec { offset, key } => {
                let rec = b.element_ptr(Value::global(CODE), Value::i64(offset as u64), 1);
                b.call(EXEC, vec![rec, Value::i8(key)], None);
            }
        }
        let slot_d = register(&mut b, rd);
        let wide = b.load(Type::I64, slot_d);
        let result = b.int_cast(wide, ty, true);

        func.replace_all_uses(*inst, &result);
        func.remove_inst(*block, *inst);
        debug!(
            "@{}: %{} {:?} -> r{} (r{}, r{})",
            name, inst.0, op, rd, r0, r1
        );
    }
    Ok(FunctionOutcome::Rewritten { sites: sites.len() })
}

enum Call {
    Dispatch([u8; RECORD_LEN]),
    Exec { offset: usize, key: u8 },
}

fn register(b: &mut Builder<'_>, index: u8) -> Value {
    b.element_ptr(Value::global(REGISTERS), Value::i64(index as u64), 8)
}

/// Creates the register file, the dispatcher and, for bytecode, the code buffer and its
/// decoder. Existing artifacts are reused.
fn ensure_runtime(module: &mut Module, encoding: VmEncoding) {
    module.get_or_insert_global_with(REGISTERS, NAME, || {
        phantom_core::ir::Global::zeroed(REGISTERS, Type::I64, REGISTER_COUNT)
    });
    module.get_or_insert_function_with(DISPATCH, NAME, build_dispatch);
    if encoding == VmEncoding::Bytecode {
        module.get_or_insert_global_with(CODE, NAME, || {
            phantom_core::ir::Global::constant(CODE, Type::I8, Vec::new())
        });
        module.get_or_insert_function_with(EXEC, NAME, build_exec);
    }
}

/// `void __vm_dispatch(i8 op, i8 dst, i8 src0, i8 src1)`: reads both source registers, runs
/// the opcode's block and writes the destination register. Unknown opcodes trap.
pub fn build_dispatch() -> Function {
    let mut f = Function::new(DISPATCH, vec![Type::I8; 4], None);
    f.attrs.no_inline = true;
    f.attrs.optimize_none = true;
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let trap = b.new_block("vm.trap");
    let i0 = b.int_cast(Value::Param(2), Type::I64, false);
    let i1 = b.int_cast(Value::Param(3), Type::I64, false);
    let p0 = b.element_ptr(Value::global(REGISTERS), i0, 8);
    let p1 = b.element_ptr(Value::global(REGISTERS), i1, 8);
    let a = b.load(Type::I64, p0);
    let c = b.load(Type::I64, p1);

    let mut cases = Vec::with_capacity(VmOp::ALL.len());
    for op in VmOp::ALL {
        let block = b.new_block(format!("vm.{}", op.binop().mnemonic()));
        cases.push((op.code() as u64, block));
    }
    b.switch(Value::Param(0), trap, cases.clone());

    for (op, (_, block)) in VmOp::ALL.iter().zip(cases) {
        b.position_at_end(block);
        let out = b.binary(op.binop(), a.clone(), c.clone());
        let d = b.int_cast(Value::Param(1), Type::I64, false);
        let pd = b.element_ptr(Value::global(REGISTERS), d, 8);
        b.store(out, pd);
        b.ret(None);
    }
    b.position_at_end(trap);
    b.unreachable();
    f
}

/// `void __vm_exec(ptr record, i8 key)`: decrypts a four-byte record and dispatches it.
pub fn build_exec() -> Function {
    let mut f = Function::new(EXEC, vec![Type::Ptr, Type::I8], None);
    f.attrs.no_inline = true;
    f.attrs.optimize_none = true;
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let mut fields = Vec::with_capacity(RECORD_LEN);
    for i in 0..RECORD_LEN {
        let p = b.element_ptr(Value::Param(0), Value::i64(i as u64), 1);
        let byte = b.load_volatile(Type::I8, p);
        fields.push(b.xor(byte, Value::Param(1)));
    }
    b.call(DISPATCH, fields, None);
    b.ret(None);
    f
}
