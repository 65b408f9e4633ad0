//! Instruction builder positioned inside a function.

use super::{
    BinOp, BlockId, Callee, CastOp, CmpPred, Function, InstId, InstKind, Terminator, Type, Value,
};
use phantom_utils::errors::IrError;

/// Emits instructions at an insertion point: the end of a block, or just before an existing
/// instruction. Inserting before an instruction keeps the cursor in front of it, so a sequence
/// of calls lands in program order.
#[derive(Debug)]
pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
    at: Option<usize>,
}

impl<'f> Builder<'f> {
    pub const fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        Self {
            func,
            block,
            at: None,
        }
    }

    /// Positions the builder immediately before `inst` in `block`.
    pub fn before(func: &'f mut Function, block: BlockId, inst: InstId) -> Result<Self, IrError> {
        let index = func
            .position_of(block, inst)
            .ok_or_else(|| IrError::UnknownInstruction {
                function: func.name.clone(),
                inst: inst.0,
            })?;
        Ok(Self {
            func,
            block,
            at: Some(index),
        })
    }

    pub const fn position_at_end(&mut self, block: BlockId) {
        self.block = block;
        self.at = None;
    }

    pub const fn current_block(&self) -> BlockId {
        self.block
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    pub fn value_type(&self, value: &Value) -> Option<Type> {
        self.func.value_type(value)
    }

    pub fn new_block(&mut self, name: impl Into<String>) -> BlockId {
        self.func.add_block(name)
    }

    fn emit(&mut self, kind: InstKind) -> Value {
        let id = match self.at {
            None => self.func.push_inst(self.block, kind),
            Some(index) => {
                let id = self.func.insert_inst(self.block, index, kind);
                self.at = Some(index + 1);
                id
            }
        };
        Value::Inst(id)
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.emit(InstKind::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn and(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::And, lhs, rhs)
    }

    pub fn or(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Or, lhs, rhs)
    }

    pub fn xor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Xor, lhs, rhs)
    }

    pub fn shl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Shl, lhs, rhs)
    }

    pub fn icmp(&mut self, pred: CmpPred, lhs: Value, rhs: Value) -> Value {
        self.emit(InstKind::ICmp { pred, lhs, rhs })
    }

    pub fn select(&mut self, cond: Value, then_value: Value, else_value: Value) -> Value {
        self.emit(InstKind::Select {
            cond,
            then_value,
            else_value,
        })
    }

    pub fn cast(&mut self, op: CastOp, value: Value, to: Type) -> Value {
        self.emit(InstKind::Cast { op, value, to })
    }

    /// Converts an integer to width `to`: truncation when narrowing, sign or zero extension
    /// when widening, the value itself when the widths already match.
    pub fn int_cast(&mut self, value: Value, to: Type, signed: bool) -> Value {
        let from = self.value_type(&value).unwrap_or(to);
        if from.bits() == to.bits() {
            return value;
        }
        let op = if from.bits() > to.bits() {
            CastOp::Trunc
        } else if signed {
            CastOp::SExt
        } else {
            CastOp::ZExt
        };
        self.cast(op, value, to)
    }

    pub fn alloca(&mut self, ty: Type) -> Value {
        self.emit(InstKind::Alloca { ty })
    }

    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        self.emit(InstKind::Load {
            ty,
            ptr,
            volatile: false,
        })
    }

    pub fn load_volatile(&mut self, ty: Type, ptr: Value) -> Value {
        self.emit(InstKind::Load {
            ty,
            ptr,
            volatile: true,
        })
    }

    pub fn store(&mut self, value: Value, ptr: Value) {
        self.emit(InstKind::Store {
            value,
            ptr,
            volatile: false,
        });
    }

    pub fn element_ptr(&mut self, base: Value, index: Value, stride: u32) -> Value {
        self.emit(InstKind::ElementPtr {
            base,
            index,
            stride,
        })
    }

    pub fn call(&mut self, callee: impl Into<String>, args: Vec<Value>, ret: Option<Type>) -> Value {
        self.emit(InstKind::Call {
            callee: Callee::Direct(callee.into()),
            args,
            ret,
        })
    }

    pub fn call_indirect(&mut self, target: Value, args: Vec<Value>, ret: Option<Type>) -> Value {
        self.emit(InstKind::Call {
            callee: Callee::Indirect(target),
            args,
            ret,
        })
    }

    fn terminate(&mut self, term: Terminator) {
        self.func.set_terminator(self.block, term);
    }

    pub fn br(&mut self, dest: BlockId) {
        self.terminate(Terminator::Br(dest));
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: BlockId, else_dest: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_dest,
            else_dest,
        });
    }

    pub fn switch(&mut self, value: Value, default: BlockId, cases: Vec<(u64, BlockId)>) {
        self.terminate(Terminator::Switch {
            value,
            default,
            cases,
        });
    }

    pub fn indirect_br(&mut self, addr: Value, dests: Vec<BlockId>) {
        self.terminate(Terminator::IndirectBr { addr, dests });
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.terminate(Terminator::Ret(value));
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }
}
