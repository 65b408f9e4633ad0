//! Reference interpreter for the IR.
//!
//! The interpreter exists so that semantic equivalence of transformed code can be checked by
//! running it. It models a flat little-endian data memory holding the globals followed by a
//! call stack for `alloca` slots, and assigns every function and block a synthetic code address
//! so that function pointers, block addresses and link-time address constants behave like
//! ordinary integers. Loading a module resolves every `ConstValue::Addr` initializer with
//! static relocation: the absolute address of the symbol plus its addend.

use crate::ir::{
    BinOp, BlockId, Callee, CastOp, CmpPred, ConstValue, Function, InstKind, Module, Symbol,
    Terminator, Type, Value,
};
use phantom_utils::errors::{InterpError, IrError};
use std::collections::HashMap;
use std::ops::Range;
use tracing::trace;

/// First address of data memory. Address zero and its neighbourhood stay unmapped.
pub const DATA_BASE: u64 = 0x1000;
/// First synthetic code address. Function `i` lives at `CODE_BASE + i * CODE_STRIDE`.
pub const CODE_BASE: u64 = 0x4000_0000;
const CODE_STRIDE: u64 = 0x1_0000;
const BLOCK_STRIDE: u64 = 0x10;

const DEFAULT_STACK_BYTES: usize = 64 * 1024;
const DEFAULT_FUEL: u64 = 50_000_000;
const DEFAULT_MAX_DEPTH: usize = 200;

/// Native implementation of a declared function. Receives the argument bits and returns the
/// result bits (ignored for `void` declarations).
pub type HostFn = Box<dyn FnMut(&[u64]) -> u64>;

/// What a synthetic code address designates.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CodeTarget {
    Function(String),
    Block(String, BlockId),
}

/// An interpreter instance bound to one module.
pub struct Machine<'m> {
    module: &'m Module,
    memory: Vec<u8>,
    globals: HashMap<String, u64>,
    functions: HashMap<String, u64>,
    code: HashMap<u64, CodeTarget>,
    /// Address ranges of `constant` globals; stores into them fault.
    read_only: Vec<Range<u64>>,
    hosts: HashMap<String, HostFn>,
    stack_base: u64,
    sp: u64,
    fuel: u64,
    depth: usize,
    max_depth: usize,
}

impl std::fmt::Debug for Machine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("module", &self.module.name)
            .field("memory_bytes", &self.memory.len())
            .field("stack_base", &self.stack_base)
            .field("sp", &self.sp)
            .field("fuel", &self.fuel)
            .finish()
    }
}

const fn align8(value: u64) -> u64 {
    (value + 7) & !7
}

impl<'m> Machine<'m> {
    /// Lays out `module` in memory and resolves its initializers.
    pub fn new(module: &'m Module) -> Result<Self, InterpError> {
        let mut functions = HashMap::new();
        let mut code = HashMap::new();
        for (index, (name, func)) in module.functions.iter().enumerate() {
            let addr = CODE_BASE + index as u64 * CODE_STRIDE;
            functions.insert(name.clone(), addr);
            code.insert(addr, CodeTarget::Function(name.clone()));
            for block in func.block_ids() {
                code.insert(
                    addr + (block.0 as u64 + 1) * BLOCK_STRIDE,
                    CodeTarget::Block(name.clone(), block),
                );
            }
        }

        let mut globals = HashMap::new();
        let mut read_only = Vec::new();
        let mut cursor = DATA_BASE;
        for (name, global) in &module.globals {
            globals.insert(name.clone(), cursor);
            if global.constant {
                read_only.push(cursor..cursor + global.size_in_bytes() as u64);
            }
            cursor = align8(cursor + (global.size_in_bytes() as u64).max(1));
        }
        let stack_base = cursor;
        let memory = vec![0u8; (stack_base - DATA_BASE) as usize + DEFAULT_STACK_BYTES];

        let mut machine = Self {
            module,
            memory,
            globals,
            functions,
            code,
            read_only,
            hosts: HashMap::new(),
            stack_base,
            sp: stack_base,
            fuel: DEFAULT_FUEL,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        };
        machine.load_initializers()?;
        Ok(machine)
    }

    fn load_initializers(&mut self) -> Result<(), InterpError> {
        let module = self.module;
        for (name, global) in &module.globals {
            let base = self.globals[name];
            let width = global.ty.bytes();
            for (i, value) in global.init.iter().enumerate() {
                let bits = match value {
                    ConstValue::Int(bits) => *bits,
                    ConstValue::Addr { symbol, addend } => {
                        self.symbol_address(symbol)?.wrapping_add(*addend as u64)
                    }
                };
                self.store_bits(base + (i * width) as u64, global.ty, bits)?;
            }
        }
        Ok(())
    }

    /// Limits the number of executed instructions and terminators.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Registers a native implementation for the declaration `name`.
    pub fn register_host(&mut self, name: impl Into<String>, host: HostFn) {
        self.hosts.insert(name.into(), host);
    }

    pub fn remaining_fuel(&self) -> u64 {
        self.fuel
    }

    /// Synthetic code address of a function.
    pub fn function_address(&self, name: &str) -> Option<u64> {
        self.functions.get(name).copied()
    }

    /// Synthetic code address of a block.
    pub fn block_address(&self, function: &str, block: BlockId) -> Option<u64> {
        let func = self.module.function(function)?;
        if block.index() >= func.blocks.len() {
            return None;
        }
        self.function_address(function)
            .map(|addr| addr + (block.0 as u64 + 1) * BLOCK_STRIDE)
    }

    /// Data address of a global.
    pub fn global_address(&self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }

    fn symbol_address(&self, symbol: &Symbol) -> Result<u64, InterpError> {
        match symbol {
            Symbol::Function(name) => self
                .function_address(name)
                .ok_or_else(|| IrError::UnknownFunction(name.clone()).into()),
            Symbol::Global(name) => self
                .global_address(name)
                .ok_or_else(|| IrError::UnknownGlobal(name.clone()).into()),
            Symbol::Block { function, block } => self
                .block_address(function, *block)
                .ok_or_else(|| {
                    IrError::UnknownBlock {
                        function: function.clone(),
                        block: block.0,
                    }
                    .into()
                }),
        }
    }

    /// Reads element `index` of the global `name`.
    pub fn read_global(&self, name: &str, index: usize) -> Result<u64, InterpError> {
        let (addr, ty) = self.global_element(name, index)?;
        self.load_bits(addr, ty)
    }

    /// Overwrites element `index` of the global `name`. Unlike a `store` executed by code, this
    /// also writes `constant` globals.
    pub fn write_global(&mut self, name: &str, index: usize, bits: u64) -> Result<(), InterpError> {
        let (addr, ty) = self.global_element(name, index)?;
        self.store_bits(addr, ty, bits)
    }

    fn global_element(&self, name: &str, index: usize) -> Result<(u64, Type), InterpError> {
        let global = self
            .module
            .global(name)
            .ok_or_else(|| IrError::UnknownGlobal(name.to_string()))?;
        let base = self.globals[name];
        let addr = base + (index * global.ty.bytes()) as u64;
        if index >= global.len() {
            return Err(InterpError::BadAddress {
                addr,
                len: global.ty.bytes(),
            });
        }
        Ok((addr, global.ty))
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, InterpError> {
        let bad = || InterpError::BadAddress { addr, len };
        let start = addr.checked_sub(DATA_BASE).ok_or_else(bad)? as usize;
        let end = start.checked_add(len).ok_or_else(bad)?;
        if end > self.memory.len() {
            return Err(bad());
        }
        Ok(start..end)
    }

    fn load_bits(&self, addr: u64, ty: Type) -> Result<u64, InterpError> {
        let range = self.range(addr, ty.bytes())?;
        let mut buf = [0u8; 8];
        buf[..ty.bytes()].copy_from_slice(&self.memory[range]);
        Ok(u64::from_le_bytes(buf) & ty.mask())
    }

    fn store_bits(&mut self, addr: u64, ty: Type, bits: u64) -> Result<(), InterpError> {
        let range = self.range(addr, ty.bytes())?;
        let bytes = (bits & ty.mask()).to_le_bytes();
        self.memory[range].copy_from_slice(&bytes[..ty.bytes()]);
        Ok(())
    }

    fn burn(&mut self) -> Result<(), InterpError> {
        if self.fuel == 0 {
            return Err(InterpError::FuelExhausted);
        }
        self.fuel -= 1;
        Ok(())
    }

    /// Calls `name` with raw argument bits. Returns `None` for `void` functions.
    pub fn call(&mut self, name: &str, args: &[u64]) -> Result<Option<u64>, InterpError> {
        let module = self.module;
        let func = module
            .function(name)
            .ok_or_else(|| InterpError::UnknownFunction(name.to_string()))?;
        if func.params.len() != args.len() {
            return Err(InterpError::ArityMismatch {
                function: name.to_string(),
                expected: func.params.len(),
                got: args.len(),
            });
        }
        let args: Vec<u64> = args
            .iter()
            .zip(&func.params)
            .map(|(bits, ty)| bits & ty.mask())
            .collect();
        if func.is_declaration() {
            let host = self
                .hosts
                .get_mut(name)
                .ok_or_else(|| InterpError::MissingHost(name.to_string()))?;
            let result = host(&args);
            return Ok(func.ret.map(|ty| result & ty.mask()));
        }
        if self.depth >= self.max_depth {
            return Err(InterpError::StackOverflow);
        }
        self.depth += 1;
        let saved_sp = self.sp;
        let result = self.run(func, &args);
        self.sp = saved_sp;
        self.depth -= 1;
        result
    }

    fn run(&mut self, func: &'m Function, args: &[u64]) -> Result<Option<u64>, InterpError> {
        trace!("enter @{}", func.name);
        let mut frame: Vec<Option<u64>> = vec![None; func.insts.len()];
        let mut block = func.entry;
        loop {
            let data = func
                .blocks
                .get(block.index())
                .ok_or_else(|| IrError::UnknownBlock {
                    function: func.name.clone(),
                    block: block.0,
                })?;
            for &inst in &data.insts {
                self.burn()?;
                let result = self.step(func, &frame, args, &func.inst(inst).kind)?;
                frame[inst.index()] = result;
            }
            self.burn()?;
            let term = data.term.as_ref().ok_or(IrError::MissingTerminator {
                function: func.name.clone(),
                block: block.0,
            })?;
            let eval = |v: &Value| self.eval(func, &frame, args, v);
            block = match term {
                Terminator::Br(dest) => *dest,
                Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    if eval(cond)? & 1 == 1 {
                        *then_dest
                    } else {
                        *else_dest
                    }
                }
                Terminator::Switch {
                    value,
                    default,
                    cases,
                } => {
                    let mask = func.value_type(value).unwrap_or(Type::I64).mask();
                    let key = eval(value)?;
                    cases
                        .iter()
                        .find(|(case, _)| case & mask == key)
                        .map_or(*default, |(_, dest)| *dest)
                }
                Terminator::IndirectBr { addr, dests } => {
                    let target = eval(addr)?;
                    match self.code.get(&target) {
                        Some(CodeTarget::Block(owner, dest))
                            if *owner == func.name && dests.contains(dest) =>
                        {
                            *dest
                        }
                        _ => {
                            return Err(InterpError::BadIndirectTarget {
                                function: func.name.clone(),
                                addr: target,
                            });
                        }
                    }
                }
                Terminator::Ret(None) => return Ok(None),
                Terminator::Ret(Some(value)) => return Ok(Some(eval(value)?)),
                Terminator::Unreachable => {
                    return Err(InterpError::Trap {
                        function: func.name.clone(),
                        block: block.0,
                    });
                }
            };
        }
    }

    fn eval(
        &self,
        func: &Function,
        frame: &[Option<u64>],
        args: &[u64],
        value: &Value,
    ) -> Result<u64, InterpError> {
        match value {
            Value::Const { bits, .. } => Ok(*bits),
            Value::Inst(id) => frame.get(id.index()).copied().flatten().ok_or_else(|| {
                InterpError::UndefinedValue {
                    function: func.name.clone(),
                    inst: id.0,
                }
            }),
            Value::Param(index) => args.get(*index as usize).copied().ok_or_else(|| {
                IrError::UnknownParam {
                    function: func.name.clone(),
                    index: *index,
                }
                .into()
            }),
            Value::Global(name) => self.symbol_address(&Symbol::Global(name.clone())),
            Value::Function(name) => self.symbol_address(&Symbol::Function(name.clone())),
            Value::Block(block) => self.symbol_address(&Symbol::Block {
                function: func.name.clone(),
                block: *block,
            }),
        }
    }

    fn step(
        &mut self,
        func: &'m Function,
        frame: &[Option<u64>],
        args: &[u64],
        kind: &InstKind,
    ) -> Result<Option<u64>, InterpError> {
        let ty_of = |v: &Value| func.value_type(v).unwrap_or(Type::I64);
        let result = match kind {
            InstKind::Binary { op, lhs, rhs } => {
                let ty = ty_of(lhs);
                let l = self.eval(func, frame, args, lhs)?;
                let r = self.eval(func, frame, args, rhs)?;
                Some(binary(*op, ty, l, r)?)
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let ty = ty_of(lhs);
                let l = self.eval(func, frame, args, lhs)?;
                let r = self.eval(func, frame, args, rhs)?;
                Some(compare(*pred, ty, l, r) as u64)
            }
            InstKind::Select {
                cond,
                then_value,
                else_value,
            } => {
                let chosen = if self.eval(func, frame, args, cond)? & 1 == 1 {
                    then_value
                } else {
                    else_value
                };
                Some(self.eval(func, frame, args, chosen)?)
            }
            InstKind::Cast { op, value, to } => {
                let from = ty_of(value);
                let bits = self.eval(func, frame, args, value)?;
                let out = match op {
                    CastOp::SExt => from.sign_extend(bits) as u64,
                    CastOp::ZExt | CastOp::Trunc | CastOp::PtrToInt | CastOp::IntToPtr => bits,
                };
                Some(out & to.mask())
            }
            InstKind::Alloca { ty } => {
                let addr = self.sp;
                let next = align8(addr + ty.bytes() as u64);
                if (next - DATA_BASE) as usize > self.memory.len() {
                    return Err(InterpError::StackOverflow);
                }
                self.sp = next;
                let slot = self.range(addr, ty.bytes())?;
                self.memory[slot].fill(0);
                Some(addr)
            }
            InstKind::Load { ty, ptr, .. } => {
                let addr = self.eval(func, frame, args, ptr)?;
                Some(self.load_bits(addr, *ty)?)
            }
            InstKind::Store { value, ptr, .. } => {
                let ty = ty_of(value);
                let bits = self.eval(func, frame, args, value)?;
                let addr = self.eval(func, frame, args, ptr)?;
                let end = addr.saturating_add(ty.bytes() as u64);
                if self.read_only.iter().any(|r| addr < r.end && r.start < end) {
                    return Err(InterpError::ReadOnlyWrite { addr });
                }
                self.store_bits(addr, ty, bits)?;
                None
            }
            InstKind::ElementPtr {
                base,
                index,
                stride,
            } => {
                let base = self.eval(func, frame, args, base)?;
                let offset = ty_of(index).sign_extend(self.eval(func, frame, args, index)?);
                Some(base.wrapping_add(offset.wrapping_mul(*stride as i64) as u64))
            }
            InstKind::Call { callee, args: call_args, .. } => {
                let name = match callee {
                    Callee::Direct(name) => name.clone(),
                    Callee::Indirect(target) => {
                        let addr = self.eval(func, frame, args, target)?;
                        match self.code.get(&addr) {
                            Some(CodeTarget::Function(name)) => name.clone(),
                            _ => return Err(InterpError::BadCallTarget(addr)),
                        }
                    }
                };
                let values = call_args
                    .iter()
                    .map(|a| self.eval(func, frame, args, a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(&name, &values)?
            }
        };
        Ok(result)
    }
}

fn binary(op: BinOp, ty: Type, l: u64, r: u64) -> Result<u64, InterpError> {
    let bits = ty.bits() as u64;
    let signed = |v: u64| ty.sign_extend(v);
    let out = match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::UDiv | BinOp::URem | BinOp::SDiv | BinOp::SRem if r & ty.mask() == 0 => {
            return Err(InterpError::DivisionByZero);
        }
        BinOp::UDiv => l / r,
        BinOp::URem => l % r,
        BinOp::SDiv => signed(l).wrapping_div(signed(r)) as u64,
        BinOp::SRem => signed(l).wrapping_rem(signed(r)) as u64,
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
        BinOp::Shl if r >= bits => 0,
        BinOp::Shl => l << r,
        BinOp::LShr if r >= bits => 0,
        BinOp::LShr => l >> r,
        BinOp::AShr => (signed(l) >> r.min(63)) as u64,
    };
    Ok(out & ty.mask())
}

fn compare(pred: CmpPred, ty: Type, l: u64, r: u64) -> bool {
    let (sl, sr) = (ty.sign_extend(l), ty.sign_extend(r));
    match pred {
        CmpPred::Eq => l == r,
        CmpPred::Ne => l != r,
        CmpPred::Ugt => l > r,
        CmpPred::Uge => l >= r,
        CmpPred::Ult => l < r,
        CmpPred::Ule => l <= r,
        CmpPred::Sgt => sl > sr,
        CmpPred::Sge => sl >= sr,
        CmpPred::Slt => sl < sr,
        CmpPred::Sle => sl <= sr,
    }
}
