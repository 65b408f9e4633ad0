/// Generic imperative intermediate representation operated on by the obfuscation transforms.
///
/// A `Module` owns global data slots and functions. A `Function` is an arena of basic blocks
/// and instructions addressed by `BlockId` and `InstId`; each block lists its live
/// instructions in order and ends in at most one `Terminator` (exactly one once the function
/// is complete, which the verifier enforces). Values are not phi-based: state that crosses
/// blocks lives in `alloca` slots, the shape produced by unoptimised front ends.
///
/// The representation is deliberately small but covers everything the transforms need:
/// block addresses and indirect branches for jump tables, switches for dispatchers,
/// link-time address constants with addends for encoded call tables, and function attributes
/// for pinning interpreter artifacts.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use self::builder::Builder;

pub mod builder;
mod display;
mod updates;
pub mod verify;

/// Index of a basic block inside its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an instruction inside its function's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstId(pub u32);

impl InstId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// First-class value types. Pointers are 64 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    I1,
    I8,
    I16,
    I32,
    I64,
    Ptr,
}

impl Type {
    pub const fn bits(self) -> u32 {
        match self {
            Self::I1 => 1,
            Self::I8 => 8,
            Self::I16 => 16,
            Self::I32 => 32,
            Self::I64 | Self::Ptr => 64,
        }
    }

    /// Storage size in memory. `i1` occupies one byte.
    pub const fn bytes(self) -> usize {
        match self {
            Self::I1 | Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::I64 | Self::Ptr => 8,
        }
    }

    pub const fn mask(self) -> u64 {
        match self.bits() {
            64 => u64::MAX,
            bits => (1u64 << bits) - 1,
        }
    }

    pub const fn is_int(self) -> bool {
        !matches!(self, Self::Ptr)
    }

    /// Interprets the low `bits()` of `value` as a two's complement integer.
    pub const fn sign_extend(self, value: u64) -> i64 {
        let shift = 64 - self.bits();
        ((value << shift) as i64) >> shift
    }
}

/// An operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Integer constant; `bits` is always masked to the width of `ty`.
    Const { ty: Type, bits: u64 },
    /// Result of another instruction in the same function.
    Inst(InstId),
    /// Function argument.
    Param(u32),
    /// Address of a global data slot.
    Global(String),
    /// Address of a function.
    Function(String),
    /// Address of a block in the same function.
    Block(BlockId),
}

impl Value {
    pub const fn int(ty: Type, bits: u64) -> Self {
        Self::Const {
            ty,
            bits: bits & ty.mask(),
        }
    }

    pub const fn bool(value: bool) -> Self {
        Self::int(Type::I1, value as u64)
    }

    pub const fn i8(value: u8) -> Self {
        Self::int(Type::I8, value as u64)
    }

    pub const fn i32(value: i32) -> Self {
        Self::int(Type::I32, value as u32 as u64)
    }

    pub const fn i64(value: u64) -> Self {
        Self::int(Type::I64, value)
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self::Global(name.into())
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self::Function(name.into())
    }

    pub const fn as_const(&self) -> Option<(Type, u64)> {
        match self {
            Self::Const { ty, bits } => Some((*ty, *bits)),
            _ => None,
        }
    }

    pub const fn as_inst(&self) -> Option<InstId> {
        match self {
            Self::Inst(id) => Some(*id),
            _ => None,
        }
    }
}

/// Integer binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::UDiv => "udiv",
            Self::SDiv => "sdiv",
            Self::URem => "urem",
            Self::SRem => "srem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::LShr => "lshr",
            Self::AShr => "ashr",
        }
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpPred {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl CmpPred {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Ugt => "ugt",
            Self::Uge => "uge",
            Self::Ult => "ult",
            Self::Ule => "ule",
            Self::Sgt => "sgt",
            Self::Sge => "sge",
            Self::Slt => "slt",
            Self::Sle => "sle",
        }
    }
}

/// Conversion operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    PtrToInt,
    IntToPtr,
}

impl CastOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::ZExt => "zext",
            Self::SExt => "sext",
            Self::Trunc => "trunc",
            Self::PtrToInt => "ptrtoint",
            Self::IntToPtr => "inttoptr",
        }
    }
}

/// Call target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    /// Statically known function.
    Direct(String),
    /// Computed function pointer.
    Indirect(Value),
}

/// Non-terminator instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstKind {
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    ICmp {
        pred: CmpPred,
        lhs: Value,
        rhs: Value,
    },
    /// Data select, no control transfer.
    Select {
        cond: Value,
        then_value: Value,
        else_value: Value,
    },
    Cast {
        op: CastOp,
        value: Value,
        to: Type,
    },
    /// Function-local storage slot, released when the function returns.
    Alloca {
        ty: Type,
    },
    Load {
        ty: Type,
        ptr: Value,
        /// Volatile loads must not be folded or elided.
        volatile: bool,
    },
    Store {
        value: Value,
        ptr: Value,
        volatile: bool,
    },
    /// `base + index * stride` in bytes.
    ElementPtr {
        base: Value,
        index: Value,
        stride: u32,
    },
    Call {
        callee: Callee,
        args: Vec<Value>,
        ret: Option<Type>,
    },
}

impl InstKind {
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Self::Binary { lhs, rhs, .. } | Self::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            Self::Select {
                cond,
                then_value,
                else_value,
            } => vec![cond, then_value, else_value],
            Self::Cast { value, .. } => vec![value],
            Self::Alloca { .. } => Vec::new(),
            Self::Load { ptr, .. } => vec![ptr],
            Self::Store { value, ptr, .. } => vec![value, ptr],
            Self::ElementPtr { base, index, .. } => vec![base, index],
            Self::Call { callee, args, .. } => {
                let mut ops: Vec<&Value> = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(target) = callee {
                    ops.push(target);
                }
                ops.extend(args.iter());
                ops
            }
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Self::Binary { lhs, rhs, .. } | Self::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            Self::Select {
                cond,
                then_value,
                else_value,
            } => vec![cond, then_value, else_value],
            Self::Cast { value, .. } => vec![value],
            Self::Alloca { .. } => Vec::new(),
            Self::Load { ptr, .. } => vec![ptr],
            Self::Store { value, ptr, .. } => vec![value, ptr],
            Self::ElementPtr { base, index, .. } => vec![base, index],
            Self::Call { callee, args, .. } => {
                let mut ops: Vec<&mut Value> = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(target) = callee {
                    ops.push(target);
                }
                ops.extend(args.iter_mut());
                ops
            }
        }
    }
}

/// An instruction in the function arena together with its result type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    /// `None` for instructions without a result (stores, void calls).
    pub ty: Option<Type>,
}

/// Control transfer ending a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Value,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Switch {
        value: Value,
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    },
    /// Branch to a computed block address; `dests` declares every block it may reach.
    IndirectBr {
        addr: Value,
        dests: Vec<BlockId>,
    },
    Ret(Option<Value>),
    /// Explicit trap.
    Unreachable,
}

impl Terminator {
    /// Distinct successor blocks in first-seen order.
    pub fn successors(&self) -> Vec<BlockId> {
        let raw: Vec<BlockId> = match self {
            Self::Br(dest) => vec![*dest],
            Self::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            Self::Switch { default, cases, .. } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, dest)| *dest))
                .collect(),
            Self::IndirectBr { dests, .. } => dests.clone(),
            Self::Ret(_) | Self::Unreachable => Vec::new(),
        };
        let mut out = Vec::with_capacity(raw.len());
        for block in raw {
            if !out.contains(&block) {
                out.push(block);
            }
        }
        out
    }

    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Self::CondBr { cond, .. } => vec![cond],
            Self::Switch { value, .. } => vec![value],
            Self::IndirectBr { addr, .. } => vec![addr],
            Self::Ret(Some(value)) => vec![value],
            Self::Br(_) | Self::Ret(None) | Self::Unreachable => Vec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Self::CondBr { cond, .. } => vec![cond],
            Self::Switch { value, .. } => vec![value],
            Self::IndirectBr { addr, .. } => vec![addr],
            Self::Ret(Some(value)) => vec![value],
            Self::Br(_) | Self::Ret(None) | Self::Unreachable => Vec::new(),
        }
    }

    /// Conditional or unconditional direct branch.
    pub const fn is_branch(&self) -> bool {
        matches!(self, Self::Br(_) | Self::CondBr { .. })
    }
}

/// A basic block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Label used for printing only.
    pub name: String,
    /// Live instructions in execution order.
    pub insts: Vec<InstId>,
    pub term: Option<Terminator>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            term: None,
        }
    }
}

/// Function attributes consulted by transforms and code generators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionAttrs {
    pub no_inline: bool,
    pub optimize_none: bool,
    pub always_inline: bool,
    pub intrinsic: bool,
}

/// A function definition or, when it has no blocks, an external declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Option<Type>,
    #[serde(default)]
    pub attrs: FunctionAttrs,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
    pub entry: BlockId,
}

impl Function {
    /// Creates a function with an empty entry block.
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Option<Type>) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            attrs: FunctionAttrs::default(),
            blocks: vec![Block::new("entry")],
            insts: Vec::new(),
            entry: BlockId(0),
        }
    }

    /// Creates an external declaration.
    pub fn declaration(name: impl Into<String>, params: Vec<Type>, ret: Option<Type>) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            attrs: FunctionAttrs::default(),
            blocks: Vec::new(),
            insts: Vec::new(),
            entry: BlockId(0),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + use<> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Type of `value` in the context of this function, if it can be determined.
    pub fn value_type(&self, value: &Value) -> Option<Type> {
        match value {
            Value::Const { ty, .. } => Some(*ty),
            Value::Inst(id) => self.insts.get(id.index()).and_then(|inst| inst.ty),
            Value::Param(index) => self.params.get(*index as usize).copied(),
            Value::Global(_) | Value::Function(_) | Value::Block(_) => Some(Type::Ptr),
        }
    }
}

/// Relocatable symbol usable in a global initializer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbol {
    Function(String),
    Global(String),
    Block { function: String, block: BlockId },
}

/// Element of a global initializer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstValue {
    Int(u64),
    /// Link-time constant `address_of(symbol) + addend`.
    Addr { symbol: Symbol, addend: i64 },
}

impl ConstValue {
    pub const fn addr(symbol: Symbol) -> Self {
        Self::Addr { symbol, addend: 0 }
    }
}

/// A global data slot: an array of `init.len()` elements of type `ty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    /// Read-only data.
    pub constant: bool,
    pub init: Vec<ConstValue>,
}

impl Global {
    /// Mutable global with the given initializer.
    pub fn new(name: impl Into<String>, ty: Type, init: Vec<ConstValue>) -> Self {
        Self {
            name: name.into(),
            ty,
            constant: false,
            init,
        }
    }

    /// Read-only global with the given initializer.
    pub fn constant(name: impl Into<String>, ty: Type, init: Vec<ConstValue>) -> Self {
        Self {
            constant: true,
            ..Self::new(name, ty, init)
        }
    }

    /// Mutable zero-initialised array of `len` elements.
    pub fn zeroed(name: impl Into<String>, ty: Type, len: usize) -> Self {
        Self::new(name, ty, vec![ConstValue::Int(0); len])
    }

    pub fn len(&self) -> usize {
        self.init.len()
    }

    pub fn is_empty(&self) -> bool {
        self.init.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.ty.bytes() * self.init.len()
    }
}

/// How code addresses are materialised when the program is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelocationModel {
    /// Absolute addresses fixed at link time.
    #[default]
    Static,
    /// Position-independent code; absolute address constants need load-time relocation.
    Pic,
}

/// Target description the transforms consult for platform-dependent rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub arch: String,
    pub pointer_bits: u32,
    #[serde(default)]
    pub relocation: RelocationModel,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            arch: "x86_64".to_string(),
            pointer_bits: 64,
            relocation: RelocationModel::Static,
        }
    }
}

/// A translation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub target: Target,
    /// The program's designated entry point, if any.
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub globals: IndexMap<String, Global>,
    #[serde(default)]
    pub functions: IndexMap<String, Function>,
    /// Transform-created globals and functions, mapped to the transform that created them.
    #[serde(default)]
    pub artifacts: IndexMap<String, String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Target::default(),
            entry_point: None,
            globals: IndexMap::new(),
            functions: IndexMap::new(),
            artifacts: IndexMap::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.get_mut(name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.get(name)
    }

    pub fn global_mut(&mut self, name: &str) -> Option<&mut Global> {
        self.globals.get_mut(name)
    }
}
