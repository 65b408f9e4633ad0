//! Deterministic textual listing of modules and functions.

use super::{
    Block, BlockId, Callee, ConstValue, Function, Global, InstKind, Module, RelocationModel,
    Symbol, Terminator, Type, Value,
};
use std::fmt;

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I1 => "i1",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Ptr => "ptr",
        };
        f.write_str(name)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const { ty: Type::I1, bits } => {
                f.write_str(if *bits == 0 { "false" } else { "true" })
            }
            Self::Const { ty, bits } => write!(f, "{}", ty.sign_extend(*bits)),
            Self::Inst(id) => write!(f, "%{}", id.0),
            Self::Param(index) => write!(f, "%arg{index}"),
            Self::Global(name) | Self::Function(name) => write!(f, "@{name}"),
            Self::Block(block) => write!(f, "blockaddress({block})"),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(name) | Self::Global(name) => write!(f, "@{name}"),
            Self::Block { function, block } => write!(f, "blockaddress(@{function}, {block})"),
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(bits) => write!(f, "{bits}"),
            Self::Addr { symbol, addend: 0 } => write!(f, "{symbol}"),
            Self::Addr { symbol, addend } => write!(f, "{symbol} {addend:+}"),
        }
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.constant { "constant" } else { "global" };
        write!(f, "@{} = {} [{} x {}]", self.name, kind, self.len(), self.ty)?;
        if self.init.iter().all(|c| *c == ConstValue::Int(0)) {
            return f.write_str(" zeroinitializer");
        }
        f.write_str(" [")?;
        for (i, value) in self.init.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str("]")
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Value]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{arg}")?;
    }
    Ok(())
}

fn write_inst(f: &mut fmt::Formatter<'_>, func: &Function, kind: &InstKind) -> fmt::Result {
    let ty_of = |v: &Value| {
        func.value_type(v)
            .map_or_else(|| "?".to_string(), |t| t.to_string())
    };
    match kind {
        InstKind::Binary { op, lhs, rhs } => {
            write!(f, "{} {} {lhs}, {rhs}", op.mnemonic(), ty_of(lhs))
        }
        InstKind::ICmp { pred, lhs, rhs } => {
            write!(f, "icmp {} {} {lhs}, {rhs}", pred.mnemonic(), ty_of(lhs))
        }
        InstKind::Select {
            cond,
            then_value,
            else_value,
        } => write!(
            f,
            "select {cond}, {} {then_value}, {else_value}",
            ty_of(then_value)
        ),
        InstKind::Cast { op, value, to } => {
            write!(f, "{} {} {value} to {to}", op.mnemonic(), ty_of(value))
        }
        InstKind::Alloca { ty } => write!(f, "alloca {ty}"),
        InstKind::Load { ty, ptr, volatile } => {
            let v = if *volatile { "volatile " } else { "" };
            write!(f, "load {v}{ty}, {ptr}")
        }
        InstKind::Store {
            value,
            ptr,
            volatile,
        } => {
            let v = if *volatile { "volatile " } else { "" };
            write!(f, "store {v}{} {value}, {ptr}", ty_of(value))
        }
        InstKind::ElementPtr {
            base,
            index,
            stride,
        } => write!(f, "elementptr {base}, {index} x {stride}"),
        InstKind::Call { callee, args, ret } => {
            let ret = ret.map_or_else(|| "void".to_string(), |t| t.to_string());
            match callee {
                Callee::Direct(name) => write!(f, "call {ret} @{name}(")?,
                Callee::Indirect(target) => write!(f, "call {ret} {target}(")?,
            }
            write_args(f, args)?;
            f.write_str(")")
        }
    }
}

fn write_terminator(f: &mut fmt::Formatter<'_>, func: &Function, term: &Terminator) -> fmt::Result {
    match term {
        Terminator::Br(dest) => write!(f, "br {dest}"),
        Terminator::CondBr {
            cond,
            then_dest,
            else_dest,
        } => write!(f, "br {cond}, {then_dest}, {else_dest}"),
        Terminator::Switch {
            value,
            default,
            cases,
        } => {
            write!(f, "switch {value}, default {default} [")?;
            for (i, (case, dest)) in cases.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{case} -> {dest}")?;
            }
            f.write_str("]")
        }
        Terminator::IndirectBr { addr, dests } => {
            write!(f, "indirectbr {addr} [")?;
            for (i, dest) in dests.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{dest}")?;
            }
            f.write_str("]")
        }
        Terminator::Ret(None) => f.write_str("ret void"),
        Terminator::Ret(Some(value)) => {
            let ty = func
                .value_type(value)
                .map_or_else(|| "?".to_string(), |t| t.to_string());
            write!(f, "ret {ty} {value}")
        }
        Terminator::Unreachable => f.write_str("unreachable"),
    }
}

fn write_block(
    f: &mut fmt::Formatter<'_>,
    func: &Function,
    id: BlockId,
    block: &Block,
) -> fmt::Result {
    writeln!(f, "{id}:  ; {}", block.name)?;
    for &inst in &block.insts {
        let data = func.inst(inst);
        f.write_str("  ")?;
        if data.ty.is_some() {
            write!(f, "%{} = ", inst.0)?;
        }
        write_inst(f, func, &data.kind)?;
        f.write_str("\n")?;
    }
    f.write_str("  ")?;
    match &block.term {
        Some(term) => write_terminator(f, func, term)?,
        None => f.write_str("<no terminator>")?,
    }
    f.write_str("\n")
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ret = self
            .ret
            .map_or_else(|| "void".to_string(), |t| t.to_string());
        let keyword = if self.is_declaration() {
            "declare"
        } else {
            "define"
        };
        write!(f, "{keyword} {ret} @{}(", self.name)?;
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ty} %arg{i}")?;
        }
        f.write_str(")")?;
        let attrs = [
            (self.attrs.no_inline, "noinline"),
            (self.attrs.optimize_none, "optnone"),
            (self.attrs.always_inline, "alwaysinline"),
            (self.attrs.intrinsic, "intrinsic"),
        ];
        for (_, name) in attrs.iter().filter(|(set, _)| *set) {
            write!(f, " {name}")?;
        }
        if self.is_declaration() {
            return f.write_str("\n");
        }
        f.write_str(" {\n")?;
        for (index, block) in self.blocks.iter().enumerate() {
            write_block(f, self, BlockId(index as u32), block)?;
        }
        f.write_str("}\n")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reloc = match self.target.relocation {
            RelocationModel::Static => "static",
            RelocationModel::Pic => "pic",
        };
        writeln!(
            f,
            "; module {} ({}, {}-bit, {reloc})",
            self.name, self.target.arch, self.target.pointer_bits
        )?;
        if let Some(entry) = &self.entry_point {
            writeln!(f, "; entry point @{entry}")?;
        }
        for global in self.globals.values() {
            writeln!(f, "{global}")?;
        }
        for function in self.functions.values() {
            f.write_str("\n")?;
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Builder;

    #[test]
    fn listing_is_stable() {
        let mut module = Module::new("demo");
        module.add_global(Global::new(
            "cell",
            Type::I32,
            vec![ConstValue::Int(13)],
        ));
        let mut f = Function::new("inc", vec![Type::I32], Some(Type::I32));
        let entry = f.entry;
        let mut b = Builder::at_end(&mut f, entry);
        let sum = b.add(Value::Param(0), Value::i32(-1));
        b.ret(Some(sum));
        module.add_function(f);

        let text = module.to_string();
        let expected = "; module demo (x86_64, 64-bit, static)\n\
                        @cell = global [1 x i32] [13]\n\
                        \n\
                        define i32 @inc(i32 %arg0) {\n\
                        bb0:  ; entry\n  \
                        %0 = add i32 %arg0, -1\n  \
                        ret i32 %0\n\
                        }\n";
        assert_eq!(text, expected);
        assert_eq!(text, module.clone().to_string());
    }
}
