//! Structural verifier.
//!
//! Run after every transform by the pass runner; a module that fails verification is rolled
//! back rather than committed.

use super::{Callee, ConstValue, Function, Module, Symbol, Terminator, Value};
use phantom_utils::errors::IrError;
use std::collections::HashSet;

/// Verifies every global initializer and every function body in `module`.
pub fn verify_module(module: &Module) -> Result<(), IrError> {
    for global in module.globals.values() {
        for value in &global.init {
            if let ConstValue::Addr { symbol, .. } = value {
                verify_symbol(module, symbol)?;
            }
        }
    }
    for function in module.functions.values() {
        verify_function(module, function)?;
    }
    Ok(())
}

fn verify_symbol(module: &Module, symbol: &Symbol) -> Result<(), IrError> {
    match symbol {
        Symbol::Function(name) => module
            .function(name)
            .map(|_| ())
            .ok_or_else(|| IrError::UnknownFunction(name.clone())),
        Symbol::Global(name) => module
            .global(name)
            .map(|_| ())
            .ok_or_else(|| IrError::UnknownGlobal(name.clone())),
        Symbol::Block { function, block } => {
            let f = module
                .function(function)
                .ok_or_else(|| IrError::UnknownFunction(function.clone()))?;
            if block.index() < f.blocks.len() {
                Ok(())
            } else {
                Err(IrError::UnknownBlock {
                    function: function.clone(),
                    block: block.0,
                })
            }
        }
    }
}

/// Verifies one function against the module it lives in. Declarations always pass.
pub fn verify_function(module: &Module, func: &Function) -> Result<(), IrError> {
    if func.is_declaration() {
        return Ok(());
    }
    let name = &func.name;
    let unknown_block = |block: u32| IrError::UnknownBlock {
        function: name.clone(),
        block,
    };
    if func.entry.index() >= func.blocks.len() {
        return Err(IrError::NoEntryBlock(name.clone()));
    }

    let mut linked = HashSet::new();
    for block in &func.blocks {
        for &inst in &block.insts {
            if inst.index() >= func.insts.len() || !linked.insert(inst) {
                return Err(IrError::UnknownInstruction {
                    function: name.clone(),
                    inst: inst.0,
                });
            }
        }
    }

    let check_value = |value: &Value| -> Result<(), IrError> {
        match value {
            Value::Const { .. } => Ok(()),
            Value::Inst(id) if linked.contains(id) => Ok(()),
            Value::Inst(id) => Err(IrError::UnknownInstruction {
                function: name.clone(),
                inst: id.0,
            }),
            Value::Param(index) if (*index as usize) < func.params.len() => Ok(()),
            Value::Param(index) => Err(IrError::UnknownParam {
                function: name.clone(),
                index: *index,
            }),
            Value::Global(global) => verify_symbol(module, &Symbol::Global(global.clone())),
            Value::Function(callee) => verify_symbol(module, &Symbol::Function(callee.clone())),
            Value::Block(block) if block.index() < func.blocks.len() => Ok(()),
            Value::Block(block) => Err(unknown_block(block.0)),
        }
    };

    for (index, block) in func.blocks.iter().enumerate() {
        for &inst in &block.insts {
            let kind = &func.inst(inst).kind;
            for operand in kind.operands() {
                check_value(operand)?;
            }
            if let super::InstKind::Binary { op, lhs, rhs } = kind
                && let (Some(l), Some(r)) = (func.value_type(lhs), func.value_type(rhs))
                && l != r
            {
                return Err(IrError::TypeMismatch {
                    function: name.clone(),
                    detail: format!("{} of {l} and {r} in %{}", op.mnemonic(), inst.0),
                });
            }
            if let super::InstKind::Call {
                callee: Callee::Direct(callee),
                args,
                ..
            } = kind
            {
                let target = module
                    .function(callee)
                    .ok_or_else(|| IrError::UnknownFunction(callee.clone()))?;
                if target.params.len() != args.len() {
                    return Err(IrError::TypeMismatch {
                        function: name.clone(),
                        detail: format!(
                            "@{callee} takes {} arguments, %{} passes {}",
                            target.params.len(),
                            inst.0,
                            args.len()
                        ),
                    });
                }
            }
        }

        let term = block.term.as_ref().ok_or(IrError::MissingTerminator {
            function: name.clone(),
            block: index as u32,
        })?;
        for operand in term.operands() {
            check_value(operand)?;
        }
        for succ in term.successors() {
            if succ.index() >= func.blocks.len() {
                return Err(unknown_block(succ.0));
            }
        }
        match term {
            Terminator::Switch { cases, .. } => {
                let mut seen = HashSet::new();
                for (value, _) in cases {
                    if !seen.insert(*value) {
                        return Err(IrError::DuplicateCase {
                            function: name.clone(),
                            block: index as u32,
                            value: *value,
                        });
                    }
                }
            }
            Terminator::Ret(value) if value.is_some() != func.ret.is_some() => {
                return Err(IrError::TypeMismatch {
                    function: name.clone(),
                    detail: format!("return in bb{index} does not match the signature"),
                });
            }
            _ => {}
        }
    }
    Ok(())
}
