//! IR update operations

use super::{
    Block, BlockId, Function, Global, Inst, InstId, InstKind, Module, Terminator, Type, Value,
};
use phantom_utils::errors::IrError;
use std::collections::HashMap;

impl Function {
    /// Appends a new, unterminated block.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(name));
        id
    }

    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        self.blocks[block.index()].term = Some(term);
    }

    pub fn take_terminator(&mut self, block: BlockId) -> Option<Terminator> {
        self.blocks[block.index()].term.take()
    }

    pub fn terminator(&self, block: BlockId) -> Option<&Terminator> {
        self.blocks.get(block.index()).and_then(|b| b.term.as_ref())
    }

    /// Result type an instruction of this kind would have in this function.
    pub fn result_type(&self, kind: &InstKind) -> Option<Type> {
        match kind {
            InstKind::Binary { lhs, rhs, .. } => {
                self.value_type(lhs).or_else(|| self.value_type(rhs))
            }
            InstKind::ICmp { .. } => Some(Type::I1),
            InstKind::Select {
                then_value,
                else_value,
                ..
            } => self
                .value_type(then_value)
                .or_else(|| self.value_type(else_value)),
            InstKind::Cast { to, .. } => Some(*to),
            InstKind::Alloca { .. } | InstKind::ElementPtr { .. } => Some(Type::Ptr),
            InstKind::Load { ty, .. } => Some(*ty),
            InstKind::Store { .. } => None,
            InstKind::Call { ret, .. } => *ret,
        }
    }

    fn alloc_inst(&mut self, kind: InstKind) -> InstId {
        let ty = self.result_type(&kind);
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Inst { kind, ty });
        id
    }

    /// Creates an instruction and appends it to `block` (before its terminator).
    pub fn push_inst(&mut self, block: BlockId, kind: InstKind) -> InstId {
        let id = self.alloc_inst(kind);
        self.blocks[block.index()].insts.push(id);
        id
    }

    /// Creates an instruction and inserts it at position `index` of `block`.
    pub fn insert_inst(&mut self, block: BlockId, index: usize, kind: InstKind) -> InstId {
        let id = self.alloc_inst(kind);
        self.blocks[block.index()].insts.insert(index, id);
        id
    }

    /// Unlinks `inst` from `block`. The arena slot stays allocated but is dead.
    pub fn remove_inst(&mut self, block: BlockId, inst: InstId) -> bool {
        let insts = &mut self.blocks[block.index()].insts;
        match insts.iter().position(|&i| i == inst) {
            Some(pos) => {
                insts.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn position_of(&self, block: BlockId, inst: InstId) -> Option<usize> {
        self.blocks[block.index()]
            .insts
            .iter()
            .position(|&i| i == inst)
    }

    /// Block that currently holds `inst`, if it is live.
    pub fn block_of(&self, inst: InstId) -> Option<BlockId> {
        self.block_ids()
            .find(|&b| self.blocks[b.index()].insts.contains(&inst))
    }

    /// Live instructions as `(block, inst)` pairs in layout order.
    pub fn live_insts(&self) -> Vec<(BlockId, InstId)> {
        self.block_ids()
            .flat_map(|b| self.blocks[b.index()].insts.iter().map(move |&i| (b, i)))
            .collect()
    }

    /// Rewrites every use of `old` in live instructions and terminators to `new`.
    ///
    /// Returns the number of rewritten operands.
    pub fn replace_all_uses(&mut self, old: InstId, new: &Value) -> usize {
        let target = Value::Inst(old);
        let mut count = 0;
        for (_, inst) in self.live_insts() {
            for operand in self.insts[inst.index()].kind.operands_mut() {
                if *operand == target {
                    *operand = new.clone();
                    count += 1;
                }
            }
        }
        for block in &mut self.blocks {
            if let Some(term) = block.term.as_mut() {
                for operand in term.operands_mut() {
                    if *operand == target {
                        *operand = new.clone();
                        count += 1;
                    }
                }
            }
        }
        count
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .map(Terminator::successors)
            .unwrap_or_default()
    }

    /// Predecessor lists for every block.
    pub fn predecessors(&self) -> HashMap<BlockId, Vec<BlockId>> {
        let mut preds: HashMap<BlockId, Vec<BlockId>> =
            self.block_ids().map(|b| (b, Vec::new())).collect();
        for block in self.block_ids() {
            for succ in self.successors(block) {
                if let Some(list) = preds.get_mut(&succ) {
                    list.push(block);
                }
            }
        }
        preds
    }

    /// Number of live instructions, terminators excluded.
    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }
}

impl Module {
    /// Adds or replaces a function.
    pub fn add_function(&mut self, function: Function) -> &mut Function {
        let name = function.name.clone();
        self.functions.insert(name.clone(), function);
        &mut self.functions[&name]
    }

    /// Adds or replaces a global.
    pub fn add_global(&mut self, global: Global) -> &mut Global {
        let name = global.name.clone();
        self.globals.insert(name.clone(), global);
        &mut self.globals[&name]
    }

    /// First name of the form `base`, `base.1`, `base.2`, ... not used by a global or function.
    pub fn unique_name(&self, base: &str) -> String {
        let taken = |name: &str| self.globals.contains_key(name) || self.functions.contains_key(name);
        if !taken(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}.{n}"))
            .find(|name| !taken(name))
            .unwrap_or_else(|| base.to_string())
    }

    /// Returns the global `name`, creating it with `make` on first request.
    ///
    /// The created global is recorded as an artifact of `owner`. A second request with the same
    /// name returns the existing global and never calls `make`.
    pub fn get_or_insert_global_with(
        &mut self,
        name: &str,
        owner: &str,
        make: impl FnOnce() -> Global,
    ) -> &mut Global {
        if !self.globals.contains_key(name) {
            let mut global = make();
            global.name = name.to_string();
            tracing::debug!("creating artifact global @{} for {}", name, owner);
            self.globals.insert(name.to_string(), global);
            self.artifacts.insert(name.to_string(), owner.to_string());
        }
        &mut self.globals[name]
    }

    /// Returns the function `name`, creating it with `make` on first request.
    ///
    /// Same memoisation contract as [`Module::get_or_insert_global_with`].
    pub fn get_or_insert_function_with(
        &mut self,
        name: &str,
        owner: &str,
        make: impl FnOnce() -> Function,
    ) -> &mut Function {
        if !self.functions.contains_key(name) {
            let mut function = make();
            function.name = name.to_string();
            tracing::debug!("creating artifact function @{} for {}", name, owner);
            self.functions.insert(name.to_string(), function);
            self.artifacts.insert(name.to_string(), owner.to_string());
        }
        &mut self.functions[name]
    }

    /// Transform that created `name`, if it is an artifact.
    pub fn artifact_owner(&self, name: &str) -> Option<&str> {
        self.artifacts.get(name).map(String::as_str)
    }

    /// Looks up a function or fails with [`IrError::UnknownFunction`].
    pub fn expect_function_mut(&mut self, name: &str) -> Result<&mut Function, IrError> {
        self.functions
            .get_mut(name)
            .ok_or_else(|| IrError::UnknownFunction(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, ConstValue};

    #[test]
    fn replace_all_uses_rewrites_instructions_and_terminators() {
        let mut f = Function::new("f", vec![Type::I32], Some(Type::I32));
        let entry = f.entry;
        let sum = f.push_inst(
            entry,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Param(0),
                rhs: Value::i32(1),
            },
        );
        f.push_inst(
            entry,
            InstKind::Binary {
                op: BinOp::Mul,
                lhs: Value::Inst(sum),
                rhs: Value::Inst(sum),
            },
        );
        f.set_terminator(entry, Terminator::Ret(Some(Value::Inst(sum))));

        let replaced = f.replace_all_uses(sum, &Value::Param(0));
        assert_eq!(replaced, 3);
        assert_eq!(
            f.terminator(entry),
            Some(&Terminator::Ret(Some(Value::Param(0))))
        );
    }

    #[test]
    fn artifact_factory_is_idempotent() {
        let mut module = Module::new("m");
        let mut calls = 0;
        module.get_or_insert_global_with("__vm_regs", "virtual-machine", || {
            calls += 1;
            Global::zeroed("ignored", Type::I64, 4)
        });
        module.get_or_insert_global_with("__vm_regs", "virtual-machine", || {
            calls += 1;
            Global::new("ignored", Type::I64, vec![ConstValue::Int(9)])
        });
        assert_eq!(calls, 1);
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.global("__vm_regs").unwrap().len(), 4);
        assert_eq!(module.artifact_owner("__vm_regs"), Some("virtual-machine"));
    }

    #[test]
    fn unique_names_skip_taken_symbols() {
        let mut module = Module::new("m");
        assert_eq!(module.unique_name("jump_table"), "jump_table");
        module.add_global(Global::zeroed("jump_table", Type::Ptr, 1));
        module.add_global(Global::zeroed("jump_table.1", Type::Ptr, 1));
        assert_eq!(module.unique_name("jump_table"), "jump_table.2");
    }
}
