//! Small sample programs used by tests and the `phantom sample` command.
//!
//! Each sample is shaped like unoptimised front-end output: locals live in `alloca` slots and
//! the entry block ends in a single unconditional branch.

use crate::ir::{Builder, CmpPred, Function, Module, Type, Value};

/// Names accepted by [`by_name`].
pub const NAMES: [&str; 4] = ["sum_to_n", "compute", "classify", "calls"];

/// Looks up a sample by name.
pub fn by_name(name: &str) -> Option<Module> {
    match name {
        "sum_to_n" => Some(sum_to_n()),
        "compute" => Some(compute()),
        "classify" => Some(classify()),
        "calls" => Some(calls()),
        _ => None,
    }
}

/// `sum_to_n(n) = 1 + 2 + ... + n`, written as a counting loop. `sum_to_n(10) == 55`.
pub fn sum_to_n() -> Module {
    let mut f = Function::new("sum_to_n", vec![Type::I32], Some(Type::I32));
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let cond = b.new_block("loop.cond");
    let body = b.new_block("loop.body");
    let exit = b.new_block("loop.exit");

    let sum = b.alloca(Type::I32);
    let i = b.alloca(Type::I32);
    b.store(Value::i32(0), sum.clone());
    b.store(Value::i32(1), i.clone());
    b.br(cond);

    b.position_at_end(cond);
    let iv = b.load(Type::I32, i.clone());
    let more = b.icmp(CmpPred::Sle, iv, Value::Param(0));
    b.cond_br(more, body, exit);

    b.position_at_end(body);
    let sv = b.load(Type::I32, sum.clone());
    let iv = b.load(Type::I32, i.clone());
    let next_sum = b.add(sv, iv.clone());
    b.store(next_sum, sum.clone());
    let next_i = b.add(iv, Value::i32(1));
    b.store(next_i, i);
    b.br(cond);

    b.position_at_end(exit);
    let result = b.load(Type::I32, sum);
    b.ret(Some(result));

    let mut module = Module::new("sum_to_n");
    module.add_function(f);
    module
}

/// `compute(a, b) = ((a + b) * 2) ^ 0xFF - a`. `compute(10, 20) == 185`.
pub fn compute() -> Module {
    let mut f = Function::new("compute", vec![Type::I32, Type::I32], Some(Type::I32));
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let sum = b.add(Value::Param(0), Value::Param(1));
    let doubled = b.mul(sum, Value::i32(2));
    let flipped = b.xor(doubled, Value::i32(0xff));
    let result = b.sub(flipped, Value::Param(0));
    b.ret(Some(result));

    let mut module = Module::new("compute");
    module.add_function(f);
    module
}

/// `classify(x)` returns the sign of `x` as -1, 0 or 1 through a chain of conditional branches.
pub fn classify() -> Module {
    let mut f = Function::new("classify", vec![Type::I32], Some(Type::I32));
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let check_neg = b.new_block("check.neg");
    let neg = b.new_block("neg");
    let check_zero = b.new_block("check.zero");
    let zero = b.new_block("zero");
    let pos = b.new_block("pos");
    let done = b.new_block("done");

    let slot = b.alloca(Type::I32);
    b.br(check_neg);

    b.position_at_end(check_neg);
    let is_neg = b.icmp(CmpPred::Slt, Value::Param(0), Value::i32(0));
    b.cond_br(is_neg, neg, check_zero);

    b.position_at_end(neg);
    b.store(Value::i32(-1), slot.clone());
    b.br(done);

    b.position_at_end(check_zero);
    let is_zero = b.icmp(CmpPred::Eq, Value::Param(0), Value::i32(0));
    b.cond_br(is_zero, zero, pos);

    b.position_at_end(zero);
    b.store(Value::i32(0), slot.clone());
    b.br(done);

    b.position_at_end(pos);
    b.store(Value::i32(1), slot.clone());
    b.br(done);

    b.position_at_end(done);
    let result = b.load(Type::I32, slot);
    b.ret(Some(result));

    let mut module = Module::new("classify");
    module.add_function(f);
    module
}

/// A module with direct calls to a defined function, an always-inline helper, an external
/// declaration (`host_scale`) and an intrinsic (`abs`). The entry point `main` returns
/// `caller(3)`; with `host_scale(x) = 10 * x` that is `9 + 6 + 30 + 3 = 48`.
pub fn calls() -> Module {
    let mut module = Module::new("calls");
    module.entry_point = Some("main".to_string());
    module.add_function(Function::declaration(
        "host_scale",
        vec![Type::I32],
        Some(Type::I32),
    ));
    let mut abs = Function::declaration("abs", vec![Type::I32], Some(Type::I32));
    abs.attrs.intrinsic = true;
    module.add_function(abs);

    let mut square = Function::new("square", vec![Type::I32], Some(Type::I32));
    let entry = square.entry;
    let mut b = Builder::at_end(&mut square, entry);
    let v = b.mul(Value::Param(0), Value::Param(0));
    b.ret(Some(v));
    module.add_function(square);

    let mut twice = Function::new("twice", vec![Type::I32], Some(Type::I32));
    twice.attrs.always_inline = true;
    let entry = twice.entry;
    let mut b = Builder::at_end(&mut twice, entry);
    let v = b.add(Value::Param(0), Value::Param(0));
    b.ret(Some(v));
    module.add_function(twice);

    let mut caller = Function::new("caller", vec![Type::I32], Some(Type::I32));
    let entry = caller.entry;
    let mut b = Builder::at_end(&mut caller, entry);
    let x = Value::Param(0);
    let a = b.call("square", vec![x.clone()], Some(Type::I32));
    let t = b.call("twice", vec![x.clone()], Some(Type::I32));
    let s = b.call("host_scale", vec![x.clone()], Some(Type::I32));
    let m = b.call("abs", vec![x], Some(Type::I32));
    let acc = b.add(a, t);
    let acc = b.add(acc, s);
    let acc = b.add(acc, m);
    b.ret(Some(acc));
    module.add_function(caller);

    let mut main = Function::new("main", vec![], Some(Type::I32));
    let entry = main.entry;
    let mut b = Builder::at_end(&mut main, entry);
    let v = b.call("caller", vec![Value::i32(3)], Some(Type::I32));
    b.ret(Some(v));
    module.add_function(main);

    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Machine;
    use crate::ir::verify::verify_module;

    #[test]
    fn every_sample_verifies() {
        for name in NAMES {
            let module = by_name(name).unwrap();
            verify_module(&module).unwrap();
        }
        assert!(by_name("nope").is_none());
    }

    #[test]
    fn samples_compute_expected_values() {
        let module = classify();
        let mut machine = Machine::new(&module).unwrap();
        for (input, expected) in [(-5i32, -1i32), (0, 0), (17, 1)] {
            let out = machine.call("classify", &[input as u32 as u64]).unwrap();
            assert_eq!(out, Some(expected as u32 as u64));
        }

        let module = calls();
        let mut machine = Machine::new(&module).unwrap();
        machine.register_host("host_scale", Box::new(|args| args[0] * 10));
        machine.register_host(
            "abs",
            Box::new(|args| (args[0] as u32 as i32).unsigned_abs() as u64),
        );
        assert_eq!(machine.call("main", &[]).unwrap(), Some(48));
    }

    #[test]
    fn modules_round_trip_through_json() {
        let module = calls();
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(module, back);
    }
}
