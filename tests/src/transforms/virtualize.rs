use crate::support::init_tracing;
use phantom_core::interp::Machine;
use phantom_core::ir::verify::verify_module;
use phantom_core::samples;
use phantom_transform::virtualize::{self, Virtualize, DISPATCH, EXEC, REGISTERS};
use phantom_transform::{PassConfig, Transform, VmEncoding};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn compute(a: i32, b: i32) -> i32 {
    (a.wrapping_add(b).wrapping_mul(2) ^ 0xff).wrapping_sub(a)
}

#[test]
fn virtualized_arithmetic_matches_native() {
    init_tracing();
    for encoding in [VmEncoding::RegisterCall, VmEncoding::Bytecode] {
        let mut module = samples::compute();
        let mut rng = StdRng::seed_from_u64(21);
        let report = Virtualize::new(PassConfig {
            vm_encoding: encoding,
            ..PassConfig::default()
        })
        .apply(&mut module, &mut rng)
        .unwrap();
        assert_eq!(report.sites(), 4);
        verify_module(&module).unwrap();
        assert_eq!(
            module.artifacts.get(DISPATCH).map(String::as_str),
            Some(virtualize::NAME)
        );
        assert_eq!(
            module.artifacts.contains_key(EXEC),
            encoding == VmEncoding::Bytecode
        );

        let mut machine = Machine::new(&module).unwrap();
        for _ in 0..500 {
            let (a, b) = (rng.random::<i32>(), rng.random::<i32>());
            let got = machine
                .call("compute", &[a as u32 as u64, b as u32 as u64])
                .unwrap();
            assert_eq!(got, Some(compute(a, b) as u32 as u64), "compute({a}, {b})");
        }
    }
}

#[test]
fn registers_do_not_leak_between_calls() {
    let mut module = samples::sum_to_n();
    let mut rng = StdRng::seed_from_u64(3);
    Virtualize::default().apply(&mut module, &mut rng).unwrap();
    let mut machine = Machine::new(&module).unwrap();
    // Garbage left in the register file must not change the next result.
    for k in 0..256 {
        machine.write_global(REGISTERS, k, 0xdead_beef_0000 + k as u64).unwrap();
    }
    for (n, sum) in [(10u64, 55u64), (3, 6), (0, 0)] {
        assert_eq!(machine.call("sum_to_n", &[n]).unwrap(), Some(sum));
    }
}
