use crate::support::assert_samples_behave;
use phantom_core::interp::Machine;
use phantom_core::ir::verify::verify_module;
use phantom_core::samples;
use phantom_transform::opaque_predicate::{OpaquePredicate, Predicate, CELL_X, CELL_Y};
use phantom_transform::Transform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn predicates_hold_for_every_cell_value() {
    let mut rng = StdRng::seed_from_u64(0xfeed);
    for predicate in Predicate::ALL {
        for _ in 0..10_000 {
            let (x, y) = (rng.random::<u32>(), rng.random::<u32>());
            assert!(predicate.holds(x, y), "{predicate:?} fails on ({x}, {y})");
        }
    }
}

#[test]
fn guarded_code_ignores_cell_contents() {
    let mut module = samples::classify();
    let mut rng = StdRng::seed_from_u64(8);
    let report = OpaquePredicate::default()
        .apply(&mut module, &mut rng)
        .unwrap();
    assert_eq!(report.sites(), 2);
    verify_module(&module).unwrap();

    let mut machine = Machine::new(&module).unwrap();
    let edges = [0u32, 1, 2, 0x7fff_ffff, 0x8000_0000, u32::MAX];
    let mut pairs: Vec<(u32, u32)> = edges
        .iter()
        .flat_map(|&x| edges.iter().map(move |&y| (x, y)))
        .collect();
    pairs.extend((0..1000).map(|_| (rng.random(), rng.random())));
    for (x, y) in pairs {
        machine.write_global(CELL_X, 0, x as u64).unwrap();
        machine.write_global(CELL_Y, 0, y as u64).unwrap();
        for (input, sign) in [(-4i32, -1i32), (0, 0), (4, 1)] {
            assert_eq!(
                machine.call("classify", &[input as u32 as u64]).unwrap(),
                Some(sign as u32 as u64),
                "cells ({x}, {y})"
            );
        }
    }
    assert_samples_behave(&module);
}
