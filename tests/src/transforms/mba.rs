use crate::support::assert_samples_behave;
use phantom_core::interp::Machine;
use phantom_core::ir::verify::verify_module;
use phantom_core::ir::{BinOp, InstKind};
use phantom_core::samples;
use phantom_transform::mba::{MbaSubstitution, CELL_X, CELL_Y};
use phantom_transform::{PassConfig, Transform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn substituted_arithmetic_matches_original() {
    let original = samples::compute();
    let mut module = original.clone();
    let mut rng = StdRng::seed_from_u64(17);
    let report = MbaSubstitution::new(PassConfig {
        mba_constants: vec![2],
        ..PassConfig::default()
    })
    .apply(&mut module, &mut rng)
    .unwrap();
    assert!(report.changed());
    verify_module(&module).unwrap();

    let func = module.function("compute").unwrap();
    let visible = func
        .live_insts()
        .into_iter()
        .filter(|(_, i)| {
            matches!(
                func.inst(*i).kind,
                InstKind::Binary {
                    op: BinOp::Mul,
                    rhs: phantom_core::ir::Value::Const { bits: 2, .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(visible, 0, "constant 2 still visible");

    let mut before = Machine::new(&original).unwrap();
    let mut after = Machine::new(&module).unwrap();
    for _ in 0..500 {
        after.write_global(CELL_X, 0, rng.random::<u32>() as u64).unwrap();
        after.write_global(CELL_Y, 0, rng.random::<u32>() as u64).unwrap();
        let args = [rng.random::<u32>() as u64, rng.random::<u32>() as u64];
        assert_eq!(
            after.call("compute", &args).unwrap(),
            before.call("compute", &args).unwrap()
        );
    }
}

#[test]
fn loops_keep_their_results() {
    let mut module = samples::sum_to_n();
    let mut rng = StdRng::seed_from_u64(9);
    MbaSubstitution::new(PassConfig {
        mba_constants: vec![0, 1],
        ..PassConfig::default()
    })
    .apply(&mut module, &mut rng)
    .unwrap();
    verify_module(&module).unwrap();
    assert_samples_behave(&module);
}
