use crate::support::assert_samples_behave;
use phantom_core::interp::Machine;
use phantom_core::ir::verify::verify_module;
use phantom_core::ir::{ConstValue, Symbol, Terminator};
use phantom_core::samples;
use phantom_transform::indirect_branch::{self, IndirectBranch};
use phantom_transform::Transform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;

#[test]
fn jump_tables_cover_every_branch_target() {
    for name in ["sum_to_n", "classify"] {
        for seed in 0..8 {
            let original = samples::by_name(name).unwrap();
            let mut module = original.clone();
            let mut rng = StdRng::seed_from_u64(seed);
            IndirectBranch::default()
                .apply(&mut module, &mut rng)
                .unwrap();
            verify_module(&module).unwrap();

            let table_name = format!("{name}.jump_table");
            assert_eq!(
                module.artifacts.get(&table_name).map(String::as_str),
                Some(indirect_branch::NAME)
            );
            let table = module.global(&table_name).unwrap();

            let old = original.function(name).unwrap();
            let wanted: BTreeSet<_> = old
                .block_ids()
                .filter_map(|b| old.terminator(b))
                .filter(|t| t.is_branch())
                .flat_map(Terminator::successors)
                .collect();
            let mut slots = Vec::new();
            for entry in &table.init {
                let ConstValue::Addr {
                    symbol: Symbol::Block { function, block },
                    addend: 0,
                } = entry
                else {
                    panic!("{name}: slot {entry:?} is not a block address");
                };
                assert_eq!(function, name);
                slots.push(*block);
            }
            let unique: BTreeSet<_> = slots.iter().copied().collect();
            assert_eq!(unique.len(), slots.len(), "{name}: duplicate slots");
            assert_eq!(unique, wanted);

            // Loaded slots resolve to the blocks they name.
            let machine = Machine::new(&module).unwrap();
            for (k, block) in slots.iter().enumerate() {
                assert_eq!(
                    machine.read_global(&table_name, k).unwrap(),
                    machine.block_address(name, *block).unwrap()
                );
            }
            assert_samples_behave(&module);
        }
    }
}

#[test]
fn rerunning_adds_a_second_table() {
    let mut module = samples::classify();
    let mut rng = StdRng::seed_from_u64(2);
    IndirectBranch::default()
        .apply(&mut module, &mut rng)
        .unwrap();
    // The rewritten function has no direct branches left.
    let report = IndirectBranch::default()
        .apply(&mut module, &mut rng)
        .unwrap();
    assert!(!report.changed());
    assert!(module.global("classify.jump_table.2").is_none());
    assert_samples_behave(&module);
}
