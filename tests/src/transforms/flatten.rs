use crate::support::{assert_samples_behave, init_tracing};
use phantom_core::ir::verify::verify_module;
use phantom_core::ir::{Function, Terminator};
use phantom_core::samples;
use phantom_transform::flatten::FlattenCfg;
use phantom_transform::{DispatcherDefault, FunctionOutcome, PassConfig, SkipReason, Transform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;

fn dispatch_cases(func: &Function) -> Vec<u64> {
    let mut values: Vec<u64> = func
        .blocks
        .iter()
        .filter(|b| b.name == "flatten.dispatch")
        .flat_map(|b| match &b.term {
            Some(Terminator::Switch { cases, .. }) => cases.iter().map(|(v, _)| *v).collect(),
            _ => Vec::new(),
        })
        .collect();
    values.sort_unstable();
    values
}

#[test]
fn dispatch_is_total_over_state_ids() {
    init_tracing();
    for default in [DispatcherDefault::Trap, DispatcherDefault::Loop] {
        for seed in 0..16 {
            for name in ["sum_to_n", "classify"] {
                let original = samples::by_name(name).unwrap();
                let mut module = original.clone();
                let mut rng = StdRng::seed_from_u64(seed);
                let report = FlattenCfg::new(PassConfig {
                    dispatcher_default: default,
                    ..PassConfig::default()
                })
                .apply(&mut module, &mut rng)
                .unwrap();
                verify_module(&module).unwrap();

                let flattened = original.function(name).unwrap().blocks.len() - 1;
                assert_eq!(
                    report.outcome(name),
                    Some(&FunctionOutcome::Rewritten { sites: flattened })
                );
                let cases = dispatch_cases(module.function(name).unwrap());
                assert_eq!(cases, (0..flattened as u64).collect::<Vec<_>>());
                assert_samples_behave(&module);
            }
        }
    }
}

#[test]
fn case_targets_are_the_original_blocks() {
    let original = samples::classify();
    let mut module = original.clone();
    let mut rng = StdRng::seed_from_u64(5);
    FlattenCfg::default().apply(&mut module, &mut rng).unwrap();

    let func = module.function("classify").unwrap();
    let old = original.function("classify").unwrap();
    let dispatcher = func
        .blocks
        .iter()
        .find(|b| b.name == "flatten.dispatch")
        .unwrap();
    let Some(Terminator::Switch { cases, .. }) = &dispatcher.term else {
        panic!("dispatcher does not switch");
    };
    let targets: BTreeSet<&str> = cases
        .iter()
        .map(|(_, block)| func.block(*block).name.as_str())
        .collect();
    let expected: BTreeSet<&str> = old
        .blocks
        .iter()
        .skip(1)
        .map(|b| b.name.as_str())
        .collect();
    assert_eq!(targets, expected);
}

#[test]
fn state_ids_depend_on_the_seed() {
    let layouts: BTreeSet<String> = (0..8)
        .map(|seed| {
            let mut module = samples::classify();
            let mut rng = StdRng::seed_from_u64(seed);
            FlattenCfg::default().apply(&mut module, &mut rng).unwrap();
            serde_json::to_string(&module).unwrap()
        })
        .collect();
    assert!(layouts.len() > 1);
}

#[test]
fn single_block_functions_are_skipped() {
    let mut module = samples::calls();
    let before = module.clone();
    let mut rng = StdRng::seed_from_u64(1);
    let report = FlattenCfg::default().apply(&mut module, &mut rng).unwrap();
    for outcome in report.functions.values() {
        assert_eq!(
            outcome,
            &FunctionOutcome::Skipped(SkipReason::NoEligibleSites)
        );
    }
    assert_eq!(module, before);
}
