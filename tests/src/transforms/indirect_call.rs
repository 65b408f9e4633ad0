use crate::support::{assert_samples_behave, machine};
use phantom_core::ir::{Callee, ConstValue, InstKind, Symbol};
use phantom_core::samples;
use phantom_transform::indirect_call::{self, IndirectCall, ENCODED, OFFSETS};
use phantom_transform::Transform;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn encoded_slots_decode_to_their_callees() {
    for seed in 0..16 {
        let mut module = samples::calls();
        let mut rng = StdRng::seed_from_u64(seed);
        let report = IndirectCall::default().apply(&mut module, &mut rng).unwrap();
        assert_eq!(report.sites(), 3);
        for table in [OFFSETS, ENCODED] {
            assert_eq!(
                module.artifacts.get(table).map(String::as_str),
                Some(indirect_call::NAME)
            );
        }

        let m = machine(&module);
        let encoded = module.global(ENCODED).unwrap();
        assert_eq!(encoded.len(), module.global(OFFSETS).unwrap().len());
        for (k, entry) in encoded.init.iter().enumerate() {
            let ConstValue::Addr {
                symbol: Symbol::Function(callee),
                addend,
            } = entry
            else {
                panic!("slot {k} is not a function address");
            };
            let off = m.read_global(OFFSETS, k).unwrap();
            assert!((1..=255).contains(&off));
            assert_eq!(*addend, -(off as i64));
            let target = m.read_global(ENCODED, k).unwrap().wrapping_add(off);
            assert_eq!(target, m.function_address(callee).unwrap());
        }
        assert_samples_behave(&module);
    }
}

#[test]
fn intrinsics_and_inline_helpers_stay_direct() {
    let mut module = samples::calls();
    let mut rng = StdRng::seed_from_u64(4);
    IndirectCall::default().apply(&mut module, &mut rng).unwrap();
    let direct: Vec<String> = module
        .functions
        .values()
        .flat_map(|f| {
            f.live_insts()
                .into_iter()
                .filter_map(|(_, i)| match &f.inst(i).kind {
                    InstKind::Call {
                        callee: Callee::Direct(name),
                        ..
                    } => Some(name.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(direct, vec!["twice".to_string(), "abs".to_string()]);
}
