use crate::support::{assert_samples_behave, init_tracing};
use phantom_analysis::metrics::collect_module_metrics;
use phantom_core::ir::verify::verify_module;
use phantom_core::samples;
use phantom_transform::obfuscator::{
    obfuscate_module, ObfuscationConfig, DEFAULT_PASSES, PASS_NAMES,
};
use phantom_transform::{DispatcherDefault, PassConfig, VmEncoding};
use phantom_utils::seed::Seed;

fn all_passes(seed: u64, pass_config: PassConfig) -> ObfuscationConfig {
    ObfuscationConfig {
        seed: Seed::from_u64(seed),
        passes: PASS_NAMES.iter().map(|p| p.to_string()).collect(),
        pass_config,
    }
}

#[tokio::test]
async fn every_sample_survives_every_pass() {
    init_tracing();
    let variants = [
        PassConfig::default(),
        PassConfig {
            dispatcher_default: DispatcherDefault::Loop,
            vm_encoding: VmEncoding::Bytecode,
            mba_constants: vec![0, 1, 2, 42],
            ..PassConfig::default()
        },
    ];
    for name in samples::NAMES {
        for (k, pass_config) in variants.iter().enumerate() {
            let module = samples::by_name(name).unwrap();
            let config = all_passes(1000 + k as u64, pass_config.clone());
            let result = obfuscate_module(module, &config).await.unwrap();
            verify_module(&result.module).unwrap();
            assert!(result.report.changed(), "{name}: nothing changed");
            assert_samples_behave(&result.module);
        }
    }
}

#[tokio::test]
async fn same_seed_gives_identical_output() {
    for name in samples::NAMES {
        let config = all_passes(7, PassConfig::default());
        let a = obfuscate_module(samples::by_name(name).unwrap(), &config)
            .await
            .unwrap();
        let b = obfuscate_module(samples::by_name(name).unwrap(), &config)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&a.module).unwrap(),
            serde_json::to_string(&b.module).unwrap()
        );
        assert_eq!(a.report.reports, b.report.reports);
    }
}

#[tokio::test]
async fn different_seeds_give_different_output() {
    let a = obfuscate_module(samples::classify(), &all_passes(1, PassConfig::default()))
        .await
        .unwrap();
    let b = obfuscate_module(samples::classify(), &all_passes(2, PassConfig::default()))
        .await
        .unwrap();
    assert_ne!(a.module, b.module);
    assert_samples_behave(&a.module);
    assert_samples_behave(&b.module);
}

#[tokio::test]
async fn removing_a_pass_keeps_later_choices() {
    // Each pass has its own stream, so the flattening of a module without calls does not
    // depend on whether call encoding ran before it.
    let with = ObfuscationConfig {
        passes: vec!["sub-indirect-call".into(), "flatten-cfg".into()],
        ..ObfuscationConfig::default()
    };
    let without = ObfuscationConfig {
        passes: vec!["flatten-cfg".into()],
        ..ObfuscationConfig::default()
    };
    let a = obfuscate_module(samples::sum_to_n(), &with).await.unwrap();
    let b = obfuscate_module(samples::sum_to_n(), &without).await.unwrap();
    assert_eq!(a.module, b.module);
}

#[tokio::test]
async fn allow_list_limits_rewrites() {
    let config = ObfuscationConfig {
        passes: DEFAULT_PASSES.iter().map(|p| p.to_string()).collect(),
        pass_config: PassConfig {
            functions: vec!["square".into()],
            ..PassConfig::default()
        },
        ..ObfuscationConfig::default()
    };
    let original = samples::calls();
    let result = obfuscate_module(original.clone(), &config).await.unwrap();
    for name in ["caller", "main", "twice"] {
        assert_eq!(result.module.function(name), original.function(name));
    }
    assert_ne!(result.module.function("square"), original.function("square"));
    assert_samples_behave(&result.module);
}

#[tokio::test]
async fn entry_point_can_be_protected() {
    let config = ObfuscationConfig {
        passes: PASS_NAMES.iter().map(|p| p.to_string()).collect(),
        pass_config: PassConfig {
            skip_entry_point: true,
            ..PassConfig::default()
        },
        ..ObfuscationConfig::default()
    };
    let original = samples::calls();
    let result = obfuscate_module(original.clone(), &config).await.unwrap();
    assert_eq!(result.module.function("main"), original.function("main"));
    assert_samples_behave(&result.module);
}

#[tokio::test]
async fn report_metrics_match_the_modules() {
    let original = samples::classify();
    let result = obfuscate_module(original.clone(), &ObfuscationConfig::default())
        .await
        .unwrap();
    let before = collect_module_metrics(&original).unwrap();
    let after = collect_module_metrics(&result.module).unwrap();
    assert_eq!(result.report.before.block_cnt, before.block_cnt);
    assert_eq!(result.report.after.block_cnt, after.block_cnt);
    assert!(after.block_cnt > before.block_cnt);
    assert_eq!(result.report.passes.len(), DEFAULT_PASSES.len());
}

#[tokio::test]
async fn module_json_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classify.json");
    let result = obfuscate_module(samples::classify(), &ObfuscationConfig::default())
        .await
        .unwrap();
    std::fs::write(&path, serde_json::to_string(&result.module).unwrap()).unwrap();
    let back: phantom_core::ir::Module =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(back, result.module);
    assert_samples_behave(&back);
}
