use crate::{SkipReason, Transform, TransformReport};
use async_trait::async_trait;
use phantom_analysis::metrics::{collect_module_metrics, compare};
use phantom_core::ir::Module;
use phantom_core::ir::verify::verify_module;
use phantom_utils::errors::TransformError;
use phantom_utils::seed::Seed;
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Trait for running a sequence of obfuscation transforms on a module.
#[async_trait]
pub trait Pass {
    async fn run(
        &self,
        module: &mut Module,
        passes: &[Box<dyn Transform>],
        seed: &Seed,
    ) -> Result<Vec<TransformReport>, TransformError>;
}

/// Default implementation of the Pass trait.
///
/// Each transform runs on a snapshot of the module with its own named random stream, so
/// adding or removing one transform never changes the randomness another one sees. The
/// snapshot is committed only if the transform succeeded and the result still verifies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPass;

#[async_trait]
impl Pass for DefaultPass {
    async fn run(
        &self,
        module: &mut Module,
        passes: &[Box<dyn Transform>],
        seed: &Seed,
    ) -> Result<Vec<TransformReport>, TransformError> {
        verify_module(module)?;
        let mut reports = Vec::with_capacity(passes.len());
        let mut runs: HashMap<&'static str, usize> = HashMap::new();

        for pass in passes {
            let count = runs.entry(pass.name()).or_default();
            *count += 1;
            let stream = match *count {
                1 => pass.name().to_string(),
                n => format!("{}#{n}", pass.name()),
            };
            let mut rng = seed.stream(&module.name, &stream);
            let mut snapshot = module.clone();

            let report = match pass.apply(&mut snapshot, &mut rng) {
                Ok(report) => report,
                Err(e) => {
                    error!("{:>18} failed: {}", pass.name(), e);
                    reports.push(TransformReport::skipped_module(
                        pass.name(),
                        SkipReason::Failed(e.to_string()),
                    ));
                    continue;
                }
            };
            if !report.changed() {
                reports.push(report);
                continue;
            }
            if let Err(e) = verify_module(&snapshot) {
                warn!("{:>18} produced invalid IR, discarded: {}", pass.name(), e);
                reports.push(TransformReport::skipped_module(
                    pass.name(),
                    SkipReason::Failed(e.to_string()),
                ));
                continue;
            }

            let before = collect_module_metrics(module)?;
            let after = collect_module_metrics(&snapshot)?;
            let delta = compare(&before, &after);
            info!(
                "{:>18} Δ{:+.2} {} site(s)",
                pass.name(),
                delta,
                report.sites()
            );
            *module = snapshot;
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Convenience function to run the default pass.
pub async fn run(
    module: &mut Module,
    passes: &[Box<dyn Transform>],
    seed: &Seed,
) -> Result<Vec<TransformReport>, TransformError> {
    DefaultPass.run(module, passes, seed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::FlattenCfg;
    use crate::opaque_predicate::OpaquePredicate;
    use crate::{FunctionOutcome, PassConfig};
    use phantom_core::interp::Machine;
    use phantom_core::ir::{Builder, Function, Type, Value};
    use phantom_core::samples;
    use rand::RngCore;

    /// Adds a block with no terminator, which the verifier rejects.
    struct Breaker;

    impl Transform for Breaker {
        fn name(&self) -> &'static str {
            "breaker"
        }

        fn apply(
            &self,
            module: &mut Module,
            _rng: &mut dyn RngCore,
        ) -> Result<TransformReport, TransformError> {
            let mut report = TransformReport::new("breaker");
            for func in module.functions.values_mut() {
                func.add_block("dangling");
                report
                    .functions
                    .insert(func.name.clone(), FunctionOutcome::Rewritten { sites: 1 });
            }
            Ok(report)
        }
    }

    #[tokio::test]
    async fn passes_commit_in_order() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let mut module = samples::sum_to_n();
        let passes: Vec<Box<dyn Transform>> = vec![
            Box::new(OpaquePredicate::new(PassConfig::default())),
            Box::new(FlattenCfg::new(PassConfig::default())),
        ];
        let reports = run(&mut module, &passes, &Seed::from_u64(1)).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(TransformReport::changed));
        let mut machine = Machine::new(&module).unwrap();
        assert_eq!(machine.call("sum_to_n", &[10]).unwrap(), Some(55));
    }

    #[tokio::test]
    async fn invalid_results_are_discarded() {
        let mut module = samples::compute();
        let original = module.clone();
        let passes: Vec<Box<dyn Transform>> = vec![Box::new(Breaker)];
        let reports = run(&mut module, &passes, &Seed::from_u64(1)).await.unwrap();
        assert!(matches!(
            reports[0].module_skip,
            Some(SkipReason::Failed(_))
        ));
        assert_eq!(module, original);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let mut module = Module::new("bad");
        let mut f = Function::new("f", vec![], Some(Type::I32));
        let entry = f.entry;
        Builder::at_end(&mut f, entry).ret(Some(Value::Param(3)));
        module.add_function(f);
        let passes: Vec<Box<dyn Transform>> = vec![Box::new(FlattenCfg::default())];
        assert!(run(&mut module, &passes, &Seed::from_u64(1)).await.is_err());
    }
}
