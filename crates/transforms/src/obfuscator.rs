use crate::flatten::{self, FlattenCfg};
use crate::indirect_branch::{self, IndirectBranch};
use crate::indirect_call::{self, IndirectCall};
use crate::mba::{self, MbaSubstitution};
use crate::opaque_predicate::{self, OpaquePredicate};
use crate::virtualize::{self, Virtualize};
use crate::{PassConfig, Transform, TransformReport, pass};
use phantom_analysis::metrics::{Metrics, collect_module_metrics};
use phantom_core::ir::Module;
use phantom_core::ir::verify::verify_module;
use phantom_utils::errors::{ObfuscateError, TransformError};
use phantom_utils::seed::Seed;
use serde::{Deserialize, Serialize};

/// Every pass name the pipeline accepts.
pub const PASS_NAMES: [&str; 6] = [
    flatten::NAME,
    indirect_branch::NAME,
    opaque_predicate::NAME,
    virtualize::NAME,
    indirect_call::NAME,
    mba::NAME,
];

/// Pass order used when none is configured. Predicates are injected before flattening so the
/// guarded branches end up behind the dispatcher; call encoding runs last so it also covers
/// calls into the interpreter.
pub const DEFAULT_PASSES: [&str; 5] = [
    opaque_predicate::NAME,
    virtualize::NAME,
    flatten::NAME,
    indirect_branch::NAME,
    indirect_call::NAME,
];

/// Configuration for the obfuscation pipeline
pub struct ObfuscationConfig {
    /// Root seed; each pass draws from its own named stream derived from it
    pub seed: Seed,
    /// Pass names, applied in order
    pub passes: Vec<String>,
    /// Pass configuration shared by every pass
    pub pass_config: PassConfig,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            seed: Seed::from_u64(42),
            passes: DEFAULT_PASSES.iter().map(|p| p.to_string()).collect(),
            pass_config: PassConfig::default(),
        }
    }
}

impl std::fmt::Debug for ObfuscationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscationConfig")
            .field("seed", &self.seed.to_string())
            .field("passes", &self.passes.join(","))
            .field("pass_config", &self.pass_config)
            .finish()
    }
}

/// Instantiates a transform by pass name.
pub fn build_pass(name: &str, config: &PassConfig) -> Result<Box<dyn Transform>, TransformError> {
    let config = config.clone();
    let pass: Box<dyn Transform> = match name {
        flatten::NAME => Box::new(FlattenCfg::new(config)),
        indirect_branch::NAME => Box::new(IndirectBranch::new(config)),
        opaque_predicate::NAME => Box::new(OpaquePredicate::new(config)),
        virtualize::NAME => Box::new(Virtualize::new(config)),
        indirect_call::NAME => Box::new(IndirectCall::new(config)),
        mba::NAME => Box::new(MbaSubstitution::new(config)),
        other => return Err(TransformError::UnknownPass(other.to_string())),
    };
    Ok(pass)
}

/// Instantiates every named pass, failing on the first unknown name.
pub fn build_passes<S: AsRef<str>>(
    names: &[S],
    config: &PassConfig,
) -> Result<Vec<Box<dyn Transform>>, ObfuscateError> {
    names
        .iter()
        .map(|name| {
            build_pass(name.as_ref(), config)
                .map_err(|_| ObfuscateError::InvalidPass(name.as_ref().to_string()))
        })
        .collect()
}

/// Advisory summary of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationReport {
    /// Root seed as hex
    pub seed: String,
    /// Passes in the order they ran
    pub passes: Vec<String>,
    /// One report per pass
    pub reports: Vec<TransformReport>,
    /// Module metrics before any pass
    pub before: Metrics,
    /// Module metrics after the last pass
    pub after: Metrics,
}

impl ObfuscationReport {
    /// Whether any pass committed a change.
    pub fn changed(&self) -> bool {
        self.reports.iter().any(TransformReport::changed)
    }

    pub fn to_json(&self) -> Result<String, ObfuscateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of the obfuscation pipeline
#[derive(Debug, Clone)]
pub struct ObfuscationResult {
    /// The obfuscated module
    pub module: Module,
    pub report: ObfuscationReport,
}

/// Main obfuscation pipeline
pub async fn obfuscate_module(
    mut module: Module,
    config: &ObfuscationConfig,
) -> Result<ObfuscationResult, ObfuscateError> {
    verify_module(&module)?;
    let passes = build_passes(&config.passes, &config.pass_config)?;

    tracing::debug!("Starting obfuscation pipeline:");
    tracing::debug!("  Module: {}", module.name);
    tracing::debug!("  Functions: {}", module.functions.len());
    tracing::debug!("  Seed: {}", config.seed);
    tracing::debug!("  Passes: {}", config.passes.join(", "));

    let before = collect_module_metrics(&module).map_err(TransformError::from)?;
    tracing::debug!(
        "  Before: {} blocks, {} instructions, potency {:.2}",
        before.block_cnt,
        before.inst_cnt,
        before.potency
    );

    let reports = pass::run(&mut module, &passes, &config.seed).await?;

    let after = collect_module_metrics(&module).map_err(TransformError::from)?;
    tracing::debug!("Transform summary:");
    for report in &reports {
        match &report.module_skip {
            Some(reason) => tracing::debug!("  {}: skipped ({})", report.transform, reason),
            None => tracing::debug!(
                "  {}: {} site(s) in {} function(s)",
                report.transform,
                report.sites(),
                report.functions.len()
            ),
        }
    }
    tracing::debug!(
        "  Final blocks: {} ({:+})",
        after.block_cnt,
        after.block_cnt as i64 - before.block_cnt as i64
    );
    tracing::debug!(
        "  Final instructions: {} ({:+})",
        after.inst_cnt,
        after.inst_cnt as i64 - before.inst_cnt as i64
    );

    let report = ObfuscationReport {
        seed: config.seed.to_string(),
        passes: config.passes.clone(),
        reports,
        before,
        after,
    };
    if !report.changed() {
        tracing::warn!("No pass changed module {}", module.name);
    }
    Ok(ObfuscationResult { module, report })
}
