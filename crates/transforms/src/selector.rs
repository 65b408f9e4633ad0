//! Function selection and the per-function rewrite driver shared by all transforms.

use crate::{FunctionOutcome, PassConfig, SkipReason, TransformReport};
use phantom_core::ir::{Function, Module};
use phantom_utils::errors::TransformError;
use std::collections::BTreeSet;
use tracing::{debug, error, warn};

/// Picks the functions a transform applies to.
///
/// A function is eligible when the allow-list is empty or names it, it has a body, it is not an
/// intrinsic, it was not created by the running transform, and it is not the module's entry
/// point while `skip_entry_point` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionSelector {
    names: BTreeSet<String>,
    skip_entry_point: bool,
}

impl FunctionSelector {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            skip_entry_point: false,
        }
    }

    pub fn from_config(config: &PassConfig) -> Self {
        Self::new(config.functions.iter().cloned()).skip_entry_point(config.skip_entry_point)
    }

    pub const fn skip_entry_point(mut self, skip: bool) -> Self {
        self.skip_entry_point = skip;
        self
    }

    pub fn is_eligible(&self, module: &Module, func: &Function, transform: &str) -> bool {
        if !self.names.is_empty() && !self.names.contains(&func.name) {
            return false;
        }
        if func.is_declaration() || func.attrs.intrinsic {
            return false;
        }
        if module.artifact_owner(&func.name) == Some(transform) {
            debug!("{}: skipping own artifact @{}", transform, func.name);
            return false;
        }
        if self.skip_entry_point && module.entry_point.as_deref() == Some(func.name.as_str()) {
            debug!("{}: skipping entry point @{}", transform, func.name);
            return false;
        }
        true
    }

    /// Names of eligible functions in module order.
    pub fn select(&self, module: &Module, transform: &str) -> Vec<String> {
        module
            .functions
            .values()
            .filter(|f| self.is_eligible(module, f, transform))
            .map(|f| f.name.clone())
            .collect()
    }
}

/// Runs `rewrite` on every function `selector` picks, one at a time.
///
/// The module is snapshotted before each function. A rewrite that reports a skip or returns
/// an error is rolled back to that snapshot, so a function is either fully rewritten or left
/// byte-identical, and one failing function never affects the others.
pub fn rewrite_functions<F>(
    module: &mut Module,
    transform: &str,
    selector: &FunctionSelector,
    mut rewrite: F,
) -> TransformReport
where
    F: FnMut(&mut Module, &str) -> Result<FunctionOutcome, TransformError>,
{
    let mut report = TransformReport::new(transform);
    for name in selector.select(module, transform) {
        let snapshot = module.clone();
        let outcome = match rewrite(module, &name) {
            Ok(FunctionOutcome::Rewritten { sites }) => {
                debug!("{}: rewrote {} site(s) in @{}", transform, sites, name);
                FunctionOutcome::Rewritten { sites }
            }
            Ok(FunctionOutcome::Skipped(reason)) => {
                *module = snapshot;
                match &reason {
                    SkipReason::NoEligibleSites => {
                        debug!("{}: nothing to do in @{}", transform, name)
                    }
                    other => warn!("{}: skipped @{}: {}", transform, name, other),
                }
                FunctionOutcome::Skipped(reason)
            }
            Err(e) => {
                *module = snapshot;
                error!("{}: rolled back @{}: {}", transform, name, e);
                FunctionOutcome::Skipped(SkipReason::Failed(e.to_string()))
            }
        };
        report.functions.insert(name, outcome);
    }
    report
}
