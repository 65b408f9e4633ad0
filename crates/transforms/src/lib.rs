pub mod flatten;
pub mod indirect_branch;
pub mod indirect_call;
pub mod mba;
pub mod obfuscator;
pub mod opaque_predicate;
pub mod pass;
pub mod selector;
pub mod virtualize;

use indexmap::IndexMap;
use phantom_core::ir::Module;
use phantom_utils::errors::TransformError;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Trait for IR obfuscation transforms.
///
/// Implementations rewrite the functions picked by their [`selector::FunctionSelector`] and
/// report, per function, whether it was rewritten or why it was left alone. Randomness comes
/// exclusively from `rng`, so a deterministic generator yields deterministic output.
pub trait Transform: Send + Sync {
    /// Returns the transform's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the transform to the module.
    ///
    /// Errors are reserved for module-level failures; a function the transform cannot handle
    /// is reported as skipped and left untouched.
    fn apply(
        &self,
        module: &mut Module,
        rng: &mut dyn RngCore,
    ) -> Result<TransformReport, TransformError>;
}

/// What the flattening dispatcher does with a state value no case matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherDefault {
    /// Land in a block that traps.
    #[default]
    Trap,
    /// Land in a block that branches straight back to the dispatcher.
    Loop,
}

/// How virtualized instructions hand their operation to the interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmEncoding {
    /// `__vm_dispatch(op, dst, src0, src1)` with plain immediate arguments.
    #[default]
    RegisterCall,
    /// `__vm_exec(record, key)` over an XOR-encrypted record in `__vm_code`.
    Bytecode,
}

/// Configuration for transform passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    /// Function allow-list; empty means every eligible function.
    pub functions: Vec<String>,
    /// Leave the module's designated entry point alone.
    pub skip_entry_point: bool,
    /// Default case of the flattening dispatcher.
    pub dispatcher_default: DispatcherDefault,
    /// Instruction virtualization encoding.
    pub vm_encoding: VmEncoding,
    /// Encode call addresses even when the module is position independent.
    pub allow_pic_call_encoding: bool,
    /// Constants hidden by MBA substitution (each in `0..=255`).
    pub mba_constants: Vec<u8>,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            functions: Vec::new(),
            skip_entry_point: false,
            dispatcher_default: DispatcherDefault::Trap,
            vm_encoding: VmEncoding::RegisterCall,
            allow_pic_call_encoding: false,
            mba_constants: vec![42],
        }
    }
}

/// Why a transform left a function (or the whole module) unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// The function's structure falls outside the handled cases.
    UnsupportedShape(String),
    /// Nothing in the function matches what the transform rewrites.
    NoEligibleSites,
    /// The target platform cannot host the rewrite.
    PlatformUnsupported(String),
    /// The rewrite failed and was rolled back.
    Failed(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedShape(detail) => write!(f, "unsupported shape: {detail}"),
            Self::NoEligibleSites => f.write_str("no eligible sites"),
            Self::PlatformUnsupported(detail) => write!(f, "platform unsupported: {detail}"),
            Self::Failed(detail) => write!(f, "failed: {detail}"),
        }
    }
}

/// Outcome of one transform on one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionOutcome {
    Rewritten { sites: usize },
    Skipped(SkipReason),
}

/// Advisory report of one transform invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformReport {
    pub transform: String,
    /// Per-function outcomes in module order.
    pub functions: IndexMap<String, FunctionOutcome>,
    /// Set when the whole module was skipped.
    pub module_skip: Option<SkipReason>,
}

impl TransformReport {
    pub fn new(transform: &str) -> Self {
        Self {
            transform: transform.to_string(),
            functions: IndexMap::new(),
            module_skip: None,
        }
    }

    /// Report for a transform that declined the whole module.
    pub fn skipped_module(transform: &str, reason: SkipReason) -> Self {
        Self {
            module_skip: Some(reason),
            ..Self::new(transform)
        }
    }

    /// Whether any function was rewritten.
    pub fn changed(&self) -> bool {
        self.functions
            .values()
            .any(|o| matches!(o, FunctionOutcome::Rewritten { .. }))
    }

    /// Total number of rewritten sites.
    pub fn sites(&self) -> usize {
        self.functions
            .values()
            .map(|o| match o {
                FunctionOutcome::Rewritten { sites } => *sites,
                FunctionOutcome::Skipped(_) => 0,
            })
            .sum()
    }

    pub fn outcome(&self, function: &str) -> Option<&FunctionOutcome> {
        self.functions.get(function)
    }
}
