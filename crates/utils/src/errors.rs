use thiserror::Error;

/// Error type for IR construction, mutation and verification.
#[derive(Debug, Error)]
pub enum IrError {
    /// A block index does not exist in the function.
    #[error("function '{function}' has no block {block}")]
    UnknownBlock { function: String, block: u32 },
    /// An instruction index does not exist or is no longer linked into a block.
    #[error("function '{function}' references dead or unknown instruction %{inst}")]
    UnknownInstruction { function: String, inst: u32 },
    /// A call or address reference names a function the module does not define.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    /// A reference names a global the module does not define.
    #[error("unknown global '{0}'")]
    UnknownGlobal(String),
    /// A block has no terminator.
    #[error("block {block} of '{function}' has no terminator")]
    MissingTerminator { function: String, block: u32 },
    /// A function with a body has no entry block.
    #[error("function '{0}' has no entry block")]
    NoEntryBlock(String),
    /// Operand types do not line up.
    #[error("type mismatch in '{function}': {detail}")]
    TypeMismatch { function: String, detail: String },
    /// A parameter index is out of range.
    #[error("function '{function}' has no parameter {index}")]
    UnknownParam { function: String, index: u32 },
    /// A switch lists the same case value twice.
    #[error("switch in block {block} of '{function}' repeats case {value}")]
    DuplicateCase {
        function: String,
        block: u32,
        value: u64,
    },
}

/// Errors raised while interpreting IR.
#[derive(Debug, Error)]
pub enum InterpError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("declaration '{0}' has no registered host implementation")]
    MissingHost(String),
    #[error("'{function}' expects {expected} arguments, got {got}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("memory access out of bounds at 0x{addr:x} ({len} bytes)")]
    BadAddress { addr: u64, len: usize },
    #[error("indirect branch in '{function}' to 0x{addr:x} is not a declared destination")]
    BadIndirectTarget { function: String, addr: u64 },
    #[error("call through 0x{0:x} does not reach a function")]
    BadCallTarget(u64),
    #[error("trap reached in block {block} of '{function}'")]
    Trap { function: String, block: u32 },
    #[error("value %{inst} used before definition in '{function}'")]
    UndefinedValue { function: String, inst: u32 },
    #[error("store into read-only data at 0x{addr:x}")]
    ReadOnlyWrite { addr: u64 },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("execution fuel exhausted")]
    FuelExhausted,
    #[error("call depth limit exceeded")]
    StackOverflow,
    #[error("ir error: {0}")]
    Ir(#[from] IrError),
}

/// Error type for metrics computation.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("function '{0}' has no body")]
    NoBody(String),
    #[error("module has no function bodies")]
    NoBodies,
}

/// Error type for transform operations.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A rewrite produced a structure that breaks one of its own invariants.
    #[error("invariant violated in '{function}': {detail}")]
    InvariantViolation { function: String, detail: String },
    #[error("ir error: {0}")]
    Ir(#[from] IrError),
    #[error("metrics computation failed: {0}")]
    Metrics(#[from] MetricsError),
    #[error("unknown pass '{0}'")]
    UnknownPass(String),
}

/// Errors that can occur during obfuscation.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    /// File read/write error.
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    /// Transform application failed.
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    /// Invalid transform pass specified.
    #[error("invalid pass: {0}")]
    InvalidPass(String),
    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The input module does not verify.
    #[error("invalid module: {0}")]
    InvalidModule(#[from] IrError),
    #[error("seed error: {0}")]
    Seed(#[from] SeedError),
}

/// Errors that can occur in the seed system
#[derive(Debug, Clone, Error)]
pub enum SeedError {
    #[error("Invalid seed length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),
    #[error("Invalid hexadecimal in seed")]
    InvalidHex,
}
