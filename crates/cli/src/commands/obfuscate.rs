/// Module for the `obfuscate` subcommand, which applies obfuscation passes to an IR module.
///
/// This module loads a JSON module, layers the command-line flags over an optional JSON pass
/// configuration, runs the selected passes through the pipeline and writes the obfuscated
/// module. A per-pass JSON report can be emitted alongside it.
use async_trait::async_trait;
use clap::Args;
use phantom_transform::obfuscator::{DEFAULT_PASSES, ObfuscationConfig, obfuscate_module};
use phantom_transform::{DispatcherDefault, FunctionOutcome, PassConfig, VmEncoding};
use phantom_utils::seed::Seed;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

/// Arguments for the `obfuscate` subcommand.
#[derive(Args)]
pub struct ObfuscateArgs {
    /// Module JSON file
    pub input: PathBuf,
    /// Comma-separated list of passes, applied in order
    #[arg(long, default_value_t = DEFAULT_PASSES.join(","))]
    pub passes: String,
    /// Seed: a decimal integer or a 64 character hex string
    #[arg(long, default_value = "42")]
    pub seed: String,
    /// Comma-separated function allow-list (default: every eligible function)
    #[arg(long)]
    pub functions: Option<String>,
    /// JSON pass configuration used as the base for the flags below
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Output file for the obfuscated module (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Path to emit the pass report as JSON
    #[arg(long)]
    pub emit: Option<PathBuf>,
    /// Dispatcher default case traps
    #[arg(long, conflicts_with = "spin")]
    pub trap: bool,
    /// Dispatcher default case loops back to the dispatcher
    #[arg(long = "loop")]
    pub spin: bool,
    /// Encode virtualized instructions as encrypted bytecode
    #[arg(long)]
    pub bytecode: bool,
    /// Encode calls even in position-independent modules
    #[arg(long)]
    pub allow_pic: bool,
    /// Leave the module's entry point untouched
    #[arg(long)]
    pub skip_entry: bool,
}

/// Parses a seed given either as a decimal `u64` or as 32 bytes of hex.
pub fn parse_seed(raw: &str) -> Result<Seed, Box<dyn Error>> {
    match raw.trim().parse::<u64>() {
        Ok(value) => Ok(Seed::from_u64(value)),
        Err(_) => Ok(Seed::from_hex(raw)?),
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ObfuscateArgs {
    /// Builds the pass configuration: file first, flags on top.
    pub fn pass_config(&self) -> Result<PassConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
            None => PassConfig::default(),
        };
        if let Some(list) = &self.functions {
            config.functions = split_list(list);
        }
        if self.trap {
            config.dispatcher_default = DispatcherDefault::Trap;
        }
        if self.spin {
            config.dispatcher_default = DispatcherDefault::Loop;
        }
        if self.bytecode {
            config.vm_encoding = VmEncoding::Bytecode;
        }
        config.allow_pic_call_encoding |= self.allow_pic;
        config.skip_entry_point |= self.skip_entry;
        Ok(config)
    }
}

/// Executes the `obfuscate` subcommand.
#[async_trait]
impl super::Command for ObfuscateArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let module = super::load_module(&self.input)?;
        let config = ObfuscationConfig {
            seed: parse_seed(&self.seed)?,
            passes: split_list(&self.passes),
            pass_config: self.pass_config()?,
        };
        tracing::debug!("{:?}", config);

        let result = obfuscate_module(module, &config).await?;

        for report in &result.report.reports {
            if let Some(reason) = &report.module_skip {
                eprintln!("{:>18}: skipped ({reason})", report.transform);
                continue;
            }
            let rewritten = report
                .functions
                .values()
                .filter(|o| matches!(o, FunctionOutcome::Rewritten { .. }))
                .count();
            eprintln!(
                "{:>18}: {} site(s) in {}/{} function(s)",
                report.transform,
                report.sites(),
                rewritten,
                report.functions.len()
            );
        }
        let (before, after) = (&result.report.before, &result.report.after);
        eprintln!(
            "Blocks {} -> {}, instructions {} -> {}, potency {:.2} -> {:.2}",
            before.block_cnt,
            after.block_cnt,
            before.inst_cnt,
            after.inst_cnt,
            before.potency,
            after.potency
        );

        if let Some(path) = &self.emit {
            fs::write(path, result.report.to_json()?)?;
            eprintln!("Wrote pass report to {}", path.display());
        }
        super::write_output(
            self.output.as_deref(),
            &serde_json::to_string_pretty(&result.module)?,
        )
    }
}
