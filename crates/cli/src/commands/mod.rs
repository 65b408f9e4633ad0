use async_trait::async_trait;
use clap::Subcommand;
use phantom_core::ir::Module;
use phantom_core::ir::verify::verify_module;
use std::error::Error;
use std::fs;
use std::path::Path;

pub mod cfg;
pub mod obfuscate;
pub mod print;
pub mod run;
pub mod sample;

#[derive(Subcommand)]
pub enum Cmd {
    /// Apply obfuscation passes to a module
    Obfuscate(obfuscate::ObfuscateArgs),

    /// Print a module as text
    Print(print::PrintArgs),

    /// Write a function's CFG to stdout or a file
    Cfg(cfg::CfgArgs),

    /// Interpret a function and print its result
    Run(run::RunArgs),

    /// Emit a bundled sample module as JSON
    Sample(sample::SampleArgs),
}

#[async_trait]
pub trait Command {
    async fn execute(self) -> Result<(), Box<dyn Error>>;
}

#[async_trait]
impl Command for Cmd {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        match self {
            Self::Obfuscate(args) => args.execute().await,
            Self::Print(args) => args.execute().await,
            Self::Cfg(args) => args.execute().await,
            Self::Run(args) => args.execute().await,
            Self::Sample(args) => args.execute().await,
        }
    }
}

/// Reads a JSON module from `path` and verifies it.
pub fn load_module(path: &Path) -> Result<Module, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let module: Module = serde_json::from_str(&text)?;
    verify_module(&module)?;
    Ok(module)
}

/// Writes `content` to `path`, or to stdout when no path is given.
pub fn write_output(path: Option<&Path>, content: &str) -> Result<(), Box<dyn Error>> {
    match path {
        Some(path) => fs::write(path, content)?,
        None => println!("{content}"),
    }
    Ok(())
}
