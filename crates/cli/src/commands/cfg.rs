use async_trait::async_trait;
use clap::Args;
use phantom_core::cfg::to_dot;
use std::error::Error;
use std::path::PathBuf;

#[derive(Args)]
pub struct CfgArgs {
    /// Module JSON file
    pub input: PathBuf,
    /// Function to graph
    #[arg(short, long)]
    pub function: String,
    /// Output file for Graphviz .dot (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[async_trait]
impl super::Command for CfgArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let module = super::load_module(&self.input)?;
        let func = module
            .function(&self.function)
            .ok_or_else(|| format!("no function '{}' in {}", self.function, module.name))?;
        if func.is_declaration() {
            return Err(format!("'{}' is a declaration", self.function).into());
        }
        super::write_output(self.output.as_deref(), &to_dot(func))
    }
}
