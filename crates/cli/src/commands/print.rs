use async_trait::async_trait;
use clap::Args;
use std::error::Error;
use std::path::PathBuf;

/// Arguments for the `print` subcommand.
#[derive(Args)]
pub struct PrintArgs {
    /// Module JSON file
    pub input: PathBuf,
}

#[async_trait]
impl super::Command for PrintArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let module = super::load_module(&self.input)?;
        print!("{module}");
        Ok(())
    }
}
