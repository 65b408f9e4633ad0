use async_trait::async_trait;
use clap::Args;
use phantom_core::samples;
use std::error::Error;
use std::path::PathBuf;

#[derive(Args)]
pub struct SampleArgs {
    /// Sample name: sum_to_n, compute, classify or calls
    pub name: String,
    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[async_trait]
impl super::Command for SampleArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let module = samples::by_name(&self.name).ok_or_else(|| {
            format!(
                "unknown sample '{}', expected one of {}",
                self.name,
                samples::NAMES.join(", ")
            )
        })?;
        super::write_output(
            self.output.as_deref(),
            &serde_json::to_string_pretty(&module)?,
        )
    }
}
