use async_trait::async_trait;
use clap::Args;
use phantom_core::interp::Machine;
use std::error::Error;
use std::path::PathBuf;

/// Arguments for the `run` subcommand.
#[derive(Args)]
pub struct RunArgs {
    /// Module JSON file
    pub input: PathBuf,
    /// Function to call
    #[arg(short, long)]
    pub function: String,
    /// Comma-separated integer arguments (decimal, negative, or 0x-prefixed hex)
    #[arg(long, default_value = "")]
    pub args: String,
    /// Instruction budget before execution is aborted
    #[arg(long)]
    pub fuel: Option<u64>,
}

/// Parses one argument into raw bits; negative values are two's complement.
fn parse_arg(raw: &str) -> Result<u64, Box<dyn Error>> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x") {
        return Ok(u64::from_str_radix(hex, 16)?);
    }
    if raw.starts_with('-') {
        return Ok(raw.parse::<i64>()? as u64);
    }
    Ok(raw.parse::<u64>()?)
}

/// Parses the `--args` list.
pub fn parse_args(list: &str) -> Result<Vec<u64>, Box<dyn Error>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_arg)
        .collect()
}

#[async_trait]
impl super::Command for RunArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let module = super::load_module(&self.input)?;
        let func = module
            .function(&self.function)
            .ok_or_else(|| format!("no function '{}' in {}", self.function, module.name))?;
        let args = parse_args(&self.args)?;
        let mut machine = Machine::new(&module)?;
        if let Some(fuel) = self.fuel {
            machine = machine.with_fuel(fuel);
        }
        match machine.call(&self.function, &args)? {
            Some(bits) => {
                let ty = func.ret.ok_or("void function returned a value")?;
                println!("{}", ty.sign_extend(bits));
            }
            None => println!("void"),
        }
        tracing::debug!("fuel left: {}", machine.remaining_fuel());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_lists() {
        assert_eq!(parse_args("10,20").unwrap(), vec![10, 20]);
        assert_eq!(parse_args("").unwrap(), Vec::<u64>::new());
        assert_eq!(parse_args("-1, 0x10").unwrap(), vec![u64::MAX, 16]);
        assert!(parse_args("ten").is_err());
    }
}
