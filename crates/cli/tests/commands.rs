use anyhow::{Result, anyhow};
use phantom_cli::commands::Command;
use phantom_cli::commands::obfuscate::ObfuscateArgs;
use phantom_cli::commands::run::RunArgs;
use phantom_cli::commands::sample::SampleArgs;
use phantom_cli::commands::{cfg::CfgArgs, load_module};
use phantom_core::interp::Machine;
use phantom_transform::obfuscator::DEFAULT_PASSES;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn obfuscate_args(input: &Path, output: &Path) -> ObfuscateArgs {
    ObfuscateArgs {
        input: input.to_path_buf(),
        passes: DEFAULT_PASSES.join(","),
        seed: "7".into(),
        functions: None,
        config: None,
        output: Some(output.to_path_buf()),
        emit: None,
        trap: false,
        spin: false,
        bytecode: false,
        allow_pic: false,
        skip_entry: false,
    }
}

async fn write_sample(dir: &TempDir, name: &str) -> Result<PathBuf> {
    let path = dir.path().join(format!("{name}.json"));
    SampleArgs {
        name: name.into(),
        output: Some(path.clone()),
    }
    .execute()
    .await
    .map_err(|e| anyhow!("{e}"))?;
    Ok(path)
}

#[tokio::test]
async fn sample_obfuscate_run() -> Result<()> {
    let dir = TempDir::new()?;
    let input = write_sample(&dir, "sum_to_n").await?;
    let output = dir.path().join("out.json");
    let report = dir.path().join("report.json");

    let mut args = obfuscate_args(&input, &output);
    args.emit = Some(report.clone());
    args.execute().await.map_err(|e| anyhow!("{e}"))?;

    let module = load_module(&output).map_err(|e| anyhow!("{e}"))?;
    let mut machine = Machine::new(&module)?;
    assert_eq!(machine.call("sum_to_n", &[10])?, Some(55));

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report)?)?;
    assert_eq!(json["reports"].as_array().map(Vec::len), Some(DEFAULT_PASSES.len()));

    RunArgs {
        input: output.clone(),
        function: "sum_to_n".into(),
        args: "10".into(),
        fuel: Some(1_000_000),
    }
    .execute()
    .await
    .map_err(|e| anyhow!("{e}"))?;

    let dot = dir.path().join("cfg.dot");
    CfgArgs {
        input: output,
        function: "sum_to_n".into(),
        output: Some(dot.clone()),
    }
    .execute()
    .await
    .map_err(|e| anyhow!("{e}"))?;
    assert!(fs::read_to_string(dot)?.starts_with("digraph"));
    Ok(())
}

#[tokio::test]
async fn same_seed_same_output() -> Result<()> {
    let dir = TempDir::new()?;
    let input = write_sample(&dir, "classify").await?;
    let mut outputs = Vec::new();
    for k in 0..2 {
        let output = dir.path().join(format!("out{k}.json"));
        let mut args = obfuscate_args(&input, &output);
        args.bytecode = true;
        args.spin = true;
        args.execute().await.map_err(|e| anyhow!("{e}"))?;
        outputs.push(fs::read_to_string(output)?);
    }
    assert_eq!(outputs[0], outputs[1]);
    Ok(())
}

#[tokio::test]
async fn config_file_and_flags_combine() -> Result<()> {
    let dir = TempDir::new()?;
    let input = write_sample(&dir, "compute").await?;
    let config = dir.path().join("passes.json");
    fs::write(&config, r#"{ "mba_constants": [42], "vm_encoding": "bytecode" }"#)?;

    let mut args = obfuscate_args(&input, &dir.path().join("out.json"));
    args.config = Some(config);
    args.trap = true;
    args.skip_entry = true;
    let pass_config = args.pass_config().map_err(|e| anyhow!("{e}"))?;
    assert_eq!(pass_config.mba_constants, vec![42]);
    assert!(pass_config.skip_entry_point);
    assert_eq!(
        pass_config.vm_encoding,
        phantom_transform::VmEncoding::Bytecode
    );
    Ok(())
}

#[tokio::test]
async fn unknown_inputs_fail() -> Result<()> {
    let dir = TempDir::new()?;
    let input = write_sample(&dir, "compute").await?;
    let mut args = obfuscate_args(&input, &dir.path().join("out.json"));
    args.passes = "flatten-cfg,reorder".into();
    assert!(args.execute().await.is_err());

    let sample = SampleArgs {
        name: "missing".into(),
        output: None,
    };
    assert!(sample.execute().await.is_err());
    Ok(())
}
