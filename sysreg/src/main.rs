use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use sysreg::{build_orchestrator, RunConfiguration, SysregError, SysregResult, Verdict};
use sysreg_core::config::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(name = "sysreg")]
#[command(about = "Boots an OS image through its test stages and watches the serial console", long_about = None)]
struct Cli {
    /// Run configuration (TOML)
    #[arg(default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level directive for sysreg crates (e.g. "debug")
    #[arg(long)]
    log_level: Option<String>,
}

/// `--log-level` wins over `RUST_LOG`, which wins over the `info` default
fn init_logging(level: Option<&str>) -> SysregResult<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    let level = match level {
        Some(level) => Some(level),
        None if std::env::var_os("RUST_LOG").is_some() => None,
        None => Some("info"),
    };

    if let Some(level) = level {
        for crate_name in ["sysreg", "sysreg_core", "sysreg_vm"] {
            let directive = format!("{}={}", crate_name, level);
            filter = filter.add_directive(directive.parse().map_err(|e| {
                SysregError::ConfigError(format!("Invalid log directive: {}", e))
            })?);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> SysregResult<Verdict> {
    let config = RunConfiguration::from_file(&cli.config)?;
    let output_dir = config.output_dir.clone();
    tracing::info!(
        "Loaded {} (output directory {})",
        cli.config.display(),
        output_dir.display()
    );

    let registry = sysreg_vm::default_registry();
    let mut orchestrator = build_orchestrator(config, &registry)?;
    let report = orchestrator.run().await;

    match report.write_to(&output_dir) {
        Ok(path) => tracing::info!("Run report written to {}", path.display()),
        Err(e) => tracing::warn!("Failed to write run report: {}", e),
    }

    Ok(report.verdict)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_level.as_deref()) {
        eprintln!("{}", e);
        return ExitCode::from(Verdict::Abort.exit_code());
    }

    let verdict = match run(cli).await {
        Ok(verdict) => verdict,
        Err(e) => {
            tracing::error!("Cannot start the run: {}", e);
            Verdict::Abort
        }
    };

    println!("Status: {}", verdict.status_line());
    ExitCode::from(verdict.exit_code())
}
