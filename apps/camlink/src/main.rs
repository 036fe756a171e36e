use anyhow::Context;
use camlink_core::cli::Cli;
use camlink_core::telemetry::logging;
use clap::Parser;
use clap::error::ErrorKind;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    if let Err(err) = run(cli).await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("failed to initialise logging")?;
    tracing::debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = camlink_core::configure(&cli).context("invalid configuration")?;
    let report = camlink_core::run(&config)
        .await
        .with_context(|| format!("{} session failed", config.role.as_str()))?;
    tracing::info!(
        role = report.role.as_str(),
        streamed = report.reached_streaming,
        "done"
    );
    Ok(())
}
