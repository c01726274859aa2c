use std::path::Path;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    pagebinder::logging::init().context("init logging")?;

    let cli = pagebinder::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config_path = cli.config.as_deref().map(Path::new);
    match cli.command {
        pagebinder::cli::Command::Download(args) => {
            pagebinder::download::run(args, config_path)
                .await
                .context("download")?;
        }
    }

    Ok(())
}
