use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;

use crate::classify::classify;
use crate::cli::DownloadArgs;
use crate::config::Config;
use crate::generate::Generator;

pub async fn run(args: DownloadArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = Config::load(config_path).context("load config")?;
    if let Some(store_path) = args.store_path {
        config.store_path = store_path;
    }
    tracing::debug!(store = %config.store_dir().display(), "download: config loaded");

    let generator = Generator::from_config(config).context("build generator")?;
    let requests = classify(&args.inputs);
    tracing::info!(requests = requests.len(), "download: start");

    let title = args.output.as_deref().unwrap_or_default();
    let processed =
        crate::queue::process(&generator, requests, title, args.cover_image.as_deref()).await;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "Generated {} files:", processed.len()).context("write summary")?;
    for (idx, request) in processed.iter().enumerate() {
        let path = Path::new(&request.locator);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| request.locator.as_str().into());
        writeln!(stdout, "{}. {name}", idx + 1).context("write summary")?;
    }
    Ok(())
}
