use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// JSON config file (default: `$PAGEBINDER_CONFIG`).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download web pages as EPUB files and save them locally.
    ///
    /// Each input is a page url or a `.txt` file listing one url per line, and produces its own
    /// file. Existing documents are passed through.
    Download(DownloadArgs),
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Page urls, url list files (`.txt`) or existing documents.
    #[arg(required = true, value_name = "INPUTS")]
    pub inputs: Vec<String>,

    /// Book title (default: title of the first page).
    #[arg(short = 'o', long = "output", value_name = "TITLE")]
    pub output: Option<String>,

    /// Cover image url or local path.
    #[arg(short = 'i', long = "cover-image", value_name = "URL")]
    pub cover_image: Option<String>,

    /// Output directory, overriding `storepath` from the config.
    #[arg(long, value_name = "DIR")]
    pub store_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;
    use clap::Parser as _;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn download_accepts_short_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "pagebinder",
            "download",
            "-o",
            "Essays",
            "-i",
            "cover.jpg",
            "http://paulgraham.com/alien.html",
            "links.txt",
            "--config",
            "conf.json",
        ])?;
        assert_eq!(cli.config.as_deref(), Some("conf.json"));
        let Command::Download(args) = cli.command;
        assert_eq!(args.inputs, vec!["http://paulgraham.com/alien.html", "links.txt"]);
        assert_eq!(args.output.as_deref(), Some("Essays"));
        assert_eq!(args.cover_image.as_deref(), Some("cover.jpg"));
        assert!(args.store_path.is_none());
        Ok(())
    }

    #[test]
    fn download_requires_inputs() {
        assert!(Cli::try_parse_from(["pagebinder", "download"]).is_err());
    }
}
