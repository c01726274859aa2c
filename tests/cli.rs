use predicates::prelude::*;

fn pagebinder() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagebinder");
    cmd.env_remove("PAGEBINDER_CONFIG")
        .env_remove("PAGEBINDER_LOG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn download_help_lists_flags() {
    pagebinder()
        .args(["download", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--output"))
        .stdout(predicate::str::contains("--cover-image"))
        .stdout(predicate::str::contains("--store-path"));
}

#[test]
fn existing_document_passes_through() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let book = temp.path().join("ready.epub");
    std::fs::write(&book, b"PK")?;

    pagebinder()
        .args(["download", "--store-path"])
        .arg(temp.path())
        .arg(&book)
        .assert()
        .success()
        .stdout("Generated 1 files:\n1. ready.epub\n");
    Ok(())
}

#[test]
fn missing_input_is_dropped() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;

    pagebinder()
        .current_dir(temp.path())
        .args(["download", "no-such-file.epub"])
        .assert()
        .success()
        .stdout("Generated 0 files:\n")
        .stderr(predicate::str::contains("no-such-file.epub"));
    Ok(())
}

#[test]
fn unreadable_config_fails() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = temp.path().join("config.json");
    std::fs::write(&config, "storepath = nope")?;

    pagebinder()
        .arg("--config")
        .arg(&config)
        .args(["download", "https://example.com/"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("load config"));
    Ok(())
}

#[test]
fn config_from_env_is_used() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = temp.path().join("config.json");
    std::fs::write(&config, "{not json")?;

    pagebinder()
        .env("PAGEBINDER_CONFIG", &config)
        .args(["download", "https://example.com/"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parse config"));
    Ok(())
}

#[test]
fn debug_log_level_emits_parsed_cli() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let book = temp.path().join("ready.epub");
    std::fs::write(&book, b"PK")?;

    pagebinder()
        .env("PAGEBINDER_LOG", "debug")
        .arg("download")
        .arg(&book)
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
