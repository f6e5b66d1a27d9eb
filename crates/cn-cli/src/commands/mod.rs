pub mod plan;
pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use cn_core::config::Config;

/// Config from `path`, or from the default location (defaults when absent).
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load_from(p)
            .with_context(|| format!("failed to load config from {}", p.display())),
        None => Config::load().context("failed to load config"),
    }
}

pub fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Pretty JSON to `out`, or stdout when `out` is `None`.
pub fn emit_json<T: Serialize>(value: &T, out: Option<&Path>) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => std::fs::write(path, text + "\n")
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

pub fn show_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
