//! `init` and `validate`: writing and checking the configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input};

use treesync_core::config::AppConfig;
use treesync_core::diff::DiffKind;

use super::style;

/// Write a configuration for the given pair, prompting for missing paths.
pub fn run_init(
    output: &Path,
    local: Option<PathBuf>,
    remote: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if output.exists() && !force {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", output.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;

        if !overwrite {
            println!(
                "{}",
                style::warn("Init cancelled. Existing file was not modified.")
            );
            return Ok(());
        }
    }

    let local = match local {
        Some(path) => path,
        None => prompt_path("Local tree")?,
    };
    let remote = match remote {
        Some(path) => path,
        None => prompt_path("Remote tree")?,
    };

    let config = build_config(local, remote);
    config.validate().context("generated configuration is invalid")?;
    config
        .save_to_file(output)
        .context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!(
        "  1. Review the auto-accept rules and ignore patterns in {}",
        output.display()
    );
    println!(
        "  2. Inspect differences: treesync --config {} diff",
        output.display()
    );
    println!(
        "  3. Start the daemon:    treesync-daemon --config {}",
        output.display()
    );
    Ok(())
}

fn prompt_path(prompt: &str) -> Result<PathBuf> {
    let value: String = Input::new()
        .with_prompt(prompt)
        .validate_with(|input: &String| -> Result<(), String> {
            if input.trim().is_empty() {
                Err("Path must not be empty".into())
            } else {
                Ok(())
            }
        })
        .interact_text()
        .with_context(|| format!("failed to read {}", prompt.to_lowercase()))?;
    Ok(PathBuf::from(value.trim()))
}

/// Defaults plus a per-user data directory.
fn build_config(local: PathBuf, remote: PathBuf) -> AppConfig {
    let mut config = AppConfig::new(local, remote);
    if let Some(data_dir) = dirs::data_dir() {
        config.daemon.data_dir = data_dir.join("treesync");
    }
    config
}

/// Parse and validate the configuration, then print a summary.
pub fn run_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All fields are valid"));

    for (label, path) in [("local", &config.local.path), ("remote", &config.remote.path)] {
        if !path.is_dir() {
            println!(
                "  {}",
                style::warn(&format!(
                    "{} tree {} does not exist yet; it will be created",
                    label,
                    path.display()
                ))
            );
        }
    }

    let rules = config.auto_accept_rules();
    let mut auto: Vec<&str> = DiffKind::ALL
        .iter()
        .filter(|kind| rules.contains_key(*kind))
        .map(|kind| kind.as_str())
        .collect();
    if auto.is_empty() {
        auto.push("none");
    }

    println!();
    println!("Configuration summary:");
    println!("  Local tree    : {}", config.local.path.display());
    println!("  Remote tree   : {}", config.remote.path.display());
    println!("  Root          : {}", config.sync.root);
    println!("  Concurrency   : {}", config.sync.concurrency);
    println!(
        "  Backoff       : {}s (after success: {}s)",
        config.sync.backoff_secs, config.sync.success_backoff_secs
    );
    println!("  Metadata      : {:?}", config.sync.metadata_backend);
    println!("  Auto-accept   : {}", auto.join(", "));
    println!(
        "  Ignored       : {}",
        if config.sync.ignore_patterns.is_empty() {
            "built-in only".to_string()
        } else {
            config.sync.ignore_patterns.join(", ")
        }
    );
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!();
    println!("{}", style::success("Configuration is valid."));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_paths_writes_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("config.toml");

        run_init(
            &output,
            Some(dir.path().join("local")),
            Some(dir.path().join("remote")),
            false,
        )
        .unwrap();

        let config = AppConfig::load_and_validate(&output).unwrap();
        assert_eq!(config.local.path, dir.path().join("local"));
        assert_eq!(config.sync.concurrency, 3);
        run_validate(&output).unwrap();
    }

    #[test]
    fn test_validate_rejects_same_paths() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("config.toml");
        AppConfig::new("/srv/a", "/srv/a")
            .save_to_file(&output)
            .unwrap();
        assert!(run_validate(&output).is_err());
    }
}
