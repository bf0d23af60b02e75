use std::path::Path;

use anyhow::{Context, Result};

use super::PATH_KEYS;
use crate::ui::{print_command_status, CommandStatus};

/// Path keys are made absolute against the working directory.
fn normalize(key: &str, value: &str) -> Result<String> {
    if !PATH_KEYS.contains(&key) {
        return Ok(value.trim().to_string());
    }
    let path = std::path::absolute(value.trim())
        .with_context(|| format!("invalid path for {key}: {value}"))?;
    Ok(path.display().to_string())
}

fn warn_if_missing(key: &str, value: &str) {
    let must_be_file = matches!(key, "trace_processor_path" | "test_spec_template");
    if must_be_file && !Path::new(value).is_file() {
        print_command_status(
            CommandStatus::Warning,
            &format!("{key} points to {value}, which is not a file (yet)"),
        );
    }
}

pub fn run(key: &str, value: &str, global: bool, local: bool) -> Result<()> {
    let path = super::resolve_write_path(global, local)?;
    let mut cfg = super::load_file(&path);

    let value = normalize(key, value)?;
    cfg.set_field(key, &value)?;
    super::save_file(&path, &cfg)?;

    print_command_status(
        CommandStatus::Success,
        &format!("Set {key} = {value} in {}", path.display()),
    );
    warn_if_missing(key, &value);
    Ok(())
}

pub fn unset(key: &str, global: bool, local: bool) -> Result<()> {
    let path = super::resolve_write_path(global, local)?;
    let mut cfg = super::load_file(&path);

    if cfg.get_field(key).is_none() {
        print_command_status(
            CommandStatus::Warning,
            &format!("{key} is not set in {}", path.display()),
        );
        return Ok(());
    }
    cfg.unset_field(key);
    super::save_file(&path, &cfg)?;

    print_command_status(
        CommandStatus::Success,
        &format!("Unset {key} in {}", path.display()),
    );
    Ok(())
}
