use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::find_local_config_dir;

pub const PROFILE_ENV: &str = "PERFRUN_ENV";

/// Load `.env` files before clap parses, so `env = ...` fallbacks see them.
/// Variables already present in the process environment always win.
pub fn bootstrap_from_args(args: &[OsString]) -> Result<()> {
    let explicit = extract_env_file_arg(args);
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let root = project_root(&cwd);
    let profile = std::env::var(PROFILE_ENV).ok().filter(|p| !p.is_empty());

    let files = match &explicit {
        Some(path) => vec![absolute_from(&cwd, path)],
        None => candidate_files(&root, profile.as_deref()),
    };
    for (key, value) in read_env_files(&files, explicit.is_some())? {
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Directory holding `.perfrun/`, or the working directory.
fn project_root(cwd: &Path) -> PathBuf {
    find_local_config_dir()
        .and_then(|dir| dir.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| cwd.to_path_buf())
}

fn absolute_from(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Lowest precedence first.
fn candidate_files(root: &Path, profile: Option<&str>) -> Vec<PathBuf> {
    let mut files = vec![root.join(".env")];
    if let Some(profile) = profile {
        files.push(root.join(format!(".env.{profile}")));
    }
    files.push(root.join(".env.local"));
    if let Some(profile) = profile {
        files.push(root.join(format!(".env.{profile}.local")));
    }
    files
}

fn read_env_files(files: &[PathBuf], required: bool) -> Result<BTreeMap<String, String>> {
    let mut loaded = BTreeMap::new();
    for file in files {
        if !required && !file.exists() {
            continue;
        }
        let entries = dotenvy::from_path_iter(file)
            .with_context(|| format!("failed to read env file {}", file.display()))?;
        for entry in entries {
            let (key, value) =
                entry.with_context(|| format!("failed to parse env file {}", file.display()))?;
            if std::env::var_os(&key).is_none() {
                loaded.insert(key, value);
            }
        }
    }
    Ok(loaded)
}

fn extract_env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut explicit = None;
    let mut rest = args.iter().skip(1).filter_map(|arg| arg.to_str());
    while let Some(arg) = rest.next() {
        match arg {
            "--" => break,
            "--env-file" => explicit = rest.next().map(PathBuf::from),
            _ => {
                if let Some(value) = arg.strip_prefix("--env-file=") {
                    explicit = Some(PathBuf::from(value));
                }
            }
        }
    }
    explicit
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn args(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn env_file_flag_is_found_in_both_forms() {
        assert_eq!(
            extract_env_file_arg(&args(&["perfrun", "run", "--env-file", "ci.env"])),
            Some(PathBuf::from("ci.env"))
        );
        assert_eq!(
            extract_env_file_arg(&args(&["perfrun", "--env-file=ci.env", "analyze"])),
            Some(PathBuf::from("ci.env"))
        );
    }

    #[test]
    fn arguments_after_double_dash_are_ignored() {
        assert_eq!(
            extract_env_file_arg(&args(&["perfrun", "run", "--", "--env-file", "x"])),
            None
        );
    }

    #[test]
    fn profile_files_sit_between_base_and_local() {
        let root = Path::new("/work");
        assert_eq!(
            candidate_files(root, None),
            vec![PathBuf::from("/work/.env"), PathBuf::from("/work/.env.local")]
        );
        assert_eq!(
            candidate_files(root, Some("ci")),
            vec![
                PathBuf::from("/work/.env"),
                PathBuf::from("/work/.env.ci"),
                PathBuf::from("/work/.env.local"),
                PathBuf::from("/work/.env.ci.local"),
            ]
        );
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join(".env");
        let local = tmp.path().join(".env.local");
        fs::write(&base, "PERFRUN_TEST_ENV_A=base\nPERFRUN_TEST_ENV_B=base\n").unwrap();
        fs::write(&local, "PERFRUN_TEST_ENV_B=local\n").unwrap();
        let missing = tmp.path().join(".env.ci");

        let loaded = read_env_files(&[base, missing, local], false).unwrap();
        assert_eq!(loaded["PERFRUN_TEST_ENV_A"], "base");
        assert_eq!(loaded["PERFRUN_TEST_ENV_B"], "local");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(read_env_files(&[tmp.path().join("nope.env")], true).is_err());
    }
}
