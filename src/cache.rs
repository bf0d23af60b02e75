use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use dialoguer::Confirm;
use serde_json::json;

use crate::args::BaseArgs;
use crate::metrics::cache::{cache_path, clear, read_snapshot};
use crate::ui::{print_command_status, CommandStatus};
use crate::utils::counted;

#[derive(Debug, Clone, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommands,
}

#[derive(Debug, Clone, Subcommand)]
enum CacheCommands {
    /// Remove cached metrics so the next analyze re-extracts them
    Clear {
        /// Trace directories
        #[arg(required = true, value_name = "DIR")]
        dirs: Vec<PathBuf>,
        /// Skip the confirmation prompt
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Show whether a directory has cached metrics
    Show {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

pub fn run(base: BaseArgs, args: CacheArgs) -> Result<()> {
    match args.command {
        CacheCommands::Clear { dirs, force } => run_clear(&base, &dirs, force),
        CacheCommands::Show { dir } => run_show(&base, dir),
    }
}

fn run_clear(base: &BaseArgs, dirs: &[PathBuf], force: bool) -> Result<()> {
    if !force && std::io::stdin().is_terminal() {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Clear cached metrics in {}?",
                counted(dirs.len(), "directory", Some("directories"))
            ))
            .default(false)
            .interact()?;
        if !confirm {
            return Ok(());
        }
    }

    let mut results = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let removed = clear(dir)?;
        if !base.json {
            if removed {
                print_command_status(
                    CommandStatus::Success,
                    &format!("Cleared {}", cache_path(dir).display()),
                );
            } else {
                print_command_status(
                    CommandStatus::Warning,
                    &format!("No cached metrics in {}", dir.display()),
                );
            }
        }
        results.push(json!({ "dir": dir, "cleared": removed }));
    }

    if base.json {
        println!("{}", serde_json::to_string(&results)?);
    }
    Ok(())
}

fn run_show(base: &BaseArgs, dir: PathBuf) -> Result<()> {
    let path = cache_path(&dir);
    let records = read_snapshot(&dir);

    if base.json {
        let value = json!({
            "path": path,
            "exists": path.exists(),
            "records": records.as_ref().map(Vec::len),
        });
        println!("{}", serde_json::to_string(&value)?);
        return Ok(());
    }

    match records {
        Some(records) => println!(
            "{}: {}",
            path.display(),
            counted(records.len(), "record", None)
        ),
        None if path.exists() => println!("{}: unreadable", path.display()),
        None => println!("{}: none", path.display()),
    }
    Ok(())
}
