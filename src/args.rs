use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Log debug output (or set PERFRUN_LOG)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Override device-farm gateway URL (or via PERFRUN_API_URL)
    #[arg(
        long,
        env = "PERFRUN_API_URL",
        hide_env_values = true,
        global = true
    )]
    pub api_url: Option<String>,

    /// Override project (or via PERFRUN_PROJECT)
    #[arg(
        short = 'p',
        long,
        env = "PERFRUN_PROJECT",
        hide_env_values = true,
        global = true
    )]
    pub project: Option<String>,

    /// Override device pool (or via PERFRUN_DEVICE_POOL)
    #[arg(long, env = "PERFRUN_DEVICE_POOL", global = true)]
    pub device_pool: Option<String>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "PERFRUN_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
