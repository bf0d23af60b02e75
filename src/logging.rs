use std::io;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PERFRUN_LOG";

/// Install the stderr subscriber. `PERFRUN_LOG` wins over `--verbose`.
pub fn init(verbose: bool) {
    let level = if verbose { "perfrun=debug" } else { "perfrun=info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
