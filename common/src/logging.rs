//! Tracing bootstrap for the daemon and tools.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Map a verbosity level to a tracing filter: 0=ERROR, 1=INFO, 2=DEBUG,
/// 3+=TRACE. `RUST_LOG` overrides the computed level when set.
fn filter_for(verbosity: u8) -> EnvFilter {
    let level = match verbosity {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. With a log file, output is appended there
/// without ANSI escapes; otherwise it goes to stderr.
pub fn init(verbosity: u8, log_file: Option<&std::path::Path>) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbosity))
        .with_target(false);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {:?}", path))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
        }
    }
    Ok(())
}
