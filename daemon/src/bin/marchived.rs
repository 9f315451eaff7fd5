use clap::Parser;

use common::config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(
    name = "marchived",
    version,
    about = "Media archiving daemon - watches media folders and hands encode jobs to remote workers",
    long_about = "marchived discovers media files in the configured folders, records them in its \
catalog and serves them to encode workers over RPC. Finished encodes are uploaded back, moved \
next to their source under the archive name and recorded.

Without -n the process detaches from the terminal after reading its configuration."
)]
struct Args {
    /// Stay in the foreground instead of detaching
    #[arg(short = 'n', long = "foreground")]
    foreground: bool,

    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE (overrides the config file)
    #[arg(short = 'v', long = "verbose", value_name = "N")]
    verbose: Option<u8>,

    /// Configuration file to use
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        default_value = "marchived.cfg"
    )]
    config: std::path::PathBuf,

    /// Log file path (overrides the config file)
    #[arg(short = 'l', long = "log", value_name = "FILE")]
    log: Option<std::path::PathBuf>,
}

fn main() {
    let args = Args::parse();
    let mut cfg = match DaemonConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(error) => {
            eprintln!("could not read configuration: {error:#}");
            std::process::exit(1);
        }
    };
    if let Some(verbose) = args.verbose {
        cfg.verbosity = verbose;
    }
    if let Some(log) = args.log {
        cfg.log_file = Some(log);
    }
    if cfg.watch_folders().is_empty() {
        eprintln!("missing media folder(s) in configuration");
        std::process::exit(1);
    }
    // detach before the runtime exists; forked threads do not survive
    if !args.foreground {
        if let Err(error) = nix::unistd::daemon(true, false) {
            eprintln!("could not daemonize: {error}");
            std::process::exit(2);
        }
    }
    if let Err(error) = common::logging::init(cfg.verbosity, cfg.log_file.as_deref()) {
        eprintln!("could not initialize logging: {error:#}");
        std::process::exit(1);
    }
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("could not start runtime: {error}");
            std::process::exit(1);
        }
    };
    match runtime.block_on(run(cfg)) {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            tracing::error!("daemon failed: {error:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cfg: DaemonConfig) -> anyhow::Result<()> {
    let daemon = marchive_daemon::start(cfg).await?;
    let _signals = marchive_daemon::signals::spawn(daemon.coordinator());
    tracing::info!("daemon started on {}", daemon.local_addr());
    daemon.wait().await?;
    tracing::info!("exiting");
    Ok(())
}
