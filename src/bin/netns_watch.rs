use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use netns_watch::{
    host::Host,
    netns::{PROCFS_ROOT, resolve},
    shutdown::{Shutdown, install_interrupt_handler},
    supervisor::{MonitorSettings, supervise},
};
use tracing::{debug, info};

/// Watches the network interfaces of every network namespace on the host.
///
/// Every namespace some process lives in is entered from a dedicated thread and its interfaces
/// are logged periodically, until Ctrl-C.
#[derive(Debug, Parser)]
#[command(about, long_about, version)]
struct Cli {
    /// Time between two interface listings of a namespace, in milliseconds.
    #[arg(long, default_value_t = 3000, value_parser = clap::value_parser!(u64).range(1..))]
    period_ms: u64,

    /// How long to wait for monitors to stop after shutdown, in milliseconds.
    #[arg(long, default_value_t = 100)]
    grace_ms: u64,

    /// Where procfs is mounted.
    #[arg(long, default_value = PROCFS_ROOT)]
    proc_root: PathBuf,

    /// Shut down by itself after this many seconds.
    #[arg(long)]
    run_for_secs: Option<u64>,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.tracing_level_filter())
        .with_thread_names(true)
        .init();

    debug!(config = ?cli);

    let shutdown = Shutdown::new();
    // Leaving `main` for any reason stops the monitors.
    let _guard = shutdown.drop_guard();
    install_interrupt_handler(shutdown.clone())?;

    if let Some(secs) = cli.run_for_secs {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if shutdown.trigger() {
                info!(secs, "run time elapsed, shutting down");
            }
        });
    }

    let namespaces = resolve(&cli.proc_root).await?;
    info!("{} namespaces...", namespaces.len());

    let settings = MonitorSettings {
        period: Duration::from_millis(cli.period_ms),
        grace: Duration::from_millis(cli.grace_ms),
    };
    let system = Arc::new(Host::new(&cli.proc_root));

    let stopped = supervise(system, &namespaces, &shutdown, settings).await;
    debug!(stopped = stopped.len(), "all namespace monitors drained");

    Ok(())
}
