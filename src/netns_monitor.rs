use std::{any::Any, sync::Arc, time::Duration};

use itertools::Itertools;
use tokio::{
    task::LocalSet,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, warn};

use crate::{host::NetnsSystem, netns::INode, shutdown::Shutdown};

pub type ThreadError = Box<dyn Any + Send + 'static>;

/// Shortest period a monitor ticks at. Shorter ones, zero included, are raised to it.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// How a namespace monitor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// `setns` into the namespace failed, nothing was listed.
    EntryFailed,
    /// The per-thread runtime could not be built.
    RuntimeFailed,
    /// Stopped by the shutdown signal after emitting `listings` interface listings.
    Cancelled { listings: u64 },
}

/// A monitor running on its own OS thread.
pub struct MonitorHandle {
    netns: INode,
    thread: async_thread::JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    pub fn netns(&self) -> INode {
        self.netns
    }

    pub async fn join(self) -> Result<MonitorExit, ThreadError> {
        self.thread.join().await
    }
}

/// Starts monitoring one network namespace.
///
/// The monitor gets a dedicated OS thread named `netns-<inode>`: `setns` only changes the
/// namespace of the calling thread, so the thread is never shared and the monitor never leaves
/// it. The handle moves onto that thread and is dropped there when the monitor stops, or right
/// away if the thread cannot be spawned.
pub fn spawn_monitor<S: NetnsSystem>(
    system: Arc<S>,
    netns: INode,
    handle: S::Handle,
    shutdown: Shutdown,
    period: Duration,
) -> std::io::Result<MonitorHandle> {
    if period < MIN_PERIOD {
        warn!(netns, ?period, min = ?MIN_PERIOD, "monitoring period too short, raising it");
    }
    let period = period.max(MIN_PERIOD);

    let thread = async_thread::Builder::new()
        .name(format!("netns-{netns}"))
        .spawn(move || run_monitor(&*system, netns, handle, &shutdown, period))?;

    Ok(MonitorHandle { netns, thread })
}

fn run_monitor<S: NetnsSystem>(
    system: &S,
    netns: INode,
    handle: S::Handle,
    shutdown: &Shutdown,
    period: Duration,
) -> MonitorExit {
    // ==== Entering ====
    if let Err(err) = system.enter(&handle) {
        warn!(netns, error = %err, "failed to enter network namespace, not monitoring it");
        return MonitorExit::EntryFailed;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!(netns, error = %err, "failed to create tokio runtime, not monitoring namespace");
            return MonitorExit::RuntimeFailed;
        }
    };
    let local_set = LocalSet::new();

    // ==== Active ====
    let listings = local_set.block_on(&runtime, watch_interfaces(system, netns, shutdown, period));

    // ==== Stopped ====
    drop(handle);
    debug!(netns, listings, "namespace monitor stopped");

    MonitorExit::Cancelled { listings }
}

/// Lists interfaces every `period` until shutdown. Returns how many listings were emitted.
async fn watch_interfaces<S: NetnsSystem>(
    system: &S,
    netns: INode,
    shutdown: &Shutdown,
    period: Duration,
) -> u64 {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut listings = 0;

    'main: loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break 'main,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.triggered() => break 'main,
            result = system.interfaces() => result,
        };

        if shutdown.is_triggered() {
            break 'main;
        }

        match result {
            Ok(interfaces) => {
                listings += 1;
                info!(
                    netns,
                    count = interfaces.len(),
                    "interfaces: {}",
                    interfaces.iter().join(", ")
                );
            }
            Err(err) => warn!(netns, error = %err, "failed to list interfaces"),
        }
    }

    listings
}
