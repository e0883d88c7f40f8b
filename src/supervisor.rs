use std::{sync::Arc, time::Duration};

use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::{
    host::NetnsSystem,
    netns::{INode, NamespaceMap},
    netns_monitor::{MonitorExit, MonitorHandle, spawn_monitor},
    shutdown::Shutdown,
};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Time between two interface listings of one namespace.
    pub period: Duration,
    /// How long to wait for monitors to release their handles after shutdown.
    pub grace: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            grace: DEFAULT_GRACE,
        }
    }
}

/// Owns one monitor per network namespace that could be opened.
pub struct Supervisor {
    monitors: Vec<MonitorHandle>,
}

impl Supervisor {
    /// Opens every namespace in `map` and starts a monitor for each.
    ///
    /// Namespaces whose representative process cannot be opened are skipped.
    pub fn start<S: NetnsSystem>(
        system: Arc<S>,
        map: &NamespaceMap,
        shutdown: &Shutdown,
        settings: MonitorSettings,
    ) -> Self {
        let mut monitors = Vec::with_capacity(map.len());

        for (netns, pid) in map.iter() {
            let handle = match system.open(pid) {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(netns, pid, error = %err, "can't get namespace handle, skipping");
                    continue;
                }
            };

            debug!(netns, pid, "starting namespace monitor");
            match spawn_monitor(
                system.clone(),
                netns,
                handle,
                shutdown.clone(),
                settings.period,
            ) {
                Ok(monitor) => monitors.push(monitor),
                Err(err) => warn!(netns, pid, error = %err, "can't spawn monitor thread, skipping"),
            }
        }

        Self { monitors }
    }

    /// Namespaces that have a running (or already finished) monitor.
    pub fn monitored(&self) -> impl Iterator<Item = INode> + '_ {
        self.monitors.iter().map(|monitor| monitor.netns())
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Waits for `shutdown`, then gives monitors up to `grace` to stop.
    ///
    /// Returns as soon as every monitor has stopped, without sleeping out the rest of `grace`.
    /// The result says how every monitor that stopped in time ended. Monitors still running
    /// after `grace` are detached.
    pub async fn drain(self, shutdown: &Shutdown, grace: Duration) -> Vec<(INode, MonitorExit)> {
        shutdown.triggered().await;

        let deadline = Instant::now() + grace;
        let mut pending: FuturesUnordered<_> = self
            .monitors
            .into_iter()
            .map(|monitor| {
                let netns = monitor.netns();
                monitor.join().map(move |result| (netns, result))
            })
            .collect();

        let mut stopped = Vec::with_capacity(pending.len());
        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((netns, Ok(exit)))) => stopped.push((netns, exit)),
                Ok(Some((netns, Err(_panic)))) => {
                    warn!(netns, "namespace monitor thread died");
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(
                        still_running = pending.len(),
                        ?grace,
                        "namespace monitors did not stop in time, detaching them"
                    );
                    break;
                }
            }
        }

        stopped
    }
}

/// Monitors every namespace in `map` until `shutdown` fires.
pub async fn supervise<S: NetnsSystem>(
    system: Arc<S>,
    map: &NamespaceMap,
    shutdown: &Shutdown,
    settings: MonitorSettings,
) -> Vec<(INode, MonitorExit)> {
    let supervisor = Supervisor::start(system, map, shutdown, settings);
    info!(
        monitored = supervisor.len(),
        namespaces = map.len(),
        "namespace monitors started"
    );

    supervisor.drain(shutdown, settings.grace).await
}
