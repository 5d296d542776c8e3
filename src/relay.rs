//! The relay loop
//!
//! Every tick runs all source watchers concurrently, waits for them, then runs
//! every destination lane concurrently and waits for those. A tick is never
//! abandoned half way: a stop request moves the loop to `Draining`, lets the
//! in-flight tick settle its requests, and then stops.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::ChainHandle;
use crate::dispatch::{DispatchConfig, DispatchReport, Dispatcher, Lane};
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::store::RequestStore;
use crate::types::ChainId;
use crate::watchers::{EventWatcher, ScanReport, WatcherConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Idle => "idle",
            RelayState::Running => "running",
            RelayState::Draining => "draining",
            RelayState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay direction: events from `gateway` on `source` addressed to `dest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source: ChainId,
    pub dest: ChainId,
    pub gateway: Address,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub tick_interval: Duration,
    pub max_block_range: u64,
    pub dispatch: DispatchConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(5000),
            max_block_range: 10_000,
            dispatch: DispatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub scans: Vec<ScanReport>,
    pub scan_failures: Vec<(ChainId, String)>,
    pub dispatched: Vec<DispatchReport>,
    pub dispatch_failures: usize,
}

impl TickReport {
    pub fn observed(&self) -> usize {
        self.scans.iter().map(|scan| scan.observed).sum()
    }

    pub fn executed(&self) -> usize {
        self.dispatched.iter().map(|lane| lane.executed).sum()
    }

    pub fn failed(&self) -> usize {
        self.dispatched.iter().map(|lane| lane.failed).sum()
    }
}

pub struct RelayLoop {
    watchers: Vec<Arc<EventWatcher>>,
    dispatcher: Dispatcher,
    tick_interval: Duration,
    state: watch::Sender<RelayState>,
}

impl RelayLoop {
    /// Build watchers and dispatch lanes for `routes` over `chains`
    pub fn new(
        chains: Vec<ChainHandle>,
        routes: Vec<Route>,
        store: Arc<dyn RequestStore>,
        settings: RelaySettings,
    ) -> Result<Self> {
        let mut by_name: HashMap<ChainId, ChainHandle> = HashMap::new();
        for handle in chains {
            let name = handle.chain().clone();
            if by_name.insert(name.clone(), handle).is_some() {
                return Err(RelayError::InvalidTopology(format!(
                    "chain {} configured twice",
                    name
                )));
            }
        }
        if routes.is_empty() {
            return Err(RelayError::InvalidTopology("no routes configured".to_string()));
        }

        let mut sources: BTreeMap<ChainId, Vec<(ChainId, Address)>> = BTreeMap::new();
        let mut dests: BTreeSet<ChainId> = BTreeSet::new();
        for route in &routes {
            for chain in [&route.source, &route.dest] {
                if !by_name.contains_key(chain) {
                    return Err(RelayError::UnknownChain(chain.clone()));
                }
            }
            if route.source == route.dest {
                return Err(RelayError::InvalidTopology(format!(
                    "route from {} to itself",
                    route.source
                )));
            }
            sources
                .entry(route.source.clone())
                .or_default()
                .push((route.dest.clone(), route.gateway));
            dests.insert(route.dest.clone());
        }

        let mut watchers = Vec::with_capacity(sources.len());
        for (source, pairs) in sources {
            let handle = &by_name[&source];
            watchers.push(Arc::new(EventWatcher::new(
                handle.client.clone(),
                store.clone(),
                pairs,
                WatcherConfig {
                    confirmations: handle.required_confirmations,
                    max_block_range: settings.max_block_range,
                    start_height: handle.start_height,
                },
            )));
        }
        let lanes = dests.iter().map(|dest| {
            let handle = &by_name[dest];
            Lane {
                client: handle.client.clone(),
                min_confirmations: handle.execution_confirmations,
            }
        });
        let dispatcher = Dispatcher::new(store, lanes, settings.dispatch);

        info!(
            sources = watchers.len(),
            destinations = dests.len(),
            tick_interval_ms = settings.tick_interval.as_millis() as u64,
            "Relay loop created"
        );

        let (state, _) = watch::channel(RelayState::Idle);
        Ok(Self {
            watchers,
            dispatcher,
            tick_interval: settings.tick_interval,
            state,
        })
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: RelayState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Relay state changed");
        }
    }

    /// One full pass: scan every source, then dispatch every destination
    pub async fn tick(&self, cancel: &CancellationToken) -> TickReport {
        let started = std::time::Instant::now();
        let mut report = TickReport::default();

        let mut scans = JoinSet::new();
        for watcher in &self.watchers {
            let watcher = watcher.clone();
            scans.spawn(async move {
                let chain = watcher.chain().clone();
                (chain, watcher.tick().await)
            });
        }
        while let Some(joined) = scans.join_next().await {
            match joined {
                Ok((_, Ok(Some(scan)))) => report.scans.push(scan),
                Ok((_, Ok(None))) => {}
                Ok((chain, Err(e))) => {
                    if e.is_transient() {
                        warn!(chain = %chain, error = %e, "Watcher tick failed, retrying next tick");
                    } else {
                        error!(chain = %chain, error = %e, "Watcher tick failed");
                    }
                    report.scan_failures.push((chain, e.to_string()));
                }
                Err(e) => error!(error = %e, "Watcher task panicked"),
            }
        }

        for lane in self.dispatcher.dispatch_all(cancel).await {
            match lane {
                Ok(lane) => report.dispatched.push(lane),
                Err(e) => {
                    error!(error = %e, "Dispatch pass failed");
                    report.dispatch_failures += 1;
                }
            }
        }

        metrics::record_tick(started.elapsed().as_secs_f64());
        report
    }

    /// Tick until `cancel` fires. Only valid from `Idle`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let started = self.state.send_if_modified(|state| {
            if *state == RelayState::Idle {
                *state = RelayState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(RelayError::AlreadyStarted);
        }
        info!(from = %RelayState::Idle, to = %RelayState::Running, "Relay state changed");
        metrics::set_up(true);

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let tick = self.tick(&cancel);
            tokio::pin!(tick);
            let report = tokio::select! {
                report = &mut tick => report,
                _ = cancel.cancelled() => {
                    self.set_state(RelayState::Draining);
                    info!("Stop requested, draining in-flight tick");
                    tick.await
                }
            };

            if report.observed() + report.executed() + report.failed() > 0
                || !report.scan_failures.is_empty()
            {
                info!(
                    observed = report.observed(),
                    executed = report.executed(),
                    failed = report.failed(),
                    scan_failures = report.scan_failures.len(),
                    "Tick complete"
                );
            } else {
                debug!("Tick complete, nothing to relay");
            }
        }

        self.set_state(RelayState::Draining);
        self.set_state(RelayState::Stopped);
        metrics::set_up(false);
        Ok(())
    }
}
