//! Connection supervisor
//! Keeps one record per known device and, once per tick, reconciles attempt states
//! and admits at most one new attempt within the connection budget.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::core::bluetooth::connection::{AttemptHandle, Connection, ConnectionContext, ConnectionState};
use crate::core::bluetooth::registry::{DeviceRegistry, Liveness};
use crate::core::stream::{EventSender, StreamEvent};
use crate::logging::Logger;
use crate::utils::format_hms;

/// Supervision record for one device address.
#[derive(Debug)]
pub struct ManagedConnection {
    pub address: String,
    pub display_id: String,
    attempt: Option<AttemptHandle>,
    last_attempt: Option<Instant>,
    /// Last lamp state sent to the console.
    reported: Option<bool>,
    connected_since: Option<Instant>,
}

impl ManagedConnection {
    fn new(address: String, display_id: String) -> Self {
        Self {
            address,
            display_id,
            attempt: None,
            last_attempt: None,
            reported: None,
            connected_since: None,
        }
    }

    /// State of the current attempt; a device never attempted counts as disconnected.
    pub fn state(&self) -> ConnectionState {
        self.attempt
            .as_ref()
            .map_or(ConnectionState::Disconnected, AttemptHandle::state)
    }
}

/// Admission order: never attempted first, then the oldest attempt, then address.
pub fn admission_order(a: &ManagedConnection, b: &ManagedConnection) -> Ordering {
    let by_attempt = match (a.last_attempt, b.last_attempt) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    };
    by_attempt.then_with(|| a.address.cmp(&b.address))
}

/// Counters after reconciling one tick, plus the device admitted in it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub active: usize,
    pub in_flight: usize,
    pub started: Option<String>,
}

pub struct ConnectionSupervisor {
    ctx: ConnectionContext,
    registry: Arc<DeviceRegistry>,
    selection: Option<BTreeSet<String>>,
    connections: BTreeMap<String, ManagedConnection>,
    events: Option<EventSender>,
    log: Logger,
}

impl ConnectionSupervisor {
    /// `selection` limits supervision to these addresses; `None` supervises every
    /// device in the registry.
    pub fn new(
        ctx: ConnectionContext,
        registry: Arc<DeviceRegistry>,
        selection: Option<BTreeSet<String>>,
        events: Option<EventSender>,
    ) -> Self {
        let log = ctx.log.scoped("supervisor");
        Self {
            ctx,
            registry,
            selection,
            connections: BTreeMap::new(),
            events,
            log,
        }
    }

    pub fn connections(&self) -> impl Iterator<Item = &ManagedConnection> {
        self.connections.values()
    }

    /// Ticks until halted, then waits for every attempt to end.
    pub async fn run(mut self) {
        self.log.info("Connection supervisor started");
        let mut ticker = interval(self.ctx.config.manager_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.halt.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Instant::now()) {
                        self.log.error(format_args!(
                            "Connection supervisor encountered an error: {:#}",
                            e
                        ));
                        self.ctx.halt.cancel();
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// One reconcile-then-admit pass.
    pub fn tick(&mut self, now: Instant) -> Result<TickReport> {
        self.track_known_devices();
        let mut report = self.reconcile(now)?;

        let max_active = self.ctx.config.max_active_connections;
        let max_attempts = self.ctx.config.max_simultaneous_connection_attempts;
        if report.active < max_active && report.in_flight < max_attempts {
            if let Some(address) = self.next_candidate() {
                self.start_attempt(&address, now);
                report.active += 1;
                report.in_flight += 1;
                report.started = Some(address);
            }
        }
        Ok(report)
    }

    fn track_known_devices(&mut self) {
        for device in self.registry.snapshot() {
            if let Some(selection) = &self.selection {
                if !selection.contains(&device.address) {
                    continue;
                }
            }
            self.connections
                .entry(device.address.clone())
                .or_insert_with(|| {
                    ManagedConnection::new(device.address.clone(), device.display_id().to_string())
                });
        }
    }

    fn reconcile(&mut self, now: Instant) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut lamps = Vec::new();

        for con in self.connections.values() {
            let Some(attempt) = &con.attempt else {
                continue;
            };
            // The task publishes its terminal state before it finishes.
            let finished = attempt.is_finished();
            let state = attempt.state();
            if finished && !state.is_terminal() {
                bail!(
                    "connection task for {} ended without reaching a terminal state ({})",
                    con.display_id,
                    state
                );
            }
            match state {
                ConnectionState::Connecting => {
                    report.active += 1;
                    report.in_flight += 1;
                }
                ConnectionState::Connected => {
                    report.active += 1;
                    lamps.push((con.address.clone(), true));
                }
                ConnectionState::Disconnected | ConnectionState::Timeout => {
                    lamps.push((con.address.clone(), false));
                }
            }
        }

        for (address, connected) in lamps {
            self.set_lamp(&address, connected, now);
        }
        Ok(report)
    }

    fn next_candidate(&self) -> Option<String> {
        self.connections
            .values()
            .filter(|con| con.state().is_terminal())
            .filter(|con| self.registry.liveness(&con.address) == Some(Liveness::RecentlySeen))
            .min_by(|a, b| admission_order(a, b))
            .map(|con| con.address.clone())
    }

    fn start_attempt(&mut self, address: &str, now: Instant) {
        let Some(con) = self.connections.get_mut(address) else {
            return;
        };
        self.log
            .info(format_args!("Connecting to {}...", con.display_id));
        con.attempt = Some(Connection::spawn(
            self.ctx.clone(),
            con.address.clone(),
            con.display_id.clone(),
        ));
        con.last_attempt = Some(now);
    }

    /// Emits a connect-state event when a device's lamp changes.
    fn set_lamp(&mut self, address: &str, connected: bool, now: Instant) {
        let Some(con) = self.connections.get_mut(address) else {
            return;
        };
        if con.reported == Some(connected) {
            return;
        }
        con.reported = Some(connected);

        if connected {
            con.connected_since = Some(now);
        } else if let Some(since) = con.connected_since.take() {
            self.log.warn(format_args!(
                "Device {} disconnected after {} active, attempting reconnect...",
                con.display_id,
                format_hms(now.saturating_duration_since(since))
            ));
        }

        if let Some(events) = &self.events {
            let _ = events.send(StreamEvent::ConnectState {
                device: con.display_id.clone(),
                connected,
            });
        }
    }

    async fn shutdown(&mut self) {
        let outstanding = self
            .connections
            .values()
            .filter(|con| con.attempt.as_ref().is_some_and(|a| !a.is_finished()))
            .count();
        if outstanding > 0 {
            self.log.info(format_args!(
                "Waiting for {} connection attempts to end...",
                outstanding
            ));
        }

        let now = Instant::now();
        let addresses: Vec<String> = self.connections.keys().cloned().collect();
        for address in addresses {
            let Some(attempt) = self
                .connections
                .get_mut(&address)
                .and_then(|con| con.attempt.take())
            else {
                continue;
            };
            if let Err(e) = attempt.join().await {
                self.log
                    .error(format_args!("Connection task for {} failed: {}", address, e));
            }
            self.set_lamp(&address, false, now);
        }
        self.log.info("Connection supervisor shut down");
    }
}
