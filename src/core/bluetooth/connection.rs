//! Per-device connection attempt
//! One attempt runs CONNECTING → CONNECTED → {DISCONNECTED | TIMEOUT} exactly once and
//! is then discarded; the supervisor spawns a fresh one for every retry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream::{BoxStream, SelectAll};
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::{CharacteristicConfig, Configuration};
use crate::core::bluetooth::constants::{DISCONNECT_TIMEOUT, LIVENESS_POLL_INTERVAL};
use crate::core::bluetooth::transport::{Link, Radio, TransportError};
use crate::core::pipeline::{DecodedSample, IntakeSender};
use crate::logging::Logger;
use crate::utils::unix_time_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Timeout,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Timeout)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Invoked for every decoded notification before it is queued.
pub type LiveCallback = Arc<dyn Fn(&DecodedSample) + Send + Sync>;

/// Shared, read-only inputs of every attempt.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<Configuration>,
    pub characteristics: Arc<[Arc<CharacteristicConfig>]>,
    pub radio: Arc<dyn Radio>,
    pub halt: CancellationToken,
    pub intake: IntakeSender,
    pub on_data: Option<LiveCallback>,
    pub log: Logger,
}

impl ConnectionContext {
    pub fn new(
        config: Arc<Configuration>,
        radio: Arc<dyn Radio>,
        halt: CancellationToken,
        intake: IntakeSender,
        on_data: Option<LiveCallback>,
        log: Logger,
    ) -> Self {
        let characteristics = config
            .characteristics
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();
        Self {
            config,
            characteristics,
            radio,
            halt,
            intake,
            on_data,
            log,
        }
    }
}

/// Supervisor-side view of a running attempt.
#[derive(Debug)]
pub struct AttemptHandle {
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl AttemptHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the attempt to end and returns its terminal state.
    pub async fn join(self) -> Result<ConnectionState, JoinError> {
        self.task.await?;
        let state = *self.state.borrow();
        Ok(state)
    }
}

/// Why a connected device was presumed dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessBreach {
    /// Notifications stopped arriving.
    Silent {
        characteristic: usize,
        silent_for: Duration,
    },
    /// No notification arrived within timeout plus the initial grace allowance.
    NeverReceived { characteristic: usize, waited: Duration },
}

impl LivenessBreach {
    pub fn characteristic(&self) -> usize {
        match self {
            LivenessBreach::Silent { characteristic, .. }
            | LivenessBreach::NeverReceived { characteristic, .. } => *characteristic,
        }
    }
}

/// Per-characteristic notification bookkeeping for one attempt.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    connected_at: Instant,
    initial_grace: Duration,
    timeouts: Vec<Option<Duration>>,
    last_notification: Vec<Option<Instant>>,
}

impl LivenessTracker {
    pub fn new(timeouts: Vec<Option<Duration>>, initial_grace: Duration, connected_at: Instant) -> Self {
        let last_notification = vec![None; timeouts.len()];
        Self {
            connected_at,
            initial_grace,
            timeouts,
            last_notification,
        }
    }

    pub fn record(&mut self, characteristic: usize, at: Instant) {
        if let Some(slot) = self.last_notification.get_mut(characteristic) {
            *slot = Some(at);
        }
    }

    pub fn check(&self, now: Instant) -> Option<LivenessBreach> {
        self.timeouts
            .iter()
            .zip(&self.last_notification)
            .enumerate()
            .find_map(|(characteristic, (timeout, last))| {
                let timeout = (*timeout)?;
                match last {
                    Some(last) => {
                        let silent_for = now.saturating_duration_since(*last);
                        (silent_for > timeout).then_some(LivenessBreach::Silent {
                            characteristic,
                            silent_for,
                        })
                    }
                    None => {
                        let waited = now.saturating_duration_since(self.connected_at);
                        (waited > timeout.saturating_add(self.initial_grace)).then_some(
                            LivenessBreach::NeverReceived {
                                characteristic,
                                waited,
                            },
                        )
                    }
                }
            })
    }
}

type Notifications = SelectAll<BoxStream<'static, (usize, Vec<u8>)>>;

pub struct Connection {
    address: String,
    display_name: String,
    ctx: ConnectionContext,
    state: watch::Sender<ConnectionState>,
    /// Samples dropped since the intake last accepted one.
    intake_drops: AtomicUsize,
}

impl Connection {
    /// Starts a fresh attempt on its own task.
    pub fn spawn(ctx: ConnectionContext, address: String, display_name: String) -> AttemptHandle {
        let (state, state_rx) = watch::channel(ConnectionState::Connecting);
        let connection = Connection {
            address,
            display_name,
            ctx,
            state,
            intake_drops: AtomicUsize::new(0),
        };
        let task = tokio::spawn(connection.run());
        AttemptHandle {
            state: state_rx,
            task,
        }
    }

    async fn run(self) {
        let final_state = self.attempt().await;
        self.state.send_replace(final_state);
    }

    async fn attempt(&self) -> ConnectionState {
        let link = match self.ctx.radio.open(&self.address).await {
            Ok(link) => link,
            Err(e) => {
                self.ctx
                    .log
                    .warn(format_args!("Failed to connect to {}: {}", self.display_name, e));
                return ConnectionState::Disconnected;
            }
        };

        let connect_timeout = self.ctx.config.connect_timeout();
        let outcome: Result<(), TransportError> = tokio::select! {
            _ = self.ctx.halt.cancelled() => Err(TransportError::Cancelled),
            result = timeout(connect_timeout, link.connect()) => {
                result.unwrap_or(Err(TransportError::Timeout))
            }
        };
        if let Err(e) = outcome {
            self.ctx
                .log
                .warn(format_args!("Failed to connect to {}: {}", self.display_name, e));
            if matches!(e, TransportError::Timeout | TransportError::Cancelled) {
                // The stack may still be half-way through connecting.
                let _ = timeout(DISCONNECT_TIMEOUT, link.disconnect()).await;
            }
            return ConnectionState::Disconnected;
        }
        self.ctx
            .log
            .info(format_args!("Established connection to {}", self.display_name));

        // Setup is bounded like the connect itself; a stalled write must not pin the attempt.
        let setup = tokio::select! {
            _ = self.ctx.halt.cancelled() => Err(TransportError::Cancelled),
            result = timeout(connect_timeout, self.configure(link.as_ref())) => {
                result.unwrap_or(Err(TransportError::Timeout))
            }
        };
        let (notifications, peer_gone) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                self.ctx.log.warn(format_args!(
                    "Failed to set up notifications for {}: {}",
                    self.display_name, e
                ));
                self.disconnect(link.as_ref()).await;
                return ConnectionState::Disconnected;
            }
        };

        self.state.send_replace(ConnectionState::Connected);
        self.stream(link.as_ref(), notifications, peer_gone).await
    }

    async fn configure(
        &self,
        link: &dyn Link,
    ) -> Result<(Notifications, oneshot::Receiver<()>), TransportError> {
        let peer_gone = link.watch_disconnect().await?;

        for write in &self.ctx.config.control_writes {
            link.write(write.characteristic, &write.data).await?;
        }

        let mut streams = Vec::with_capacity(self.ctx.characteristics.len());
        for (index, characteristic) in self.ctx.characteristics.iter().enumerate() {
            let stream = link.subscribe(characteristic.uuid).await?;
            streams.push(stream.map(move |payload| (index, payload)).boxed());
        }
        self.ctx.log.debug(format_args!(
            "Enabled notifications for all characteristics for {}",
            self.display_name
        ));

        Ok((futures_util::stream::select_all(streams), peer_gone))
    }

    async fn stream(
        &self,
        link: &dyn Link,
        mut notifications: Notifications,
        peer_gone: oneshot::Receiver<()>,
    ) -> ConnectionState {
        let timeouts = self.ctx.characteristics.iter().map(|c| c.timeout()).collect();
        let mut liveness = LivenessTracker::new(
            timeouts,
            self.ctx.config.initial_characteristic_timeout(),
            Instant::now(),
        );
        let mut poll = interval(LIVENESS_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut peer_gone = peer_gone.fuse();

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.halt.cancelled() => {
                    self.disconnect(link).await;
                    return ConnectionState::Disconnected;
                }
                gone = &mut peer_gone => {
                    if gone.is_ok() {
                        self.ctx
                            .log
                            .warn(format_args!("Connection to {} lost!", self.display_name));
                        let _ = timeout(DISCONNECT_TIMEOUT, link.disconnect()).await;
                        return ConnectionState::Disconnected;
                    }
                    self.ctx.log.debug(format_args!(
                        "Disconnect watch for {} ended",
                        self.display_name
                    ));
                }
                _ = poll.tick() => {
                    if let Some(breach) = liveness.check(Instant::now()) {
                        self.report_breach(breach);
                        self.disconnect(link).await;
                        return ConnectionState::Timeout;
                    }
                }
                Some((index, payload)) = notifications.next() => {
                    liveness.record(index, Instant::now());
                    self.handle_notification(index, &payload);
                }
            }
        }
    }

    fn report_breach(&self, breach: LivenessBreach) {
        let name = self
            .ctx
            .characteristics
            .get(breach.characteristic())
            .map(|c| c.name.as_str())
            .unwrap_or("?");
        match breach {
            LivenessBreach::Silent { silent_for, .. } => self.ctx.log.warn(format_args!(
                "{}: Timeout for characteristic {} expired after {:.1}s of silence, disconnecting..",
                self.display_name,
                name,
                silent_for.as_secs_f64()
            )),
            LivenessBreach::NeverReceived { .. } => self.ctx.log.warn(format_args!(
                "{}: Never received a notification for {}, disconnecting...",
                self.display_name, name
            )),
        }
    }

    /// Decodes one notification and hands it on. Never blocks and never changes state.
    fn handle_notification(&self, index: usize, payload: &[u8]) {
        let Some(characteristic) = self.ctx.characteristics.get(index) else {
            return;
        };
        let receipt_time = unix_time_secs();

        let frame = match characteristic.decoder.decode(payload, receipt_time) {
            Ok(frame) => frame,
            Err(e) => {
                self.ctx.log.error(format_args!(
                    "Decoder for {} on {} failed: {}",
                    characteristic.name, self.display_name, e
                ));
                return;
            }
        };
        for text in &frame.diagnostics {
            self.ctx
                .log
                .debug(format_args!("{} says: {}", self.display_name, text));
        }
        if frame.rows.is_empty() {
            return;
        }

        let sample = Arc::new(DecodedSample {
            address: self.address.clone(),
            display_name: self.display_name.clone(),
            characteristic: characteristic.clone(),
            rows: frame.rows,
        });
        if let Some(on_data) = &self.ctx.on_data {
            on_data(&sample);
        }
        match self.ctx.intake.try_send(sample) {
            Ok(()) => {
                let dropped = self.intake_drops.swap(0, Ordering::Relaxed);
                if dropped > 1 {
                    self.ctx.log.warn(format_args!(
                        "{} dropped {} samples while the intake queue was full",
                        self.display_name, dropped
                    ));
                }
            }
            // Only the first drop of a streak is reported; the streak total follows once it ends.
            Err(TrySendError::Full(_)) => {
                if self.intake_drops.fetch_add(1, Ordering::Relaxed) == 0 {
                    self.ctx.log.error(format_args!(
                        "{} failed to put data into queue",
                        self.display_name
                    ));
                }
            }
            Err(TrySendError::Closed(_)) => self.ctx.log.debug(format_args!(
                "Intake queue closed, dropping data from {}",
                self.display_name
            )),
        }
    }

    async fn disconnect(&self, link: &dyn Link) {
        match timeout(DISCONNECT_TIMEOUT, link.disconnect()).await {
            Ok(Ok(())) => self
                .ctx
                .log
                .info(format_args!("Disconnected from {}", self.display_name)),
            Ok(Err(e)) => self.ctx.log.warn(format_args!(
                "Failed to disconnect from {}: {}",
                self.display_name, e
            )),
            Err(_) => self.ctx.log.warn(format_args!(
                "Failed to disconnect from {}: Timeout",
                self.display_name
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{IMU_CONFIG_COMMAND, UUID_CONTROL_CHAR, UUID_DATA_CHAR};
    use crate::core::bluetooth::mock::{ConnectBehaviour, MockPeripheral, MockRadio};
    use crate::core::pipeline::DecodedSample;
    use crate::logging::CaptureLog;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const ADDRESS: &str = "FB:4A:66:AC:08:01";

    fn imu_payload(ts: u32) -> Vec<u8> {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&ts.to_le_bytes());
        for v in [1i16, 2, 3, 4, 5, 6] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    struct Harness {
        peripheral: MockPeripheral,
        halt: CancellationToken,
        intake: mpsc::Receiver<Arc<DecodedSample>>,
        live: Arc<Mutex<Vec<u32>>>,
        capture: Arc<CaptureLog>,
        handle: AttemptHandle,
    }

    fn start(timeout_secs: Option<f64>, intake_capacity: usize) -> Harness {
        let mut config = Configuration::default();
        config.characteristics[0].timeout_secs = timeout_secs;
        config.connect_timeout_secs = 2.0;
        config.initial_characteristic_timeout_secs = 10.0;
        let config = Arc::new(config.validated().unwrap());

        let radio = MockRadio::new();
        let peripheral = radio.add_device(ADDRESS, Some("SmartVNS"), None);
        let halt = CancellationToken::new();
        let (tx, rx) = mpsc::channel(intake_capacity);
        let live = Arc::new(Mutex::new(Vec::new()));
        let live_sink = live.clone();
        let on_data: LiveCallback = Arc::new(move |sample: &DecodedSample| {
            live_sink.lock().unwrap().push(sample.rows[0][1] as u32);
        });
        let capture = CaptureLog::new();
        let ctx = ConnectionContext::new(
            config,
            radio,
            halt.clone(),
            tx,
            Some(on_data),
            Logger::with_sink("connection", capture.clone()),
        );
        let handle = Connection::spawn(ctx, ADDRESS.to_string(), "SmartVNS0".to_string());
        Harness {
            peripheral,
            halt,
            intake: rx,
            live,
            capture,
            handle,
        }
    }

    async fn wait_for(handle: &AttemptHandle, state: ConnectionState) {
        for _ in 0..1000 {
            if handle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("attempt never reached {state}, stuck in {}", handle.state());
    }

    #[test]
    fn liveness_tracker_uses_last_notification_once_data_arrived() {
        let t0 = Instant::now();
        let mut tracker =
            LivenessTracker::new(vec![Some(Duration::from_secs(5)), None], Duration::from_secs(10), t0);
        tracker.record(0, t0 + Duration::from_secs(1));
        assert_eq!(tracker.check(t0 + Duration::from_secs(6)), None);
        assert_eq!(
            tracker.check(t0 + Duration::from_secs(7)),
            Some(LivenessBreach::Silent {
                characteristic: 0,
                silent_for: Duration::from_secs(6)
            })
        );
    }

    #[test]
    fn liveness_tracker_allows_initial_grace() {
        let t0 = Instant::now();
        let tracker =
            LivenessTracker::new(vec![None, Some(Duration::from_secs(5))], Duration::from_secs(10), t0);
        assert_eq!(tracker.check(t0 + Duration::from_secs(15)), None);
        assert_eq!(
            tracker.check(t0 + Duration::from_secs(16)),
            Some(LivenessBreach::NeverReceived {
                characteristic: 1,
                waited: Duration::from_secs(16)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connects_configures_and_streams() {
        let mut h = start(None, 16);
        wait_for(&h.handle, ConnectionState::Connected).await;

        let writes = h.peripheral.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], (UUID_CONTROL_CHAR, IMU_CONFIG_COMMAND.to_vec()));
        assert!(h.peripheral.is_subscribed(UUID_DATA_CHAR));

        for ts in [1, 2, 3] {
            assert!(h.peripheral.notify(UUID_DATA_CHAR, imu_payload(ts)));
        }
        let mut received = Vec::new();
        for _ in 0..3 {
            let sample = h.intake.recv().await.unwrap();
            assert_eq!(sample.display_name, "SmartVNS0");
            assert_eq!(sample.characteristic.name, "data");
            received.push(sample.rows[0][1] as u32);
        }
        assert_eq!(received, vec![1, 2, 3]);
        assert_eq!(*h.live.lock().unwrap(), vec![1, 2, 3]);

        h.halt.cancel();
        wait_for(&h.handle, ConnectionState::Disconnected).await;
        assert_eq!(h.peripheral.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_characteristic_times_out_and_disconnects() {
        let h = start(Some(5.0), 16);
        wait_for(&h.handle, ConnectionState::Connected).await;
        h.peripheral.notify(UUID_DATA_CHAR, imu_payload(1));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        wait_for(&h.handle, ConnectionState::Timeout).await;
        assert_eq!(h.peripheral.disconnects(), 1);
        assert!(h.capture.contains("Timeout for characteristic data expired"));
        assert_eq!(h.handle.join().await.unwrap(), ConnectionState::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn never_notified_characteristic_gets_grace_then_times_out() {
        let h = start(Some(5.0), 16);
        wait_for(&h.handle, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        tokio::time::sleep(Duration::from_secs(2)).await;
        wait_for(&h.handle, ConnectionState::Timeout).await;
        assert!(h.capture.contains("Never received a notification for data"));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_disconnect_ends_attempt() {
        let h = start(None, 16);
        wait_for(&h.handle, ConnectionState::Connected).await;
        assert!(h.peripheral.drop_link());
        wait_for(&h.handle, ConnectionState::Disconnected).await;
        assert!(h.capture.contains("Connection to SmartVNS0 lost!"));
        h.handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_is_disconnected() {
        let radio = MockRadio::new();
        let peripheral = radio.add_device(ADDRESS, Some("SmartVNS"), None);
        peripheral.set_behaviour(ConnectBehaviour::Refuse);
        let (tx, _rx) = mpsc::channel(4);
        let ctx = ConnectionContext::new(
            Arc::new(Configuration::default()),
            radio,
            CancellationToken::new(),
            tx,
            None,
            Logger::new("test"),
        );
        let handle = Connection::spawn(ctx, ADDRESS.to_string(), "SmartVNS0".to_string());
        wait_for(&handle, ConnectionState::Disconnected).await;
        assert_eq!(peripheral.connects(), 1);
        assert!(peripheral.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_hits_connect_timeout() {
        let radio = MockRadio::new();
        let peripheral = radio.add_device(ADDRESS, Some("SmartVNS"), None);
        peripheral.set_behaviour(ConnectBehaviour::Hang);
        let (tx, _rx) = mpsc::channel(4);
        let mut config = Configuration::default();
        config.connect_timeout_secs = 3.0;
        let ctx = ConnectionContext::new(
            Arc::new(config),
            radio,
            CancellationToken::new(),
            tx,
            None,
            Logger::new("test"),
        );
        let handle = Connection::spawn(ctx, ADDRESS.to_string(), "SmartVNS0".to_string());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);
        tokio::time::sleep(Duration::from_secs(2)).await;
        wait_for(&handle, ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn decode_errors_and_full_intake_do_not_change_state() {
        let mut h = start(None, 1);
        wait_for(&h.handle, ConnectionState::Connected).await;

        h.peripheral.notify(UUID_DATA_CHAR, vec![9, 9, 9]);
        h.peripheral.notify(UUID_DATA_CHAR, imu_payload(1));
        h.peripheral.notify(UUID_DATA_CHAR, imu_payload(2));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert!(h.capture.contains("Decoder for data on SmartVNS0 failed"));
        assert!(h.capture.contains("SmartVNS0 failed to put data into queue"));
        assert_eq!(h.intake.recv().await.unwrap().rows[0][1], 1.0);
        // The live callback still saw both decoded batches.
        assert_eq!(*h.live.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn halt_during_stalled_setup_ends_attempt() {
        let h = start(None, 16);
        h.peripheral.stall_writes(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connecting);
        assert!(h.peripheral.is_connected());

        h.halt.cancel();
        let state = tokio::time::timeout(Duration::from_secs(60), h.handle.join())
            .await
            .expect("attempt kept running after halt")
            .unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(h.peripheral.disconnects(), 1);
        assert!(!h.peripheral.is_subscribed(UUID_DATA_CHAR));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_setup_is_bounded_by_connect_timeout() {
        let h = start(None, 16);
        h.peripheral.stall_writes(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_secs(1)).await;
        wait_for(&h.handle, ConnectionState::Disconnected).await;
        assert_eq!(h.peripheral.disconnects(), 1);
        assert!(h.capture.contains("Failed to set up notifications for SmartVNS0"));
    }

    #[tokio::test(start_paused = true)]
    async fn intake_drops_are_reported_once_per_streak() {
        let mut h = start(None, 1);
        wait_for(&h.handle, ConnectionState::Connected).await;

        for ts in 1..=5 {
            h.peripheral.notify(UUID_DATA_CHAR, imu_payload(ts));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.capture.count(log::Level::Error), 1);

        assert_eq!(h.intake.recv().await.unwrap().rows[0][1], 1.0);
        h.peripheral.notify(UUID_DATA_CHAR, imu_payload(6));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.capture.count(log::Level::Error), 1);
        assert!(h.capture.contains("SmartVNS0 dropped 4 samples while the intake queue was full"));
        assert_eq!(h.intake.recv().await.unwrap().rows[0][1], 6.0);
    }
}
