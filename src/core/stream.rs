//! Acquisition session
//! Wires the connection supervisor into the fan-out, scales live samples into the
//! per-device rolling buffers and reports to the operator console through
//! [`StreamEvent`]s. A session runs on its own thread with a single-threaded runtime.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::core::bluetooth::connection::{ConnectionContext, LiveCallback};
use crate::core::bluetooth::registry::{DeviceRegistry, SeenDevice};
use crate::core::bluetooth::supervisor::ConnectionSupervisor;
use crate::core::bluetooth::transport::Radio;
use crate::core::decoder::Row;
use crate::core::pipeline::{CsvSink, DecodedSample, Fanout, intake_channel};
use crate::logging::{LogMessage, Logger};

/// Messages from the engine to the operator console.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ConnectState { device: String, connected: bool },
    NewData { device: String },
    Log(LogMessage),
}

pub type EventSender = mpsc::UnboundedSender<StreamEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

const ACC_FULL_SCALE: f64 = 4.0;
const GYRO_FULL_SCALE: f64 = 1000.0;
const COUNTS: f64 = 32768.0;
/// Raw gyro counts to rad/s.
pub const GYRO_SCALING: f64 = 1.0 / COUNTS * 1.13 * std::f64::consts::PI / 180.0 * GYRO_FULL_SCALE;
/// Raw accelerometer counts to m/s².
pub const ACC_SCALING: f64 = 1.0 / COUNTS * 9.81 * ACC_FULL_SCALE;

/// Per-column unit conversion of a motion row.
pub const SCALING_FACTORS: [f64; 15] = [
    1.0,          // receipt time [s]
    1e-3,         // device time [s]
    GYRO_SCALING, // gyro_x [rad/s]
    GYRO_SCALING,
    GYRO_SCALING,
    ACC_SCALING, // acc_x [m/s^2]
    ACC_SCALING,
    ACC_SCALING,
    1.0, // q_x, q_y, q_z, q_w
    1.0,
    1.0,
    1.0,
    1.0, // mag_x, mag_y, mag_z
    1.0,
    1.0,
];

/// Applies [`SCALING_FACTORS`]; columns past the table are left as they are.
pub fn scale_row(row: &[f64]) -> Row {
    row.iter()
        .enumerate()
        .map(|(i, v)| v * SCALING_FACTORS.get(i).copied().unwrap_or(1.0))
        .collect()
}

/// Fixed-length, oldest-evicted buffers of scaled rows, one per device.
#[derive(Debug, Clone)]
pub struct RollingBuffers {
    inner: Arc<Mutex<HashMap<String, VecDeque<Row>>>>,
    capacity: usize,
}

impl RollingBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Creates (or empties) the buffer of `device`.
    pub fn register(&self, device: &str) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.to_string(), VecDeque::with_capacity(self.capacity));
    }

    /// Appends rows, evicting the oldest ones. Returns `false` if `device` has no buffer.
    pub fn push(&self, device: &str, rows: impl IntoIterator<Item = Row>) -> bool {
        let mut buffers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(buffer) = buffers.get_mut(device) else {
            return false;
        };
        for row in rows {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(row);
        }
        true
    }

    pub fn snapshot(&self, device: &str) -> Vec<Row> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no devices selected")]
    NoDevicesSelected,
    #[error("too many devices selected for recording: {selected}, max connections allowed: {max}")]
    TooManyDevices { selected: usize, max: usize },
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("acquisition engine failed: {0}")]
    Engine(String),
}

struct Session {
    halt: CancellationToken,
    engine: thread::JoinHandle<()>,
}

/// Everything the engine thread needs for one session.
struct EngineParts {
    config: Arc<Configuration>,
    radio: Arc<dyn Radio>,
    registry: Arc<DeviceRegistry>,
    selection: BTreeSet<String>,
    buffers: RollingBuffers,
    events: Option<EventSender>,
    halt: CancellationToken,
    session_start: DateTime<Local>,
    log: Logger,
}

/// Starts and stops acquisition sessions over a shared device registry.
pub struct Stream {
    config: Arc<Configuration>,
    radio: Arc<dyn Radio>,
    registry: Arc<DeviceRegistry>,
    buffers: RollingBuffers,
    events: Option<EventSender>,
    log: Logger,
    session: Option<Session>,
}

impl Stream {
    pub fn new(
        config: Arc<Configuration>,
        radio: Arc<dyn Radio>,
        registry: Arc<DeviceRegistry>,
        events: Option<EventSender>,
        log: Logger,
    ) -> Self {
        let buffers = RollingBuffers::new(config.buffer_size);
        Self {
            config,
            radio,
            registry,
            buffers,
            events,
            log,
            session: None,
        }
    }

    /// Shared view of the per-device rolling buffers.
    pub fn buffers(&self) -> RollingBuffers {
        self.buffers.clone()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Halt signal of the running session.
    pub fn halt_token(&self) -> Option<CancellationToken> {
        self.session.as_ref().map(|s| s.halt.clone())
    }

    /// Starts recording from `devices` on a dedicated engine thread.
    pub fn start(&mut self, devices: &[SeenDevice]) -> Result<(), SessionError> {
        if self.session.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        if devices.is_empty() {
            return Err(SessionError::NoDevicesSelected);
        }
        let max = self.config.max_active_connections;
        if devices.len() > max {
            return Err(SessionError::TooManyDevices {
                selected: devices.len(),
                max,
            });
        }

        self.log.info("Setting up IMU data stream");
        for device in devices {
            self.buffers.register(device.display_id());
            self.log
                .info(format_args!("Added device to stream: {}", device.display_id()));
        }

        let halt = CancellationToken::new();
        let started = Local::now();
        let parts = EngineParts {
            config: self.config.clone(),
            radio: self.radio.clone(),
            registry: self.registry.clone(),
            selection: devices.iter().map(|d| d.address.clone()).collect(),
            buffers: self.buffers.clone(),
            events: self.events.clone(),
            halt: halt.clone(),
            session_start: started,
            log: self.log.clone(),
        };

        let engine_log = self.log.clone();
        let engine_halt = halt.clone();
        let engine = thread::Builder::new()
            .name("acquisition-engine".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build();
                match runtime {
                    Ok(runtime) => runtime.block_on(run_engine(parts)),
                    Err(e) => {
                        engine_log.error(format_args!("Failed to create engine runtime: {}", e));
                        engine_halt.cancel();
                    }
                }
            })
            .map_err(|e| SessionError::Engine(e.to_string()))?;

        self.session = Some(Session { halt, engine });
        Ok(())
    }

    /// Raises halt and blocks until the session has wound down and every file is closed.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session.halt.cancel();
        session
            .engine
            .join()
            .map_err(|_| SessionError::Engine("engine thread panicked".to_string()))?;
        self.log.info("IMU data stream stopped");
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            self.log.error(e);
        }
    }
}

/// Runs one session until halt, then until every component has drained.
async fn run_engine(parts: EngineParts) {
    let EngineParts {
        config,
        radio,
        registry,
        selection,
        buffers,
        events,
        halt,
        session_start,
        log,
    } = parts;

    let (intake_tx, intake_rx) = intake_channel(config.intake_queue_capacity);
    let mut fanout = Fanout::new(intake_rx, halt.clone(), log.scoped("fanout"));
    if config.output_csv {
        log.info("Streaming data to CSV");
        fanout.add_consumer(Arc::new(CsvSink::new(
            &config,
            session_start,
            halt.clone(),
            log.scoped("csv"),
        )));
    }

    let on_data = live_callback(buffers, events.clone(), log.scoped("stream"));
    let ctx = ConnectionContext::new(
        config,
        radio,
        halt,
        intake_tx,
        Some(on_data),
        log.scoped("connection"),
    );
    let supervisor = ConnectionSupervisor::new(ctx, registry, Some(selection), events);

    // Both halves end only after halt; neither outlives the other.
    tokio::join!(supervisor.run(), fanout.run());
}

/// Scales live samples into the rolling buffers and announces them.
fn live_callback(buffers: RollingBuffers, events: Option<EventSender>, log: Logger) -> LiveCallback {
    Arc::new(move |sample: &DecodedSample| {
        let rows = sample.rows.iter().map(|row| scale_row(row));
        if !buffers.push(&sample.display_name, rows) {
            log.warn(format_args!(
                "No buffer initialized for device {} ({})",
                sample.display_name, sample.address
            ));
            return;
        }
        if let Some(events) = &events {
            let _ = events.send(StreamEvent::NewData {
                device: sample.display_name.clone(),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_DATA_CHAR;
    use crate::core::bluetooth::mock::MockRadio;
    use crate::core::bluetooth::transport::Advertisement;
    use std::time::Duration;
    use tokio::time::{Instant, timeout};

    const TRACKER: &str = "FB:4A:66:AC:08:01";

    fn imu_payload(ts: u32, gyro_x: i16, acc_x: i16) -> Vec<u8> {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&ts.to_le_bytes());
        for v in [gyro_x, 0, 0, acc_x, 0, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn scaling_converts_counts_to_physical_units() {
        let mut row = vec![0.0; 15];
        row[0] = 12.5;
        row[1] = 2500.0;
        row[2] = 32768.0;
        row[5] = 32768.0;
        row[8] = 0.5;
        let scaled = scale_row(&row);
        assert_eq!(scaled[0], 12.5);
        assert!((scaled[1] - 2.5).abs() < 1e-12);
        assert!((scaled[2] - 1.13 * std::f64::consts::PI / 180.0 * 1000.0).abs() < 1e-9);
        assert!((scaled[5] - 9.81 * 4.0).abs() < 1e-9);
        assert_eq!(scaled[8], 0.5);
    }

    #[test]
    fn rolling_buffer_evicts_oldest() {
        let buffers = RollingBuffers::new(3);
        buffers.register("A");
        assert!(buffers.push("A", (0..5).map(|i| vec![i as f64])));
        assert_eq!(buffers.snapshot("A"), vec![vec![2.0], vec![3.0], vec![4.0]]);
        assert!(!buffers.push("B", vec![vec![1.0]]));
        assert!(buffers.snapshot("B").is_empty());
    }

    fn stream_over(radio: Arc<MockRadio>, folder: &std::path::Path) -> (Stream, EventReceiver) {
        let mut config = Configuration::default();
        config.output_folder = folder.to_path_buf();
        config.max_active_connections = 2;
        let config = Arc::new(config.validated().unwrap());
        let registry = Arc::new(DeviceRegistry::new(&config).unwrap());
        registry.apply_tick(
            &[Advertisement {
                address: TRACKER.to_string(),
                name: Some("SmartVNS".to_string()),
                rssi: Some(-55),
            }],
            Instant::now(),
        );
        let (events_tx, events_rx) = event_channel();
        let stream = Stream::new(config, radio, registry, Some(events_tx), Logger::new("test"));
        (stream, events_rx)
    }

    #[test]
    fn selection_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, _events) = stream_over(MockRadio::new(), dir.path());
        assert!(matches!(stream.start(&[]), Err(SessionError::NoDevicesSelected)));

        let device = SeenDevice {
            address: TRACKER.to_string(),
            alias: None,
            name: None,
            liveness: crate::core::bluetooth::registry::Liveness::RecentlySeen,
            last_seen: Instant::now(),
            rssi: None,
        };
        let too_many = vec![device.clone(), device.clone(), device];
        assert!(matches!(
            stream.start(&too_many),
            Err(SessionError::TooManyDevices { selected: 3, max: 2 })
        ));
        assert!(!stream.is_running());
    }

    async fn next_event(events: &mut EventReceiver, wanted: impl Fn(&StreamEvent) -> bool) {
        loop {
            let event = timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if wanted(&event) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn session_records_to_csv_and_restart_uses_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let radio = MockRadio::new();
        let tracker = radio.add_device(TRACKER, Some("SmartVNS"), Some(-55));
        let (mut stream, mut events) = stream_over(radio.clone(), dir.path());
        let devices = stream.registry.recently_seen();

        for session in 0..2u32 {
            stream.start(&devices).unwrap();
            assert!(matches!(stream.start(&devices), Err(SessionError::AlreadyRunning)));
            next_event(&mut events, |e| {
                matches!(e, StreamEvent::ConnectState { device, connected: true } if device == "SmartVNS0")
            })
            .await;
            assert!(tracker.is_subscribed(UUID_DATA_CHAR));

            for ts in 0..3 {
                tracker.notify(UUID_DATA_CHAR, imu_payload(session * 100 + ts, 100, -200));
            }
            for _ in 0..3 {
                next_event(&mut events, |e| {
                    matches!(e, StreamEvent::NewData { device } if device == "SmartVNS0")
                })
                .await;
            }
            stream.stop().unwrap();
            assert!(!stream.is_running());
        }

        let buffered = stream.buffers().snapshot("SmartVNS0");
        assert_eq!(buffered.len(), 3);
        assert!((buffered[0][1] - 0.1).abs() < 1e-12);
        assert!((buffered[0][2] - 100.0 * GYRO_SCALING).abs() < 1e-12);
        assert!((buffered[0][5] + 200.0 * ACC_SCALING).abs() < 1e-12);

        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files.len(), 2);
        for file in &files {
            assert!(file.starts_with("SmartVNS0_"));
            assert!(file.ends_with("_data.csv") || file.ends_with("_data_1.csv"));
            let content = std::fs::read_to_string(dir.path().join(file)).unwrap();
            let lines: Vec<&str> = content.lines().collect();
            assert_eq!(lines.len(), 4);
            assert!(lines[0].starts_with("sys_time,timestamp,"));
            // Files hold raw counts; scaling only applies to the live buffers.
            assert!(lines[1].contains(",100,0,0,-200,0,0,"));
        }
    }
}
