//! Scripted in-memory radio
//! Every peripheral is controlled through a [`MockPeripheral`] handle: tests decide
//! whether connecting succeeds, push notification payloads, and drop links as if
//! the peer went away.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::core::bluetooth::transport::{
    Advertisement, Link, NotificationStream, Radio, TransportError,
};

/// How a peripheral reacts to `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehaviour {
    Succeed,
    Refuse,
    /// Never completes; only the connect timeout or halt ends the attempt.
    Hang,
    /// Panics inside the radio stack.
    Panic,
}

#[derive(Debug)]
struct PeripheralState {
    advertisement: Advertisement,
    advertising: bool,
    behaviour: ConnectBehaviour,
    connected: bool,
    connects: usize,
    disconnects: usize,
    writes: Vec<(Uuid, Vec<u8>)>,
    stall_writes: bool,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    peer_gone: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone)]
pub struct MockPeripheral {
    state: Arc<Mutex<PeripheralState>>,
}

impl MockPeripheral {
    fn lock(&self) -> MutexGuard<'_, PeripheralState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behaviour(&self, behaviour: ConnectBehaviour) {
        self.lock().behaviour = behaviour;
    }

    /// Makes every following write hang without completing.
    pub fn stall_writes(&self, stall: bool) {
        self.lock().stall_writes = stall;
    }

    /// Stops (or resumes) showing up in discovery results.
    pub fn set_advertising(&self, advertising: bool) {
        self.lock().advertising = advertising;
    }

    /// Delivers a payload to the subscriber of `characteristic`, if any.
    pub fn notify(&self, characteristic: Uuid, payload: Vec<u8>) -> bool {
        self.lock()
            .subscribers
            .get(&characteristic)
            .is_some_and(|tx| tx.send(payload).is_ok())
    }

    /// Simulates the peer dropping the link.
    pub fn drop_link(&self) -> bool {
        let mut state = self.lock();
        state.connected = false;
        state.subscribers.clear();
        state
            .peer_gone
            .take()
            .is_some_and(|tx| tx.send(()).is_ok())
    }

    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        self.lock().subscribers.contains_key(&characteristic)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }
}

#[derive(Debug, Default)]
pub struct MockRadio {
    peripherals: Mutex<BTreeMap<String, MockPeripheral>>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an advertising peripheral that accepts connections.
    pub fn add_device(&self, address: &str, name: Option<&str>, rssi: Option<i16>) -> MockPeripheral {
        let peripheral = MockPeripheral {
            state: Arc::new(Mutex::new(PeripheralState {
                advertisement: Advertisement {
                    address: address.to_string(),
                    name: name.map(str::to_string),
                    rssi,
                },
                advertising: true,
                behaviour: ConnectBehaviour::Succeed,
                connected: false,
                connects: 0,
                disconnects: 0,
                writes: Vec::new(),
                stall_writes: false,
                subscribers: HashMap::new(),
                peer_gone: None,
            })),
        };
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), peripheral.clone());
        peripheral
    }

    pub fn peripheral(&self, address: &str) -> Option<MockPeripheral> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn discover(&self, _timeout: Duration) -> Result<Vec<Advertisement>, TransportError> {
        Ok(self
            .peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|p| {
                let state = p.lock();
                state.advertising.then(|| state.advertisement.clone())
            })
            .collect())
    }

    async fn open(&self, address: &str) -> Result<Box<dyn Link>, TransportError> {
        let peripheral = self
            .peripheral(address)
            .ok_or_else(|| TransportError::NotFound(address.to_string()))?;
        Ok(Box::new(MockLink { peripheral }))
    }
}

struct MockLink {
    peripheral: MockPeripheral,
}

#[async_trait]
impl Link for MockLink {
    async fn connect(&self) -> Result<(), TransportError> {
        let behaviour = {
            let mut state = self.peripheral.lock();
            state.connects += 1;
            state.behaviour
        };
        match behaviour {
            ConnectBehaviour::Succeed => {
                self.peripheral.lock().connected = true;
                Ok(())
            }
            ConnectBehaviour::Refuse => Err(TransportError::Radio("connection refused".to_string())),
            ConnectBehaviour::Hang => std::future::pending().await,
            ConnectBehaviour::Panic => panic!("radio stack crashed while connecting"),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.peripheral.lock();
        state.connected = false;
        state.disconnects += 1;
        state.subscribers.clear();
        state.peer_gone = None;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let stalled = {
            let mut state = self.peripheral.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if !state.stall_writes {
                state.writes.push((characteristic, data.to_vec()));
            }
            state.stall_writes
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.peripheral.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.subscribers.insert(characteristic, tx);
        }
        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }

    async fn watch_disconnect(&self) -> Result<oneshot::Receiver<()>, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.peripheral.lock().peer_gone = Some(tx);
        Ok(rx)
    }
}
