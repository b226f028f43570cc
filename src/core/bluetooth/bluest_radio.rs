//! `bluest` backend for the radio abstraction
//! Discovered `Device` handles are cached by canonical address so that a later
//! `open` can hand out a link without scanning again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Uuid};
use futures_util::StreamExt;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::normalise_address;
use crate::core::bluetooth::transport::{
    Advertisement, Link, NotificationStream, Radio, TransportError,
};
use crate::logging::Logger;

impl From<bluest::Error> for TransportError {
    fn from(e: bluest::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => TransportError::NotFound(e.to_string()),
            ErrorKind::Timeout => TransportError::Timeout,
            ErrorKind::NotConnected => TransportError::NotConnected,
            _ => TransportError::Radio(e.to_string()),
        }
    }
}

pub struct BluestRadio {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    mac_pattern: Regex,
    log: Logger,
}

impl BluestRadio {
    /// Opens the default adapter and waits until it is powered.
    pub async fn new(log: Logger) -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        adapter.wait_available().await?;
        log.info("Bluetooth adapter is available.");

        let mac_pattern = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})")
            .map_err(|e| TransportError::Radio(e.to_string()))?;

        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            mac_pattern,
            log,
        })
    }

    /// Platform device ids embed the MAC address on Linux and Windows; macOS only
    /// hands out opaque ids, which are used as-is.
    fn address_of(&self, device: &Device) -> String {
        let id = device.id().to_string();
        let address = self
            .mac_pattern
            .find_iter(&id)
            .last()
            .map(|m| m.as_str().replace('-', ":"))
            .unwrap_or(id);
        normalise_address(&address)
    }
}

#[async_trait]
impl Radio for BluestRadio {
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, TransportError> {
        let mut found: HashMap<String, Advertisement> = HashMap::new();
        let mut scan_stream = self.adapter.scan(&[]).await?;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            let address = self.address_of(&device);
                            let name = discovered
                                .adv_data
                                .local_name
                                .clone()
                                .or_else(|| device.name().ok());
                            self.log.debug(format_args!(
                                "Found device - Address: {}, Name: {:?}, RSSI: {:?}",
                                address, name, discovered.rssi
                            ));
                            found.insert(
                                address.clone(),
                                Advertisement {
                                    address: address.clone(),
                                    name,
                                    rssi: discovered.rssi,
                                },
                            );
                            self.devices
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(address, device);
                        }
                        None => {
                            self.log.info("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = &mut deadline => break,
            }
        }

        Ok(found.into_values().collect())
    }

    async fn open(&self, address: &str) -> Result<Box<dyn Link>, TransportError> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(address.to_string()))?;

        Ok(Box::new(BluestLink {
            adapter: self.adapter.clone(),
            device,
            characteristics: tokio::sync::Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            log: self.log.clone(),
        }))
    }
}

pub struct BluestLink {
    adapter: Adapter,
    device: Device,
    characteristics: tokio::sync::Mutex<HashMap<Uuid, Characteristic>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    log: Logger,
}

impl BluestLink {
    async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.characteristics
            .lock()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::UnknownCharacteristic(uuid))
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

#[async_trait]
impl Link for BluestLink {
    async fn connect(&self) -> Result<(), TransportError> {
        let id = self.device.id().to_string();
        if !self.device.is_connected().await {
            self.log.info(format_args!("Initiating connection to {}...", id));
            self.adapter.connect_device(&self.device).await?;
        }

        self.log.debug("Connection successful, discovering services...");
        let mut characteristics = self.characteristics.lock().await;
        characteristics.clear();
        for service in self.device.services().await? {
            for char in service.characteristics().await? {
                characteristics.insert(char.uuid(), char);
            }
        }
        self.log.debug(format_args!(
            "Discovered {} characteristics on {}",
            characteristics.len(),
            id
        ));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }

        if self.device.is_connected().await {
            self.log.info(format_args!("Disconnecting from device {}", self.device.id()));
            self.adapter.disconnect_device(&self.device).await?;
        } else {
            self.log.debug(format_args!("Device {} not connected", self.device.id()));
        }
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let char = self.characteristic(characteristic).await?;
        self.log.debug(format_args!("Writing {:02x?} to {}", data, characteristic));
        char.write(data).await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let char = self.characteristic(characteristic).await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let log = self.log.clone();

        let handle = tokio::spawn(async move {
            match char.notify().await {
                Ok(mut notification_stream) => {
                    let _ = ready_tx.send(Ok(()));
                    while let Some(result) = notification_stream.next().await {
                        match result {
                            Ok(value) => {
                                if tx.send(value).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log.error(format_args!("Error in notification stream: {}", e));
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(TransportError::from(e)));
                }
            }
            log.debug(format_args!("Notification stream for {} ended", characteristic));
        });
        self.track(handle);

        ready_rx
            .await
            .map_err(|_| TransportError::Radio("notification task ended early".to_string()))??;

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }

    async fn watch_disconnect(&self) -> Result<oneshot::Receiver<()>, TransportError> {
        let adapter = self.adapter.clone();
        let device = self.device.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            match adapter.device_connection_events(&device).await {
                Ok(mut events) => {
                    let _ = ready_tx.send(Ok(()));
                    while let Some(event) = events.next().await {
                        if matches!(event, ConnectionEvent::Disconnected) {
                            let _ = tx.send(());
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(TransportError::from(e)));
                }
            }
        });
        self.track(handle);

        ready_rx
            .await
            .map_err(|_| TransportError::Radio("connection watcher ended early".to_string()))??;
        Ok(rx)
    }
}
