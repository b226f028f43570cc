use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::core::bluetooth::registry::{DeviceRegistry, SeenDevice};
use crate::core::bluetooth::transport::{Radio, TransportError};
use crate::logging::Logger;

/// Bounded discovery loop feeding the device registry.
pub struct BluetoothScanner {
    radio: Arc<dyn Radio>,
    registry: Arc<DeviceRegistry>,
    scan_duration: Duration,
    scan_timeout: Duration,
    scan_cooldown: Duration,
    halt: CancellationToken,
    log: Logger,
}

impl BluetoothScanner {
    pub fn new(
        config: &Configuration,
        radio: Arc<dyn Radio>,
        registry: Arc<DeviceRegistry>,
        halt: CancellationToken,
        log: Logger,
    ) -> Self {
        Self {
            radio,
            registry,
            scan_duration: config.scan_duration(),
            scan_timeout: config.scan_timeout(),
            scan_cooldown: config.scan_cooldown(),
            halt,
            log,
        }
    }

    /// Runs discovery ticks for the configured scan duration and returns the recently
    /// seen devices ordered by display id.
    pub async fn scan_for_devices(&self) -> Vec<SeenDevice> {
        self.log.info("Scanning nearby motion trackers...");
        self.run().await;

        let scanned = self.registry.recently_seen();
        let listing: Vec<String> = scanned
            .iter()
            .map(|d| format!("{}({})", d.display_id(), d.address))
            .collect();
        self.log
            .info(format_args!("Scanned motion trackers: {:?}", listing));
        scanned
    }

    async fn run(&self) {
        let started = Instant::now();
        while !self.halt.is_cancelled() && started.elapsed() < self.scan_duration {
            // The radio's own timeout governs a healthy scan; this one catches a stuck stack.
            let deadline = self.scan_timeout.saturating_add(self.scan_timeout);
            let result = tokio::select! {
                _ = self.halt.cancelled() => break,
                result = timeout(deadline, self.radio.discover(self.scan_timeout)) => result,
            };

            match result {
                Ok(Ok(sightings)) => {
                    let changes = self.registry.apply_tick(&sightings, Instant::now());
                    for address in &changes.discovered {
                        if let Some(dev) = self.registry.get(address) {
                            self.log.info(format_args!(
                                "New device found: {}({})",
                                dev.display_id(),
                                dev.address
                            ));
                        }
                    }
                    for address in &changes.expired {
                        self.log
                            .debug(format_args!("Device {} has not been seen recently", address));
                    }
                }
                Ok(Err(TransportError::Timeout)) | Err(_) => {
                    self.log.warn("Scanner timed out");
                }
                Ok(Err(e)) => {
                    self.log
                        .warn(format_args!("Scanner did not complete scan: {}", e));
                    break;
                }
            }

            tokio::select! {
                _ = self.halt.cancelled() => break,
                _ = sleep(self.scan_cooldown) => {}
            }
        }
    }
}
