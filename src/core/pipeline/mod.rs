//! Sample pipeline
//! Connections push decoded samples onto one bounded intake queue; the fan-out
//! copies each sample into the private queue of every registered consumer.

pub mod consumer;
pub mod csv_sink;
pub mod fanout;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::CharacteristicConfig;
use crate::core::decoder::Row;

pub use consumer::{Consumer, ConsumerQueue};
pub use csv_sink::CsvSink;
pub use fanout::Fanout;

/// One decoded notification batch from one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub address: String,
    pub display_name: String,
    pub characteristic: Arc<CharacteristicConfig>,
    pub rows: Vec<Row>,
}

pub type IntakeSender = mpsc::Sender<Arc<DecodedSample>>;
pub type IntakeReceiver = mpsc::Receiver<Arc<DecodedSample>>;

/// Creates the shared queue between connections and the fan-out.
pub fn intake_channel(capacity: usize) -> (IntakeSender, IntakeReceiver) {
    mpsc::channel(capacity)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Configuration;

    pub fn sample(address: &str, display_name: &str, device_time: f64) -> Arc<DecodedSample> {
        let characteristic = Configuration::default().characteristics.remove(0);
        let mut row = vec![0.0; characteristic.columns.len()];
        row[0] = 1_700_000_000.5;
        row[1] = device_time;
        Arc::new(DecodedSample {
            address: address.to_string(),
            display_name: display_name.to_string(),
            characteristic: Arc::new(characteristic),
            rows: vec![row],
        })
    }
}
