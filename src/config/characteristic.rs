use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::decoder::DecoderKind;

/// A subscribable data channel on a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicConfig {
    /// Used in log lines and in the CSV file name, so it has to be unique.
    pub name: String,
    pub uuid: Uuid,
    /// Maximum silence before the connection is presumed dead. `None` disables the check.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    pub decoder: DecoderKind,
    /// CSV header row; its length must match what the decoder emits.
    pub columns: Vec<String>,
}

impl CharacteristicConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }
}

/// A one-shot write issued right after connecting, before subscribing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlWrite {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}
