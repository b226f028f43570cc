//! Bluetooth functionality for the motion-tracker recorder
//! This module handles discovery, the per-device connection attempts and the
//! supervisor that keeps the selected trackers connected.

pub mod bluest_radio;
pub mod connection;
pub mod constants;
#[cfg(any(test, feature = "mock-radio"))]
pub mod mock;
pub mod registry;
pub mod scanner;
pub mod supervisor;
pub mod transport;

// Re-export types that should be publicly accessible
pub use bluest_radio::BluestRadio;
pub use connection::{AttemptHandle, Connection, ConnectionContext, ConnectionState};
pub use constants::*; // Re-export all constants
pub use registry::{DeviceRegistry, Liveness, SeenDevice};
pub use scanner::BluetoothScanner;
pub use supervisor::ConnectionSupervisor;
pub use transport::{Advertisement, Link, Radio, TransportError};
