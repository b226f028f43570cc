//! Constants used throughout the application
//! This module contains the tracker-specific identifiers and the fixed timing
//! values of the acquisition engine.

use std::time::Duration;

use uuid::Uuid;

/// Advertised-name pattern of the motion trackers
pub const DEFAULT_NAME_PATTERN: &str = "SmartVNS$";

/// Known trackers and their nicknames
pub const DEFAULT_DEVICE_ALIASES: [(&str, &str); 10] = [
    ("FB:4A:66:AC:08:01", "SmartVNS0"),
    ("C2:4D:BE:83:07:01", "SmartVNS1"),
    ("FB:D8:39:2A:59:09", "SmartVNS2"),
    ("C0:59:1E:36:C4:B2", "SmartVNS3"),
    ("E6:D8:E2:62:1C:8C", "SmartVNS4"),
    ("CC:E8:96:1F:54:5C", "SmartVNS5"),
    ("DE:F7:3D:30:68:DA", "SmartVNS6"),
    ("CF:79:18:65:C2:D9", "SmartVNS7"),
    ("E8:35:69:09:DC:C2", "SmartVNS8"),
    ("E2:07:E6:57:16:27", "SmartVNS9"),
];

/// The sensor data notification characteristic
pub const UUID_DATA_CHAR: Uuid = Uuid::from_u128(0xce60014d_ae91_11e1_4495_9fc5dd4aff08);

/// The control characteristic the configuration commands are written to
pub const UUID_CONTROL_CHAR: Uuid = Uuid::from_u128(0xce60014d_ae91_11e1_4496_9fc5dd4aff01);

pub const DATA_CHARACTERISTIC_NAME: &str = "data";

/// Column layout of the multiplexed motion characteristic
pub const MOTION_COLUMNS: [&str; 15] = [
    "sys_time", "timestamp", "gyro_x", "gyro_y", "gyro_z", "acc_x", "acc_y", "acc_z", "q_x",
    "q_y", "q_z", "q_w", "mag_x", "mag_y", "mag_z",
];

/// IMU configuration command
pub const IMU_CONFIG_COMMAND: [u8; 12] = [
    0x08, 0x0b, 0x2a, 0x08, 0x0a, 0x06, 0x10, 0x04, 0x18, 0x02, 0x20, 0x78,
];

/// Magnetometer configuration command
pub const MAG_CONFIG_COMMAND: [u8; 8] = [0x08, 0x0c, 0x2a, 0x04, 0x12, 0x02, 0x08, 0x0a];

/// Interval between liveness checks of a connected device
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Deadline for a transport disconnect
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
