// Serial defaults, motor id, and diagnostic targets
use std::time::Duration;

// Serial port the U2D2 / USB2Dynamixel adapter shows up on
pub const DEVICE_NAME: &str = "/dev/ttyUSB0";

// Factory baudrate for X-series servos
pub const BAUDRATE: u32 = 57_600;

// Per-read timeout on the serial port
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

// Motor under test
pub const MOTOR_ID: u8 = 1;

// Position range for XL430 in position mode (raw ticks, 4096 per revolution)
pub const POSITION_MIN: i32 = 0;
pub const POSITION_MAX: i32 = 4095;

// Centre of the range
pub const GOAL_POSITION: i32 = 2048;

// How long to let the horn move before reading back
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Runtime parameters for one diagnostic run
#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    pub device: String,
    pub baudrate: u32,
    pub id: u8,
    pub goal: i32,
    pub settle: Duration,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            device: DEVICE_NAME.to_string(),
            baudrate: BAUDRATE,
            id: MOTOR_ID,
            goal: GOAL_POSITION,
            settle: SETTLE_DELAY,
        }
    }
}
