// Motor module for a single Dynamixel servo
//
// Provides:
// - Dynamixel Protocol 2.0 serial implementation
// - Name-addressed servo API used by the diagnostic

mod driver;
pub mod dynamixel;

pub use driver::ServoBus;
pub use dynamixel::{model_name, BusPort, DynamixelBus, DynamixelError, SerialBus};
