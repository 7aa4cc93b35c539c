// High-level servo API on top of the Dynamixel bus
//
// The diagnostic only talks to this trait, so any bus (or a scripted
// fake in tests) that can ping and read/write named items plugs in.

use super::dynamixel::{item, BusPort, DynamixelBus, DynamixelError};
use crate::config::{POSITION_MAX, POSITION_MIN};

/// Call surface of a servo bus
pub trait ServoBus {
    /// Ping a motor, returning its model number
    fn ping(&mut self, id: u8) -> Result<u16, DynamixelError>;

    /// Read a control table item by name
    fn item_read(&mut self, id: u8, item: &str) -> Result<i32, DynamixelError>;

    /// Write a control table item by name
    fn item_write(&mut self, id: u8, item: &str, value: i32) -> Result<(), DynamixelError>;

    fn torque_on(&mut self, id: u8) -> Result<(), DynamixelError> {
        self.item_write(id, item::TORQUE_ENABLE, 1)
    }

    fn torque_off(&mut self, id: u8) -> Result<(), DynamixelError> {
        self.item_write(id, item::TORQUE_ENABLE, 0)
    }

    fn led_on(&mut self, id: u8) -> Result<(), DynamixelError> {
        self.item_write(id, item::LED, 1)
    }

    /// Command a goal position (torque must be on for the motor to move)
    fn goal_position(&mut self, id: u8, goal: i32) -> Result<(), DynamixelError> {
        if !(POSITION_MIN..=POSITION_MAX).contains(&goal) {
            return Err(DynamixelError::OutOfRange {
                name: item::GOAL_POSITION.to_string(),
                value: goal,
                min: POSITION_MIN,
                max: POSITION_MAX,
            });
        }
        self.item_write(id, item::GOAL_POSITION, goal)
    }
}

impl<P: BusPort> ServoBus for DynamixelBus<P> {
    fn ping(&mut self, id: u8) -> Result<u16, DynamixelError> {
        DynamixelBus::ping(self, id)
    }

    fn item_read(&mut self, id: u8, item: &str) -> Result<i32, DynamixelError> {
        DynamixelBus::item_read(self, id, item)
    }

    fn item_write(&mut self, id: u8, item: &str, value: i32) -> Result<(), DynamixelError> {
        DynamixelBus::item_write(self, id, item, value)
    }
}
