// Dynamixel Protocol 2.0 serial implementation
//
// Instruction packet: [0xFF, 0xFF, 0xFD, 0x00, ID, LEN_L, LEN_H, Instruction, Params..., CRC_L, CRC_H]
// Status packet:      [0xFF, 0xFF, 0xFD, 0x00, ID, LEN_L, LEN_H, 0x55, Error, Params..., CRC_L, CRC_H]
// LEN counts instruction + params + CRC after byte stuffing.

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use tracing::{debug, warn};

use crate::config::READ_TIMEOUT;

/// Packet header bytes (0x00 is reserved)
const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// Byte sequence that must be stuffed inside instruction + params
const STUFF_PATTERN: [u8; 3] = [0xFF, 0xFF, 0xFD];
const STUFF_BYTE: u8 = 0xFD;

/// Bit 7 of the status error byte: hardware error latched, packet still valid
const HARDWARE_ALERT: u8 = 0x80;

/// Instruction set (subset used here)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    Status = 0x55,
}

/// Control table item names, as the vendor tooling spells them
pub mod item {
    pub const MODEL_NUMBER: &str = "Model_Number";
    pub const MAX_POSITION_LIMIT: &str = "Max_Position_Limit";
    pub const MIN_POSITION_LIMIT: &str = "Min_Position_Limit";
    pub const TORQUE_ENABLE: &str = "Torque_Enable";
    pub const LED: &str = "LED";
    pub const GOAL_POSITION: &str = "Goal_Position";
    pub const PRESENT_POSITION: &str = "Present_Position";
}

/// One entry of the control table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlItem {
    pub name: &'static str,
    pub address: u16,
    pub size: u8,
    pub writable: bool,
}

const fn rw(name: &'static str, address: u16, size: u8) -> ControlItem {
    ControlItem { name, address, size, writable: true }
}

const fn ro(name: &'static str, address: u16, size: u8) -> ControlItem {
    ControlItem { name, address, size, writable: false }
}

/// XL430 control table
pub const CONTROL_TABLE: &[ControlItem] = &[
    // EEPROM area (only writable with torque off)
    ro(item::MODEL_NUMBER, 0, 2),
    ro("Firmware_Version", 6, 1),
    rw("ID", 7, 1),
    rw("Baud_Rate", 8, 1),
    rw("Operating_Mode", 11, 1),
    rw(item::MAX_POSITION_LIMIT, 48, 4),
    rw(item::MIN_POSITION_LIMIT, 52, 4),
    // RAM area
    rw(item::TORQUE_ENABLE, 64, 1),
    rw(item::LED, 65, 1),
    ro("Hardware_Error_Status", 70, 1),
    rw(item::GOAL_POSITION, 116, 4),
    ro("Moving", 122, 1),
    ro(item::PRESENT_POSITION, 132, 4),
    ro("Present_Input_Voltage", 144, 2),
    ro("Present_Temperature", 146, 1),
];

/// Look up a control table item by name
pub fn find_item(name: &str) -> Option<&'static ControlItem> {
    CONTROL_TABLE.iter().find(|item| item.name == name)
}

/// Human-readable name for a model number returned by ping
pub fn model_name(model: u16) -> &'static str {
    match model {
        1000 => "XH430-W350",
        1010 => "XH430-W210",
        1020 => "XM430-W350",
        1030 => "XM430-W210",
        1060 => "XL430-W250",
        1070 => "XC430-W150",
        1080 => "XC430-W240",
        1090 => "2XL430-W250",
        1190 => "XL330-M077",
        1200 => "XL330-M288",
        _ => "unknown model",
    }
}

/// Error number carried in bits 0-6 of the status error byte
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum StatusError {
    #[error("result fail")]
    ResultFail,
    #[error("instruction error")]
    Instruction,
    #[error("CRC error")]
    Crc,
    #[error("data range error")]
    DataRange,
    #[error("data length error")]
    DataLength,
    #[error("data limit error")]
    DataLimit,
    #[error("access error")]
    Access,
    #[error("unknown error 0x{0:02X}")]
    Unknown(u8),
}

impl StatusError {
    fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::ResultFail,
            0x02 => Self::Instruction,
            0x03 => Self::Crc,
            0x04 => Self::DataRange,
            0x05 => Self::DataLength,
            0x06 => Self::DataLimit,
            0x07 => Self::Access,
            other => Self::Unknown(other),
        }
    }
}

/// Error types for Dynamixel communication
#[derive(Debug, thiserror::Error)]
pub enum DynamixelError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("CRC mismatch for motor {id}: expected 0x{expected:04X}, got 0x{received:04X}")]
    CrcMismatch { id: u8, expected: u16, received: u16 },

    #[error("Motor {id} returned error status: {error}")]
    Status { id: u8, error: StatusError },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },

    #[error("Unknown control table item '{name}'")]
    UnknownItem { name: String },

    #[error("Control table item '{name}' is read-only")]
    ReadOnly { name: &'static str },

    #[error("Value {value} out of range for '{name}' ({min}..={max})")]
    OutOfRange {
        name: String,
        value: i32,
        min: i32,
        max: i32,
    },
}

pub type Result<T> = std::result::Result<T, DynamixelError>;

/// CRC-16 used by Protocol 2.0 (polynomial 0x8005, initial value 0, MSB first)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Insert 0xFD after every FF FF FD in instruction + params
fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 3);
    for &byte in body {
        out.push(byte);
        if out.ends_with(&STUFF_PATTERN) {
            out.push(STUFF_BYTE);
        }
    }
    out
}

/// Reverse of `stuff`
fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        out.push(byte);
        if out.ends_with(&STUFF_PATTERN) && bytes.peek() == Some(&STUFF_BYTE) {
            bytes.next();
        }
    }
    out
}

/// Little-endian encoding of `value` into an item of `size` bytes
fn encode_value(item: &ControlItem, value: i32) -> Result<Vec<u8>> {
    let (min, max) = match item.size {
        1 => (0, u8::MAX as i32),
        2 => (0, u16::MAX as i32),
        _ => (i32::MIN, i32::MAX),
    };
    if value < min || value > max {
        return Err(DynamixelError::OutOfRange {
            name: item.name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(value.to_le_bytes()[..item.size as usize].to_vec())
}

/// 1 and 2 byte items are unsigned, 4 byte items are signed
fn decode_value(data: &[u8]) -> i32 {
    match *data {
        [b0] => b0 as i32,
        [b0, b1] => u16::from_le_bytes([b0, b1]) as i32,
        [b0, b1, b2, b3, ..] => i32::from_le_bytes([b0, b1, b2, b3]),
        _ => 0,
    }
}

/// Byte stream the bus runs over
pub trait BusPort: Read + Write {
    /// Drop bytes received but not yet read (late replies to timed-out requests)
    fn discard_input(&mut self) -> io::Result<()>;
}

impl BusPort for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Dynamixel bus - handles serial communication with Protocol 2.0 servos
pub struct DynamixelBus<P = Box<dyn SerialPort>> {
    port: P,
}

/// Bus on a real serial port
pub type SerialBus = DynamixelBus<Box<dyn SerialPort>>;

impl SerialBus {
    /// Open the serial device at the given baudrate
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(READ_TIMEOUT)
            .open()?;
        debug!("Opened {} at {} baud", port_name, baudrate);
        Ok(Self { port })
    }
}

impl<P: BusPort> DynamixelBus<P> {
    /// Wrap an already opened port
    pub fn with_port(port: P) -> Self {
        Self { port }
    }

    /// Build an instruction packet with header, stuffing and CRC
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + params.len());
        body.push(instruction as u8);
        body.extend_from_slice(params);
        let body = stuff(&body);

        let length = (body.len() + 2) as u16; // body + CRC
        let mut packet = Vec::with_capacity(HEADER.len() + 3 + body.len() + 2);
        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.extend_from_slice(&length.to_le_bytes());
        packet.extend_from_slice(&body);

        let crc = crc16(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());
        packet
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.discard_input()?;
        debug!("TX {:02X?}", packet);
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], id: u8) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DynamixelError::Timeout { id },
            _ => DynamixelError::Io(e),
        })
    }

    /// Read a status packet and return its params (error byte stripped)
    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header, expected_id)?;
        if header != HEADER {
            return Err(DynamixelError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut id_length = [0u8; 3];
        self.read_exact(&mut id_length, expected_id)?;
        let id = id_length[0];
        let length = u16::from_le_bytes([id_length[1], id_length[2]]) as usize;

        if id != expected_id {
            return Err(DynamixelError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
            });
        }
        // Instruction + error + CRC at minimum
        if length < 4 {
            return Err(DynamixelError::InvalidResponse {
                id,
                reason: format!("Length field too short: {}", length),
            });
        }

        let mut remaining = vec![0u8; length];
        self.read_exact(&mut remaining, id)?;
        debug!("RX {:02X?} {:02X?} {:02X?}", header, id_length, remaining);

        let (body, crc_bytes) = remaining.split_at(length - 2);
        let mut crc_data = Vec::with_capacity(HEADER.len() + 3 + body.len());
        crc_data.extend_from_slice(&header);
        crc_data.extend_from_slice(&id_length);
        crc_data.extend_from_slice(body);
        let expected = crc16(&crc_data);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        if expected != received {
            return Err(DynamixelError::CrcMismatch { id, expected, received });
        }

        let body = unstuff(body);
        if body[0] != Instruction::Status as u8 {
            return Err(DynamixelError::InvalidResponse {
                id,
                reason: format!("Not a status packet: instruction 0x{:02X}", body[0]),
            });
        }

        let error = body[1];
        if error & HARDWARE_ALERT != 0 {
            warn!("Motor {} has a hardware alert set, check Hardware_Error_Status", id);
        }
        let code = error & !HARDWARE_ALERT;
        if code != 0 {
            return Err(DynamixelError::Status {
                id,
                error: StatusError::from_code(code),
            });
        }

        Ok(body[2..].to_vec())
    }

    /// Ping a motor, returning its model number
    pub fn ping(&mut self, id: u8) -> Result<u16> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        // model (2) + firmware version (1)
        let response = self.read_response(id)?;
        if response.len() < 3 {
            return Err(DynamixelError::InvalidResponse {
                id,
                reason: format!("Expected 3 ping bytes, got {}", response.len()),
            });
        }
        Ok(u16::from_le_bytes([response[0], response[1]]))
    }

    /// Read `length` raw bytes starting at `address`
    pub fn read(&mut self, id: u8, address: u16, length: u16) -> Result<Vec<u8>> {
        let [addr_lo, addr_hi] = address.to_le_bytes();
        let [len_lo, len_hi] = length.to_le_bytes();
        let packet = Self::build_packet(id, Instruction::Read, &[addr_lo, addr_hi, len_lo, len_hi]);
        self.send_packet(&packet)?;

        let response = self.read_response(id)?;
        if response.len() != length as usize {
            return Err(DynamixelError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", length, response.len()),
            });
        }
        Ok(response)
    }

    /// Write raw bytes starting at `address`
    pub fn write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(2 + data.len());
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(data);
        let packet = Self::build_packet(id, Instruction::Write, &params);
        self.send_packet(&packet)?;

        let _ = self.read_response(id)?;
        Ok(())
    }

    /// Read a control table item by name
    pub fn item_read(&mut self, id: u8, name: &str) -> Result<i32> {
        let item = find_item(name).ok_or_else(|| DynamixelError::UnknownItem {
            name: name.to_string(),
        })?;
        let data = self.read(id, item.address, item.size as u16)?;
        let value = decode_value(&data);
        debug!("Read motor {}: {}={}", id, item.name, value);
        Ok(value)
    }

    /// Write a control table item by name
    pub fn item_write(&mut self, id: u8, name: &str, value: i32) -> Result<()> {
        let item = find_item(name).ok_or_else(|| DynamixelError::UnknownItem {
            name: name.to_string(),
        })?;
        if !item.writable {
            return Err(DynamixelError::ReadOnly { name: item.name });
        }
        let data = encode_value(item, value)?;
        debug!("Write motor {}: {}={}", id, item.name, value);
        self.write(id, item.address, &data)
    }
}
