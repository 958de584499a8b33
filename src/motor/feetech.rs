// Feetech STS serial bus protocol
//
// Every wheel servo hangs off the same half-duplex serial line and is
// addressed by its bus id. Frame layout:
// [0xFF, 0xFF, id, length, opcode, params..., checksum]

use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

const SYNC: [u8; 2] = [0xFF, 0xFF];

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Opcode {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Control table addresses used by the runtime
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    OperatingMode = 33, // 0=position, 1=velocity
    TorqueEnable = 40,
    GoalVelocity = 46, // sign-magnitude
    Lock = 55,
    PresentVelocity = 58, // sign-magnitude, read-only
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed reply from servo {id}: {reason}")]
    Malformed { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    Checksum { id: u8 },

    #[error("Servo {id} reported status 0x{status:02X}")]
    Status { id: u8, status: u8 },

    #[error("No reply from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Shared serial line to the wheel servos
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self { port })
    }

    /// Ping a servo. `Ok(false)` means the line is fine but nobody answered.
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.transact(id, Opcode::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        debug!(id, ?register, value, "bus write u8");
        self.transact(id, Opcode::Write, &[register as u8, value])
            .map(|_| ())
    }

    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.transact(id, Opcode::Write, &[register as u8, lo, hi])
            .map(|_| ())
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let reply = self.transact(id, Opcode::Read, &[register as u8, 2])?;
        match reply.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(FeetechError::Malformed {
                id,
                reason: format!("expected 2 bytes, got {}", reply.len()),
            }),
        }
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, enabled as u8)?;
        self.write_u8(id, Register::Lock, enabled as u8)
    }

    /// Torque must be off while the mode changes
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write_u8(id, Register::OperatingMode, mode as u8)
    }

    pub fn set_velocity(&mut self, id: u8, raw: i16) -> Result<()> {
        self.write_u16(id, Register::GoalVelocity, to_sign_magnitude(raw))
    }

    pub fn present_velocity(&mut self, id: u8) -> Result<i16> {
        self.read_u16(id, Register::PresentVelocity)
            .map(from_sign_magnitude)
    }

    fn transact(&mut self, id: u8, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
        let frame = encode_frame(id, opcode, params);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        self.read_reply(id)
    }

    fn read_reply(&mut self, id: u8) -> Result<Vec<u8>> {
        let mut head = [0u8; 4];
        self.port.read_exact(&mut head).map_err(|e| match e.kind() {
            ErrorKind::TimedOut => FeetechError::Timeout { id },
            _ => FeetechError::Io(e),
        })?;

        if head[..2] != SYNC {
            return Err(FeetechError::Malformed {
                id,
                reason: format!("bad sync bytes {:02X?}", &head[..2]),
            });
        }
        if head[2] != id {
            return Err(FeetechError::Malformed {
                id,
                reason: format!("reply addressed from {}", head[2]),
            });
        }

        let length = head[3] as usize;
        if length < 2 {
            return Err(FeetechError::Malformed {
                id,
                reason: format!("length {length} too short"),
            });
        }
        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body)?;
        decode_reply(id, head[3], &body)
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    !sum
}

fn encode_frame(id: u8, opcode: Opcode, params: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + params.len());
    frame.extend_from_slice(&SYNC);
    frame.push(id);
    frame.push((params.len() + 2) as u8);
    frame.push(opcode as u8);
    frame.extend_from_slice(params);
    frame.push(checksum(&frame[2..]));
    frame
}

/// `body` is status byte, params, checksum
fn decode_reply(id: u8, length: u8, body: &[u8]) -> Result<Vec<u8>> {
    let (payload, tail) = body.split_at(body.len() - 1);
    let expected = checksum(&[&[id, length][..], payload].concat());
    if tail[0] != expected {
        return Err(FeetechError::Checksum { id });
    }
    if payload[0] != 0 {
        return Err(FeetechError::Status {
            id,
            status: payload[0],
        });
    }
    Ok(payload[1..].to_vec())
}

/// Bit 15 carries the direction, bits 0-14 the magnitude
fn to_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs() & 0x7FFF;
    if value < 0 { 0x8000 | magnitude } else { magnitude }
}

fn from_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}
