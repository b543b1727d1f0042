//! Single-byte wire protocol spoken with the enclosure microcontroller.
//!
//! Outbound, the hub writes one command byte per state change. Inbound, the
//! device writes newline-terminated lines: a sensor reading (`i` header), a
//! free-form log line (`j` header), or a lone command byte echoing a command
//! it has just executed.

use crate::effector::{EffectorKind, EffectorState};

/// First byte of a sensor reading line.
pub const SENSOR_HEADER: u8 = b'i';
/// First byte of a device log line.
pub const LOG_HEADER: u8 = b'j';

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    BlowerOn,
    BlowerOff,
    RadiatorOn,
    RadiatorOff,
    AirRenewOn,
    AirRenewOff,
    WaterPumpOn,
    WaterPumpOff,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::BlowerOn,
        Command::BlowerOff,
        Command::RadiatorOn,
        Command::RadiatorOff,
        Command::AirRenewOn,
        Command::AirRenewOff,
        Command::WaterPumpOn,
        Command::WaterPumpOff,
    ];

    pub fn byte(self) -> u8 {
        match self {
            Command::BlowerOn => b'a',
            Command::BlowerOff => b'b',
            Command::RadiatorOn => b'c',
            Command::RadiatorOff => b'd',
            Command::AirRenewOn => b'e',
            Command::AirRenewOff => b'f',
            Command::WaterPumpOn => b'g',
            Command::WaterPumpOff => b'h',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.byte() == b)
    }

    pub fn effector(self) -> EffectorKind {
        match self {
            Command::BlowerOn | Command::BlowerOff => EffectorKind::Blower,
            Command::RadiatorOn | Command::RadiatorOff => EffectorKind::RadiatorValve,
            Command::AirRenewOn | Command::AirRenewOff => EffectorKind::AirRenewValve,
            Command::WaterPumpOn | Command::WaterPumpOff => EffectorKind::WaterPump,
        }
    }

    /// The state this command asks its effector to enter.
    pub fn state(self) -> EffectorState {
        match self {
            Command::BlowerOn
            | Command::RadiatorOn
            | Command::AirRenewOn
            | Command::WaterPumpOn => EffectorState::On,
            _ => EffectorState::Off,
        }
    }
}

/// True if `b` is already claimed by a header or a command.
pub fn is_reserved_byte(b: u8) -> bool {
    b == SENSOR_HEADER || b == LOG_HEADER || Command::from_byte(b).is_some()
}

// ---------------------------------------------------------------------------
// Inbound decoding
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Whole sensor line, header included (field positions count from it).
    Sensor(&'a str),
    /// Device log text with the header stripped.
    DeviceLog(&'a str),
    /// Handshake: the device executed this command.
    Ack(Command),
    Empty,
    Unknown(&'a [u8]),
}

/// Classify one inbound line. Trailing `\r`/`\n` are ignored.
pub fn decode(line: &[u8]) -> Inbound<'_> {
    let end = line
        .iter()
        .rposition(|b| *b != b'\n' && *b != b'\r')
        .map_or(0, |i| i + 1);
    let line = &line[..end];

    match line {
        [] => Inbound::Empty,
        [b] => Command::from_byte(*b).map_or(Inbound::Unknown(line), Inbound::Ack),
        [SENSOR_HEADER, ..] => match std::str::from_utf8(line) {
            Ok(s) => Inbound::Sensor(s),
            Err(_) => Inbound::Unknown(line),
        },
        [LOG_HEADER, rest @ ..] => match std::str::from_utf8(rest) {
            Ok(s) => Inbound::DeviceLog(s.trim()),
            Err(_) => Inbound::Unknown(line),
        },
        _ => Inbound::Unknown(line),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
