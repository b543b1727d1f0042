//! Per-actuator state machine.
//!
//! ```text
//!            request_on / request_off        (desired only)
//!   confirmed ───────────────────────▶ desired != confirmed  ── pending
//!       ▲                                         │
//!       └──────────── confirm(ack) ◀──────────────┘
//! ```
//!
//! `confirmed` moves only when the device acknowledges a command; nothing in
//! the policy engine assumes a send succeeded.

use std::fmt;

use time::{Duration, OffsetDateTime};

use crate::constants::*;
use crate::protocol::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectorState {
    On,
    Off,
}

impl EffectorState {
    pub fn is_on(self) -> bool {
        self == EffectorState::On
    }
}

impl fmt::Display for EffectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectorKind {
    Blower,
    WaterPump,
    RadiatorValve,
    AirRenewValve,
}

impl EffectorKind {
    pub const ALL: [EffectorKind; 4] = [
        EffectorKind::Blower,
        EffectorKind::WaterPump,
        EffectorKind::RadiatorValve,
        EffectorKind::AirRenewValve,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Blower => "air_blower",
            Self::WaterPump => "water_pump",
            Self::RadiatorValve => "radiator_valve",
            Self::AirRenewValve => "air_renew_valve",
        }
    }
}

impl fmt::Display for EffectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct Effector {
    kind: EffectorKind,
    confirmed: EffectorState,
    desired: EffectorState,
    last_activation: OffsetDateTime,
    on_interval: Duration,
    off_interval: Option<Duration>,
    on_message: Command,
    off_message: Command,
}

impl Effector {
    /// Build an effector with its standard timing and command bytes. It starts
    /// OFF with the activation timer at `now`, so no schedule fires until a
    /// full interval has elapsed after startup.
    pub fn new(kind: EffectorKind, now: OffsetDateTime) -> Self {
        let (on_interval, off_interval, on_message, off_message) = match kind {
            EffectorKind::Blower => (
                BLOWER_ON_INTERVAL,
                Some(BLOWER_OFF_INTERVAL),
                Command::BlowerOn,
                Command::BlowerOff,
            ),
            EffectorKind::WaterPump => (
                WATER_PUMP_ON_INTERVAL,
                Some(WATER_PUMP_OFF_INTERVAL),
                Command::WaterPumpOn,
                Command::WaterPumpOff,
            ),
            // Thermal threshold only, no off schedule.
            EffectorKind::RadiatorValve => (
                RADIATOR_VALVE_ON_INTERVAL,
                None,
                Command::RadiatorOn,
                Command::RadiatorOff,
            ),
            EffectorKind::AirRenewValve => (
                AIR_RENEW_ON_INTERVAL,
                Some(AIR_RENEW_OFF_INTERVAL),
                Command::AirRenewOn,
                Command::AirRenewOff,
            ),
        };

        Self {
            kind,
            confirmed: EffectorState::Off,
            desired: EffectorState::Off,
            last_activation: now,
            on_interval,
            off_interval,
            on_message,
            off_message,
        }
    }

    pub fn kind(&self) -> EffectorKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn confirmed(&self) -> EffectorState {
        self.confirmed
    }

    pub fn desired(&self) -> EffectorState {
        self.desired
    }

    pub fn is_on(&self) -> bool {
        self.confirmed.is_on()
    }

    #[cfg(test)]
    pub fn last_activation(&self) -> OffsetDateTime {
        self.last_activation
    }

    pub fn on_interval(&self) -> Duration {
        self.on_interval
    }

    /// One full on/off period. Effectors without an off schedule count only
    /// their on interval.
    pub fn full_cycle(&self) -> Duration {
        self.on_interval + self.off_interval.unwrap_or(Duration::ZERO)
    }

    pub fn elapsed_since_on(&self, now: OffsetDateTime) -> Duration {
        now - self.last_activation
    }

    pub fn request_on(&mut self) {
        self.request(EffectorState::On);
    }

    pub fn request_off(&mut self) {
        self.request(EffectorState::Off);
    }

    pub fn request(&mut self, state: EffectorState) {
        self.desired = state;
    }

    pub fn pending_change(&self) -> bool {
        self.desired != self.confirmed
    }

    pub fn command_message(&self) -> Command {
        match self.desired {
            EffectorState::On => self.on_message,
            EffectorState::Off => self.off_message,
        }
    }

    /// Apply a handshake. Only an ON confirmation restarts the activation
    /// timer; scheduling measures elapsed-since-last-on.
    pub fn confirm(&mut self, state: EffectorState, now: OffsetDateTime) {
        self.confirmed = state;
        if state.is_on() {
            self.last_activation = now;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_confirmed(&mut self, state: EffectorState) {
        self.confirmed = state;
        self.desired = state;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
