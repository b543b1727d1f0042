//! Stateful enclosure simulator standing in for the microcontroller during
//! local development.
//!
//! Models a thermophilic compost pile:
//! - Pile self-heats; the radiator valve and the blower pull heat out
//! - Soil dries by evaporation (faster with the blower); the pump wets it
//! - Evaporated moisture raises enclosure air humidity until air is renewed
//! - Per-reading sensor noise
//!
//! [`SimChannel`] speaks the same wire protocol as the real board: every
//! command byte is executed and echoed back as a handshake (unless the
//! configured drop rate loses it), and a sensor line is printed every tick.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::channel::ActuationChannel;
use crate::protocol::{Command, LOG_HEADER};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate N(0,1) with the Irwin-Hall method: 12 uniforms minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Starting conditions selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-band humidity, warm pile. Little should happen.
    Nominal,
    /// Pile just under the thermal trip point and heating fast.
    Hot,
    /// Saturated enclosure air; exercises the drying cycle.
    Humid,
    /// Soil below the watering threshold.
    Dry,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "humid" => Self::Humid,
            "dry" => Self::Dry,
            _ => Self::Nominal,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nominal => write!(f, "nominal"),
            Self::Hot => write!(f, "hot"),
            Self::Humid => write!(f, "humid"),
            Self::Dry => write!(f, "dry"),
        }
    }
}

// ---------------------------------------------------------------------------
// Enclosure model
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct Actuators {
    blower: bool,
    radiator: bool,
    air_renew: bool,
    pump: bool,
}

pub struct EnclosureSim {
    soil_humidity: f64,
    soil_temperature: f64,
    air_humidity: f64,
    air_temperature: f64,
    /// Degrees per tick the pile gains on its own.
    self_heating: f64,
    noise_sigma: f64,
    actuators: Actuators,
}

const AMBIENT_TEMP: f64 = 18.0;

impl EnclosureSim {
    pub fn new(scenario: Scenario) -> Self {
        let (soil_humidity, soil_temperature, air_humidity, self_heating) = match scenario {
            Scenario::Nominal => (50.0, 45.0, 55.0, 0.14),
            Scenario::Hot => (50.0, 59.0, 55.0, 0.4),
            Scenario::Humid => (52.0, 45.0, 88.0, 0.14),
            Scenario::Dry => (38.0, 45.0, 45.0, 0.14),
        };
        Self {
            soil_humidity,
            soil_temperature,
            air_humidity,
            air_temperature: AMBIENT_TEMP + 4.0,
            self_heating,
            noise_sigma: 0.15,
            actuators: Actuators::default(),
        }
    }

    /// Execute a command the way the board's relays would.
    pub fn apply(&mut self, command: Command) {
        let on = command.state().is_on();
        match command {
            Command::BlowerOn | Command::BlowerOff => self.actuators.blower = on,
            Command::RadiatorOn | Command::RadiatorOff => self.actuators.radiator = on,
            Command::AirRenewOn | Command::AirRenewOff => self.actuators.air_renew = on,
            Command::WaterPumpOn | Command::WaterPumpOff => self.actuators.pump = on,
        }
    }

    /// Advance the model by one sample tick.
    pub fn step(&mut self) {
        let a = self.actuators;

        // -- Heat ---------------------------------------------------------
        let mut dt = self.self_heating - 0.005 * (self.soil_temperature - AMBIENT_TEMP);
        if a.radiator {
            dt -= 0.4;
        }
        if a.blower {
            dt -= 0.1;
        }
        self.soil_temperature += dt;

        // -- Soil moisture ------------------------------------------------
        let evaporation = if a.blower { 0.08 } else { 0.02 };
        let mut dh = -evaporation;
        if a.pump {
            dh += 2.5;
        }
        self.soil_humidity = (self.soil_humidity + dh).clamp(0.0, 100.0);

        // -- Enclosure air ------------------------------------------------
        let mut da = evaporation * 4.0;
        if a.air_renew {
            da -= 1.5;
        }
        if a.radiator {
            // Condensation on the cold radiator.
            da -= 0.3;
        }
        self.air_humidity = (self.air_humidity + da).clamp(0.0, 100.0);

        let air_target = AMBIENT_TEMP + 0.1 * self.soil_temperature;
        self.air_temperature += 0.1 * (air_target - self.air_temperature);
    }

    /// Sensor line in the firmware's print format, with sensor noise.
    pub fn line(&self) -> String {
        let n = |v: f64| gaussian(v, self.noise_sigma);
        let air_temperature = n(self.air_temperature);
        format!(
            "iSoilH: {:.2}% SoilT: {:.2}*C AirH: {:.2}% AirT: {:.2}*C HI: {:.2}*C",
            n(self.soil_humidity).clamp(0.0, 100.0),
            n(self.soil_temperature),
            n(self.air_humidity).clamp(0.0, 100.0),
            air_temperature,
            air_temperature + 0.5,
        )
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

pub struct SimChannel {
    sim: EnclosureSim,
    outbox: VecDeque<Vec<u8>>,
    ticker: tokio::time::Interval,
    /// Probability in [0, 1] that a handshake is lost.
    ack_drop: f32,
}

impl SimChannel {
    pub fn new(scenario: Scenario, sample_every: Duration, ack_drop: f32) -> Self {
        info!(%scenario, ?sample_every, ack_drop, "simulated enclosure started");
        Self {
            sim: EnclosureSim::new(scenario),
            outbox: VecDeque::new(),
            ticker: tokio::time::interval(sample_every),
            ack_drop: ack_drop.clamp(0.0, 1.0),
        }
    }
}

impl ActuationChannel for SimChannel {
    async fn send(&mut self, byte: u8) -> Result<()> {
        match Command::from_byte(byte) {
            Some(command) => {
                self.sim.apply(command);
                if fastrand::f32() < self.ack_drop {
                    debug!(?command, "sim: handshake dropped");
                } else {
                    self.outbox.push_back(vec![byte]);
                }
            }
            None => {
                let mut line = vec![LOG_HEADER];
                line.extend_from_slice(
                    format!(" self-test 0x{byte:02x}: cycling all effectors").as_bytes(),
                );
                self.outbox.push_back(line);
            }
        }
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(line) = self.outbox.pop_front() {
            return Ok(Some(line));
        }
        self.ticker.tick().await;
        self.sim.step();
        Ok(Some(self.sim.line().into_bytes()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
