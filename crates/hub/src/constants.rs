//! Fixed control thresholds and actuator timing.
//!
//! These are domain constants, not runtime configuration: the policy engine
//! in `manager` is written against them directly.

use time::Duration;

// ---------------------------------------------------------------------------
// Sensor thresholds
// ---------------------------------------------------------------------------

/// Max soil temperature allowed during the thermophilic phase, in ºC.
pub const MAX_SOIL_TEMP: f64 = 60.0;
/// Width of the radiator hysteresis band below `MAX_SOIL_TEMP`, in ºC.
pub const TEMP_BUFFER: f64 = 5.0;

/// Soil humidity bands, in % RH.
pub const SOIL_H2O_MAX: f64 = 60.0;
pub const SOIL_H2O_NORM: f64 = 50.0;
pub const SOIL_H2O_MIN: f64 = 45.0;

/// Enclosure air humidity ceiling, in % RH. Above this the drying cycle runs.
pub const AIR_H2O_MAX: f64 = 80.0;

// ---------------------------------------------------------------------------
// Actuator intervals
// ---------------------------------------------------------------------------

pub const WATER_PUMP_ON_INTERVAL: Duration = Duration::seconds(5);
pub const WATER_PUMP_OFF_INTERVAL: Duration = Duration::minutes(5);

pub const BLOWER_ON_INTERVAL: Duration = Duration::minutes(1);
pub const BLOWER_OFF_INTERVAL: Duration = Duration::hours(1);

/// Extra time the radiator valve stays open past a blower run.
pub const VALVE_BUFFER_INTERVAL: Duration = Duration::seconds(5);
pub const RADIATOR_VALVE_ON_INTERVAL: Duration = BLOWER_ON_INTERVAL.saturating_add(VALVE_BUFFER_INTERVAL);

pub const AIR_RENEW_ON_INTERVAL: Duration = Duration::minutes(1);
pub const AIR_RENEW_OFF_INTERVAL: Duration = Duration::hours(8);

/// Drying cycle: run phase, then forced cool-down phase.
pub const DRYING_ON_INTERVAL: Duration = Duration::minutes(10);
pub const DRYING_OFF_INTERVAL: Duration = Duration::minutes(5);

/// How long a sent command may wait for its acknowledgment before it is
/// evicted and becomes eligible for a fresh send.
pub const MAX_WAIT_HANDSHAKE: Duration = Duration::seconds(10);
