//! Policy engine: owns the four effectors and the handshake tracker, turns
//! each sensor snapshot into a set of command bytes, and applies inbound acks.
//!
//! Rules are evaluated in a fixed priority order, later rules overriding
//! earlier ones:
//!
//! 1. quiet hours (radiator + air-renew forced OFF, scheduled activation off)
//! 2. air-renewal duty cycle
//! 3. thermal safety with hysteresis (never suppressed)
//! 4. soil humidity, pump bursts with diffusion dead-time
//! 5. air humidity ceiling
//! 6. drying override
//! 7. blower schedule / circulation
//! 8. emit through the handshake tracker
//!
//! ## Drying sub-mode
//!
//! ```text
//!            DRYING_ON_INTERVAL
//!   Drying ─────────────────────▶ Recovering
//!     ▲                               │
//!     └───── DRYING_OFF_INTERVAL ─────┘
//!
//!   (cleared as soon as air humidity drops back under the ceiling)
//! ```

use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::constants::*;
use crate::effector::{Effector, EffectorKind, EffectorState};
use crate::handshake::{HandshakeTracker, Offer};
use crate::protocol::Command;
use crate::sensors::{SensorParseError, SensorSnapshot};

// ---------------------------------------------------------------------------
// Quiet hours
// ---------------------------------------------------------------------------

/// Local-time window in which noisy actuators may be scheduled on.
#[derive(Debug, Clone, Copy)]
pub struct QuietHours {
    /// First hour (inclusive) of the loud window.
    earliest_hour: u8,
    /// Hour (exclusive) at which the loud window ends.
    latest_hour: u8,
    offset: UtcOffset,
}

impl QuietHours {
    pub fn new(earliest_hour: u8, latest_hour: u8, offset: UtcOffset) -> Self {
        Self {
            earliest_hour,
            latest_hour,
            offset,
        }
    }

    /// True when `now` falls outside the loud window. A window whose start is
    /// after its end wraps past midnight.
    pub fn is_quiet(&self, now: OffsetDateTime) -> bool {
        let hour = now.to_offset(self.offset).hour();
        let loud = if self.earliest_hour <= self.latest_hour {
            hour >= self.earliest_hour && hour < self.latest_hour
        } else {
            hour >= self.earliest_hour || hour < self.latest_hour
        };
        !loud
    }
}

// ---------------------------------------------------------------------------
// Drying cycle state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryingPhase {
    /// Blower, radiator and air-renew running.
    Drying,
    /// Blower and radiator forced off to cool down.
    Recovering,
}

#[derive(Debug, Clone, Copy)]
struct DryingCycle {
    phase: DryingPhase,
    since: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Confirmed(EffectorKind, EffectorState),
    /// Recognised command byte with no outstanding record.
    Unsolicited(Command),
}

pub struct EffectorManager<C: Clock> {
    clock: C,
    quiet_hours: QuietHours,
    blower: Effector,
    water_pump: Effector,
    radiator_valve: Effector,
    air_renew_valve: Effector,
    tracker: HandshakeTracker,
    drying: Option<DryingCycle>,
    snapshot: Option<SensorSnapshot>,
}

impl<C: Clock> EffectorManager<C> {
    pub fn new(clock: C, quiet_hours: QuietHours) -> Self {
        let now = clock.now();
        Self {
            clock,
            quiet_hours,
            blower: Effector::new(EffectorKind::Blower, now),
            water_pump: Effector::new(EffectorKind::WaterPump, now),
            radiator_valve: Effector::new(EffectorKind::RadiatorValve, now),
            air_renew_valve: Effector::new(EffectorKind::AirRenewValve, now),
            tracker: HandshakeTracker::new(),
            drying: None,
            snapshot: None,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn effector(&self, kind: EffectorKind) -> &Effector {
        match kind {
            EffectorKind::Blower => &self.blower,
            EffectorKind::WaterPump => &self.water_pump,
            EffectorKind::RadiatorValve => &self.radiator_valve,
            EffectorKind::AirRenewValve => &self.air_renew_valve,
        }
    }

    pub(crate) fn effector_mut(&mut self, kind: EffectorKind) -> &mut Effector {
        match kind {
            EffectorKind::Blower => &mut self.blower,
            EffectorKind::WaterPump => &mut self.water_pump,
            EffectorKind::RadiatorValve => &mut self.radiator_valve,
            EffectorKind::AirRenewValve => &mut self.air_renew_valve,
        }
    }

    pub fn tracker(&self) -> &HandshakeTracker {
        &self.tracker
    }

    /// Last successfully parsed reading.
    pub fn snapshot(&self) -> Option<&SensorSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn drying_phase(&self) -> Option<DryingPhase> {
        self.drying.map(|d| d.phase)
    }

    /// Commands for every effector whose desired state differs from its
    /// confirmed one, whether or not they are currently in flight.
    pub fn pending_commands(&self) -> Vec<Command> {
        EffectorKind::ALL
            .into_iter()
            .map(|k| self.effector(k))
            .filter(|e| e.pending_change())
            .map(Effector::command_message)
            .collect()
    }

    /// Parse a sensor line into the working snapshot. A rejected line leaves
    /// the previous snapshot untouched.
    pub fn ingest_sensor_line(&mut self, line: &str) -> Result<SensorSnapshot, SensorParseError> {
        let snapshot = SensorSnapshot::parse(line, self.clock.now())?;
        self.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Run one policy cycle and return the commands to write to the device.
    pub fn manage(&mut self, s: &SensorSnapshot) -> Vec<Command> {
        let now = self.clock.now();
        let quiet = self.quiet_hours.is_quiet(now);
        let mut circulate = false;

        // 1. Quiet hours
        if quiet {
            self.radiator_valve.request_off();
            self.air_renew_valve.request_off();
        }

        // 2. Air renewal
        if !quiet {
            self.schedule_air_renewal(s, now);
        }

        // 3. Thermal safety
        let thermal_trip = s.soil_temperature >= MAX_SOIL_TEMP;
        if thermal_trip {
            self.radiator_valve.request_on();
            circulate = true;
        } else if s.soil_temperature < MAX_SOIL_TEMP - TEMP_BUFFER {
            self.radiator_valve.request_off();
        }

        // 4. Soil humidity
        if self.control_soil_humidity(s, now) {
            circulate = true;
        }

        // 5. Air humidity ceiling
        let need_drying = s.air_humidity > AIR_H2O_MAX;

        // 6. Drying override
        let drying = need_drying && !quiet;
        if drying {
            self.run_drying_cycle(now, thermal_trip);
        } else if self.drying.take().is_some() {
            info!(
                air_humidity = s.air_humidity,
                quiet, "drying cycle ended"
            );
        }

        // 7. Blower
        if !drying {
            self.schedule_blower(now, quiet, circulate);
        }

        debug!(
            soil_humidity = s.soil_humidity,
            soil_temperature = s.soil_temperature,
            air_humidity = s.air_humidity,
            quiet,
            circulate,
            drying,
            "policy evaluated"
        );

        // 8. Emit
        self.emit(now)
    }

    /// Apply an inbound handshake byte.
    pub fn acknowledge(&mut self, command: Command) -> AckOutcome {
        let now = self.clock.now();
        match self.tracker.acknowledge(command) {
            Some(sent_at) => {
                let state = command.state();
                let effector = self.effector_mut(command.effector());
                effector.confirm(state, now);
                info!(
                    effector = %effector.name(),
                    %state,
                    rtt_ms = (now - sent_at).whole_milliseconds() as i64,
                    "handshake confirmed"
                );
                let kind = effector.kind();
                if self.tracker.is_empty() {
                    debug!("all handshakes settled");
                }
                AckOutcome::Confirmed(kind, state)
            }
            None => {
                warn!(
                    ?command,
                    byte = %char::from(command.byte()),
                    "expired or unsolicited handshake, ignoring"
                );
                AckOutcome::Unsolicited(command)
            }
        }
    }

    // -- Rules ------------------------------------------------------------

    fn schedule_air_renewal(&mut self, s: &SensorSnapshot, now: OffsetDateTime) {
        if let Some(o2) = s.air_o2 {
            // O2-driven renewal needs a probe the enclosure does not have yet.
            trace!(o2, "air renewal: O2 reading present, schedule skipped");
            return;
        }

        let valve = &mut self.air_renew_valve;
        let elapsed = valve.elapsed_since_on(now);
        if valve.is_on() {
            if elapsed >= valve.on_interval() {
                valve.request_off();
            }
        } else if elapsed >= valve.full_cycle() {
            valve.request_on();
        }
    }

    /// Returns true if the soil is wet enough that air should circulate.
    fn control_soil_humidity(&mut self, s: &SensorSnapshot, now: OffsetDateTime) -> bool {
        let pump = &mut self.water_pump;
        let elapsed = pump.elapsed_since_on(now);

        if s.soil_humidity >= SOIL_H2O_MAX {
            pump.request_off();
            // Vent the moisture that circulation evaporates.
            self.air_renew_valve.request_on();
            return true;
        }

        if pump.is_on() {
            if elapsed >= pump.on_interval() || s.soil_humidity >= SOIL_H2O_NORM {
                pump.request_off();
            }
        } else if s.soil_humidity < SOIL_H2O_MIN && elapsed >= pump.full_cycle() {
            pump.request_on();
        }
        false
    }

    fn run_drying_cycle(&mut self, now: OffsetDateTime, thermal_trip: bool) {
        let cycle = self.drying.get_or_insert_with(|| {
            info!("air humidity above ceiling, drying cycle started");
            DryingCycle {
                phase: DryingPhase::Drying,
                since: now,
            }
        });

        let span = match cycle.phase {
            DryingPhase::Drying => DRYING_ON_INTERVAL,
            DryingPhase::Recovering => DRYING_OFF_INTERVAL,
        };
        if now - cycle.since >= span {
            cycle.phase = match cycle.phase {
                DryingPhase::Drying => DryingPhase::Recovering,
                DryingPhase::Recovering => DryingPhase::Drying,
            };
            cycle.since = now;
            info!(phase = ?cycle.phase, "drying cycle phase change");
        }
        let phase = cycle.phase;

        match phase {
            DryingPhase::Drying => {
                self.blower.request_on();
                self.radiator_valve.request_on();
                self.air_renew_valve.request_on();
            }
            DryingPhase::Recovering => {
                self.blower.request_off();
                if !thermal_trip {
                    self.radiator_valve.request_off();
                }
            }
        }
    }

    fn schedule_blower(&mut self, now: OffsetDateTime, quiet: bool, circulate: bool) {
        let blower = &mut self.blower;
        if circulate {
            blower.request_on();
            return;
        }

        let elapsed = blower.elapsed_since_on(now);
        if blower.is_on() {
            if elapsed >= blower.on_interval() {
                blower.request_off();
            }
        } else if !quiet && elapsed >= blower.full_cycle() {
            blower.request_on();
        }
    }

    fn emit(&mut self, now: OffsetDateTime) -> Vec<Command> {
        let wanted = self.pending_commands();
        self.tracker.evict_stale(&wanted, now);

        let mut to_send = Vec::new();
        for kind in EffectorKind::ALL {
            let effector = self.effector(kind);
            if !effector.pending_change() {
                continue;
            }
            let command = effector.command_message();
            let desired = effector.desired();
            match self.tracker.offer(command, now) {
                Offer::Send => {
                    debug!(
                        effector = %kind,
                        %desired,
                        ?command,
                        "sending state change"
                    );
                    to_send.push(command);
                }
                Offer::Suppressed => {
                    trace!(effector = %kind, ?command, "awaiting handshake");
                }
                Offer::TimedOut => {}
            }
        }
        to_send
    }
}

// ===========================================================================
// Tests
// ===========================================================================
