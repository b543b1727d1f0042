//! Outstanding-command bookkeeping for the command/ack handshake.
//!
//! At most one record exists per command byte. A command that is still
//! waiting for its ack is never re-sent; once it has waited longer than
//! `MAX_WAIT_HANDSHAKE` it is evicted, and the following offer sends it again.
//!
//! Retry policy: forever, at the timeout cadence, with no backoff. Under a
//! dead link every pending command goes out once per timeout window.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};
use tracing::{error, warn};

use crate::constants::MAX_WAIT_HANDSHAKE;
use crate::protocol::Command;

/// What the caller must do with an offered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Recorded as outstanding; write it to the device now.
    Send,
    /// Already outstanding and still within the wait window.
    Suppressed,
    /// Outstanding record expired and was evicted. Nothing is sent on this
    /// offer; the next one sends fresh.
    TimedOut,
}

#[derive(Debug)]
pub struct HandshakeTracker {
    outstanding: HashMap<Command, OffsetDateTime>,
    max_wait: Duration,
}

impl HandshakeTracker {
    pub fn new() -> Self {
        Self::with_max_wait(MAX_WAIT_HANDSHAKE)
    }

    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            outstanding: HashMap::new(),
            max_wait,
        }
    }

    pub fn offer(&mut self, command: Command, now: OffsetDateTime) -> Offer {
        match self.outstanding.get(&command) {
            None => {
                self.outstanding.insert(command, now);
                Offer::Send
            }
            Some(&sent_at) if now - sent_at <= self.max_wait => Offer::Suppressed,
            Some(&sent_at) => {
                error!(
                    ?command,
                    byte = %char::from(command.byte()),
                    waited_ms = (now - sent_at).whole_milliseconds() as i64,
                    "handshake timeout, evicting"
                );
                self.outstanding.remove(&command);
                Offer::TimedOut
            }
        }
    }

    /// Drop expired records for commands no longer being requested, so a
    /// later request for the same command sends on its first offer. Records
    /// in `wanted` are left to `offer`, which keeps the retry cadence.
    pub fn evict_stale(&mut self, wanted: &[Command], now: OffsetDateTime) -> usize {
        let max_wait = self.max_wait;
        let before = self.outstanding.len();
        self.outstanding.retain(|command, sent_at| {
            let keep = wanted.contains(command) || now - *sent_at <= max_wait;
            if !keep {
                warn!(
                    ?command,
                    byte = %char::from(command.byte()),
                    waited_ms = (now - *sent_at).whole_milliseconds() as i64,
                    "superseded command never acknowledged, evicting"
                );
            }
            keep
        });
        before - self.outstanding.len()
    }

    /// Clear the record for an inbound ack. Returns when the command was sent,
    /// or `None` if it was not outstanding (expired or unsolicited).
    pub fn acknowledge(&mut self, command: Command) -> Option<OffsetDateTime> {
        self.outstanding.remove(&command)
    }

    #[cfg(test)]
    pub fn is_outstanding(&self, command: Command) -> bool {
        self.outstanding.contains_key(&command)
    }

    #[cfg(test)]
    pub fn sent_at(&self, command: Command) -> Option<OffsetDateTime> {
        self.outstanding.get(&command).copied()
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    #[test]
    fn first_offer_sends_and_records() {
        let mut t = HandshakeTracker::new();
        assert_eq!(t.offer(Command::BlowerOn, T0), Offer::Send);
        assert!(t.is_outstanding(Command::BlowerOn));
        assert_eq!(t.sent_at(Command::BlowerOn), Some(T0));
    }

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let mut t = HandshakeTracker::new();
        t.offer(Command::BlowerOn, T0);
        assert_eq!(
            t.offer(Command::BlowerOn, T0 + Duration::seconds(3)),
            Offer::Suppressed
        );
        // Exactly at the limit still counts as waiting.
        assert_eq!(
            t.offer(Command::BlowerOn, T0 + MAX_WAIT_HANDSHAKE),
            Offer::Suppressed
        );
        assert_eq!(t.len(), 1);
        assert_eq!(t.sent_at(Command::BlowerOn), Some(T0));
    }

    #[test]
    fn expired_record_is_evicted_then_resent() {
        let mut t = HandshakeTracker::new();
        t.offer(Command::RadiatorOn, T0);

        let late = T0 + MAX_WAIT_HANDSHAKE + Duration::seconds(1);
        assert_eq!(t.offer(Command::RadiatorOn, late), Offer::TimedOut);
        assert!(!t.is_outstanding(Command::RadiatorOn));

        let retry = late + Duration::seconds(1);
        assert_eq!(t.offer(Command::RadiatorOn, retry), Offer::Send);
        assert_eq!(t.sent_at(Command::RadiatorOn), Some(retry));
    }

    #[test]
    fn on_and_off_are_independent_keys() {
        let mut t = HandshakeTracker::new();
        assert_eq!(t.offer(Command::WaterPumpOn, T0), Offer::Send);
        assert_eq!(t.offer(Command::WaterPumpOff, T0), Offer::Send);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn acknowledge_clears_record() {
        let mut t = HandshakeTracker::new();
        t.offer(Command::AirRenewOn, T0);
        assert_eq!(t.acknowledge(Command::AirRenewOn), Some(T0));
        assert!(t.is_empty());
    }

    #[test]
    fn acknowledge_unknown_returns_none() {
        let mut t = HandshakeTracker::new();
        assert_eq!(t.acknowledge(Command::AirRenewOff), None);
    }

    #[test]
    fn acked_command_can_be_sent_again_immediately() {
        let mut t = HandshakeTracker::new();
        t.offer(Command::BlowerOff, T0);
        t.acknowledge(Command::BlowerOff);
        assert_eq!(
            t.offer(Command::BlowerOff, T0 + Duration::seconds(1)),
            Offer::Send
        );
    }

    #[test]
    fn evict_stale_drops_expired_superseded_records() {
        let mut t = HandshakeTracker::new();
        t.offer(Command::RadiatorOn, T0);
        t.offer(Command::BlowerOn, T0);
        t.offer(Command::WaterPumpOff, T0 + Duration::seconds(8));

        let now = T0 + MAX_WAIT_HANDSHAKE + Duration::seconds(1);
        assert_eq!(t.evict_stale(&[Command::BlowerOn], now), 1);

        assert!(!t.is_outstanding(Command::RadiatorOn));
        // Still wanted: left for offer to time out.
        assert!(t.is_outstanding(Command::BlowerOn));
        // Not yet expired.
        assert!(t.is_outstanding(Command::WaterPumpOff));
        assert_eq!(t.offer(Command::RadiatorOn, now), Offer::Send);
    }

    #[test]
    fn evict_stale_keeps_fresh_records() {
        let mut t = HandshakeTracker::new();
        t.offer(Command::AirRenewOn, T0);
        assert_eq!(t.evict_stale(&[], T0 + MAX_WAIT_HANDSHAKE), 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn dead_link_resends_once_per_window_forever() {
        let mut t = HandshakeTracker::new();
        let step = Duration::seconds(1);
        let mut now = T0;
        let mut sends = Vec::new();

        // One offer per second for five minutes, no acks ever.
        for _ in 0..300 {
            if t.offer(Command::BlowerOn, now) == Offer::Send {
                sends.push(now);
            }
            now += step;
        }

        assert!(sends.len() > 10, "expected repeated retries, got {}", sends.len());
        for pair in sends.windows(2) {
            let gap = pair[1] - pair[0];
            // Sent at t, suppressed through t+10s, evicted at t+11s, resent at t+12s.
            assert_eq!(gap, MAX_WAIT_HANDSHAKE + step * 2, "no backoff expected");
        }
    }
}
