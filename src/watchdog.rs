/// Staleness watchdog.
///
/// A puck that is still on air but no longer advertises its payload has
/// usually lost its script. Once such a device has been silent for longer than
/// the grace period it is handed to the reprogram action, and the grace window
/// restarts so the action fires at most once per window.
use log::debug;
use time::{Duration, OffsetDateTime};

use crate::registry::DeviceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// A valid payload arrived within the grace period
    Fresh,
    /// Seen on air without payload for longer than the grace period
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    grace: Duration,
}

impl Watchdog {
    pub fn new(grace_secs: u64) -> Self {
        Watchdog {
            grace: Duration::seconds(grace_secs.min(i64::MAX as u64) as i64),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Record a valid payload; timestamps never move backwards
    pub fn payload_seen(&self, state: &mut DeviceState, at: OffsetDateTime) {
        if state.last_valid_payload_time.map_or(true, |last| at > last) {
            state.last_valid_payload_time = Some(at);
        }
        if at > state.grace_anchor {
            state.grace_anchor = at;
        }
        state.freshness = Freshness::Fresh;
    }

    /// Record a sighting without payload; returns true when a reprogram is due
    pub fn presence_seen(&self, state: &mut DeviceState, now: OffsetDateTime) -> bool {
        state.last_seen_no_payload_time = Some(now);
        if now - state.grace_anchor <= self.grace {
            return false;
        }
        if state.freshness == Freshness::Fresh {
            debug!(
                "{} went stale: last payload {:?}, on air without payload at {:?}",
                state.mac, state.last_valid_payload_time, state.last_seen_no_payload_time
            );
        }
        state.freshness = Freshness::Stale;
        !state.reprogram_in_progress
    }

    /// Restart the grace window after a reprogram attempt, successful or not
    pub fn reprogram_attempted(&self, state: &mut DeviceState, now: OffsetDateTime) {
        if now > state.grace_anchor {
            state.grace_anchor = now;
        }
        state.reprogram_in_progress = false;
    }
}
