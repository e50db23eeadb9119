// SPDX-License-Identifier: GPL-3.0-only

//! Temperature supervision
//!
//! The illumination driver heats the module; two limits guard it. Crossing
//! the soft limit warns the application, crossing the hard limit demands
//! action. Each limit carries a hysteresis band of half a degree on either
//! side, so a sensor jittering around a limit does not generate an event
//! storm: an alarm trips half a degree above the limit and releases half a
//! degree below it.
//!
//! Alarms do not re-emit while they stay tripped; `retrigger` rearms them,
//! which capture restarts use to get a fresh alarm if the module is still
//! hot.

use crate::errors::{CoreError, CoreResult};
use crate::events::{Event, EventSender};
use std::sync::Mutex;
use tracing::warn;

/// Half-width of the hysteresis band in degrees celsius
const HYSTERESIS: f32 = 0.5;

#[derive(Debug, Default, Clone, Copy)]
struct AlarmState {
    soft: bool,
    hard: bool,
}

/// Two-threshold hysteretic temperature alarm
pub struct TemperatureMonitor {
    soft_limit: f32,
    hard_limit: f32,
    state: Mutex<AlarmState>,
    events: EventSender,
}

impl TemperatureMonitor {
    pub fn new(soft_limit: f32, hard_limit: f32, events: EventSender) -> CoreResult<Self> {
        if soft_limit > hard_limit {
            return Err(CoreError::InvalidValue(format!(
                "soft limit {soft_limit} above hard limit {hard_limit}"
            )));
        }
        Ok(Self {
            soft_limit,
            hard_limit,
            state: Mutex::new(AlarmState::default()),
            events,
        })
    }

    /// Feed one temperature sample; emits on limit crossings only
    pub fn accept_temperature(&self, celsius: f32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if !state.soft && celsius >= self.soft_limit + HYSTERESIS {
            state.soft = true;
            warn!(celsius, limit = self.soft_limit, "soft temperature limit exceeded");
            self.events.send(Event::TemperatureSoftAlarm { celsius });
        }
        if state.soft && !state.hard && celsius >= self.hard_limit + HYSTERESIS {
            state.hard = true;
            warn!(celsius, limit = self.hard_limit, "hard temperature limit exceeded");
            self.events.send(Event::TemperatureHardAlarm { celsius });
        }

        // release at the lower edge of the band
        if state.hard && celsius < self.hard_limit - HYSTERESIS {
            state.hard = false;
        }
        if state.soft && !state.hard && celsius < self.soft_limit - HYSTERESIS {
            state.soft = false;
        }
    }

    pub fn soft_alarm(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).soft
    }

    pub fn hard_alarm(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).hard
    }

    /// Rearm both alarms without emitting; the next sample above a limit
    /// emits again
    pub fn retrigger(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = AlarmState::default();
    }
}
