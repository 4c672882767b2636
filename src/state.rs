//! Observed device state, connection-scoped identity and the locally desired
//! configuration that survives reconnects.

use chrono::{DateTime, Utc};

use crate::codec::{EffectParams, Rgbw};
use crate::connection::ConnectionOutcome;
use crate::effects::Effect;

/// Effect step delay the firmware uses out of the box.
pub const DEFAULT_EFFECT_DELAY: u8 = 0x14;

/// Last observed state of the candle
///
/// Replaced wholesale after every successful read or command. A powered-off
/// candle may still report non-zero color registers (a tap on the device
/// toggles power without clearing them).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub power: bool,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
    pub battery_level: Option<u8>,
    /// When this snapshot was taken from a live link
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceState {
    pub fn rgbw(&self) -> Rgbw {
        Rgbw::new(self.red, self.green, self.blue, self.white)
    }

    /// Copy of `self` with the color registers and power flag replaced
    pub fn with_light(&self, power: bool, color: Rgbw) -> DeviceState {
        DeviceState {
            power,
            red: color.red,
            green: color.green,
            blue: color.blue,
            white: color.white,
            ..self.clone()
        }
    }

    /// Equality on everything a caller can observe, ignoring the timestamp
    pub fn same_observation(&self, other: &DeviceState) -> bool {
        self.power == other.power
            && self.rgbw() == other.rgbw()
            && self.battery_level == other.battery_level
    }
}

/// Device information read right after connecting
///
/// Belongs to the connection: cleared whenever the link goes away.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub manufacturer: Option<String>,
    pub hw_version: Option<String>,
    pub sw_version: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub battery_powered: bool,
    pub has_timer: bool,
}

impl DeviceIdentity {
    /// Model name followed by the serial, when both are known
    pub fn display_model(&self) -> Option<String> {
        match (&self.model, &self.serial) {
            (Some(model), Some(serial)) => Some(format!("{model} {serial}")),
            (Some(model), None) => Some(model.clone()),
            (None, serial) => serial.clone(),
        }
    }
}

/// What the user last asked the candle to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredConfiguration {
    pub power: bool,
    pub color: Rgbw,
    pub effect: Effect,
    pub delay: u8,
    pub repetitions: u8,
    pub pause: u8,
    pub timer_minutes: u16,
    pub timer_armed: bool,
    pub timer_armed_at: Option<DateTime<Utc>>,
}

impl Default for DesiredConfiguration {
    fn default() -> Self {
        Self {
            power: false,
            color: Rgbw::OFF,
            effect: Effect::Light,
            delay: DEFAULT_EFFECT_DELAY,
            repetitions: 0,
            pause: 0,
            timer_minutes: 0,
            timer_armed: false,
            timer_armed_at: None,
        }
    }
}

impl DesiredConfiguration {
    pub fn effect_params(&self) -> EffectParams {
        EffectParams {
            effect: self.effect,
            repetitions: self.repetitions,
            delay: self.delay,
            pause: self.pause,
        }
    }

    /// Merge `update` into a copy of `self`. Absent fields keep their value;
    /// an absent color falls back to the last desired color, then to what the
    /// device was last seen showing.
    pub fn merged(&self, update: &LightUpdate, observed: &DeviceState) -> DesiredConfiguration {
        let fallback = if self.color.is_off() {
            observed.rgbw()
        } else {
            self.color
        };
        DesiredConfiguration {
            color: update.color.unwrap_or(fallback),
            effect: update.effect.unwrap_or(self.effect),
            delay: update.delay.unwrap_or(self.delay),
            repetitions: update.repetitions.unwrap_or(self.repetitions),
            pause: update.pause.unwrap_or(self.pause),
            timer_minutes: update.timer_minutes.unwrap_or(self.timer_minutes),
            ..self.clone()
        }
    }

    /// Whole minutes left on an armed timer at `now`, `None` once it has run out
    pub fn remaining_timer_minutes(&self, now: DateTime<Utc>) -> Option<u16> {
        if !self.timer_armed || self.timer_minutes == 0 {
            return None;
        }
        let elapsed = self
            .timer_armed_at
            .map(|armed_at| (now - armed_at).num_minutes().max(0))
            .unwrap_or(0);
        let remaining = i64::from(self.timer_minutes) - elapsed;
        (remaining > 0).then(|| remaining as u16)
    }
}

/// Partial update for [`crate::CandleSession::set_light`]; `None` leaves a
/// field as it was.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightUpdate {
    pub color: Option<Rgbw>,
    pub effect: Option<Effect>,
    pub delay: Option<u8>,
    pub repetitions: Option<u8>,
    pub pause: Option<u8>,
    /// `Some(0)` disarms the timer
    pub timer_minutes: Option<u16>,
}

impl LightUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color(mut self, color: Rgbw) -> Self {
        self.color = Some(color);
        self
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn delay(mut self, delay: u8) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn repetitions(mut self, repetitions: u8) -> Self {
        self.repetitions = Some(repetitions);
        self
    }

    pub fn pause(mut self, pause: u8) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn timer_minutes(mut self, minutes: u16) -> Self {
        self.timer_minutes = Some(minutes);
        self
    }
}

/// Decides when a refresh also reads the battery characteristic.
///
/// Always read on a new link, on a power change, and while the light is on.
/// While it stays off, read on every `every`th refresh only.
#[derive(Debug, Clone)]
pub struct BatteryCadence {
    every: u32,
    skipped: u32,
}

impl BatteryCadence {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            skipped: 0,
        }
    }

    pub fn should_read(&mut self, outcome: ConnectionOutcome, was_on: bool, is_on: bool) -> bool {
        if outcome != ConnectionOutcome::Reused || was_on != is_on || is_on {
            self.skipped = 0;
            return true;
        }
        self.skipped += 1;
        if self.skipped >= self.every {
            self.skipped = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn should_ignore_timestamp_when_comparing_observations() {
        let a = DeviceState::default();
        let b = DeviceState {
            updated_at: Some(Utc::now()),
            ..DeviceState::default()
        };
        assert!(a.same_observation(&b));
        assert!(!a.same_observation(&a.with_light(true, Rgbw::new(1, 0, 0, 0))));
    }

    #[test]
    fn should_keep_unset_fields_when_merging() {
        let desired = DesiredConfiguration {
            power: true,
            color: Rgbw::new(10, 20, 30, 40),
            effect: Effect::Candle,
            ..DesiredConfiguration::default()
        };

        let merged = desired.merged(&LightUpdate::new().pause(9), &DeviceState::default());
        assert_eq!(merged.color, Rgbw::new(10, 20, 30, 40));
        assert_eq!(merged.effect, Effect::Candle);
        assert_eq!(merged.delay, DEFAULT_EFFECT_DELAY);
        assert_eq!(merged.pause, 9);
    }

    #[test]
    fn should_fall_back_to_observed_color_when_nothing_was_desired() {
        let observed = DeviceState::default().with_light(true, Rgbw::new(0, 0, 0, 200));
        let merged = DesiredConfiguration::default()
            .merged(&LightUpdate::new().effect(Effect::Pulse), &observed);
        assert_eq!(merged.color, Rgbw::new(0, 0, 0, 200));
    }

    #[test]
    fn should_count_down_remaining_timer_minutes() {
        let armed_at = Utc::now();
        let desired = DesiredConfiguration {
            timer_minutes: 30,
            timer_armed: true,
            timer_armed_at: Some(armed_at),
            ..DesiredConfiguration::default()
        };
        assert_eq!(desired.remaining_timer_minutes(armed_at), Some(30));
        assert_eq!(
            desired.remaining_timer_minutes(armed_at + Duration::minutes(12)),
            Some(18)
        );
        assert_eq!(
            desired.remaining_timer_minutes(armed_at + Duration::minutes(30)),
            None
        );
    }

    #[test]
    fn should_read_battery_on_cadence_while_off() {
        let mut cadence = BatteryCadence::new(3);
        let reads: Vec<bool> = (0..6)
            .map(|_| cadence.should_read(ConnectionOutcome::Reused, false, false))
            .collect();
        assert_eq!(reads, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn should_always_read_battery_on_new_link_or_power_change() {
        let mut cadence = BatteryCadence::new(3);
        assert!(cadence.should_read(ConnectionOutcome::FreshConnection, false, false));
        assert!(cadence.should_read(ConnectionOutcome::Reconnected, false, false));
        assert!(cadence.should_read(ConnectionOutcome::Reused, false, true));
        assert!(cadence.should_read(ConnectionOutcome::Reused, true, true));
        assert!(!cadence.should_read(ConnectionOutcome::Reused, false, false));
    }

    #[test]
    fn should_join_model_and_serial() {
        let identity = DeviceIdentity {
            model: Some("BTL300".into()),
            serial: Some("0042".into()),
            ..DeviceIdentity::default()
        };
        assert_eq!(identity.display_model().as_deref(), Some("BTL300 0042"));
    }
}
