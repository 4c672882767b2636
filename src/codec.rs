//! Fixed-layout frames exchanged with the candle's GATT characteristics.
//!
//! Everything here is pure: encoders build byte arrays, decoders validate the
//! length before touching any index and report [`FrameError`] otherwise.

use crate::capabilities::Capability;
use crate::effects::Effect;
use crate::{Error, FrameError, Result};

pub const RGBW_FRAME_LEN: usize = 4;
pub const EFFECT_FRAME_LEN: usize = 8;
pub const TIMER_FRAME_LEN: usize = 13;

/// Timer action byte that schedules the channel.
pub const TIMER_ACTION_ARM: u8 = 2;
/// Timer action byte that clears the channel.
pub const TIMER_ACTION_DISARM: u8 = 4;

/// Longest timer the hour/minute end fields can express without wrapping a day.
pub const MAX_TIMER_MINUTES: u16 = 24 * 60 - 1;

const MAX_BATTERY_PERCENT: u8 = 100;

/// Red, green, blue and white channel values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgbw {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
}

impl Rgbw {
    pub const OFF: Rgbw = Rgbw::new(0, 0, 0, 0);

    pub const fn new(red: u8, green: u8, blue: u8, white: u8) -> Self {
        Self {
            red,
            green,
            blue,
            white,
        }
    }

    pub fn is_off(&self) -> bool {
        *self == Rgbw::OFF
    }
}

impl From<(u8, u8, u8, u8)> for Rgbw {
    fn from((red, green, blue, white): (u8, u8, u8, u8)) -> Self {
        Rgbw::new(red, green, blue, white)
    }
}

/// Firmware animation parameters carried by the effect frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectParams {
    pub effect: Effect,
    pub repetitions: u8,
    pub delay: u8,
    pub pause: u8,
}

/// A decoded timer characteristic frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFrame {
    pub channel: u8,
    pub action: u8,
    pub second: u8,
    pub minute_start: u8,
    pub hour_start: u8,
    pub minute_end: u8,
    pub hour_end: u8,
    pub color: Rgbw,
}

impl TimerFrame {
    pub fn is_armed(&self) -> bool {
        self.action == TIMER_ACTION_ARM
    }
}

/// An encoded write, tagged with the characteristic it goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFrame {
    Rgbw([u8; RGBW_FRAME_LEN]),
    Timer([u8; TIMER_FRAME_LEN]),
    Effect([u8; EFFECT_FRAME_LEN]),
}

impl CommandFrame {
    pub fn capability(&self) -> Capability {
        match self {
            CommandFrame::Rgbw(_) => Capability::RgbwWrite,
            CommandFrame::Timer(_) => Capability::Timer,
            CommandFrame::Effect(_) => Capability::Effect,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            CommandFrame::Rgbw(frame) => frame,
            CommandFrame::Timer(frame) => frame,
            CommandFrame::Effect(frame) => frame,
        }
    }
}

fn expect_len(frame: &'static str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(Error::MalformedFrame(FrameError::WrongLength {
            frame,
            expected,
            actual: bytes.len(),
        }));
    }
    Ok(())
}

/// `[white, red, green, blue]`
pub fn encode_rgbw(color: Rgbw) -> [u8; RGBW_FRAME_LEN] {
    [color.white, color.red, color.green, color.blue]
}

/// Reorders the device's `[white, red, green, blue]` into [`Rgbw`].
pub fn decode_rgbw(bytes: &[u8]) -> Result<Rgbw> {
    expect_len("rgbw", bytes, RGBW_FRAME_LEN)?;
    Ok(Rgbw::new(bytes[1], bytes[2], bytes[3], bytes[0]))
}

/// `[white, red, green, blue, effect, repetitions, delay, pause]`
///
/// Returns `None` for [`Effect::Light`]: static light is selected by the RGBW
/// frame alone and the effect frame must not be written.
pub fn encode_effect(color: Rgbw, params: EffectParams) -> Option<[u8; EFFECT_FRAME_LEN]> {
    if !params.effect.is_animated() {
        return None;
    }
    Some([
        color.white,
        color.red,
        color.green,
        color.blue,
        params.effect.id(),
        params.repetitions,
        params.delay,
        params.pause,
    ])
}

/// Clears `channel`; every field besides channel and action is zero.
pub fn encode_timer_disarm(channel: u8) -> [u8; TIMER_FRAME_LEN] {
    let mut frame = [0u8; TIMER_FRAME_LEN];
    frame[0] = channel;
    frame[1] = TIMER_ACTION_DISARM;
    frame
}

/// Arms `channel` to run `minutes` from now with `color` applied.
///
/// The start fields stay at zero, so the end time is relative to the moment
/// the frame is written: whole hours go into `hour_end`, the rest into
/// `minute_end`.
pub fn encode_timer_arm(channel: u8, minutes: u16, color: Rgbw) -> Result<[u8; TIMER_FRAME_LEN]> {
    if minutes == 0 || minutes > MAX_TIMER_MINUTES {
        return Err(Error::ValueOutOfRange(
            minutes.into(),
            1,
            MAX_TIMER_MINUTES.into(),
        ));
    }
    let hour_end = (minutes / 60) as u8;
    let minute_end = (minutes % 60) as u8;
    Ok([
        channel,
        TIMER_ACTION_ARM,
        0,
        0,
        0,
        0,
        minute_end,
        hour_end,
        color.white,
        color.red,
        color.green,
        color.blue,
        0,
    ])
}

pub fn decode_timer(bytes: &[u8]) -> Result<TimerFrame> {
    expect_len("timer", bytes, TIMER_FRAME_LEN)?;
    Ok(TimerFrame {
        channel: bytes[0],
        action: bytes[1],
        second: bytes[2],
        minute_start: bytes[3],
        hour_start: bytes[4],
        minute_end: bytes[6],
        hour_end: bytes[7],
        color: Rgbw::new(bytes[9], bytes[10], bytes[11], bytes[8]),
    })
}

/// First byte of the battery characteristic, as a percentage.
pub fn decode_battery(bytes: &[u8]) -> Result<u8> {
    let level = *bytes
        .first()
        .ok_or(FrameError::Empty { frame: "battery" })?;
    if level > MAX_BATTERY_PERCENT {
        return Err(FrameError::OutOfRange {
            frame: "battery",
            value: level.into(),
            max: MAX_BATTERY_PERCENT.into(),
        }
        .into());
    }
    Ok(level)
}

/// UTF-8 text of an identity characteristic, with trailing NUL padding removed.
pub fn decode_identity(frame: &'static str, bytes: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidText { frame })?;
    Ok(text.trim_end_matches('\0').to_string())
}
