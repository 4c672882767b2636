/*!
 # Effect modes for the candle

 The firmware animates the light itself once an effect frame is written.
 The numeric ids are the device's contract and must not be renumbered.
*/

use std::fmt;
use std::str::FromStr;

/// Firmware-driven animation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Effect {
    /// Hard on/off flashing
    Flash,
    /// Fade in and out of the current color
    Pulse,
    /// Jump between red, green and blue
    Colorloop,
    /// Crossfade through red, green and blue
    Rainbow,
    /// Flickering candle
    Candle,
    /// Static light, no effect frame is sent
    #[default]
    Light,
}

/// All effects in id order, static light last.
pub const EFFECTS: [Effect; 6] = [
    Effect::Flash,
    Effect::Pulse,
    Effect::Colorloop,
    Effect::Rainbow,
    Effect::Candle,
    Effect::Light,
];

/// Id the firmware uses for "no effect".
pub const STATIC_LIGHT_ID: u8 = 255;

impl Effect {
    /// Wire id of the effect
    pub fn id(self) -> u8 {
        match self {
            Effect::Flash => 0,
            Effect::Pulse => 1,
            Effect::Colorloop => 2,
            Effect::Rainbow => 3,
            Effect::Candle => 4,
            Effect::Light => STATIC_LIGHT_ID,
        }
    }

    /// Resolve a wire id, `None` for ids the firmware does not define
    pub fn from_id(id: u8) -> Option<Effect> {
        EFFECTS.into_iter().find(|effect| effect.id() == id)
    }

    /// Whether selecting this effect requires writing the effect characteristic
    pub fn is_animated(self) -> bool {
        self != Effect::Light
    }

    /// Lowercase name used by the CLI and daemon
    pub fn name(self) -> &'static str {
        match self {
            Effect::Flash => "flash",
            Effect::Pulse => "pulse",
            Effect::Colorloop => "colorloop",
            Effect::Rainbow => "rainbow",
            Effect::Candle => "candle",
            Effect::Light => "light",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when an effect name is not one of [`EFFECTS`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown effect '{0}'")]
pub struct UnknownEffect(pub String);

impl FromStr for Effect {
    type Err = UnknownEffect;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "flash" => Ok(Effect::Flash),
            "pulse" | "fade" => Ok(Effect::Pulse),
            "colorloop" | "jump" | "jump_rgb" => Ok(Effect::Colorloop),
            "rainbow" | "fade_rgb" => Ok(Effect::Rainbow),
            "candle" => Ok(Effect::Candle),
            "light" | "none" | "static" => Ok(Effect::Light),
            _ => Err(UnknownEffect(value.to_string())),
        }
    }
}
