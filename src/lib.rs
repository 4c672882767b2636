/*!
 # MiPow Playbulb Candle Controller Library

 A Rust library for controlling MiPow Playbulb RGBW candles over Bluetooth LE.
 A [`CandleSession`] owns the GATT link to one candle, keeps a cached copy of
 the device state, and replays the locally desired light after the link drops
 unexpectedly.

 ## Features

 * Power on/off and RGBW color control
 * Firmware effects (flash, pulse, colorloop, rainbow, candle)
 * Sleep timer arm/disarm
 * Battery level and device identity reads
 * Idle disconnect and transparent reconnect

 ## Example

 ```no_run
 use mipow_candle::*;
 use std::sync::Arc;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let transport = Arc::new(BtleplugTransport::new().await?);
     let session = CandleSession::new(
         "AA:BB:CC:DD:EE:FF",
         "Candle",
         transport,
         SessionConfig::default(),
     );

     session.refresh().await?;
     session
         .set_light(LightUpdate::new().color(Rgbw::new(255, 80, 0, 0)).effect(Effect::Candle))
         .await?;

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the candle controller library
#[derive(Error, Debug)]
pub enum Error {
    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoBluetoothAdapters,

    /// The requested peripheral never showed up during scanning
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    /// Connecting (or reconnecting) exhausted its retry budget
    #[error("Connection failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed { attempts: u8, reason: String },

    /// The device does not expose a characteristic the operation needs
    #[error("Operation requires the {0} capability, which this device lacks")]
    Unsupported(Capability),

    /// A read returned bytes the codec cannot interpret
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// The link failed in the middle of an operation
    #[error("BLE link lost: {0}")]
    LinkLost(String),

    /// Value out of range
    #[error("Value {0} out of range ({1}..{2})")]
    ValueOutOfRange(u32, u32, u32),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlugError(#[from] btleplug::Error),
}

/// Details about why a frame could not be encoded or decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame has a fixed size and the payload does not match it.
    #[error("{frame} frame must be {expected} bytes, got {actual}")]
    WrongLength {
        /// Frame name (e.g. "rgbw", "timer").
        frame: &'static str,
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// A read returned no bytes at all.
    #[error("{frame} frame is empty")]
    Empty {
        /// Frame name.
        frame: &'static str,
    },

    /// A text characteristic did not contain valid UTF-8.
    #[error("{frame} is not valid UTF-8")]
    InvalidText {
        /// Frame name.
        frame: &'static str,
    },

    /// A decoded field holds a value outside its documented range.
    #[error("{frame} field value {value} exceeds {max}")]
    OutOfRange {
        /// Frame name.
        frame: &'static str,
        /// Value received.
        value: u32,
        /// Largest accepted value.
        max: u32,
    },
}

impl Error {
    /// Whether this failure counts toward the advisory failed-update streak.
    ///
    /// Caller mistakes and missing capabilities are deterministic and never
    /// say anything about reachability.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::Unsupported(_) | Error::ValueOutOfRange(..))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod connection;
pub mod effects;
pub mod gatt;
pub mod observer;
pub mod platform;
pub mod resync;
pub mod session;
pub mod state;

// Re-export key types
pub use capabilities::{Capability, CapabilitySet, CharacteristicHandle};
pub use codec::Rgbw;
pub use config::SessionConfig;
pub use connection::{ConnectionManager, ConnectionOutcome};
pub use effects::Effect;
pub use gatt::{BleLink, BleTransport, DisconnectCallback, GattCharacteristic, GattService};
pub use observer::{ObserverRegistry, Subscription};
pub use platform::{BtleplugTransport, DiscoveredCandle};
pub use resync::{ResyncTracker, SyncState};
pub use session::CandleSession;
pub use state::{DesiredConfiguration, DeviceIdentity, DeviceState, LightUpdate};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_wrong_length_frame_error() {
        let err = Error::from(FrameError::WrongLength {
            frame: "rgbw",
            expected: 4,
            actual: 3,
        });
        assert_eq!(
            err.to_string(),
            "Malformed frame: rgbw frame must be 4 bytes, got 3"
        );
    }

    #[test]
    fn should_display_unsupported_capability() {
        let err = Error::Unsupported(Capability::Timer);
        assert_eq!(
            err.to_string(),
            "Operation requires the timer capability, which this device lacks"
        );
    }

    #[test]
    fn should_not_count_caller_errors_as_transient() {
        assert!(!Error::Unsupported(Capability::Effect).is_transient());
        assert!(!Error::ValueOutOfRange(2000, 0, 1439).is_transient());
        assert!(Error::LinkLost("gone".into()).is_transient());
        assert!(Error::ConnectionFailed {
            attempts: 3,
            reason: "timeout".into()
        }
        .is_transient());
    }
}
