//! Maps discovered characteristics onto the roles a candle session uses.
//!
//! A role is only filled when the characteristic exists *and* advertises the
//! access the session needs, so a missing handle means "unsupported" rather
//! than an I/O call bound to fail.

use std::fmt;

use btleplug::api::{CharPropFlags, WriteType};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::gatt::GattService;
use crate::{Error, Result};

/// RGBW state characteristic, `[W, R, G, B]`
pub const RGBW_CHAR: Uuid = Uuid::from_u128(0x0000_fffc_0000_1000_8000_0080_5f9b_34fb);
/// Effect characteristic, `[W, R, G, B, effect, repetitions, delay, pause]`
pub const EFFECT_CHAR: Uuid = Uuid::from_u128(0x0000_fffb_0000_1000_8000_0080_5f9b_34fb);
/// Sleep timer characteristic, 13-byte frames
pub const TIMER_CHAR: Uuid = Uuid::from_u128(0x0000_fffe_0000_1000_8000_0080_5f9b_34fb);
/// Standard battery level characteristic
pub const BATTERY_CHAR: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

pub const MANUFACTURER_CHAR: Uuid = Uuid::from_u128(0x0000_2a29_0000_1000_8000_0080_5f9b_34fb);
pub const HW_VERSION_CHAR: Uuid = Uuid::from_u128(0x0000_2a27_0000_1000_8000_0080_5f9b_34fb);
pub const SW_VERSION_CHAR: Uuid = Uuid::from_u128(0x0000_2a28_0000_1000_8000_0080_5f9b_34fb);
/// Candles report their model name under the firmware revision characteristic.
pub const MODEL_CHAR: Uuid = Uuid::from_u128(0x0000_2a26_0000_1000_8000_0080_5f9b_34fb);
pub const SERIAL_CHAR: Uuid = Uuid::from_u128(0x0000_2a25_0000_1000_8000_0080_5f9b_34fb);

/// A session-level role backed by one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    RgbwRead,
    RgbwWrite,
    Effect,
    Battery,
    Timer,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::RgbwRead => "rgbw read",
            Capability::RgbwWrite => "rgbw write",
            Capability::Effect => "effect",
            Capability::Battery => "battery",
            Capability::Timer => "timer",
        })
    }
}

/// Which access a role needs from its characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn satisfied_by(self, properties: CharPropFlags) -> bool {
        let readable = properties.contains(CharPropFlags::READ);
        let writable = properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE);
        match self {
            Access::Read => readable,
            Access::Write => writable,
            Access::ReadWrite => readable && writable,
        }
    }
}

/// A characteristic that passed the access check for its role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

impl CharacteristicHandle {
    /// Prefer acknowledged writes when the characteristic offers them
    pub fn write_type(&self) -> WriteType {
        if self.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        }
    }
}

/// Text fields of the device information service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Manufacturer,
    HwVersion,
    SwVersion,
    Model,
    Serial,
}

impl IdentityField {
    pub const ALL: [IdentityField; 5] = [
        IdentityField::Manufacturer,
        IdentityField::HwVersion,
        IdentityField::SwVersion,
        IdentityField::Model,
        IdentityField::Serial,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            IdentityField::Manufacturer => MANUFACTURER_CHAR,
            IdentityField::HwVersion => HW_VERSION_CHAR,
            IdentityField::SwVersion => SW_VERSION_CHAR,
            IdentityField::Model => MODEL_CHAR,
            IdentityField::Serial => SERIAL_CHAR,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IdentityField::Manufacturer => "manufacturer",
            IdentityField::HwVersion => "hardware version",
            IdentityField::SwVersion => "software version",
            IdentityField::Model => "model",
            IdentityField::Serial => "serial",
        }
    }
}

/// Typed handles for everything a session may touch on one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub rgbw_read: Option<CharacteristicHandle>,
    pub rgbw_write: Option<CharacteristicHandle>,
    pub effect_write: Option<CharacteristicHandle>,
    pub battery_read: Option<CharacteristicHandle>,
    pub timer_readwrite: Option<CharacteristicHandle>,
    identity: Vec<(IdentityField, CharacteristicHandle)>,
}

impl CapabilitySet {
    /// Resolve roles from a discovery result. Same input, same set.
    pub fn resolve(services: &[GattService]) -> CapabilitySet {
        let identity = IdentityField::ALL
            .into_iter()
            .filter_map(|field| {
                lookup(services, field.uuid(), Access::Read, field.name())
                    .map(|handle| (field, handle))
            })
            .collect();

        let set = CapabilitySet {
            rgbw_read: lookup(services, RGBW_CHAR, Access::Read, "rgbw"),
            rgbw_write: lookup(services, RGBW_CHAR, Access::Write, "rgbw"),
            effect_write: lookup(services, EFFECT_CHAR, Access::Write, "effect"),
            battery_read: lookup(services, BATTERY_CHAR, Access::Read, "battery"),
            timer_readwrite: lookup(services, TIMER_CHAR, Access::ReadWrite, "timer"),
            identity,
        };
        debug!(?set, "Resolved capabilities");
        set
    }

    pub fn handle(&self, capability: Capability) -> Option<&CharacteristicHandle> {
        match capability {
            Capability::RgbwRead => self.rgbw_read.as_ref(),
            Capability::RgbwWrite => self.rgbw_write.as_ref(),
            Capability::Effect => self.effect_write.as_ref(),
            Capability::Battery => self.battery_read.as_ref(),
            Capability::Timer => self.timer_readwrite.as_ref(),
        }
    }

    /// Like [`CapabilitySet::handle`] but fails fast with [`Error::Unsupported`]
    pub fn require(&self, capability: Capability) -> Result<&CharacteristicHandle> {
        self.handle(capability)
            .ok_or(Error::Unsupported(capability))
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.handle(capability).is_some()
    }

    /// Readable identity characteristics, in [`IdentityField::ALL`] order
    pub fn identity_handles(&self) -> impl Iterator<Item = (IdentityField, &CharacteristicHandle)> {
        self.identity.iter().map(|(field, handle)| (*field, handle))
    }
}

fn lookup(
    services: &[GattService],
    uuid: Uuid,
    access: Access,
    role: &str,
) -> Option<CharacteristicHandle> {
    let Some(characteristic) = services
        .iter()
        .flat_map(|service| service.characteristics.iter())
        .find(|c| c.uuid == uuid)
    else {
        debug!("Characteristic {} ({}) not present", uuid, role);
        return None;
    };

    if !access.satisfied_by(characteristic.properties) {
        warn!(
            "Characteristic {} ({}) lacks {:?} access (properties: {:?}), treating as unsupported",
            uuid, role, access, characteristic.properties
        );
        return None;
    }

    Some(CharacteristicHandle {
        uuid: characteristic.uuid,
        properties: characteristic.properties,
    })
}
