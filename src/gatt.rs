//! The platform BLE layer as seen by a session.
//!
//! [`BleTransport`] opens links and [`BleLink`] performs GATT I/O on one of
//! them. The btleplug implementation lives in [`crate::platform`]; tests plug
//! in a scripted transport.

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use uuid::Uuid;

use crate::capabilities::CharacteristicHandle;
use crate::Result;

/// Invoked by the platform layer when a link goes down, whoever initiated it.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, properties: CharPropFlags) -> Self {
        Self { uuid, properties }
    }
}

impl From<&btleplug::api::Characteristic> for GattCharacteristic {
    fn from(characteristic: &btleplug::api::Characteristic) -> Self {
        Self::new(characteristic.uuid, characteristic.properties)
    }
}

/// A primary service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Opens links to peripherals by address
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Connect to `address`. `on_disconnect` must be called once when this
    /// link drops, including drops the caller asked for.
    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Box<dyn BleLink>>;
}

/// GATT operations on one live connection
#[async_trait]
pub trait BleLink: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn discover_services(&self) -> Result<Vec<GattService>>;

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>>;

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
