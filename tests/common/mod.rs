//! Scripted in-memory candle for exercising sessions without a radio.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use mipow_candle::capabilities::{
    BATTERY_CHAR, EFFECT_CHAR, MANUFACTURER_CHAR, MODEL_CHAR, RGBW_CHAR, SERIAL_CHAR, TIMER_CHAR,
};
use mipow_candle::{
    BleLink, BleTransport, CharacteristicHandle, DisconnectCallback, Error, GattCharacteristic,
    GattService, Result, SessionConfig,
};
use parking_lot::Mutex;
use uuid::Uuid;

pub const MODEL: &str = "MIPOW SMART CANDLE";
pub const SERIAL: &str = "BTL300";

#[derive(Default)]
struct Script {
    characteristics: Vec<GattCharacteristic>,
    values: HashMap<Uuid, Vec<u8>>,
    writes: Vec<(Uuid, Vec<u8>)>,
    reads: Vec<Uuid>,
    connect_attempts: usize,
    failing_connects: usize,
    fail_io: bool,
    io_delay: Duration,
    connect_delay: Duration,
    /// Bumped on every successful connect
    generation: u64,
    connected: bool,
    on_disconnect: Option<DisconnectCallback>,
}

/// Shared handle to one fake candle; clones see the same device
#[derive(Clone, Default)]
pub struct FakeCandle {
    script: Arc<Mutex<Script>>,
}

impl FakeCandle {
    /// A candle exposing every characteristic a session knows about
    pub fn full() -> Self {
        let rw = CharPropFlags::READ | CharPropFlags::WRITE;
        let read = CharPropFlags::READ;
        let candle = Self::default();
        {
            let mut script = candle.script.lock();
            script.characteristics = vec![
                GattCharacteristic::new(RGBW_CHAR, rw),
                GattCharacteristic::new(EFFECT_CHAR, rw),
                GattCharacteristic::new(TIMER_CHAR, rw),
                GattCharacteristic::new(BATTERY_CHAR, read),
                GattCharacteristic::new(MANUFACTURER_CHAR, read),
                GattCharacteristic::new(MODEL_CHAR, read),
                GattCharacteristic::new(SERIAL_CHAR, read),
            ];
            script.values.insert(RGBW_CHAR, vec![0, 0, 0, 0]);
            script.values.insert(BATTERY_CHAR, vec![87]);
            script.values.insert(MANUFACTURER_CHAR, b"MIPOW".to_vec());
            script.values.insert(MODEL_CHAR, MODEL.as_bytes().to_vec());
            script.values.insert(SERIAL_CHAR, format!("{SERIAL}\0\0").into_bytes());
        }
        candle
    }

    /// Remove a characteristic from service discovery
    pub fn without(self, uuid: Uuid) -> Self {
        self.script
            .lock()
            .characteristics
            .retain(|characteristic| characteristic.uuid != uuid);
        self
    }

    pub fn transport(&self) -> Arc<dyn BleTransport> {
        Arc::new(FakeTransport {
            candle: self.clone(),
        })
    }

    pub fn set_value(&self, uuid: Uuid, bytes: &[u8]) {
        self.script.lock().values.insert(uuid, bytes.to_vec());
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.script.lock().writes.clone()
    }

    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|(target, _)| *target == uuid)
            .map(|(_, bytes)| bytes)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.script.lock().writes.clear();
    }

    pub fn reads_of(&self, uuid: Uuid) -> usize {
        self.script
            .lock()
            .reads
            .iter()
            .filter(|target| **target == uuid)
            .count()
    }

    pub fn connect_attempts(&self) -> usize {
        self.script.lock().connect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.script.lock().connected
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.script.lock().failing_connects = count;
    }

    pub fn fail_io(&self, fail: bool) {
        self.script.lock().fail_io = fail;
    }

    pub fn set_io_delay(&self, delay: Duration) {
        self.script.lock().io_delay = delay;
    }

    /// Make every connect attempt take `delay` before it answers
    pub fn set_connect_delay(&self, delay: Duration) {
        self.script.lock().connect_delay = delay;
    }

    /// The candle walks out of range: the link drops without anyone asking
    pub fn drop_link(&self) {
        let callback = {
            let mut script = self.script.lock();
            script.connected = false;
            script.on_disconnect.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Someone pressed the button on the device, or it rebooted
    pub fn reset_color(&self) {
        self.set_value(RGBW_CHAR, &[0, 0, 0, 0]);
    }

    fn is_current(&self, generation: u64) -> bool {
        let script = self.script.lock();
        script.connected && script.generation == generation
    }

    async fn io_delay(&self) -> Result<()> {
        let (delay, fail) = {
            let script = self.script.lock();
            (script.io_delay, script.fail_io)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::LinkLost("injected I/O failure".into()));
        }
        Ok(())
    }
}

struct FakeTransport {
    candle: FakeCandle,
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn connect(
        &self,
        _address: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Box<dyn BleLink>> {
        let delay = {
            let mut script = self.candle.script.lock();
            script.connect_attempts += 1;
            script.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.candle.script.lock();
        if script.failing_connects > 0 {
            script.failing_connects -= 1;
            return Err(Error::DeviceNotFound("out of range".into()));
        }
        script.generation += 1;
        script.connected = true;
        script.on_disconnect = Some(on_disconnect);
        Ok(Box::new(FakeLink {
            candle: self.candle.clone(),
            generation: script.generation,
        }))
    }
}

struct FakeLink {
    candle: FakeCandle,
    generation: u64,
}

#[async_trait]
impl BleLink for FakeLink {
    async fn is_connected(&self) -> bool {
        self.candle.is_current(self.generation)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        Ok(vec![GattService {
            uuid: Uuid::from_u128(0xff02_0000_1000_8000_0080_5f9b_34fb),
            characteristics: self.candle.script.lock().characteristics.clone(),
        }])
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        self.candle.io_delay().await?;
        let mut script = self.candle.script.lock();
        script.reads.push(handle.uuid);
        Ok(script.values.get(&handle.uuid).cloned().unwrap_or_default())
    }

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        self.candle.io_delay().await?;
        let mut script = self.candle.script.lock();
        script.writes.push((handle.uuid, data.to_vec()));
        if handle.uuid == RGBW_CHAR {
            script.values.insert(RGBW_CHAR, data.to_vec());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.candle.is_current(self.generation) {
            // Platforms report requested disconnects through the callback too.
            self.candle.drop_link();
        }
        Ok(())
    }
}

/// Fast retries so failure paths do not slow the suite down
pub fn test_config() -> SessionConfig {
    SessionConfig {
        connect_attempts: 3,
        connect_timeout: Duration::from_secs(1),
        retry_delay: Duration::from_millis(1),
        ..SessionConfig::default()
    }
}
