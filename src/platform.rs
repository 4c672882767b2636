//! btleplug-backed implementation of the [`crate::gatt`] traits.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capabilities::CharacteristicHandle;
use crate::gatt::{BleLink, BleTransport, DisconnectCallback, GattCharacteristic, GattService};
use crate::{Error, Result};

const ZERO_ADDRESS: &str = "00:00:00:00:00:00";

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            error!("No Bluetooth adapters found");
            Error::NoBluetoothAdapters
        })?;
    debug!("Using Bluetooth adapter");
    Ok(adapter)
}

/// Cleanup spawned onto the runtime if dropped while still armed.
///
/// Connect attempts run under a timeout and may be cancelled at any await;
/// this is what undoes their side effects on the adapter.
struct Release {
    cleanup: Option<BoxFuture<'static, ()>>,
}

impl Release {
    fn new(cleanup: BoxFuture<'static, ()>) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(&mut self) {
        self.cleanup = None;
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(cleanup);
            }
            Err(_) => debug!("No runtime left to release BLE resources"),
        }
    }
}

/// An active scan, stopped on drop unless stopped explicitly
struct ScanGuard {
    adapter: Adapter,
    release: Release,
}

impl ScanGuard {
    async fn start(adapter: &Adapter) -> Result<Self> {
        adapter.start_scan(ScanFilter::default()).await?;
        let abandoned = adapter.clone();
        Ok(Self {
            adapter: adapter.clone(),
            release: Release::new(
                async move {
                    if let Err(e) = abandoned.stop_scan().await {
                        debug!("Failed to stop abandoned scan: {}", e);
                    }
                }
                .boxed(),
            ),
        })
    }

    async fn stop(mut self) -> Result<()> {
        self.release.disarm();
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

/// Peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCandle {
    /// MAC address, or the platform id where the OS hides the address
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Address callers should use for `peripheral`
fn peripheral_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address().to_string();
    if address == ZERO_ADDRESS {
        peripheral.id().to_string()
    } else {
        address
    }
}

fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || peripheral.id().to_string().eq_ignore_ascii_case(address)
}

/// Connects through the first local Bluetooth adapter
pub struct BtleplugTransport {
    adapter: Adapter,
    /// How long `connect` scans for a peripheral it has not seen yet
    pub scan_timeout: Duration,
}

impl BtleplugTransport {
    #[instrument]
    pub async fn new() -> Result<Self> {
        info!("Initializing BLE transport");
        let manager = Manager::new().await?;
        let adapter = get_central(&manager).await?;
        Ok(Self {
            adapter,
            scan_timeout: Duration::from_secs(10),
        })
    }

    /// Scan for `duration` and list everything that advertised a name
    #[instrument(skip(self))]
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredCandle>> {
        info!("Scanning for BLE devices for {:?}...", duration);
        let scan = ScanGuard::start(&self.adapter).await?;
        time::sleep(duration).await;
        scan.stop().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            if props.local_name.is_none() {
                continue;
            }
            found.push(DiscoveredCandle {
                address: peripheral_address(&peripheral),
                name: props.local_name,
                rssi: props.rssi,
            });
        }
        found.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        debug!("Found {} named BLE peripherals", found.len());
        Ok(found)
    }

    /// Find the peripheral with a given MAC address or platform id,
    /// scanning for it if the adapter has not seen it yet
    #[instrument(skip(self))]
    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| matches_address(p, address))
        {
            return Ok(peripheral);
        }

        info!("Scanning for {}...", address);
        let scan = ScanGuard::start(&self.adapter).await?;
        let start_time = std::time::Instant::now();

        while start_time.elapsed() < self.scan_timeout {
            let peripherals = self.adapter.peripherals().await?;
            trace!("Found {} BLE peripherals so far", peripherals.len());
            if let Some(peripheral) = peripherals.into_iter().find(|p| matches_address(p, address)) {
                scan.stop().await?;
                return Ok(peripheral);
            }
            time::sleep(Duration::from_millis(500)).await;
        }

        scan.stop().await?;
        error!(
            "Device {} not found within {} seconds",
            address,
            self.scan_timeout.as_secs()
        );
        Err(Error::DeviceNotFound(address.to_string()))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Box<dyn BleLink>> {
        let peripheral = self.find_peripheral(address).await?;

        // Subscribe before connecting so an early drop is not missed.
        let mut events = self.adapter.events().await?;
        let id = peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        on_disconnect();
                        break;
                    }
                }
            }
        });

        // Owned from here on, so a cancelled attempt still tears the link down.
        let abandoned = peripheral.clone();
        let link = BtleplugLink {
            peripheral,
            watcher,
            release: Mutex::new(Release::new(
                async move {
                    if let Err(e) = abandoned.disconnect().await {
                        warn!("Failed to release abandoned link: {}", e);
                    }
                }
                .boxed(),
            )),
        };
        if !link.peripheral.is_connected().await? {
            link.peripheral.connect().await?;
        }
        Ok(Box::new(link))
    }
}

/// A connected btleplug peripheral
pub struct BtleplugLink {
    peripheral: Peripheral,
    watcher: JoinHandle<()>,
    /// Disconnects a link dropped without `disconnect`
    release: Mutex<Release>,
}

impl BtleplugLink {
    fn characteristic(&self, handle: &CharacteristicHandle) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid)
            .ok_or_else(|| Error::LinkLost(format!("characteristic {} vanished", handle.uuid)))
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(GattCharacteristic::from)
                    .collect(),
            })
            .collect())
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(handle)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        self.peripheral
            .write(&characteristic, data, handle.write_type())
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.release.lock().disarm();
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn should_run_cleanup_when_dropped_armed() {
        let (done, finished) = oneshot::channel();
        drop(Release::new(
            async move {
                let _ = done.send(());
            }
            .boxed(),
        ));
        assert!(finished.await.is_ok());
    }

    #[tokio::test]
    async fn should_skip_cleanup_once_disarmed() {
        let (done, finished) = oneshot::channel::<()>();
        let mut release = Release::new(
            async move {
                let _ = done.send(());
            }
            .boxed(),
        );
        release.disarm();
        drop(release);
        assert!(finished.await.is_err());
    }
}
