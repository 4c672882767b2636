//! Owns the GATT link of one candle.
//!
//! The manager connects with retry and a timeout, resolves capabilities and
//! reads the identity once per connection, and closes the link again after a
//! quiet period. Disconnect callbacks from the platform layer only flip flags:
//! the link's own `alive` flag and, for drops nobody asked for, the session's
//! [`ResyncTracker`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capabilities::{Capability, CapabilitySet, IdentityField};
use crate::codec;
use crate::config::SessionConfig;
use crate::gatt::{BleLink, BleTransport, DisconnectCallback};
use crate::resync::ResyncTracker;
use crate::state::DeviceIdentity;
use crate::{Error, Result};

/// How `ensure_connected` obtained the link it hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// A new link, and nothing was lost unexpectedly before it: the first
    /// connection of the session, or one after an idle/explicit disconnect.
    FreshConnection,
    /// The existing link was still up.
    Reused,
    /// The previous link dropped unexpectedly and the resync it requires has
    /// not completed yet.
    Reconnected,
}

/// Flags the disconnect callback of one link shares with the manager
#[derive(Debug, Default)]
struct LinkStatus {
    alive: AtomicBool,
    /// Set before any locally initiated disconnect
    closing: AtomicBool,
}

impl LinkStatus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct ActiveLink {
    link: Box<dyn BleLink>,
    status: Arc<LinkStatus>,
    capabilities: CapabilitySet,
    identity: DeviceIdentity,
}

/// Connection lifecycle of one session
pub struct ConnectionManager {
    address: String,
    transport: Arc<dyn BleTransport>,
    config: SessionConfig,
    resync: Arc<ResyncTracker>,
    active: Mutex<Option<Arc<ActiveLink>>>,
    /// Serializes connect and teardown; independent of the command lock
    connection_lock: tokio::sync::Mutex<()>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every arm so a stale timer can tell it was superseded
    timer_epoch: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        address: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        config: SessionConfig,
        resync: Arc<ResyncTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            transport,
            config,
            resync,
            active: Mutex::new(None),
            connection_lock: tokio::sync::Mutex::new(()),
            idle_timer: Mutex::new(None),
            timer_epoch: AtomicU64::new(0),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a link is currently held and has not reported a drop
    pub fn is_connected(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| active.status.is_alive())
    }

    /// Capabilities of the current connection, empty while disconnected
    pub fn capabilities(&self) -> CapabilitySet {
        self.current()
            .map(|active| active.capabilities.clone())
            .unwrap_or_default()
    }

    /// Identity read when the current link was opened, `None` once it dropped
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.current()
            .filter(|active| active.status.is_alive())
            .map(|active| active.identity.clone())
    }

    /// Make sure a live link exists, connecting if needed, and restart the
    /// idle-disconnect countdown.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<ConnectionOutcome> {
        if let Some(outcome) = self.reuse_live_link().await {
            return Ok(outcome);
        }

        debug!("Connection locked {}", self.connection_lock.try_lock().is_err());
        let _guard = self.connection_lock.lock().await;

        // Another caller may have connected while we waited for the lock.
        if let Some(outcome) = self.reuse_live_link().await {
            return Ok(outcome);
        }

        self.discard_stale_link().await;

        let active = self.connect_with_retry().await?;
        info!(
            "Connected to {} ({})",
            self.address,
            active
                .identity
                .display_model()
                .unwrap_or_else(|| "unknown model".into())
        );
        *self.active.lock() = Some(Arc::new(active));
        self.arm_idle_timer();

        Ok(if self.resync.needs_resync() {
            ConnectionOutcome::Reconnected
        } else {
            ConnectionOutcome::FreshConnection
        })
    }

    /// Close the link on purpose. The next operation connects from scratch.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn disconnect(&self) {
        self.cancel_idle_timer();
        let _guard = self.connection_lock.lock().await;
        self.close_link().await;
    }

    /// Read the characteristic behind `capability` on the current link
    pub async fn read(&self, capability: Capability) -> Result<Vec<u8>> {
        let active = self.require_link()?;
        let handle = active.capabilities.require(capability)?;
        match active.link.read(handle).await {
            Ok(bytes) => {
                trace!("Read {} <- {:02x?}", capability, bytes);
                Ok(bytes)
            }
            Err(e) => Err(self.link_failed(&active, capability, e)),
        }
    }

    /// Write `frame` to the characteristic behind `capability`
    pub async fn write(&self, capability: Capability, frame: &[u8]) -> Result<()> {
        let active = self.require_link()?;
        let handle = active.capabilities.require(capability)?;
        trace!("Write {} -> {:02x?}", capability, frame);
        active
            .link
            .write(handle, frame)
            .await
            .map_err(|e| self.link_failed(&active, capability, e))
    }

    fn current(&self) -> Option<Arc<ActiveLink>> {
        self.active.lock().clone()
    }

    fn require_link(&self) -> Result<Arc<ActiveLink>> {
        self.current()
            .filter(|active| active.status.is_alive())
            .ok_or_else(|| Error::LinkLost("not connected".into()))
    }

    async fn reuse_live_link(self: &Arc<Self>) -> Option<ConnectionOutcome> {
        let active = self.current()?;
        if !active.status.is_alive() {
            return None;
        }
        // Arm before probing so an idle timer racing this access stands down.
        self.arm_idle_timer();
        if !active.link.is_connected().await || !active.status.is_alive() {
            return None;
        }
        Some(if self.resync.needs_resync() {
            ConnectionOutcome::Reconnected
        } else {
            ConnectionOutcome::Reused
        })
    }

    /// Drop a link that went away without telling us through its callback.
    async fn discard_stale_link(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        if !active.status.is_closing() && self.resync.link_lost() {
            warn!("{}: Link found dead, scheduling resync", self.address);
        }
        active.status.close();
        if let Err(e) = active.link.disconnect().await {
            debug!("Ignoring disconnect error on stale link: {}", e);
        }
    }

    fn link_failed(&self, active: &ActiveLink, capability: Capability, e: Error) -> Error {
        active.status.alive.store(false, Ordering::SeqCst);
        if active.status.is_closing() {
            debug!("{} I/O failed on a link being closed: {}", capability, e);
        } else {
            warn!("{} I/O failed, link lost: {}", capability, e);
            self.resync.link_lost();
        }
        Error::LinkLost(e.to_string())
    }

    async fn connect_with_retry(&self) -> Result<ActiveLink> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let status = LinkStatus::new();
            match time::timeout(self.config.connect_timeout, self.try_connect(&status)).await {
                Ok(Ok(active)) => return Ok(active),
                Ok(Err(e)) => {
                    status.close();
                    warn!("Connection attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    status.close();
                    warn!(
                        "Connection attempt {}/{} timed out after {:?}",
                        attempt, attempts, self.config.connect_timeout
                    );
                    last_error = format!("timed out after {:?}", self.config.connect_timeout);
                }
            }

            if attempt < attempts {
                debug!("Retrying connection in {:?}", self.config.retry_delay);
                time::sleep(self.config.retry_delay).await;
            }
        }

        error!("Failed to connect to {}: {}", self.address, last_error);
        Err(Error::ConnectionFailed {
            attempts,
            reason: last_error,
        })
    }

    async fn try_connect(&self, status: &Arc<LinkStatus>) -> Result<ActiveLink> {
        info!("Connecting to {}...", self.address);
        let link = self
            .transport
            .connect(&self.address, self.disconnect_callback(status))
            .await?;

        debug!("Discovering services...");
        let services = match link.discover_services().await {
            Ok(services) => services,
            Err(e) => {
                status.close();
                if let Err(close_err) = link.disconnect().await {
                    debug!("Ignoring disconnect error after failed discovery: {}", close_err);
                }
                return Err(e);
            }
        };

        let mut active = ActiveLink {
            link,
            status: Arc::clone(status),
            capabilities: CapabilitySet::resolve(&services),
            identity: DeviceIdentity::default(),
        };
        active.identity = self.read_identity(&active).await;
        Ok(active)
    }

    fn disconnect_callback(&self, status: &Arc<LinkStatus>) -> DisconnectCallback {
        let status = Arc::clone(status);
        let resync = Arc::clone(&self.resync);
        let address = self.address.clone();
        Arc::new(move || {
            status.alive.store(false, Ordering::SeqCst);
            if status.is_closing() {
                debug!("{}: Disconnected", address);
            } else {
                warn!("{}: Disconnected unexpectedly", address);
                resync.link_lost();
            }
        })
    }

    async fn read_identity(&self, active: &ActiveLink) -> DeviceIdentity {
        let mut identity = DeviceIdentity {
            battery_powered: active.capabilities.supports(Capability::Battery),
            has_timer: active.capabilities.supports(Capability::Timer),
            ..DeviceIdentity::default()
        };

        for (field, handle) in active.capabilities.identity_handles() {
            let value = match active.link.read(handle).await {
                Ok(bytes) => match codec::decode_identity(field.name(), &bytes) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!("Ignoring unreadable {}: {}", field.name(), e);
                        None
                    }
                },
                Err(e) => {
                    warn!("Failed to read {}: {}", field.name(), e);
                    None
                }
            };
            match field {
                IdentityField::Manufacturer => identity.manufacturer = value,
                IdentityField::HwVersion => identity.hw_version = value,
                IdentityField::SwVersion => identity.sw_version = value,
                IdentityField::Model => identity.model = value,
                IdentityField::Serial => identity.serial = value,
            }
        }

        identity
    }

    fn arm_idle_timer(self: &Arc<Self>) {
        let epoch = self.timer_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.idle_disconnect;

        let handle = tokio::spawn(async move {
            time::sleep(period).await;
            if let Some(manager) = manager.upgrade() {
                manager.idle_disconnect(epoch).await;
            }
        });

        if let Some(previous) = self.idle_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        self.timer_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.idle_timer.lock().take() {
            handle.abort();
        }
    }

    async fn idle_disconnect(&self, epoch: u64) {
        let _guard = self.connection_lock.lock().await;
        if self.timer_epoch.load(Ordering::SeqCst) != epoch {
            trace!("Idle timer superseded, keeping link");
            return;
        }
        // This is the running timer task; detach rather than abort it.
        drop(self.idle_timer.lock().take());
        debug!(
            "No access for {:?}, disconnecting",
            self.config.idle_disconnect
        );
        self.close_link().await;
    }

    async fn close_link(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        active.status.close();
        if let Err(e) = active.link.disconnect().await {
            debug!("Ignoring disconnect error: {}", e);
        }
        info!("Disconnected from {}", self.address);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.idle_timer.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("needs_resync", &self.resync.needs_resync())
            .finish()
    }
}
