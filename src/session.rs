//! One candle, one session.
//!
//! Every mutating operation takes the command lock for its whole duration,
//! BLE I/O included, so the byte sequences of two commands never interleave
//! and observers only ever see the result of a complete operation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Capability, CapabilitySet};
use crate::codec::{self, CommandFrame, Rgbw, MAX_TIMER_MINUTES};
use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionOutcome};
use crate::effects::Effect;
use crate::gatt::BleTransport;
use crate::observer::{ObserverRegistry, Subscription};
use crate::platform::BtleplugTransport;
use crate::resync::{self, ResyncTracker, SyncState};
use crate::state::{BatteryCadence, DesiredConfiguration, DeviceIdentity, DeviceState, LightUpdate};
use crate::{Error, Result};

/// Bookkeeping that only the command holder touches
struct CommandContext {
    battery: BatteryCadence,
}

/// Connection, cached state and desired configuration of a single candle
pub struct CandleSession {
    address: String,
    name: String,
    config: SessionConfig,
    connection: Arc<ConnectionManager>,
    resync: Arc<ResyncTracker>,
    command_lock: Mutex<CommandContext>,
    /// Written only while `command_lock` is held
    state: RwLock<DeviceState>,
    /// Written only while `command_lock` is held
    desired: RwLock<DesiredConfiguration>,
    observers: ObserverRegistry,
    failures: AtomicU32,
}

impl CandleSession {
    /// Creates a session. Nothing is connected until the first operation.
    pub fn new(
        address: impl Into<String>,
        name: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        config: SessionConfig,
    ) -> Self {
        let address = address.into();
        let resync = Arc::new(ResyncTracker::new());
        let connection = ConnectionManager::new(
            address.clone(),
            transport,
            config.clone(),
            Arc::clone(&resync),
        );
        Self {
            address,
            name: name.into(),
            command_lock: Mutex::new(CommandContext {
                battery: BatteryCadence::new(config.battery_cadence),
            }),
            config,
            connection,
            resync,
            state: RwLock::new(DeviceState::default()),
            desired: RwLock::new(DesiredConfiguration::default()),
            observers: ObserverRegistry::new(),
            failures: AtomicU32::new(0),
        }
    }

    /// Creates a session on the first local Bluetooth adapter
    #[instrument]
    pub async fn with_btleplug(address: &str, name: &str) -> Result<Self> {
        let transport = Arc::new(BtleplugTransport::new().await?);
        Ok(Self::new(address, name, transport, SessionConfig::default()))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Display name, falling back to the address
    pub fn name(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }

    /// Last known power state
    pub fn is_on(&self) -> bool {
        self.state.read().power
    }

    /// Last known color registers
    pub fn rgbw(&self) -> Rgbw {
        self.state.read().rgbw()
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.state.read().battery_level
    }

    /// Snapshot of the last known state. Stale while [`Self::needs_resync`].
    pub fn state(&self) -> DeviceState {
        self.state.read().clone()
    }

    /// Identity of the current connection, `None` while disconnected
    pub fn device_identity(&self) -> Option<DeviceIdentity> {
        self.connection.identity()
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.connection.capabilities()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn desired(&self) -> DesiredConfiguration {
        self.desired.read().clone()
    }

    pub fn effect(&self) -> Effect {
        self.desired.read().effect
    }

    pub fn delay(&self) -> u8 {
        self.desired.read().delay
    }

    pub fn repetitions(&self) -> u8 {
        self.desired.read().repetitions
    }

    pub fn pause(&self) -> u8 {
        self.desired.read().pause
    }

    pub fn timer_minutes(&self) -> u16 {
        self.desired.read().timer_minutes
    }

    pub fn sync_state(&self) -> SyncState {
        self.resync.state()
    }

    /// Whether the link dropped unexpectedly and the next operation will replay
    pub fn needs_resync(&self) -> bool {
        self.resync.needs_resync()
    }

    /// Failed operations in a row, reset by any success
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Advisory only: hosts may stop polling a persistently unreachable candle.
    /// The session itself still attempts every requested operation.
    pub fn should_back_off(&self) -> bool {
        self.consecutive_failures() >= self.config.failure_threshold
    }

    /// Register a state listener, called after each operation that changed
    /// the observable state.
    pub fn register_observer<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        self.observers.register(callback)
    }

    /// Read the candle's state, or replay the desired state after an
    /// unexpected reconnect.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn refresh(&self) -> Result<()> {
        let mut context = self.command_lock.lock().await;
        let result = self.refresh_locked(&mut context).await;
        self.record(&result);
        result
    }

    /// Apply a partial update. Absent fields keep their desired value; a
    /// color that resolves to all-zero turns the candle off instead.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn set_light(&self, update: LightUpdate) -> Result<()> {
        let _context = self.command_lock.lock().await;
        let result = self.set_light_locked(&update).await;
        self.record(&result);
        result
    }

    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn turn_off(&self) -> Result<()> {
        let _context = self.command_lock.lock().await;
        let pending = self.desired.read().clone();
        let result = self.turn_off_locked(pending).await;
        self.record(&result);
        result
    }

    /// Disconnect on purpose. Waits for any in-flight command.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn stop(&self) {
        let _context = self.command_lock.lock().await;
        self.connection.disconnect().await;
    }

    async fn refresh_locked(&self, context: &mut CommandContext) -> Result<()> {
        let outcome = self.connection.ensure_connected().await?;
        let previous = self.state();
        let desired = self.desired();

        let (power, color) = if outcome == ConnectionOutcome::Reconnected && desired.power {
            info!("Link was lost, replaying desired state instead of trusting a read");
            self.replay(&desired).await?;
            (true, desired.color)
        } else {
            let bytes = self.connection.read(Capability::RgbwRead).await?;
            let color = codec::decode_rgbw(&bytes)?;
            (!color.is_off(), color)
        };

        let mut next = previous.with_light(power, color);
        // Stepped on a copy so a failed refresh does not advance the cadence.
        let mut battery = context.battery.clone();
        if self.connection.capabilities().supports(Capability::Battery)
            && battery.should_read(outcome, previous.power, power)
        {
            let bytes = self.connection.read(Capability::Battery).await?;
            next.battery_level = Some(codec::decode_battery(&bytes)?);
        }

        if outcome == ConnectionOutcome::Reconnected {
            self.resync.resynced();
        }
        context.battery = battery;
        self.commit(next);
        Ok(())
    }

    async fn replay(&self, desired: &DesiredConfiguration) -> Result<()> {
        let capabilities = self.connection.capabilities();
        let plan = resync::plan_replay(
            desired,
            &capabilities,
            self.config.timer_channel,
            Utc::now(),
        )?;
        self.send_frames(&plan.frames).await?;

        if capabilities.supports(Capability::Timer) && plan.timer_minutes.is_none() {
            let mut desired = self.desired.write();
            desired.timer_armed = false;
            desired.timer_armed_at = None;
        }
        Ok(())
    }

    async fn set_light_locked(&self, update: &LightUpdate) -> Result<()> {
        if let Some(minutes) = update.timer_minutes {
            if minutes > MAX_TIMER_MINUTES {
                return Err(Error::ValueOutOfRange(
                    minutes.into(),
                    0,
                    MAX_TIMER_MINUTES.into(),
                ));
            }
        }

        let outcome = self.connection.ensure_connected().await?;
        let capabilities = self.connection.capabilities();
        if update.timer_minutes.is_some() {
            capabilities.require(Capability::Timer)?;
        }

        let previous = self.state();
        let mut desired = self.desired().merged(update, &previous);
        if desired.color.is_off() {
            debug!("Resolved color is off, turning off instead");
            return self.turn_off_locked(desired).await;
        }

        capabilities.require(Capability::RgbwWrite)?;
        if desired.effect.is_animated() {
            capabilities.require(Capability::Effect)?;
        }

        let mut frames = vec![CommandFrame::Rgbw(codec::encode_rgbw(desired.color))];
        if capabilities.supports(Capability::Timer) {
            let now = Utc::now();
            if update.timer_minutes.is_some() || !previous.power {
                frames.push(self.restart_timer(&mut desired, now)?);
            } else if outcome == ConnectionOutcome::Reconnected {
                frames.push(self.resume_timer(&mut desired, now)?);
            }
        }
        if let Some(frame) = codec::encode_effect(desired.color, desired.effect_params()) {
            frames.push(CommandFrame::Effect(frame));
        }

        self.send_frames(&frames).await?;

        desired.power = true;
        let color = desired.color;
        *self.desired.write() = desired;
        if outcome == ConnectionOutcome::Reconnected {
            self.resync.resynced();
        }
        self.commit(previous.with_light(true, color));
        Ok(())
    }

    /// `pending` becomes the desired configuration once the candle is off
    async fn turn_off_locked(&self, mut pending: DesiredConfiguration) -> Result<()> {
        let outcome = self.connection.ensure_connected().await?;

        let mut frames = vec![CommandFrame::Rgbw(codec::encode_rgbw(Rgbw::OFF))];
        if self.connection.capabilities().supports(Capability::Timer) {
            frames.push(CommandFrame::Timer(codec::encode_timer_disarm(
                self.config.timer_channel,
            )));
        }
        self.send_frames(&frames).await?;

        pending.power = false;
        pending.timer_armed = false;
        pending.timer_armed_at = None;
        *self.desired.write() = pending;
        if outcome == ConnectionOutcome::Reconnected {
            self.resync.resynced();
        }
        let next = self.state().with_light(false, Rgbw::OFF);
        self.commit(next);
        Ok(())
    }

    /// Arm for the full desired duration, or disarm when it is zero
    fn restart_timer(
        &self,
        desired: &mut DesiredConfiguration,
        now: DateTime<Utc>,
    ) -> Result<CommandFrame> {
        let channel = self.config.timer_channel;
        if desired.timer_minutes == 0 {
            desired.timer_armed = false;
            desired.timer_armed_at = None;
            return Ok(CommandFrame::Timer(codec::encode_timer_disarm(channel)));
        }
        let frame = codec::encode_timer_arm(channel, desired.timer_minutes, desired.color)?;
        desired.timer_armed = true;
        desired.timer_armed_at = Some(now);
        Ok(CommandFrame::Timer(frame))
    }

    /// Re-arm with whatever was left before the link dropped
    fn resume_timer(
        &self,
        desired: &mut DesiredConfiguration,
        now: DateTime<Utc>,
    ) -> Result<CommandFrame> {
        let channel = self.config.timer_channel;
        match desired.remaining_timer_minutes(now) {
            Some(remaining) => Ok(CommandFrame::Timer(codec::encode_timer_arm(
                channel,
                remaining,
                desired.color,
            )?)),
            None => {
                desired.timer_armed = false;
                desired.timer_armed_at = None;
                Ok(CommandFrame::Timer(codec::encode_timer_disarm(channel)))
            }
        }
    }

    async fn send_frames(&self, frames: &[CommandFrame]) -> Result<()> {
        for frame in frames {
            debug!("Sending {} frame", frame.capability());
            self.connection
                .write(frame.capability(), frame.bytes())
                .await?;
        }
        Ok(())
    }

    /// Replace the cached state; notify observers if anything observable changed
    fn commit(&self, mut next: DeviceState) {
        next.updated_at = Some(Utc::now());
        let changed = {
            let mut state = self.state.write();
            let changed = !state.same_observation(&next);
            *state = next.clone();
            changed
        };
        if changed {
            debug!(?next, "Device state changed");
            self.observers.notify(&next);
        }
    }

    fn record<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.failures.store(0, Ordering::SeqCst);
            }
            Err(e) if e.is_transient() => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures == self.config.failure_threshold {
                    warn!(
                        "{} failed {} times in a row, last error: {}",
                        self.name(),
                        failures,
                        e
                    );
                }
            }
            Err(_) => {}
        }
    }
}

impl std::fmt::Debug for CandleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleSession")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("state", &*self.state.read())
            .field("connection", &self.connection)
            .finish()
    }
}
