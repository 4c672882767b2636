//! Tracks whether the link was lost behind the session's back, and what to
//! write to bring a freshly reconnected candle back to the desired state.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::capabilities::{Capability, CapabilitySet};
use crate::codec::{self, CommandFrame};
use crate::state::DesiredConfiguration;
use crate::Result;

/// Per-session sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// The cached state can be trusted.
    Stable,
    /// The link dropped unexpectedly; the next operation must replay.
    NeedsResync,
}

/// Sticky "reconnect needed" flag shared with disconnect callbacks.
///
/// Callbacks only ever move it to [`SyncState::NeedsResync`]; the command
/// path moves it back once a replay (or an authoritative command) finished.
#[derive(Debug, Default)]
pub struct ResyncTracker {
    needs_resync: AtomicBool,
}

impl ResyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        if self.needs_resync() {
            SyncState::NeedsResync
        } else {
            SyncState::Stable
        }
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::SeqCst)
    }

    /// `Stable -> NeedsResync`. Returns whether this call made the transition.
    pub fn link_lost(&self) -> bool {
        let transitioned = !self.needs_resync.swap(true, Ordering::SeqCst);
        if transitioned {
            debug!("Session marked for resync");
        }
        transitioned
    }

    /// `NeedsResync -> Stable`
    pub fn resynced(&self) {
        if self.needs_resync.swap(false, Ordering::SeqCst) {
            debug!("Session resynchronized");
        }
    }
}

/// Writes that restore `desired` on a reconnected candle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPlan {
    /// In send order: RGBW, then timer, then effect
    pub frames: Vec<CommandFrame>,
    /// Minutes the timer was re-armed with, if it was
    pub timer_minutes: Option<u16>,
}

/// Build the replay for `desired` against what this connection supports.
///
/// An armed timer is re-armed with the minutes it still had left at `now`;
/// one that has run out is left alone. A missing effect characteristic
/// downgrades the replay to the static color instead of failing the refresh.
pub fn plan_replay(
    desired: &DesiredConfiguration,
    capabilities: &CapabilitySet,
    timer_channel: u8,
    now: DateTime<Utc>,
) -> Result<ReplayPlan> {
    let mut frames = vec![CommandFrame::Rgbw(codec::encode_rgbw(desired.color))];
    let mut timer_minutes = None;

    if capabilities.supports(Capability::Timer) {
        if let Some(remaining) = desired.remaining_timer_minutes(now) {
            frames.push(CommandFrame::Timer(codec::encode_timer_arm(
                timer_channel,
                remaining,
                desired.color,
            )?));
            timer_minutes = Some(remaining);
        } else if desired.timer_armed {
            debug!("Desired timer already ran out, not re-arming");
        }
    }

    if let Some(frame) = codec::encode_effect(desired.color, desired.effect_params()) {
        if capabilities.supports(Capability::Effect) {
            frames.push(CommandFrame::Effect(frame));
        } else {
            warn!(
                "Cannot replay effect {} without an effect characteristic",
                desired.effect
            );
        }
    }

    Ok(ReplayPlan {
        frames,
        timer_minutes,
    })
}
