//! Cleaning jobs: point navigation, zoned room cleaning and the dock
//! recovery watcher that follows a room clean until the vacuum is charging.

use crate::device::{DeviceUpdate, Point, Vacuum, Zone};
use crate::error::{MiioError, Result};
use crate::map::MapStore;
use crate::state::LifecycleState;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Idle observations handled before the watcher gives up.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 6;

/// Timing of a cleaning job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Delay before the watcher starts consuming updates
    pub initial_wait_secs: u64,
    /// Delay before driving to the idle point after the dock was missed
    pub idle_delay_secs: u64,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            initial_wait_secs: 30,
            idle_delay_secs: 5,
        }
    }
}

impl CleaningConfig {
    pub fn initial_wait(&self) -> Duration {
        Duration::from_secs(self.initial_wait_secs)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_delay_secs)
    }
}

/// Corrective action taken when the vacuum stops short of its dock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drive to the job's idle point
    GotoIdlePoint,
    /// Send the vacuum home, optionally changing the volume afterwards
    Dock { volume: Option<u8> },
}

/// What the watcher should do about one observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Same state as last time
    Repeat,
    /// Expected transition, nothing to do
    Wait,
    /// State outside the recovery table
    Unlisted(LifecycleState),
    Act(RecoveryAction),
    Complete,
    GiveUp,
}

/// Edge-triggered recovery state machine.
#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    attempts: u32,
    last_state: LifecycleState,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self {
            attempts: 0,
            last_state: LifecycleState::ZoneCleaning,
        }
    }
}

impl RecoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle observations handled so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn observe(&mut self, state: LifecycleState) -> Step {
        if state == LifecycleState::Charging {
            return Step::Complete;
        }
        if state == self.last_state {
            return Step::Repeat;
        }

        let step = match state {
            LifecycleState::Idle => {
                if self.attempts >= MAX_RECOVERY_ATTEMPTS {
                    return Step::GiveUp;
                }
                let action = match self.attempts {
                    0 => Some(RecoveryAction::GotoIdlePoint),
                    // Waiting for the docking command
                    1 => None,
                    2 => Some(RecoveryAction::Dock { volume: Some(0) }),
                    4 => Some(RecoveryAction::Dock { volume: Some(100) }),
                    _ => Some(RecoveryAction::Dock { volume: None }),
                };
                self.attempts += 1;
                action.map_or(Step::Wait, Step::Act)
            }
            LifecycleState::Returning
            | LifecycleState::GoingToTarget
            | LifecycleState::ZoneCleaning => Step::Wait,
            other => Step::Unlisted(other),
        };

        self.last_state = state;
        step
    }
}

/// How a watcher ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The vacuum reached its charger
    Completed { attempts: u32 },
    /// Recovery attempts ran out
    GaveUp { attempts: u32 },
    Cancelled,
    /// The update source went away
    Disconnected,
}

/// Device operations the recovery watcher needs.
#[async_trait]
pub trait DockingControl: Send + Sync {
    async fn drive_to(&self, target: Point) -> bool;
    async fn return_to_dock(&self) -> bool;
    async fn set_sound_volume(&self, volume: u8) -> bool;
}

#[async_trait]
impl DockingControl for Vacuum {
    async fn drive_to(&self, target: Point) -> bool {
        self.goto_target(target.0, target.1).await
    }

    async fn return_to_dock(&self) -> bool {
        self.dock().await
    }

    async fn set_sound_volume(&self, volume: u8) -> bool {
        self.set_volume(volume).await
    }
}

/// Follows state updates until the vacuum is charging, steering it back
/// to its dock when it stops short.
pub async fn watch<C: DockingControl + ?Sized>(
    ctl: &C,
    mut updates: mpsc::Receiver<DeviceUpdate>,
    idle_point: Point,
    config: &CleaningConfig,
    cancel: &CancellationToken,
) -> WatchOutcome {
    tokio::select! {
        _ = cancel.cancelled() => return WatchOutcome::Cancelled,
        _ = sleep(config.initial_wait()) => {}
    }
    // Readings from before the vacuum left the dock
    while updates.try_recv().is_ok() {}

    let mut tracker = RecoveryTracker::new();
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            update = updates.recv() => match update {
                Some(update) => update,
                None => return WatchOutcome::Disconnected,
            },
        };

        let state = update.state.state;
        match tracker.observe(state) {
            Step::Repeat => {}
            Step::Wait => debug!("Processing state: {}", state),
            Step::Unlisted(state) => info!("Unexpected state {} during cleaning job", state),
            Step::Complete => {
                info!("Charging. All done.");
                return WatchOutcome::Completed {
                    attempts: tracker.attempts(),
                };
            }
            Step::GiveUp => {
                warn!(
                    "Vacuum still idle after {} recovery attempts, giving up",
                    tracker.attempts()
                );
                return WatchOutcome::GaveUp {
                    attempts: tracker.attempts(),
                };
            }
            Step::Act(action) => {
                info!("Recovery attempt {}: {:?}", tracker.attempts(), action);
                if !recover(ctl, action, idle_point, config, cancel).await {
                    return WatchOutcome::Cancelled;
                }
            }
        }
    }
}

/// Runs one recovery action. Returns `false` if cancelled midway.
async fn recover<C: DockingControl + ?Sized>(
    ctl: &C,
    action: RecoveryAction,
    idle_point: Point,
    config: &CleaningConfig,
    cancel: &CancellationToken,
) -> bool {
    match action {
        RecoveryAction::GotoIdlePoint => {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(config.idle_delay()) => {}
            }
            if !ctl.drive_to(idle_point).await {
                warn!("Failed to send vacuum to idle point {:?}", idle_point);
            }
        }
        RecoveryAction::Dock { volume } => {
            if !ctl.return_to_dock().await {
                warn!("Failed to send vacuum to dock");
            }
            if let Some(volume) = volume
                && !ctl.set_sound_volume(volume).await
            {
                warn!("Failed to set volume to {}", volume);
            }
        }
    }
    true
}

/// A running room clean, owned by whoever started it.
pub struct CleaningJob {
    handle: JoinHandle<WatchOutcome>,
    cancel_token: CancellationToken,
}

impl CleaningJob {
    /// Starts a watcher on its own task.
    pub fn spawn<C>(
        ctl: C,
        updates: mpsc::Receiver<DeviceUpdate>,
        idle_point: Point,
        config: CleaningConfig,
    ) -> Self
    where
        C: DockingControl + 'static,
    {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle =
            tokio::spawn(async move { watch(&ctl, updates, idle_point, &config, &token).await });
        Self {
            handle,
            cancel_token,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the watcher. Commands already sent are not undone.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Waits for the watcher to end.
    pub async fn join(self) -> WatchOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Cleaning watcher failed: {}", e);
                WatchOutcome::Cancelled
            }
        }
    }
}

impl std::fmt::Debug for CleaningJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleaningJob")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Starts point navigation and room cleaning jobs.
///
/// Only one job should run at a time; exclusion is up to the caller.
#[derive(Clone)]
pub struct Orchestrator {
    vacuum: Vacuum,
    maps: Arc<dyn MapStore>,
    config: CleaningConfig,
}

impl Orchestrator {
    pub fn new(vacuum: Vacuum, maps: Arc<dyn MapStore>, config: CleaningConfig) -> Self {
        Self {
            vacuum,
            maps,
            config,
        }
    }

    pub fn vacuum(&self) -> &Vacuum {
        &self.vacuum
    }

    /// Restores the reference map and drives to `target`.
    pub async fn goto_point(&self, target: Point) -> Result<()> {
        self.maps.restore_reference_map().await?;
        if !self.vacuum.goto_target(target.0, target.1).await {
            return Err(MiioError::CommandFailed(
                crate::device::CMD_GOTO_TARGET.into(),
            ));
        }
        info!("Going to the target point {:?}", target);
        Ok(())
    }

    /// Restores the reference map, starts a zoned clean and returns the
    /// watcher that brings the vacuum home afterwards.
    pub async fn clean_room(&self, zones: &[Zone], idle_point: Point) -> Result<CleaningJob> {
        self.maps.restore_reference_map().await?;

        let updates = self.vacuum.subscribe();
        if !self.vacuum.zoned_clean(zones).await {
            return Err(MiioError::CommandFailed(
                crate::device::CMD_ZONED_CLEAN.into(),
            ));
        }

        info!("Starting zoned clean of {} zones", zones.len());
        Ok(CleaningJob::spawn(
            self.vacuum.clone(),
            updates,
            idle_point,
            self.config.clone(),
        ))
    }
}
