//! Periodic status poll.
//! Publishes lifecycle transitions and puts the reference map back whenever
//! the vacuum arrives on its charger.

use crate::device::Vacuum;
use crate::map::MapStore;
use crate::state::LifecycleState;
use log::{debug, error, info};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const BROADCAST_CAPACITY: usize = 16;

/// Background task polling the vacuum status.
pub struct StatusMonitor {
    handle: JoinHandle<()>,
    tx: broadcast::Sender<LifecycleState>,
    cancel_token: CancellationToken,
}

impl StatusMonitor {
    pub fn spawn(vacuum: Vacuum, maps: Arc<dyn MapStore>, poll_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            vacuum,
            maps,
            poll_interval,
            tx.clone(),
            cancel_token.clone(),
        ));
        Self {
            handle,
            tx,
            cancel_token,
        }
    }

    /// Receives each new lifecycle state.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("Status monitor failed: {}", e);
        }
    }
}

async fn poll_loop(
    vacuum: Vacuum,
    maps: Arc<dyn MapStore>,
    poll_interval: Duration,
    tx: broadcast::Sender<LifecycleState>,
    ct: CancellationToken,
) {
    let mut updates = vacuum.subscribe();

    // Random offset for the first poll
    let jitter = {
        let mut rng = rand::rng();
        Duration::from_millis((rng.next_u32() % 500) as u64)
    };
    let mut ticker = interval_at(Instant::now() + jitter, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last = LifecycleState::Unknown;
    debug!("Starting status monitor");

    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            _ = ticker.tick() => {
                if !vacuum.update_status().await {
                    debug!("Status poll failed");
                }
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                let current = update.state.state;
                if current == last {
                    continue;
                }

                info!("New state: {}", current);
                let _ = tx.send(current);
                if current == LifecycleState::Charging && !last.is_docked() {
                    if let Err(e) = maps.restore_reference_map().await {
                        error!("Failed to restore reference map: {}", e);
                    }
                }
                last = current;
            }
        }
    }
    debug!("Status monitor stopped");
}
