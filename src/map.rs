//! Map archive management.
//! The robot keeps its live map in its data directory; named snapshots are
//! kept in an archive directory, where `full` holds the reference map.

use crate::crypto::md5;
use crate::device::Vacuum;
use crate::error::{MiioError, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Files that make up a map snapshot.
pub const MAP_FILES: [&str; 3] = ["last_map", "ChargerPos.data", "StartPos.data"];
/// Archive entry holding the reference map.
pub const REFERENCE_MAP: &str = "full";

pub const DEFAULT_LIVE_DIR: &str = "/mnt/data/rockrobo";
pub const DEFAULT_ARCHIVE_DIR: &str = "/mnt/data/room_controller";
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Map collaborator used by cleaning jobs and the bus handlers.
#[async_trait]
pub trait MapStore: Send + Sync {
    /// Puts the reference map in place. Returns whether any file changed.
    async fn restore_reference_map(&self) -> Result<bool>;

    /// Copies the live map into the archive under `name`.
    async fn save_map(&self, name: &str) -> Result<()>;
}

/// [`MapStore`] over the robot's filesystem.
///
/// Restoring reloads the robot's watchdog service and waits for it to pick
/// the new map up. Only one copy runs at a time.
pub struct FsMapStore {
    live_dir: PathBuf,
    archive_dir: PathBuf,
    reload_command: Vec<String>,
    settle_delay: Duration,
    dock_guard: Option<Vacuum>,
    copy_lock: tokio::sync::Mutex<()>,
}

impl Default for FsMapStore {
    fn default() -> Self {
        Self::new(DEFAULT_LIVE_DIR, DEFAULT_ARCHIVE_DIR)
    }
}

impl FsMapStore {
    pub fn new(live_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            live_dir: live_dir.into(),
            archive_dir: archive_dir.into(),
            reload_command: vec!["service".into(), "rrwatchdoge".into(), "reload".into()],
            settle_delay: DEFAULT_SETTLE_DELAY,
            dock_guard: None,
            copy_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Program and arguments run after the live map changed. Empty disables it.
    pub fn with_reload_command(mut self, command: Vec<String>) -> Self {
        self.reload_command = command;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Refuse to touch map files unless this vacuum is docked.
    pub fn with_dock_guard(mut self, vacuum: Vacuum) -> Self {
        self.dock_guard = Some(vacuum);
        self
    }

    /// Archive directory for a map name. Names must be a single plain path
    /// component.
    pub fn map_dir(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == name => {
                Ok(self.archive_dir.join(name))
            }
            _ => Err(MiioError::Map(format!("Invalid map name '{}'", name))),
        }
    }

    /// Copies the map files from `source` to `destination`.
    /// Returns `false` without copying when every file already matches.
    async fn copy_map(&self, source: &Path, destination: &Path) -> Result<bool> {
        let _guard = self.copy_lock.lock().await;

        if maps_match(source, destination).await {
            return Ok(false);
        }
        if let Some(vacuum) = &self.dock_guard {
            vacuum.check_docked()?;
        }

        tokio::fs::create_dir_all(destination).await.map_err(|e| {
            MiioError::Map(format!("Failed to create {}: {}", destination.display(), e))
        })?;
        for file in MAP_FILES {
            let from = source.join(file);
            let to = destination.join(file);
            tokio::fs::copy(&from, &to).await.map_err(|e| {
                MiioError::Map(format!("Failed to copy {}: {}", from.display(), e))
            })?;
        }
        debug!(
            "Copied map from {} to {}",
            source.display(),
            destination.display()
        );
        Ok(true)
    }

    async fn reload_service(&self) -> Result<()> {
        let Some((program, args)) = self.reload_command.split_first() else {
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| MiioError::Map(format!("Failed to run {}: {}", program, e)))?;
        if !status.success() {
            return Err(MiioError::Map(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MapStore for FsMapStore {
    async fn restore_reference_map(&self) -> Result<bool> {
        info!("Restoring reference map");
        let reference = self.archive_dir.join(REFERENCE_MAP);
        if !self.copy_map(&reference, &self.live_dir).await? {
            info!("Reference map already in place");
            return Ok(false);
        }

        self.reload_service().await?;
        tokio::time::sleep(self.settle_delay).await;
        info!("Reference map restored");
        Ok(true)
    }

    async fn save_map(&self, name: &str) -> Result<()> {
        let destination = self.map_dir(name)?;
        if self.copy_map(&self.live_dir, &destination).await? {
            info!("Saved map '{}'", name);
        } else {
            info!("Map '{}' is already up to date", name);
        }
        Ok(())
    }
}

async fn file_digest(path: &Path) -> Option<[u8; 16]> {
    tokio::fs::read(path).await.ok().map(|data| md5(&[&data]))
}

async fn maps_match(source: &Path, destination: &Path) -> bool {
    for file in MAP_FILES {
        let (Some(a), Some(b)) = (
            file_digest(&source.join(file)).await,
            file_digest(&destination.join(file)).await,
        ) else {
            return false;
        };
        if a != b {
            return false;
        }
    }
    true
}
