//! # Miroom
//!
//! Local miIO control of Xiaomi/Roborock vacuums, with unattended room
//! cleaning that steers the robot back to its dock when it misses it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use miroom::{VacuumBuilder, config::parse_token};
//!
//! # async fn run() -> miroom::Result<()> {
//! let token = parse_token("00112233445566778899aabbccddeeff")?;
//! let vacuum = VacuumBuilder::new("127.0.0.1", token).connect().await?;
//! vacuum.update_status().await;
//! println!("{:?}", vacuum.state());
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod cleaning;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod handlers;
pub mod map;
pub mod monitor;
pub mod protocol;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cleaning::{CleaningConfig, CleaningJob, Orchestrator, WatchOutcome};
pub use config::{NotifyPolicy, SessionConfig};
pub use device::{DeviceUpdate, Point, Vacuum, VacuumBuilder, Zone};
pub use error::{MiioError, Result};
pub use handlers::{Controller, Operation, StatusResponse};
pub use map::{FsMapStore, MapStore};
pub use monitor::StatusMonitor;
pub use state::{DeviceState, ErrorKind, LifecycleState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
