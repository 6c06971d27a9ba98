//! Vacuum state model and status decoding.

use crate::error::{MiioError, Result};
use serde::{Deserialize, Serialize};

define_wire_codes! {
    /// Error condition reported in the status `error_code` field.
    pub enum ErrorKind {
        Unknown;
        None = 0,
        ChargingError = 9,
        ContainerFull = 100,
    }
}

define_wire_codes! {
    /// High-level operational mode reported in the status `state` field.
    pub enum LifecycleState {
        Unknown;
        Initiating = 1,
        Sleeping = 2,
        Idle = 3,
        RemoteControl = 4,
        Cleaning = 5,
        /// Returning to the dock
        Returning = 6,
        ManualMode = 7,
        Charging = 8,
        ChargingError = 9,
        Paused = 10,
        Spot = 11,
        InError = 12,
        ShuttingDown = 13,
        Updating = 14,
        Docking = 15,
        /// Driving to a target point
        GoingToTarget = 16,
        ZoneCleaning = 17,
        RoomCleaning = 18,
        FullyCharged = 100,
    }
}

impl LifecycleState {
    /// Sitting on the dock.
    pub fn is_docked(&self) -> bool {
        matches!(self, LifecycleState::Charging | LifecycleState::FullyCharged)
    }

    /// Free to accept a new job.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            LifecycleState::Charging
                | LifecycleState::FullyCharged
                | LifecycleState::Idle
                | LifecycleState::Sleeping
                | LifecycleState::Paused
        )
    }
}

/// Decoded vacuum state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    /// Battery level in percent
    pub battery: u32,
    /// Cumulative clean area (mm²)
    pub clean_area: u64,
    /// Cumulative clean time (seconds)
    pub clean_time: u64,
    pub is_dnd: bool,
    pub is_cleaning: bool,
    pub fan_power: u32,
    pub error: ErrorKind,
    pub state: LifecycleState,
}

/// One entry of the `get_status` result list, as sent by the device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusReport {
    pub battery: u32,
    pub clean_area: u64,
    pub clean_time: u64,
    pub dnd_enabled: i64,
    pub error_code: i64,
    pub in_cleaning: Option<i64>,
    pub cleaning: Option<i64>,
    pub fan_power: u32,
    pub map_present: i64,
    pub msg_ver: i64,
    pub msg_seq: i64,
    pub state: i64,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    result: Vec<StatusReport>,
}

impl From<&StatusReport> for DeviceState {
    fn from(report: &StatusReport) -> Self {
        let state = LifecycleState::from_code(report.state);
        // A charging-error state implies the charging error kind
        let error = if state == LifecycleState::ChargingError {
            ErrorKind::ChargingError
        } else {
            ErrorKind::from_code(report.error_code)
        };

        Self {
            battery: report.battery,
            clean_area: report.clean_area,
            clean_time: report.clean_time,
            is_dnd: report.dnd_enabled != 0,
            is_cleaning: report.cleaning.or(report.in_cleaning).unwrap_or(0) != 0,
            fan_power: report.fan_power,
            error,
            state,
        }
    }
}

/// Decode a raw `get_status` response.
///
/// Returns `Ok(None)` when the response carries no status entry. The whole
/// payload is parsed before anything is returned, so a failure never yields
/// a partially updated state.
pub fn decode_status(payload: &[u8]) -> Result<Option<DeviceState>> {
    let response: StatusResponse =
        serde_json::from_slice(payload).map_err(|e| MiioError::Json(e.to_string()))?;
    Ok(response.result.first().map(DeviceState::from))
}
