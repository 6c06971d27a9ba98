//! Session configuration and device token helpers.

use crate::error::{MiioError, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::time::Duration;

/// Default miIO UDP port.
pub const DEFAULT_PORT: u16 = 54321;

/// Path of the token file on the vacuum itself.
pub const DEFAULT_TOKEN_PATH: &str = "/mnt/data/miio/device.token";

/// Bounded capacity of the transport and notification queues.
pub const QUEUE_CAPACITY: usize = 100;

/// What to do when a subscriber's notification queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPolicy {
    /// Drop the newest update. Slow subscribers may miss transient states.
    #[default]
    Drop,
    /// Wait until the subscriber has room.
    Block,
}

/// Tunables of a device session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub port: u16,
    pub handshake_timeout_secs: u64,
    pub response_timeout_secs: u64,
    /// Age after which the discovery handshake is repeated.
    pub handshake_ttl_secs: u64,
    pub retries: u32,
    /// Delay between a mutating command and its status refresh.
    pub refresh_delay_ms: u64,
    pub queue_capacity: usize,
    pub notify_policy: NotifyPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            handshake_timeout_secs: 5,
            response_timeout_secs: 5,
            handshake_ttl_secs: 60,
            retries: 3,
            refresh_delay_ms: 1000,
            queue_capacity: QUEUE_CAPACITY,
            notify_policy: NotifyPolicy::Drop,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn handshake_ttl(&self) -> Duration {
        Duration::from_secs(self.handshake_ttl_secs)
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

/// Parses a 32 character hex token into its 16 raw bytes.
pub fn parse_token(token: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(token.trim()).map_err(|_| MiioError::InvalidToken)?;
    <[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| MiioError::InvalidToken)
}

/// Reads the device token from a raw token file. Only the first 16 bytes count.
pub async fn load_token<P: AsRef<Path>>(path: P) -> Result<[u8; 16]> {
    let data = tokio::fs::read(path.as_ref()).await?;
    if data.len() < 16 {
        return Err(MiioError::InvalidToken);
    }
    let mut token = [0u8; 16];
    token.copy_from_slice(&data[..16]);
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_token() {
        let token = parse_token("30313233343536373839616263646566\n").unwrap();
        assert_eq!(&token, b"0123456789abcdef");
    }

    #[test]
    fn rejects_short_or_bad_tokens() {
        assert_eq!(parse_token("abcd"), Err(MiioError::InvalidToken));
        assert_eq!(
            parse_token("zz313233343536373839616263646566"),
            Err(MiioError::InvalidToken)
        );
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"retries": 5, "notify_policy": "block"}"#).unwrap();
        assert_eq!(config.retries, 5);
        assert_eq!(config.notify_policy, NotifyPolicy::Block);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn loads_first_sixteen_bytes_of_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.token");
        std::fs::write(&path, b"0123456789abcdefTRAILING").unwrap();
        assert_eq!(&load_token(&path).await.unwrap(), b"0123456789abcdef");

        std::fs::write(&path, b"short").unwrap();
        assert_eq!(load_token(&path).await, Err(MiioError::InvalidToken));
    }
}
