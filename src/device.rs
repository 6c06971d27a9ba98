//! miIO vacuum session.
//! Handles the discovery handshake, encrypted command/response exchange with
//! retries, the raw response cache and the decoded device state.

use crate::config::{NotifyPolicy, SessionConfig};
use crate::crypto::CipherContext;
use crate::error::{MiioError, Result};
use crate::protocol::{
    HEADER_LEN, MiioFrame, MiioHeader, MiioPacket, MiioRequest, decode_message, encode_request,
    parse_header,
};
use crate::state::{DeviceState, LifecycleState, decode_status};
use crate::transport::Transport;
use futures_core::stream::Stream;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;

// Commands
pub const CMD_GET_STATUS: &str = "get_status";
pub const CMD_START: &str = "app_start";
pub const CMD_PAUSE: &str = "app_pause";
pub const CMD_STOP: &str = "app_stop";
pub const CMD_DOCK: &str = "app_charge";
pub const CMD_GOTO_TARGET: &str = "app_goto_target";
pub const CMD_ZONED_CLEAN: &str = "app_zoned_clean";
pub const CMD_FIND_ME: &str = "find_me";
pub const CMD_FAN_POWER: &str = "set_custom_mode";
pub const CMD_CHANGE_VOLUME: &str = "change_sound_volume";

/// Map coordinates `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point(pub i32, pub i32);

/// Rectangle to clean `[x1, y1, x2, y2, repeats]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone(pub i32, pub i32, pub i32, pub i32, pub u32);

/// Published after every successfully decoded status response.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub device_id: u32,
    pub state: DeviceState,
}

/// Builder for a [`Vacuum`] reachable over UDP.
pub struct VacuumBuilder {
    address: String,
    token: [u8; 16],
    config: SessionConfig,
}

impl VacuumBuilder {
    pub fn new<A: Into<String>>(address: A, token: [u8; 16]) -> Self {
        Self {
            address: address.into(),
            token,
            config: SessionConfig::default(),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn notify_policy(mut self, policy: NotifyPolicy) -> Self {
        self.config.notify_policy = policy;
        self
    }

    /// Open the UDP transport and start the session.
    pub async fn connect(self) -> Result<Vacuum> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| MiioError::ConnectionFailed(format!("Bad address '{}'", self.address)))?;
        let transport = Transport::open(SocketAddr::new(ip, self.config.port)).await?;
        info!("Connected to vacuum at {}:{}", self.address, self.config.port);
        Ok(Vacuum::new(transport, self.token, self.config))
    }
}

/// Wire side of the session. Held for the whole send/wait cycle.
struct Link {
    transport: Transport,
    cipher: Option<CipherContext>,
    last_handshake: Option<Instant>,
}

/// State shared between the response path and the decode path.
struct Shared {
    state: DeviceState,
    raw: HashMap<String, Vec<u8>>,
    device_id: u32,
}

struct VacuumInner {
    token: [u8; 16],
    config: SessionConfig,
    link: tokio::sync::Mutex<Link>,
    shared: parking_lot::Mutex<Shared>,
    // Names of commands whose response was just cached
    cache_tx: mpsc::Sender<String>,
    subscribers: parking_lot::Mutex<Vec<mpsc::Sender<DeviceUpdate>>>,
    cancel_token: CancellationToken,
}

/// A session with one miIO vacuum.
///
/// Cheap to clone; all clones share the transport, cipher context and state.
#[derive(Clone)]
pub struct Vacuum {
    inner: Arc<VacuumInner>,
}

impl Vacuum {
    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Start a session over an already opened transport.
    pub fn new(transport: Transport, token: [u8; 16], config: SessionConfig) -> Self {
        let (cache_tx, cache_rx) = mpsc::channel(config.queue_capacity.max(1));
        let inner = Arc::new(VacuumInner {
            token,
            config,
            link: tokio::sync::Mutex::new(Link {
                transport,
                cipher: None,
                last_handshake: None,
            }),
            shared: parking_lot::Mutex::new(Shared {
                state: DeviceState::default(),
                raw: HashMap::new(),
                device_id: 0,
            }),
            cache_tx,
            subscribers: parking_lot::Mutex::new(Vec::new()),
            cancel_token: CancellationToken::new(),
        });

        tokio::spawn(process_updates(
            Arc::downgrade(&inner),
            cache_rx,
            inner.cancel_token.clone(),
        ));
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Latest decoded state.
    pub fn state(&self) -> DeviceState {
        self.inner.shared.lock().state.clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.shared.lock().state.state
    }

    /// Device identifier learned during discovery, 0 before the first handshake.
    pub fn device_id(&self) -> u32 {
        self.inner.shared.lock().device_id
    }

    /// Latest decrypted response stored for a command.
    pub fn raw_response(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.shared.lock().raw.get(name).cloned()
    }

    /// Snapshot of the latest state as an update message.
    pub fn update_message(&self) -> DeviceUpdate {
        let shared = self.inner.shared.lock();
        DeviceUpdate {
            device_id: shared.device_id,
            state: shared.state.clone(),
        }
    }

    /// Register for state updates. Delivery follows the configured [`NotifyPolicy`].
    pub fn subscribe(&self) -> mpsc::Receiver<DeviceUpdate> {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        if !self.inner.cancel_token.is_cancelled() {
            self.inner.subscribers.lock().push(tx);
        }
        rx
    }

    /// Returns a Stream of state updates.
    pub fn updates(&self) -> impl Stream<Item = DeviceUpdate> + Send + 'static {
        let mut rx = self.subscribe();
        async_stream::stream! {
            while let Some(update) = rx.recv().await {
                yield update;
            }
        }
    }

    /// Fails with a precondition error unless the vacuum sits on its dock.
    pub fn check_docked(&self) -> Result<()> {
        let state = self.lifecycle();
        if state.is_docked() {
            return Ok(());
        }
        Err(MiioError::Precondition(format!(
            "Vacuum not docked! - State: {}",
            state.code().unwrap_or_default()
        )))
    }

    /// Fails with a precondition error while the vacuum is busy.
    pub fn check_available(&self) -> Result<()> {
        let state = self.lifecycle();
        if state.is_available() {
            return Ok(());
        }
        Err(MiioError::Precondition(format!(
            "Vacuum busy! - State: {}",
            state.code().unwrap_or_default()
        )))
    }

    /// Closes the transport and stops background work.
    pub async fn close(&self) {
        info!("Closing vacuum session");
        self.inner.cancel_token.cancel();
        // Subscribers see the end of their update stream
        self.inner.subscribers.lock().clear();
        let link = self.inner.link.lock().await;
        link.transport.close();
    }

    /// Sends a command, retrying the full handshake/send/wait cycle.
    /// Returns whether the device answered.
    pub async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        store_response: bool,
        max_retries: u32,
    ) -> bool {
        self.request(method, params, store_response, max_retries)
            .await
            .is_ok()
    }

    /// Like [`call`](Self::call) but returns the response or the last error.
    pub async fn request(
        &self,
        method: &str,
        params: Vec<Value>,
        store_response: bool,
        max_retries: u32,
    ) -> Result<MiioFrame> {
        let attempts = max_retries.max(1);
        let mut last_err = MiioError::Timeout;

        for attempt in 1..=attempts {
            match self.do_command(method, &params, store_response).await {
                Ok(frame) => return Ok(frame),
                Err(MiioError::Closed) => return Err(MiioError::Closed),
                Err(e) => {
                    warn!(
                        "Command {} failed (attempt {}/{}): {}",
                        method, attempt, attempts, e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Decodes the cached `get_status` response into the device state.
    /// A decode failure is logged and leaves the state untouched.
    pub async fn update_state(&self) -> bool {
        let update = {
            let mut shared = self.inner.shared.lock();
            let Some(raw) = shared.raw.get(CMD_GET_STATUS) else {
                return false;
            };
            match decode_status(raw) {
                Ok(Some(state)) => {
                    shared.state = state.clone();
                    DeviceUpdate {
                        device_id: shared.device_id,
                        state,
                    }
                }
                Ok(None) => {
                    debug!("Status response without entries");
                    return false;
                }
                Err(e) => {
                    error!("Failed to decode vacuum status: {}", e);
                    return false;
                }
            }
        };

        self.publish(update).await;
        true
    }
}

// -------------------------------------------------------------------------
// Vacuum Control API
// -------------------------------------------------------------------------
impl Vacuum {
    fn retries(&self) -> u32 {
        self.inner.config.retries
    }

    /// Requests a state update.
    pub async fn update_status(&self) -> bool {
        self.call(CMD_GET_STATUS, Vec::new(), true, self.retries())
            .await
    }

    /// Runs a mutating command and refreshes the status shortly after.
    /// Succeeds only if both the command and the refresh succeed.
    async fn command_and_refresh(&self, method: &str, params: Vec<Value>) -> bool {
        if !self.call(method, params, false, self.retries()).await {
            return false;
        }
        sleep(self.inner.config.refresh_delay()).await;
        self.update_status().await
    }

    /// Starts the cleaning cycle.
    pub async fn start_cleaning(&self) -> bool {
        self.command_and_refresh(CMD_START, Vec::new()).await
    }

    pub async fn pause_cleaning(&self) -> bool {
        self.command_and_refresh(CMD_PAUSE, Vec::new()).await
    }

    pub async fn stop_cleaning(&self) -> bool {
        self.command_and_refresh(CMD_STOP, Vec::new()).await
    }

    /// Stops the cleaning cycle and returns to dock.
    pub async fn stop_cleaning_and_dock(&self) -> bool {
        if !self.call(CMD_STOP, Vec::new(), false, self.retries()).await {
            return false;
        }
        sleep(self.inner.config.refresh_delay()).await;
        self.dock().await
    }

    /// Returns to dock.
    pub async fn dock(&self) -> bool {
        self.command_and_refresh(CMD_DOCK, Vec::new()).await
    }

    pub async fn find_me(&self) -> bool {
        self.command_and_refresh(CMD_FIND_ME, Vec::new()).await
    }

    /// Drives to the given map coordinates.
    pub async fn goto_target(&self, x: i32, y: i32) -> bool {
        self.command_and_refresh(CMD_GOTO_TARGET, vec![json!(x), json!(y)])
            .await
    }

    /// Cleans the given zones, each as many times as its repeat count.
    pub async fn zoned_clean(&self, zones: &[Zone]) -> bool {
        let params = zones
            .iter()
            .map(|z| json!([z.0, z.1, z.2, z.3, z.4]))
            .collect();
        self.command_and_refresh(CMD_ZONED_CLEAN, params).await
    }

    /// Sets fan power in percent, clamped to 100.
    pub async fn set_fan_power(&self, value: u8) -> bool {
        self.command_and_refresh(CMD_FAN_POWER, vec![json!(value.min(100))])
            .await
    }

    /// Sets the sound volume in percent, clamped to 100.
    pub async fn set_volume(&self, value: u8) -> bool {
        self.command_and_refresh(CMD_CHANGE_VOLUME, vec![json!(value.min(100))])
            .await
    }
}

// -------------------------------------------------------------------------
// Internal Communication Helpers
// -------------------------------------------------------------------------
impl Vacuum {
    fn get_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// One full attempt: ensure the handshake, send, wait, cache.
    async fn do_command(
        &self,
        method: &str,
        params: &[Value],
        store_response: bool,
    ) -> Result<MiioFrame> {
        let frame = {
            let mut link = self.inner.link.lock().await;
            self.ensure_session(&mut link).await?;
            self.exchange(&mut link, method, params).await?
        };

        if let Some(err) = frame.device_error() {
            return Err(err);
        }

        if store_response {
            self.inner
                .shared
                .lock()
                .raw
                .insert(method.to_string(), frame.payload.clone());
            if self.inner.cache_tx.send(method.to_string()).await.is_err() {
                debug!("Update processor stopped, {} not decoded", method);
            }
        }

        Ok(frame)
    }

    async fn ensure_session(&self, link: &mut Link) -> Result<()> {
        let ttl = self.inner.config.handshake_ttl();
        let fresh = link.cipher.is_some()
            && link
                .last_handshake
                .is_some_and(|at| at.elapsed() < ttl);
        if fresh {
            return Ok(());
        }

        let header = self.handshake(link).await?;
        match link.cipher.as_mut() {
            Some(ctx) => ctx.resync(header.device_id, header.stamp),
            None => {
                link.cipher = Some(CipherContext::new(
                    &self.inner.token,
                    header.device_id,
                    header.stamp,
                )?);
            }
        }
        link.last_handshake = Some(Instant::now());
        self.inner.shared.lock().device_id = header.device_id;
        Ok(())
    }

    async fn handshake(&self, link: &mut Link) -> Result<MiioHeader> {
        let stale = link.transport.drain();
        if stale > 0 {
            debug!("Discarded {} stale datagrams before handshake", stale);
        }

        link.transport.send(MiioPacket::hello().pack()?).await?;
        let deadline = Instant::now() + self.inner.config.handshake_timeout();

        loop {
            let bytes = match timeout_at(deadline, link.transport.receive()).await {
                Err(_) => {
                    warn!("Timeout while waiting on handshake");
                    return Err(MiioError::Timeout);
                }
                Ok(None) => return Err(MiioError::Closed),
                Ok(Some(bytes)) => bytes,
            };

            if bytes.len() < HEADER_LEN {
                return Err(MiioError::DecodeError(format!(
                    "Received incorrect discovery packet of {} bytes",
                    bytes.len()
                )));
            }
            if bytes.len() > HEADER_LEN {
                debug!(
                    "Ignoring {} byte datagram while waiting on handshake",
                    bytes.len()
                );
                continue;
            }

            let header =
                parse_header(&bytes).map_err(|e| MiioError::HandshakeFailed(e.to_string()))?;
            debug!(
                "Handshake: device {:08x}, stamp {}",
                header.device_id, header.stamp
            );
            return Ok(header);
        }
    }

    async fn exchange(&self, link: &mut Link, method: &str, params: &[Value]) -> Result<MiioFrame> {
        let Link {
            transport, cipher, ..
        } = link;
        let ctx = cipher
            .as_ref()
            .ok_or_else(|| MiioError::HandshakeFailed("No cipher context".into()))?;

        let request = MiioRequest {
            id: self.get_timestamp(),
            method: method.to_string(),
            params: params.to_vec(),
        };
        debug!("Sending {} (id {})", method, request.id);
        transport.send(encode_request(ctx, &request)?).await?;

        let deadline = Instant::now() + self.inner.config.response_timeout();
        loop {
            let bytes = match timeout_at(deadline, transport.receive()).await {
                Err(_) => {
                    warn!("Timeout while waiting on response for {}", method);
                    return Err(MiioError::Timeout);
                }
                Ok(None) => return Err(MiioError::Closed),
                Ok(Some(bytes)) => bytes,
            };

            match decode_message(ctx, &bytes) {
                Ok(frame) => {
                    if let Some(id) = frame.id()
                        && id != request.id
                    {
                        debug!(
                            "Ignoring response for id {} while waiting for {}",
                            id, request.id
                        );
                        continue;
                    }
                    return Ok(frame);
                }
                Err(e) if e.is_discardable() => {
                    warn!("Discarding datagram while waiting for {}: {}", method, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish(&self, update: DeviceUpdate) {
        let subscribers: Vec<_> = {
            let mut subs = self.inner.subscribers.lock();
            subs.retain(|tx| !tx.is_closed());
            subs.clone()
        };

        for tx in subscribers {
            match self.inner.config.notify_policy {
                NotifyPolicy::Drop => match tx.try_send(update.clone()) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("Subscriber queue full, dropping state update");
                    }
                },
                NotifyPolicy::Block => {
                    let _ = tx.send(update.clone()).await;
                }
            }
        }
    }
}

/// Decodes cached responses on their own schedule. Only status responses
/// carry state.
async fn process_updates(
    inner: Weak<VacuumInner>,
    mut rx: mpsc::Receiver<String>,
    ct: CancellationToken,
) {
    loop {
        let name = tokio::select! {
            _ = ct.cancelled() => break,
            name = rx.recv() => match name {
                Some(name) => name,
                None => break,
            },
        };

        if name != CMD_GET_STATUS {
            continue;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Vacuum { inner }.update_state().await;
    }
    debug!("Update processor stopped");
}
