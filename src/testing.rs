//! Test doubles: an in-memory vacuum simulator and a recording map store.

use crate::config::{QUEUE_CAPACITY, SessionConfig};
use crate::crypto::CipherContext;
use crate::device::{CMD_GET_STATUS, Vacuum};
use crate::error::{MiioError, Result};
use crate::map::MapStore;
use crate::protocol::{
    MiioHeader, MiioPacket, MiioRequest, decode_message, encode_message, unpack_packet,
};
use crate::transport::{Endpoint, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;

pub(crate) const TOKEN: [u8; 16] = *b"0123456789abcdef";
pub(crate) const DEVICE_ID: u32 = 0x0042_1337;
const DEVICE_STAMP: u32 = 1000;

/// Scriptable device behaviour and a record of what it saw.
#[derive(Debug)]
pub(crate) struct SimState {
    pub status: i64,
    pub error_code: i64,
    pub battery: u32,
    /// Discovery probes received
    pub hellos: usize,
    /// Decoded requests, in arrival order
    pub received: Vec<MiioRequest>,
    /// Number of upcoming requests left unanswered
    pub drop_replies: usize,
    /// Methods that are never answered
    pub drop_methods: Vec<String>,
    /// Number of upcoming requests answered with an error object
    pub error_replies: usize,
    /// Answer status requests with an undecodable result
    pub garbled_status: bool,
    /// Ignore everything, probes included
    pub silent: bool,
    /// Send a corrupted datagram ahead of every reply
    pub noise_before_reply: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            status: 8,
            error_code: 0,
            battery: 100,
            hellos: 0,
            received: Vec::new(),
            drop_replies: 0,
            drop_methods: Vec::new(),
            error_replies: 0,
            garbled_status: false,
            silent: false,
            noise_before_reply: false,
        }
    }
}

#[derive(Clone)]
pub(crate) struct SimulatedVacuum {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedVacuum {
    pub fn spawn(endpoint: Endpoint) -> Self {
        let state = Arc::new(Mutex::new(SimState::default()));
        tokio::spawn(serve(endpoint, state.clone()));
        Self { state }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut *self.state.lock())
    }

    pub fn methods(&self) -> Vec<String> {
        self.with(|s| s.received.iter().map(|r| r.method.clone()).collect())
    }
}

/// A session wired to a fresh simulator.
pub(crate) fn session(config: SessionConfig) -> (Vacuum, SimulatedVacuum) {
    let (transport, endpoint) = Transport::channel(QUEUE_CAPACITY);
    let sim = SimulatedVacuum::spawn(endpoint);
    (Vacuum::new(transport, TOKEN, config), sim)
}

fn respond(state: &mut SimState, request: &MiioRequest) -> Option<Value> {
    state.received.push(request.clone());
    if state.silent || state.drop_methods.contains(&request.method) {
        return None;
    }
    if state.drop_replies > 0 {
        state.drop_replies -= 1;
        return None;
    }
    if state.error_replies > 0 {
        state.error_replies -= 1;
        return Some(json!({
            "id": request.id,
            "error": {"code": -5001, "message": "busy"}
        }));
    }

    if request.method != CMD_GET_STATUS {
        return Some(json!({"id": request.id, "result": ["ok"]}));
    }
    if state.garbled_status {
        return Some(json!({"id": request.id, "result": "garbage"}));
    }
    Some(json!({
        "id": request.id,
        "result": [{
            "state": state.status,
            "error_code": state.error_code,
            "battery": state.battery,
            "in_cleaning": i64::from(matches!(state.status, 5 | 11 | 17 | 18)),
            "fan_power": 60,
            "dnd_enabled": 0,
        }]
    }))
}

async fn serve(mut endpoint: Endpoint, state: Arc<Mutex<SimState>>) {
    let Ok(ctx) = CipherContext::new(&TOKEN, DEVICE_ID, DEVICE_STAMP) else {
        return;
    };

    while let Some(bytes) = endpoint.rx.recv().await {
        let Ok(packet) = unpack_packet(&bytes) else {
            continue;
        };

        if packet.is_hello() {
            let silent = {
                let mut s = state.lock();
                s.hellos += 1;
                s.silent
            };
            if silent {
                continue;
            }
            let reply = MiioPacket {
                header: MiioHeader {
                    length: 32,
                    reserved: 0,
                    device_id: DEVICE_ID,
                    stamp: DEVICE_STAMP,
                    checksum: [0xFF; 16],
                },
                data: Vec::new(),
            };
            if let Ok(bytes) = reply.pack() {
                let _ = endpoint.tx.send(bytes).await;
            }
            continue;
        }

        let Ok(frame) = decode_message(&ctx, &bytes) else {
            continue;
        };
        let Ok(request) = serde_json::from_value::<MiioRequest>(frame.body) else {
            continue;
        };

        let (reply, noise) = {
            let mut s = state.lock();
            (respond(&mut s, &request), s.noise_before_reply)
        };
        let Some(reply) = reply else {
            continue;
        };

        if noise {
            let mut junk = vec![0x21, 0x31, 0x00, 0x30];
            junk.resize(48, 0xAB);
            let _ = endpoint.tx.send(junk).await;
        }
        if let Ok(bytes) = encode_message(&ctx, &reply) {
            let _ = endpoint.tx.send(bytes).await;
        }
    }
}

/// [`MapStore`] that only counts calls.
#[derive(Default)]
pub(crate) struct RecordingMaps {
    restores: Mutex<u32>,
    saved: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingMaps {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn restores(&self) -> u32 {
        *self.restores.lock()
    }

    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl MapStore for RecordingMaps {
    async fn restore_reference_map(&self) -> Result<bool> {
        *self.restores.lock() += 1;
        if self.fail {
            return Err(MiioError::Map("reference map missing".into()));
        }
        Ok(true)
    }

    async fn save_map(&self, name: &str) -> Result<()> {
        if self.fail {
            return Err(MiioError::Map("archive not writable".into()));
        }
        self.saved.lock().push(name.to_string());
        Ok(())
    }
}
