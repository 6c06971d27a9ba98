//! Bus-facing operations.
//! One handler per topic under `devices/vacuum/1/`. The bus layer delivers the
//! payload and publishes the returned [`StatusResponse`] on `<topic>/status`.

use crate::cleaning::{CleaningConfig, CleaningJob, Orchestrator};
use crate::device::{Point, Vacuum, Zone};
use crate::error::{MiioError, Result};
use crate::map::MapStore;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TOPIC_PREFIX: &str = "devices/vacuum/1/";
/// Topic carrying lifecycle transitions.
pub const STATE_TOPIC: &str = "devices/vacuum/1/status";

/// Handler outcome: optional data on success, an error string otherwise.
pub type HandlerResult = std::result::Result<Option<String>, String>;

/// Externally visible operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SaveMap,
    Clean,
    GotoTarget,
    CleanRoom,
    SshPubKey,
    SshTunnel,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::SaveMap,
        Operation::Clean,
        Operation::GotoTarget,
        Operation::CleanRoom,
        Operation::SshPubKey,
        Operation::SshTunnel,
    ];

    /// Topic suffix below [`TOPIC_PREFIX`].
    pub fn path(&self) -> &'static str {
        match self {
            Operation::SaveMap => "save_map",
            Operation::Clean => "clean",
            Operation::GotoTarget => "goto_target",
            Operation::CleanRoom => "clean_room",
            Operation::SshPubKey => "ssh/pubkey",
            Operation::SshTunnel => "ssh/tunnel",
        }
    }

    pub fn topic(&self) -> String {
        format!("{}{}", TOPIC_PREFIX, self.path())
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic())
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        let path = topic.strip_prefix(TOPIC_PREFIX)?;
        Self::ALL.into_iter().find(|op| op.path() == path)
    }
}

/// Reply published for every handled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub error: Option<String>,
    pub data: Option<String>,
}

impl From<HandlerResult> for StatusResponse {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(data) => Self { error: None, data },
            Err(error) => Self {
                error: Some(error),
                data: None,
            },
        }
    }
}

/// `clean_room` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Room {
    pub zones: Vec<Zone>,
    pub idle_point: Point,
}

/// `ssh/tunnel` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteHost {
    #[serde(rename = "Address", alias = "address")]
    pub address: String,
    #[serde(rename = "Port", alias = "port")]
    pub port: String,
    /// Record the host key before connecting
    #[serde(rename = "FetchKey", alias = "fetch_key", default)]
    pub fetch_key: bool,
}

/// Remote access provisioning used by the `ssh/*` operations.
#[async_trait]
pub trait SshProvisioner: Send + Sync {
    /// Generates a fresh key pair and returns the public key.
    async fn generate_key(&self) -> Result<String>;

    /// Opens a reverse tunnel to `remote`.
    async fn open_tunnel(&self, remote: &RemoteHost) -> Result<()>;
}

/// Routes bus requests to the session, the map store and the orchestrator.
pub struct Controller {
    orchestrator: Orchestrator,
    maps: Arc<dyn MapStore>,
    ssh: Option<Arc<dyn SshProvisioner>>,
    job: tokio::sync::Mutex<Option<CleaningJob>>,
}

impl Controller {
    pub fn new(vacuum: Vacuum, maps: Arc<dyn MapStore>, config: CleaningConfig) -> Self {
        Self {
            orchestrator: Orchestrator::new(vacuum, maps.clone(), config),
            maps,
            ssh: None,
            job: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_ssh(mut self, ssh: Arc<dyn SshProvisioner>) -> Self {
        self.ssh = Some(ssh);
        self
    }

    pub fn vacuum(&self) -> &Vacuum {
        self.orchestrator.vacuum()
    }

    /// Topics to subscribe to.
    pub fn topics(&self) -> Vec<String> {
        Operation::ALL.iter().map(Operation::topic).collect()
    }

    /// Handles a message for `topic`. `None` if the topic is not ours.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Option<StatusResponse> {
        let Some(op) = Operation::from_topic(topic) else {
            debug!("Ignoring message on {}", topic);
            return None;
        };
        Some(self.dispatch(op, payload).await.into())
    }

    pub async fn dispatch(&self, op: Operation, payload: &[u8]) -> HandlerResult {
        info!("Handling {}", op.path());
        let result = match op {
            Operation::SaveMap => self.save_map(payload).await,
            Operation::Clean => self.clean(payload).await,
            Operation::GotoTarget => self.goto_target(payload).await,
            Operation::CleanRoom => self.clean_room(payload).await,
            Operation::SshPubKey => self.ssh_pubkey().await,
            Operation::SshTunnel => self.ssh_tunnel(payload).await,
        };
        result.map_err(|e| {
            warn!("{} failed: {}", op.path(), e);
            e.to_string()
        })
    }

    /// Cancels a running cleaning job, if any.
    pub async fn shutdown(&self) {
        if let Some(job) = self.job.lock().await.take() {
            job.cancel();
            let outcome = job.join().await;
            info!("Cleaning job stopped: {:?}", outcome);
        }
    }

    async fn save_map(&self, payload: &[u8]) -> Result<Option<String>> {
        self.vacuum().check_docked()?;
        let name = payload_str(payload)?;
        self.maps.save_map(name.trim()).await?;
        Ok(None)
    }

    async fn clean(&self, payload: &[u8]) -> Result<Option<String>> {
        self.vacuum().check_available()?;

        let vacuum = self.vacuum();
        let (command, ok) = match payload_str(payload)? {
            "start" => ("start", vacuum.start_cleaning().await),
            "pause" => ("pause", vacuum.pause_cleaning().await),
            _ => ("stop and dock", vacuum.stop_cleaning_and_dock().await),
        };
        if !ok {
            return Err(MiioError::CommandFailed(command.into()));
        }
        Ok(None)
    }

    async fn goto_target(&self, payload: &[u8]) -> Result<Option<String>> {
        self.vacuum().check_available()?;
        let target: Point = serde_json::from_slice(payload)?;
        self.orchestrator.goto_point(target).await?;
        Ok(None)
    }

    async fn clean_room(&self, payload: &[u8]) -> Result<Option<String>> {
        self.vacuum().check_docked()?;

        let mut job = self.job.lock().await;
        if job.as_ref().is_some_and(|j| !j.is_finished()) {
            return Err(MiioError::Precondition(
                "A cleaning job is already running".into(),
            ));
        }

        let room: Room = serde_json::from_slice(payload)?;
        *job = Some(
            self.orchestrator
                .clean_room(&room.zones, room.idle_point)
                .await?,
        );
        Ok(None)
    }

    async fn ssh_pubkey(&self) -> Result<Option<String>> {
        let key = self.provisioner()?.generate_key().await?;
        Ok(Some(key))
    }

    async fn ssh_tunnel(&self, payload: &[u8]) -> Result<Option<String>> {
        let remote: RemoteHost = serde_json::from_slice(payload)?;
        self.provisioner()?.open_tunnel(&remote).await?;
        Ok(None)
    }

    fn provisioner(&self) -> Result<&Arc<dyn SshProvisioner>> {
        self.ssh
            .as_ref()
            .ok_or_else(|| MiioError::CommandFailed("SSH provisioning not configured".into()))
    }
}

fn payload_str(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|e| MiioError::DecodeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::device::{
        CMD_DOCK, CMD_GET_STATUS, CMD_GOTO_TARGET, CMD_PAUSE, CMD_START, CMD_STOP,
        CMD_ZONED_CLEAN,
    };
    use crate::testing::{RecordingMaps, SimulatedVacuum, session};
    use parking_lot::Mutex;

    struct FakeSsh {
        tunnels: Mutex<Vec<RemoteHost>>,
    }

    #[async_trait]
    impl SshProvisioner for FakeSsh {
        async fn generate_key(&self) -> Result<String> {
            Ok("ssh-ed25519 AAAAC3Nza vacuum_1".into())
        }

        async fn open_tunnel(&self, remote: &RemoteHost) -> Result<()> {
            self.tunnels.lock().push(remote.clone());
            Ok(())
        }
    }

    /// Controller over a simulator reporting `status`, state already fetched.
    async fn controller(status: i64) -> (Controller, SimulatedVacuum, Arc<RecordingMaps>) {
        let (vacuum, sim) = session(SessionConfig::default());
        let mut updates = vacuum.subscribe();
        sim.with(|s| s.status = status);
        assert!(vacuum.update_status().await);
        updates.recv().await.unwrap();
        sim.with(|s| s.received.clear());

        let maps = Arc::new(RecordingMaps::default());
        let controller = Controller::new(vacuum, maps.clone(), CleaningConfig::default());
        (controller, sim, maps)
    }

    #[test]
    fn topics_map_to_operations() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_topic(&op.topic()), Some(op));
        }
        assert_eq!(
            Operation::SshTunnel.topic(),
            "devices/vacuum/1/ssh/tunnel"
        );
        assert_eq!(
            Operation::Clean.status_topic(),
            "devices/vacuum/1/clean/status"
        );
        assert_eq!(Operation::from_topic("devices/vacuum/1/ping"), None);
        assert_eq!(Operation::from_topic("save_map"), None);
    }

    #[test]
    fn status_response_shape() {
        let ok = StatusResponse::from(Ok(Some("key".to_string())));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"error":null,"data":"key"}"#
        );
        let err = StatusResponse::from(Err("Vacuum busy! - State: 17".to_string()));
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"error":"Vacuum busy! - State: 17","data":null}"#
        );
    }

    #[test]
    fn remote_host_accepts_both_spellings() {
        let a: RemoteHost =
            serde_json::from_str(r#"{"Address":"10.0.0.2","Port":"2222","FetchKey":true}"#)
                .unwrap();
        let b: RemoteHost =
            serde_json::from_str(r#"{"address":"10.0.0.2","port":"2222"}"#).unwrap();
        assert!(a.fetch_key);
        assert!(!b.fetch_key);
        assert_eq!(a.address, b.address);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_topic_is_not_handled() {
        let (controller, _sim, _maps) = controller(8).await;
        assert_eq!(controller.handle("devices/other/1/clean", b"start").await, None);
        assert_eq!(controller.topics().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_commands_follow_payload() {
        let (controller, sim, _maps) = controller(8).await;
        let topic = Operation::Clean.topic();

        let reply = controller.handle(&topic, b"start").await.unwrap();
        assert_eq!(reply, StatusResponse { error: None, data: None });
        assert_eq!(sim.methods(), vec![CMD_START, CMD_GET_STATUS]);

        sim.with(|s| s.received.clear());
        controller.handle(&topic, b"pause").await.unwrap();
        assert_eq!(sim.methods(), vec![CMD_PAUSE, CMD_GET_STATUS]);

        sim.with(|s| s.received.clear());
        controller.handle(&topic, b"home").await.unwrap();
        assert_eq!(sim.methods(), vec![CMD_STOP, CMD_DOCK, CMD_GET_STATUS]);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_vacuum_rejects_clean_without_commands() {
        let (controller, sim, _maps) = controller(17).await;
        let reply = controller
            .handle(&Operation::Clean.topic(), b"start")
            .await
            .unwrap();
        assert_eq!(reply.error.as_deref(), Some("Vacuum busy! - State: 17"));
        assert!(sim.methods().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn goto_target_parses_coordinates() {
        let (controller, sim, maps) = controller(3).await;

        let err = controller
            .dispatch(Operation::GotoTarget, b"not json")
            .await
            .unwrap_err();
        assert!(err.starts_with("JSON error"), "{}", err);

        controller
            .dispatch(Operation::GotoTarget, b"[25500,26500]")
            .await
            .unwrap();
        assert_eq!(maps.restores(), 1);
        assert_eq!(sim.methods(), vec![CMD_GOTO_TARGET, CMD_GET_STATUS]);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_room_runs_one_job_at_a_time() {
        let (controller, sim, maps) = controller(8).await;
        let payload =
            br#"{"zones":[[25000,25000,27000,27000,2]],"idle_point":[25500,25500]}"#;

        assert_eq!(
            controller.dispatch(Operation::CleanRoom, payload).await,
            Ok(None)
        );
        assert_eq!(maps.restores(), 1);
        assert_eq!(sim.methods(), vec![CMD_ZONED_CLEAN, CMD_GET_STATUS]);

        let err = controller
            .dispatch(Operation::CleanRoom, payload)
            .await
            .unwrap_err();
        assert_eq!(err, "A cleaning job is already running");
        assert_eq!(maps.restores(), 1);

        controller.shutdown().await;
        assert_eq!(
            controller.dispatch(Operation::CleanRoom, payload).await,
            Ok(None)
        );
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clean_room_requires_dock() {
        let (controller, sim, maps) = controller(3).await;
        let payload = br#"{"zones":[[1,2,3,4,1]],"idle_point":[5,6]}"#;
        let err = controller
            .dispatch(Operation::CleanRoom, payload)
            .await
            .unwrap_err();
        assert_eq!(err, "Vacuum not docked! - State: 3");
        assert_eq!(maps.restores(), 0);
        assert!(sim.methods().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn save_map_uses_payload_as_name() {
        let (controller, _sim, maps) = controller(100).await;
        assert_eq!(
            controller.dispatch(Operation::SaveMap, b"kitchen\n").await,
            Ok(None)
        );
        assert_eq!(maps.saved(), vec!["kitchen"]);
    }

    #[tokio::test(start_paused = true)]
    async fn ssh_operations_delegate_to_provisioner() {
        let (controller, _sim, _maps) = controller(8).await;
        assert!(
            controller
                .dispatch(Operation::SshPubKey, b"")
                .await
                .is_err()
        );

        let ssh = Arc::new(FakeSsh {
            tunnels: Mutex::new(Vec::new()),
        });
        let controller = controller.with_ssh(ssh.clone());
        assert_eq!(
            controller.dispatch(Operation::SshPubKey, b"").await,
            Ok(Some("ssh-ed25519 AAAAC3Nza vacuum_1".to_string()))
        );

        controller
            .dispatch(
                Operation::SshTunnel,
                br#"{"Address":"bridge.local","Port":"22","FetchKey":true}"#,
            )
            .await
            .unwrap();
        let tunnels = ssh.tunnels.lock().clone();
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].address, "bridge.local");
    }
}
