//! RPC surface of the daemon.
//!
//! One request/reply pair per verb, all streamed: a handler may write any
//! number of replies before its status resolves. The wire framing is the
//! server harness's concern; these are the payloads it carries.

use multipassd_common::types::SnapshotInfo;
use multipassd_common::{InstanceState, MountKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Level;

pub use tonic::{Code, Status};

/// Map a client verbosity level to the lowest log level forwarded to it.
pub fn level_from(verbosity: i32) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn level_code(level: Level) -> i32 {
    match level {
        Level::ERROR => 0,
        Level::WARN => 1,
        Level::INFO => 2,
        Level::DEBUG => 3,
        Level::TRACE => 4,
    }
}

/// Sender half of one RPC's reply stream.
pub struct ReplyStream<R> {
    tx: mpsc::Sender<R>,
}

impl<R> Clone for ReplyStream<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: Send + 'static> ReplyStream<R> {
    /// A connected stream pair; the receiver side is what the server harness
    /// (or a test) drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<R>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Write one reply. Returns false when the client is gone.
    pub async fn write(&self, reply: R) -> bool {
        self.tx.send(reply).await.is_ok()
    }

    /// Non-blocking write for synchronous callbacks (progress monitors).
    /// Drops the reply when the stream is full or closed.
    pub fn try_write(&self, reply: R) -> bool {
        self.tx.try_send(reply).is_ok()
    }
}

/// Reply types that can carry daemon log lines and progress messages.
pub trait StreamedReply: Default + Send + 'static {
    fn set_log_line(&mut self, line: String);

    /// Progress message slot; a no-op for replies without one.
    fn set_reply_message(&mut self, _msg: String) {}
}

/// Per-RPC scoped logger.
///
/// Everything goes to the daemon log; lines at or below the client's
/// requested verbosity are additionally written to the reply stream.
pub struct ClientLogger<R> {
    verbosity: i32,
    stream: ReplyStream<R>,
}

impl<R: StreamedReply> ClientLogger<R> {
    pub fn new(verbosity: i32, stream: ReplyStream<R>) -> Self {
        Self { verbosity, stream }
    }

    pub async fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!("{}", message),
            Level::WARN => tracing::warn!("{}", message),
            Level::INFO => tracing::info!("{}", message),
            Level::DEBUG => tracing::debug!("{}", message),
            Level::TRACE => tracing::trace!("{}", message),
        }

        if level_code(level) <= self.verbosity {
            let mut reply = R::default();
            reply.set_log_line(format!("[{}] {}\n", level.as_str().to_lowercase(), message));
            self.stream.write(reply).await;
        }
    }
}

/// Status shown to clients for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Restarting,
    Running,
    DelayedShutdown,
    Suspending,
    Suspended,
    Deleted,
    Unknown,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl From<InstanceState> for InstanceStatus {
    fn from(state: InstanceState) -> Self {
        match state {
            InstanceState::Off | InstanceState::Stopped => Self::Stopped,
            InstanceState::Starting => Self::Starting,
            InstanceState::Restarting => Self::Restarting,
            InstanceState::Running => Self::Running,
            InstanceState::DelayedShutdown => Self::DelayedShutdown,
            InstanceState::Suspending => Self::Suspending,
            InstanceState::Suspended => Self::Suspended,
            InstanceState::Unknown => Self::Unknown,
        }
    }
}

/// `(instance, snapshot)` pair; an empty snapshot name addresses the whole
/// instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshotPair {
    pub instance_name: String,
    pub snapshot_name: String,
}

/// One `(instance, target path)` entry of a mount or umount request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPathEntry {
    pub instance_name: String,
    pub target_path: String,
}

/// Requested mode for one extra network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Auto,
    Manual,
}

impl Default for NetworkMode {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOptions {
    pub id: String,
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub mac_address: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request payload shared by `create` and `launch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub remote_name: String,
    #[serde(default)]
    pub num_cores: i32,
    /// Human size string; empty means default.
    #[serde(default)]
    pub mem_size: String,
    /// Human size string; empty means "compute from the image".
    #[serde(default)]
    pub disk_space: String,
    #[serde(default)]
    pub network_options: Vec<NetworkOptions>,
    #[serde(default)]
    pub permission_to_bridge: bool,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub cloud_init_user_data: String,
    /// Seconds; zero means the default.
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    #[serde(default)]
    pub time_minutes: i32,
    #[serde(default)]
    pub cancel_shutdown: bool,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuspendRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub instances_snapshots: Vec<InstanceSnapshotPair>,
    #[serde(default)]
    pub purge: bool,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub request_ipv4: bool,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoRequest {
    #[serde(default)]
    pub instances_snapshots: Vec<InstanceSnapshotPair>,
    #[serde(default)]
    pub no_runtime_information: bool,
    #[serde(default)]
    pub snapshot_overview: bool,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindRequest {
    #[serde(default)]
    pub search_string: String,
    #[serde(default)]
    pub remote_name: String,
    #[serde(default)]
    pub show_images: bool,
    #[serde(default)]
    pub show_blueprints: bool,
    #[serde(default)]
    pub allow_unsupported: bool,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworksRequest {
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountMaps {
    #[serde(default)]
    pub uid_mappings: Vec<(i32, i32)>,
    #[serde(default)]
    pub gid_mappings: Vec<(i32, i32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    pub source_path: String,
    pub target_paths: Vec<TargetPathEntry>,
    #[serde(default)]
    pub mount_maps: MountMaps,
    pub mount_type: MountKind,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UmountRequest {
    #[serde(default)]
    pub target_paths: Vec<TargetPathEntry>,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshInfoRequest {
    #[serde(default)]
    pub instance_name: Vec<String>,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionRequest {
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub val: String,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysRequest {
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub passphrase: String,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub instance: String,
    #[serde(default)]
    pub snapshot: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub instance: String,
    pub snapshot: String,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default)]
    pub verbosity_level: i32,
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchProgress {
    pub percent_complete: String,
}

/// Reply payload shared by `create` and `launch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchReply {
    #[serde(default)]
    pub create_message: String,
    #[serde(default)]
    pub launch_progress: Option<LaunchProgress>,
    #[serde(default)]
    pub vm_instance_name: String,
    #[serde(default)]
    pub reply_message: String,
    #[serde(default)]
    pub nets_need_bridging: Vec<String>,
    #[serde(default)]
    pub aliases_to_be_created: Vec<multipassd_backend::AliasDefinition>,
    #[serde(default)]
    pub workspaces_to_be_created: Vec<String>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for LaunchReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
    fn set_reply_message(&mut self, msg: String) {
        self.reply_message = msg;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartReply {
    #[serde(default)]
    pub reply_message: String,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for StartReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
    fn set_reply_message(&mut self, msg: String) {
        self.reply_message = msg;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopReply {
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for StopReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuspendReply {
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for SuspendReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartReply {
    #[serde(default)]
    pub reply_message: String,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for RestartReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
    fn set_reply_message(&mut self, msg: String) {
        self.reply_message = msg;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteReply {
    #[serde(default)]
    pub purged_instances: Vec<String>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for DeleteReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeReply {
    #[serde(default)]
    pub purged_instances: Vec<String>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for PurgeReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVMInstance {
    pub name: String,
    pub instance_status: InstanceStatus,
    #[serde(default)]
    pub current_release: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListReply {
    #[serde(default)]
    pub instances: Vec<ListVMInstance>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for ListReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountPathEntry {
    pub source_path: String,
    pub target_path: String,
    #[serde(default)]
    pub uid_mappings: Vec<(i32, i32)>,
    #[serde(default)]
    pub gid_mappings: Vec<(i32, i32)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountInfo {
    pub longest_path_len: u64,
    #[serde(default)]
    pub mount_paths: Vec<MountPathEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub name: String,
    pub instance_status: InstanceStatus,
    #[serde(default)]
    pub image_release: String,
    #[serde(default)]
    pub current_release: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub num_snapshots: u64,
    #[serde(default)]
    pub load: String,
    #[serde(default)]
    pub memory_usage: String,
    #[serde(default)]
    pub memory_total: String,
    #[serde(default)]
    pub disk_usage: String,
    #[serde(default)]
    pub disk_total: String,
    #[serde(default)]
    pub cpu_count: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub mount_info: MountInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotOverviewEntry {
    pub instance_name: String,
    pub fundamentals: SnapshotInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoReply {
    #[serde(default)]
    pub details: Vec<InstanceDetails>,
    #[serde(default)]
    pub snapshot_overview: Vec<SnapshotOverviewEntry>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for InfoReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasInfo {
    #[serde(default)]
    pub remote_name: String,
    pub alias: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindImageInfo {
    #[serde(default)]
    pub aliases_info: Vec<AliasInfo>,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindReply {
    #[serde(default)]
    pub show_images: bool,
    #[serde(default)]
    pub show_blueprints: bool,
    #[serde(default)]
    pub images_info: Vec<FindImageInfo>,
    #[serde(default)]
    pub blueprints_info: Vec<FindImageInfo>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for FindReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterfaceEntry {
    pub name: String,
    #[serde(default)]
    pub if_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworksReply {
    #[serde(default)]
    pub interfaces: Vec<NetworkInterfaceEntry>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for NetworksReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountReply {
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for MountReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UmountReply {
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for UmountReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoverReply {
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for RecoverReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoverRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    #[serde(default)]
    pub verbosity_level: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub priv_key_base64: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshInfoReply {
    #[serde(default)]
    pub ssh_info: std::collections::HashMap<String, SshInfo>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for SshInfoReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for VersionReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for GetReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetReply {
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for SetReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysReply {
    #[serde(default)]
    pub settings_keys: Vec<String>,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for KeysReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticateReply {
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for AuthenticateReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotReply {
    #[serde(default)]
    pub snapshot: String,
    #[serde(default)]
    pub reply_message: String,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for SnapshotReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
    fn set_reply_message(&mut self, msg: String) {
        self.reply_message = msg;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReply {
    #[serde(default)]
    pub reply_message: String,
    #[serde(default)]
    pub log_line: String,
}

impl StreamedReply for RestoreReply {
    fn set_log_line(&mut self, line: String) {
        self.log_line = line;
    }
    fn set_reply_message(&mut self, msg: String) {
        self.reply_message = msg;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_verbosity() {
        assert_eq!(level_from(0), Level::ERROR);
        assert_eq!(level_from(2), Level::INFO);
        assert_eq!(level_from(9), Level::TRACE);
    }

    #[test]
    fn test_instance_status_from_state() {
        assert_eq!(
            InstanceStatus::from(InstanceState::Off),
            InstanceStatus::Stopped
        );
        assert_eq!(
            InstanceStatus::from(InstanceState::Stopped),
            InstanceStatus::Stopped
        );
        assert_eq!(
            InstanceStatus::from(InstanceState::DelayedShutdown),
            InstanceStatus::DelayedShutdown
        );
    }

    #[tokio::test]
    async fn test_reply_stream_delivers_in_order() {
        let (stream, mut rx) = ReplyStream::channel(8);
        assert!(stream.write(StartReply::default()).await);
        assert!(
            stream
                .write(StartReply {
                    reply_message: "second".into(),
                    ..Default::default()
                })
                .await
        );
        assert_eq!(rx.recv().await.unwrap().reply_message, "");
        assert_eq!(rx.recv().await.unwrap().reply_message, "second");
    }

    #[tokio::test]
    async fn test_client_logger_respects_verbosity() {
        let (stream, mut rx) = ReplyStream::channel(8);
        let logger = ClientLogger::<StartReply>::new(1, stream);

        logger.log(Level::INFO, "too chatty").await;
        logger.log(Level::WARN, "matters").await;
        drop(logger);

        let reply = rx.recv().await.unwrap();
        assert!(reply.log_line.contains("matters"));
        assert!(rx.recv().await.is_none());
    }
}
