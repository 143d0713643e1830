//! Mock collaborators shared by the crate's tests.

use async_trait::async_trait;
use multipassd_backend::{
    AliasDefinition, Backend, BlueprintProvider, ClientLaunchData, ImageVault, MountHandler,
    NetworkInterfaceInfo, ProgressFn, Query, Settings, SshConnector, SshExec, SshKeyProvider,
    SshSession, VMImage, VMImageInfo, VirtualMachine, VirtualMachineDescription,
};
use multipassd_common::config::DaemonPaths;
use multipassd_common::types::SnapshotInfo;
use multipassd_common::{Error, InstanceState, MemorySize, Result, VMMount, VMSpecs};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::alloc::NameGenerator;
use crate::config::DaemonConfig;

// ---------------------------------------------------------------------------
// Virtual machine
// ---------------------------------------------------------------------------

pub struct MockVirtualMachine {
    name: String,
    state: Mutex<InstanceState>,
    snapshots: Mutex<Vec<SnapshotInfo>>,
    pub fail_start: AtomicBool,
    pub fail_ssh: AtomicBool,
    pub ssh_wait_delay: Mutex<Duration>,
    pub start_calls: AtomicUsize,
    pub ssh_waits: AtomicUsize,
    pub cloud_init_waits: AtomicUsize,
    pub ipv4: Mutex<Vec<String>>,
    pub management_ip: Mutex<String>,
}

impl MockVirtualMachine {
    pub fn new(name: &str, state: InstanceState) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(state),
            snapshots: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_ssh: AtomicBool::new(false),
            ssh_wait_delay: Mutex::new(Duration::ZERO),
            start_calls: AtomicUsize::new(0),
            ssh_waits: AtomicUsize::new(0),
            cloud_init_waits: AtomicUsize::new(0),
            ipv4: Mutex::new(vec!["192.168.64.5".to_string()]),
            management_ip: Mutex::new("192.168.64.2".to_string()),
        }
    }
}

#[async_trait]
impl VirtualMachine for MockVirtualMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_state(&self) -> InstanceState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.lock().unwrap() = state;
    }

    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Backend("failed to start".into()));
        }
        self.set_state(InstanceState::Starting);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.set_state(InstanceState::Off);
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        self.set_state(InstanceState::Suspended);
        Ok(())
    }

    fn ssh_hostname(&self) -> String {
        "localhost".to_string()
    }

    fn ssh_port(&self) -> u16 {
        22
    }

    fn ssh_username(&self) -> String {
        "ubuntu".to_string()
    }

    fn management_ipv4(&self) -> String {
        self.management_ip.lock().unwrap().clone()
    }

    async fn get_all_ipv4(&self) -> Vec<String> {
        self.ipv4.lock().unwrap().clone()
    }

    async fn wait_until_ssh_up(&self, _timeout: Duration) -> Result<()> {
        self.ssh_waits.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ssh_wait_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_ssh.load(Ordering::SeqCst) {
            return Err(Error::Ssh(format!("{}: SSH unreachable", self.name)));
        }
        if self.current_state() == InstanceState::Starting {
            self.set_state(InstanceState::Running);
        }
        Ok(())
    }

    async fn wait_for_cloud_init(&self, _timeout: Duration) -> Result<()> {
        self.cloud_init_waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn take_snapshot(
        &self,
        _specs: &VMSpecs,
        name: &str,
        comment: &str,
    ) -> Result<SnapshotInfo> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let name = if name.is_empty() {
            format!("snapshot{}", snapshots.len() + 1)
        } else {
            name.to_string()
        };
        if snapshots.iter().any(|s| s.name == name) {
            return Err(Error::SnapshotNameTaken {
                instance: self.name.clone(),
                name,
            });
        }
        let info = SnapshotInfo {
            name: name.clone(),
            parent: snapshots.last().map(|s| s.name.clone()).unwrap_or_default(),
            comment: comment.to_string(),
        };
        snapshots.push(info.clone());
        Ok(info)
    }

    async fn restore_snapshot(&self, name: &str, specs: &mut VMSpecs) -> Result<()> {
        let snapshots = self.snapshots.lock().unwrap();
        if !snapshots.iter().any(|s| s.name == name) {
            return Err(Error::NoSuchSnapshot {
                instance: self.name.clone(),
                name: name.to_string(),
            });
        }
        specs.state = InstanceState::Stopped;
        Ok(())
    }

    fn view_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots.lock().unwrap().clone()
    }

    fn get_snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchSnapshot {
                instance: self.name.clone(),
                name: name.to_string(),
            })
    }

    fn make_native_mount_handler(
        &self,
        _target: &str,
        _mount: &VMMount,
    ) -> Result<Box<dyn MountHandler>> {
        Ok(Box::new(MockMountHandler::backend_managed()))
    }
}

// ---------------------------------------------------------------------------
// Mount handler
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MountCounters {
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
}

pub struct MockMountHandler {
    managed: bool,
    fail_activate: bool,
    pub counters: Arc<MountCounters>,
}

impl MockMountHandler {
    pub fn new() -> Self {
        Self {
            managed: false,
            fail_activate: false,
            counters: Arc::new(MountCounters::default()),
        }
    }

    pub fn backend_managed() -> Self {
        Self {
            managed: true,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_activate: true,
            ..Self::new()
        }
    }
}

impl Default for MockMountHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MountHandler for MockMountHandler {
    async fn activate(&mut self) -> Result<()> {
        self.counters.activations.fetch_add(1, Ordering::SeqCst);
        if self.fail_activate {
            return Err(Error::Runtime("mount refused".into()));
        }
        Ok(())
    }

    async fn deactivate(&mut self, _force: bool) -> Result<()> {
        self.counters.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_mount_managed_by_backend(&self) -> bool {
        self.managed
    }
}

// ---------------------------------------------------------------------------
// Backend factory
// ---------------------------------------------------------------------------

pub struct MockBackend {
    pub created: Mutex<HashMap<String, Arc<MockVirtualMachine>>>,
    pub removed: Mutex<Vec<String>>,
    pub health_checks: AtomicUsize,
    pub fail_health: AtomicBool,
    pub fail_create: AtomicBool,
    pub next_vm_fails_start: AtomicBool,
    pub host_networks: Mutex<Vec<NetworkInterfaceInfo>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            created: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            health_checks: AtomicUsize::new(0),
            fail_health: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            next_vm_fails_start: AtomicBool::new(false),
            host_networks: Mutex::new(vec![
                NetworkInterfaceInfo {
                    id: "eth0".into(),
                    if_type: "ethernet".into(),
                    description: "wired adapter".into(),
                    needs_authorization: false,
                },
                NetworkInterfaceInfo {
                    id: "wlan0".into(),
                    if_type: "wifi".into(),
                    description: "wireless adapter".into(),
                    needs_authorization: true,
                },
            ]),
        }
    }
}

impl MockBackend {
    pub fn vm(&self, name: &str) -> Arc<MockVirtualMachine> {
        self.created.lock().unwrap().get(name).unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
    ) -> Result<Arc<dyn VirtualMachine>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Backend("could not create machine".into()));
        }
        let vm = Arc::new(MockVirtualMachine::new(&desc.vm_name, InstanceState::Off));
        if self.next_vm_fails_start.swap(false, Ordering::SeqCst) {
            vm.fail_start.store(true, Ordering::SeqCst);
        }
        self.created
            .lock()
            .unwrap()
            .insert(desc.vm_name.clone(), vm.clone());
        Ok(vm)
    }

    async fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        Ok(self.host_networks.lock().unwrap().clone())
    }

    async fn hypervisor_health_check(&self) -> Result<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(Error::Backend("hypervisor unavailable".into()));
        }
        Ok(())
    }

    async fn prepare_networking(
        &self,
        _extra_interfaces: &mut Vec<multipassd_common::NetworkInterface>,
    ) -> Result<()> {
        Ok(())
    }

    async fn prepare_instance_image(
        &self,
        _image: &VMImage,
        _desc: &VirtualMachineDescription,
    ) -> Result<()> {
        Ok(())
    }

    async fn configure(&self, _desc: &mut VirtualMachineDescription) -> Result<()> {
        Ok(())
    }

    async fn remove_resources_for(&self, name: &str) -> Result<()> {
        self.removed.lock().unwrap().push(name.to_string());
        self.created.lock().unwrap().remove(name);
        Ok(())
    }

    fn backend_directory_name(&self) -> &str {
        "mock"
    }

    fn backend_version_string(&self) -> String {
        "mock-1.0".to_string()
    }
}

// ---------------------------------------------------------------------------
// Image vault
// ---------------------------------------------------------------------------

pub struct MockVault {
    image_root: std::path::PathBuf,
    pub records: Mutex<HashMap<String, VMImage>>,
    pub infos: Mutex<Vec<(String, VMImageInfo)>>,
    pub min_image_size: Mutex<MemorySize>,
    pub fail_fetch: AtomicBool,
    pub removed: Mutex<Vec<String>>,
    prune_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl MockVault {
    pub fn new(image_root: std::path::PathBuf) -> Self {
        let default_info = VMImageInfo {
            os: "Ubuntu".into(),
            release_title: "24.04 LTS".into(),
            version: "20260801".into(),
            aliases: vec!["default".into(), "noble".into(), "lts".into()],
            id: "0123456789abcdef0123456789abcdef".into(),
            supported: true,
        };
        Self {
            image_root,
            records: Mutex::new(HashMap::new()),
            infos: Mutex::new(vec![("release".to_string(), default_info)]),
            min_image_size: Mutex::new("1G".parse().unwrap()),
            fail_fetch: AtomicBool::new(false),
            removed: Mutex::new(Vec::new()),
            prune_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Seed a vault record whose image file exists on disk.
    pub fn seed_record(&self, name: &str) -> VMImage {
        let dir = self.image_root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ubuntu.img");
        std::fs::write(&path, b"image").unwrap();
        let image = VMImage {
            image_path: path,
            id: "0123456789abcdef0123456789abcdef".into(),
            original_release: "24.04 LTS".into(),
        };
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), image.clone());
        image
    }

    pub fn prune_calls(&self) -> usize {
        self.prune_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageVault for MockVault {
    async fn fetch_image(&self, query: &Query, monitor: ProgressFn<'_>) -> Result<VMImage> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::CreateImageFailure("download failed".into()));
        }
        monitor(0);
        monitor(100);

        if let Some(image) = self.records.lock().unwrap().get(&query.name) {
            return Ok(image.clone());
        }
        Ok(self.seed_record(&query.name))
    }

    async fn has_record_for(&self, name: &str) -> bool {
        self.records.lock().unwrap().contains_key(name)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.records.lock().unwrap().remove(name);
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn minimum_image_size_for(&self, _id: &str) -> Result<MemorySize> {
        Ok(*self.min_image_size.lock().unwrap())
    }

    async fn all_info_for(&self, query: &Query) -> Result<Vec<(String, VMImageInfo)>> {
        let infos = self.infos.lock().unwrap();
        Ok(infos
            .iter()
            .filter(|(_, info)| {
                query.release.is_empty() || info.aliases.iter().any(|a| a == &query.release)
            })
            .cloned()
            .collect())
    }

    async fn all_images(
        &self,
        remote_name: &str,
        _allow_unsupported: bool,
    ) -> Result<Vec<(String, VMImageInfo)>> {
        let infos = self.infos.lock().unwrap();
        Ok(infos
            .iter()
            .filter(|(remote, _)| remote_name.is_empty() || remote == remote_name)
            .cloned()
            .collect())
    }

    async fn prune_expired_images(&self) -> Result<()> {
        self.prune_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_images(&self, monitor: ProgressFn<'_>) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        for percentage in [0, 10, 10, 50, 100] {
            monitor(percentage);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blueprints
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockBlueprintProvider {
    /// name -> (suggested instance name, aliases)
    pub blueprints: Mutex<HashMap<String, (String, Vec<AliasDefinition>)>>,
}

#[async_trait]
impl BlueprintProvider for MockBlueprintProvider {
    async fn fetch_blueprint_for(
        &self,
        name: &str,
        _desc: &mut VirtualMachineDescription,
        launch_data: &mut ClientLaunchData,
    ) -> Result<Query> {
        let blueprints = self.blueprints.lock().unwrap();
        let (_, aliases) = blueprints
            .get(name)
            .ok_or_else(|| Error::ImageNotFound(name.to_string()))?;
        launch_data.aliases_to_be_created = aliases.clone();
        Ok(Query::alias("", "default"))
    }

    async fn info_for(&self, name: &str) -> Result<Option<VMImageInfo>> {
        let blueprints = self.blueprints.lock().unwrap();
        Ok(blueprints.get(name).map(|_| VMImageInfo {
            os: "Ubuntu".into(),
            release_title: name.to_string(),
            version: "v1".into(),
            aliases: vec![name.to_string()],
            id: format!("blueprint-{}", name),
            supported: true,
        }))
    }

    async fn all_blueprints(&self) -> Result<Vec<VMImageInfo>> {
        Ok(Vec::new())
    }

    fn name_from_blueprint(&self, name: &str) -> String {
        self.blueprints
            .lock()
            .unwrap()
            .get(name)
            .map(|(suggested, _)| suggested.clone())
            .unwrap_or_default()
    }

    fn blueprint_timeout(&self, _name: &str) -> i32 {
        0
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

pub struct MockKeyProvider;

impl SshKeyProvider for MockKeyProvider {
    fn public_key_as_base64(&self) -> String {
        "MOCKPUBKEY".to_string()
    }

    fn private_key_as_base64(&self) -> String {
        "MOCKPRIVKEY".to_string()
    }
}

#[derive(Default)]
struct SshScript {
    responses: HashMap<String, SshExec>,
    log: Vec<String>,
}

/// Connector whose sessions answer from a command -> response table;
/// unscripted commands succeed with empty output.
#[derive(Default)]
pub struct MockSshConnector {
    script: Arc<Mutex<SshScript>>,
    pub fail_connect: AtomicBool,
    pub connections: AtomicUsize,
}

impl MockSshConnector {
    pub fn respond(&self, command: &str, exec: SshExec) {
        self.script
            .lock()
            .unwrap()
            .responses
            .insert(command.to_string(), exec);
    }

    pub fn executed(&self) -> Vec<String> {
        self.script.lock().unwrap().log.clone()
    }
}

struct MockSshSession {
    script: Arc<Mutex<SshScript>>,
}

#[async_trait]
impl SshSession for MockSshSession {
    async fn exec(&mut self, command: &str) -> Result<SshExec> {
        let mut script = self.script.lock().unwrap();
        script.log.push(command.to_string());
        Ok(script
            .responses
            .get(command)
            .cloned()
            .unwrap_or(SshExec {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }))
    }
}

#[async_trait]
impl SshConnector for MockSshConnector {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        _username: &str,
        _keys: &dyn SshKeyProvider,
    ) -> Result<Box<dyn SshSession>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Ssh("connection refused".into()));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSshSession {
            script: self.script.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub struct MockSettings {
    values: Mutex<HashMap<String, String>>,
}

impl Default for MockSettings {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert(
            multipassd_common::settings::MOUNTS_KEY.to_string(),
            "true".to_string(),
        );
        values.insert(
            multipassd_common::settings::BRIDGED_INTERFACE_KEY.to_string(),
            String::new(),
        );
        values.insert(
            multipassd_common::settings::PASSPHRASE_KEY.to_string(),
            String::new(),
        );
        Self {
            values: Mutex::new(values),
        }
    }
}

impl MockSettings {
    pub fn insert(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

impl Settings for MockSettings {
    fn get(&self, key: &str) -> Result<String> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnrecognizedSetting(key.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        if !values.contains_key(key) {
            return Err(Error::UnrecognizedSetting(key.to_string()));
        }
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

// ---------------------------------------------------------------------------
// Name generation
// ---------------------------------------------------------------------------

/// Deterministic name generator: prefix-0, prefix-1, ...
pub struct SequentialNames {
    prefix: String,
    counter: AtomicUsize,
}

impl SequentialNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl NameGenerator for SequentialNames {
    fn make_name(&self) -> String {
        format!(
            "{}-{}",
            self.prefix,
            self.counter.fetch_add(1, Ordering::SeqCst)
        )
    }
}

// ---------------------------------------------------------------------------
// Assembled configuration
// ---------------------------------------------------------------------------

pub struct MockHandles {
    pub factory: Arc<MockBackend>,
    pub vault: Arc<MockVault>,
    pub blueprints: Arc<MockBlueprintProvider>,
    pub ssh: Arc<MockSshConnector>,
    pub settings: Arc<MockSettings>,
    pub data_dir: tempfile::TempDir,
    pub cache_dir: tempfile::TempDir,
}

/// A daemon configuration wired entirely to mocks over temp directories.
pub fn mock_daemon_config() -> (DaemonConfig, MockHandles) {
    let data_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();

    let factory = Arc::new(MockBackend::default());
    let vault = Arc::new(MockVault::new(data_dir.path().join("vault")));
    let blueprints = Arc::new(MockBlueprintProvider::default());
    let ssh = Arc::new(MockSshConnector::default());
    let settings = Arc::new(MockSettings::default());

    let config = DaemonConfig {
        paths: DaemonPaths {
            data_directory: data_dir.path().to_path_buf(),
            cache_directory: cache_dir.path().to_path_buf(),
            ssh_username: "ubuntu".to_string(),
            image_refresh_secs: 6 * 60 * 60,
        },
        factory: factory.clone(),
        vault: vault.clone(),
        blueprint_provider: blueprints.clone(),
        ssh_key_provider: Arc::new(MockKeyProvider),
        ssh: ssh.clone(),
        settings: settings.clone(),
        name_generator: Arc::new(SequentialNames::new("generated")),
    };

    (
        config,
        MockHandles {
            factory,
            vault,
            blueprints,
            ssh,
            settings,
            data_dir,
            cache_dir,
        },
    )
}
