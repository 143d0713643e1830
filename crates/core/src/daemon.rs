//! The command dispatcher.
//!
//! One async method per RPC verb. Every handler follows the same shape:
//! select targets, react per the command's reaction table, drive the backend,
//! update the registry and persist the catalog, streaming replies along the
//! way. Start-like verbs finish through the shared readiness pipeline, which
//! guarantees at most one concurrent waiter per instance name.

use async_trait::async_trait;
use futures::FutureExt;
use multipassd_backend::{ClientLaunchData, VirtualMachine, VirtualMachineDescription};
use multipassd_common::config::DEFAULT_TIMEOUT;
use multipassd_common::settings::{MOUNTS_KEY, PASSPHRASE_KEY};
use multipassd_common::{Error, InstanceState, MemorySize, Result, VMMount, VMSpecs};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tonic::{Code, Status};
use tracing::Level;

use crate::config::DaemonConfig;
use crate::registry::DaemonState;
use crate::rpc::*;
use crate::select::{
    self, find_instance, require_existing_instances, require_missing_instances,
    require_operative_instances, InstanceGroup, ReactionComponent, SelectionReaction,
};
use crate::{alloc, catalog, cloudinit, maintenance, mounts, shutdown, validate};

use multipassd_backend::vault::{Query, QueryType, VMImageInfo};

const REBOOT_CMD: &str = "sudo reboot";
const STOP_SSH_CMD: &str = "sudo systemctl stop ssh";

fn fp(e: Error) -> Status {
    e.status_with_default(Code::FailedPrecondition)
}

fn internal(e: Error) -> Status {
    e.status_with_default(Code::Internal)
}

fn timeout_for(requested: i32, blueprint_timeout: i32) -> Duration {
    if requested > 0 {
        Duration::from_secs(requested as u64)
    } else if blueprint_timeout > 0 {
        Duration::from_secs(blueprint_timeout as u64)
    } else {
        DEFAULT_TIMEOUT
    }
}

fn is_ipv4_valid(address: &str) -> bool {
    address.parse::<std::net::Ipv4Addr>().is_ok()
}

fn query_from(request: &LaunchRequest, name: &str) -> Result<Query> {
    if !request.remote_name.is_empty() && request.image.is_empty() {
        return Err(Error::Runtime(
            "Must specify an image when specifying a remote".into(),
        ));
    }

    let image = if request.image.is_empty() {
        "default".to_string()
    } else {
        request.image.clone()
    };

    let query_type = if image.starts_with("file") {
        QueryType::LocalFile
    } else if image.starts_with("http") {
        QueryType::HttpDownload
    } else {
        QueryType::Alias
    };

    Ok(Query {
        name: name.to_string(),
        release: image,
        remote_name: request.remote_name.clone(),
        query_type,
    })
}

/// Snapshot filters per instance. An empty set means "all snapshots"; a pair
/// with an empty snapshot name widens its instance back to all.
fn map_snapshots_to_instances(
    pairs: &[InstanceSnapshotPair],
) -> HashMap<String, HashSet<String>> {
    let mut map: HashMap<String, HashSet<String>> = HashMap::new();
    for pair in pairs {
        if pair.snapshot_name.is_empty() {
            map.entry(pair.instance_name.clone()).or_default().clear();
        } else {
            match map.get_mut(&pair.instance_name) {
                Some(set) if set.is_empty() => {}
                Some(set) => {
                    set.insert(pair.snapshot_name.clone());
                }
                None => {
                    map.entry(pair.instance_name.clone())
                        .or_default()
                        .insert(pair.snapshot_name.clone());
                }
            }
        }
    }
    map
}

fn add_aliases(
    container: &mut Vec<FindImageInfo>,
    remote_name: &str,
    info: &VMImageInfo,
    default_remote: &str,
) {
    if info.aliases.is_empty() {
        return;
    }
    let mut entry = FindImageInfo {
        os: info.os.clone(),
        release: info.release_title.clone(),
        version: info.version.clone(),
        ..Default::default()
    };
    for alias in &info.aliases {
        entry.aliases_info.push(AliasInfo {
            remote_name: if remote_name != default_remote {
                remote_name.to_string()
            } else {
                String::new()
            },
            alias: alias.clone(),
        });
    }
    container.push(entry);
}

/// The passphrase digest stored in settings and checked by `authenticate`.
pub fn passphrase_hash(passphrase: &str) -> String {
    let digest = Sha256::digest(passphrase.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Progress sink for the readiness pipeline, erased over the reply type so
/// waiters started by different verbs can share one in-flight future.
#[async_trait]
trait ReadinessReporter: Send + Sync {
    async fn reply_message(&self, msg: &str);
    async fn stream_log(&self, msg: &str);
}

struct StreamReporter<R> {
    stream: ReplyStream<R>,
}

#[async_trait]
impl<R: StreamedReply> ReadinessReporter for StreamReporter<R> {
    async fn reply_message(&self, msg: &str) {
        let mut reply = R::default();
        reply.set_reply_message(msg.to_string());
        self.stream.write(reply).await;
    }

    async fn stream_log(&self, msg: &str) {
        let mut reply = R::default();
        reply.set_log_line(msg.to_string());
        self.stream.write(reply).await;
    }
}

/// The daemon's orchestration engine.
pub struct Daemon {
    config: Arc<DaemonConfig>,
    state: Arc<Mutex<DaemonState>>,
    maintenance: JoinHandle<()>,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.maintenance.abort();
    }
}

impl Daemon {
    /// Bring the daemon up: load the catalog, quarantine invalid specs,
    /// recreate machine handles, re-start instances that should be running
    /// and arm the maintenance timer.
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let config = Arc::new(config);

        if let Err(e) = config.factory.hypervisor_health_check().await {
            tracing::warn!("Hypervisor health check failed: {}", e);
        }

        let specs = catalog::load_db(
            &config.backend_data_directory(),
            &config.backend_cache_directory(),
        )?;
        let state = Arc::new(Mutex::new(DaemonState {
            specs,
            ..Default::default()
        }));

        let daemon = Daemon {
            config: config.clone(),
            state,
            maintenance: maintenance::spawn_image_maintenance(config.clone()),
        };

        let to_start = daemon.reconcile_loaded_instances().await;

        if let Err(e) = config.vault.prune_expired_images().await {
            tracing::warn!("Failed to prune expired images: {}", e);
        }

        for name in to_start {
            daemon.spawn_restart_readiness(name).await;
        }

        Ok(daemon)
    }

    /// Walk the loaded specs, building live handles and dropping the ones
    /// that cannot be trusted. Returns the instances that need starting.
    async fn reconcile_loaded_instances(&self) -> Vec<String> {
        let mut st = self.state.lock().await;
        let mut invalid_specs = Vec::new();
        let mut to_start = Vec::new();
        let mut spec_changed = false;

        let names: Vec<String> = st.specs.keys().cloned().collect();
        for name in names {
            let spec = st.specs.get(&name).cloned().expect("spec just listed");

            if !self.config.vault.has_record_for(&name).await {
                invalid_specs.push(name);
                continue;
            }

            // All of this instance's MACs must be distinct among themselves
            // and against every previously accepted instance.
            let new_macs = spec.mac_set();
            if new_macs.len() <= spec.extra_interfaces.len()
                || new_macs.iter().any(|mac| st.allocated_macs.contains(mac))
            {
                tracing::warn!("{} has repeated MAC addresses", name);
                invalid_specs.push(name);
                continue;
            }

            let image = match self
                .config
                .vault
                .fetch_image(&Query::alias(&name, ""), &|_| true)
                .await
            {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!("Could not obtain image for '{}': {}", name, e);
                    invalid_specs.push(name);
                    continue;
                }
            };
            if !image.image_path.as_os_str().is_empty() && !image.image_path.exists() {
                tracing::warn!(
                    "Could not find image for '{}'. Expected location: {}",
                    name,
                    image.image_path.display()
                );
                invalid_specs.push(name);
                continue;
            }

            let instance_dir = image.image_path.parent().unwrap_or(Path::new("."));
            let desc = VirtualMachineDescription {
                num_cores: spec.num_cores,
                mem_size: spec.mem_size,
                disk_space: spec.disk_space,
                vm_name: name.clone(),
                default_mac_address: spec.default_mac_address.clone(),
                extra_interfaces: spec.extra_interfaces.clone(),
                ssh_username: spec.ssh_username.clone(),
                cloud_init_iso: instance_dir.join("cloud-init-config.iso"),
                image,
                ..Default::default()
            };

            let vm = match self.config.factory.create_virtual_machine(&desc).await {
                Ok(vm) => vm,
                Err(e) => {
                    tracing::warn!("Could not recreate machine for '{}': {}", name, e);
                    invalid_specs.push(name);
                    continue;
                }
            };

            st.allocated_macs.extend(new_macs);
            if spec.deleted {
                if spec.state != InstanceState::Stopped {
                    tracing::warn!(
                        "{} is deleted but has incompatible state {}, resetting to stopped",
                        name,
                        spec.state.code()
                    );
                    if let Some(s) = st.specs.get_mut(&name) {
                        s.state = InstanceState::Stopped;
                    }
                    spec_changed = true;
                }
                st.deleted_instances.insert(name.clone(), vm);
            } else {
                st.operative_instances.insert(name.clone(), vm.clone());
                spec_changed |= mounts::init_mounts(&mut st, &self.config, &name);

                let live_state = vm.current_state();
                if spec.state == InstanceState::Running
                    && live_state != InstanceState::Running
                    && live_state != InstanceState::Starting
                {
                    tracing::info!("{} needs starting. Starting now...", name);
                    if let Err(e) = vm.start().await {
                        tracing::warn!("Failed to start '{}': {}", name, e);
                    } else {
                        to_start.push(name.clone());
                    }
                }
            }
        }

        for bad_spec in &invalid_specs {
            tracing::warn!("Removing invalid instance: {}", bad_spec);
            st.specs.remove(bad_spec);
        }

        if !invalid_specs.is_empty() || spec_changed {
            if let Err(e) = self.persist(&st) {
                tracing::warn!("Could not persist instance specs: {}", e);
            }
        }

        to_start
    }

    /// Follow an unattended start (boot-time reconciliation) with the
    /// readiness pipeline, flipping the machine to running when done. Shares
    /// the per-name dedup map with the RPC-driven waits.
    async fn spawn_restart_readiness(&self, name: String) {
        let config = self.config.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let wait = {
                let mut st = state.lock().await;
                if let Some(shared) = st.readiness.get(&name) {
                    shared.clone()
                } else {
                    let shared = readiness_waiter(
                        config,
                        state.clone(),
                        name.clone(),
                        DEFAULT_TIMEOUT,
                        false,
                        None,
                    )
                    .boxed()
                    .shared();
                    st.readiness.insert(name.clone(), shared.clone());
                    shared
                }
            };

            let error = wait.await;
            state.lock().await.readiness.remove(&name);

            if error.is_empty() {
                if let Some(vm) = state.lock().await.operative_instances.get(&name) {
                    vm.set_state(InstanceState::Running);
                }
            } else {
                tracing::warn!("'{}' did not come up: {}", name, error);
            }
        });
    }

    fn persist(&self, state: &DaemonState) -> Result<()> {
        catalog::persist_db(&self.config.backend_data_directory(), &state.specs)
    }

    /// Release everything held for `name`: backend resources, the vault
    /// record, its MAC addresses and its spec. Idempotent.
    async fn release_resources(&self, state: &mut DaemonState, name: &str) {
        if let Err(e) = self.config.factory.remove_resources_for(name).await {
            tracing::warn!("Failed to remove backend resources for '{}': {}", name, e);
        }
        if let Err(e) = self.config.vault.remove(name).await {
            tracing::warn!("Failed to remove vault record for '{}': {}", name, e);
        }

        state.mounts.remove(name);
        if let Some(spec) = state.specs.remove(name) {
            for mac in spec.mac_set() {
                state.allocated_macs.remove(&mac);
            }
        }
    }

    // -----------------------------------------------------------------------
    // create / launch
    // -----------------------------------------------------------------------

    pub async fn create(
        &self,
        request: LaunchRequest,
        server: &ReplyStream<LaunchReply>,
    ) -> std::result::Result<(), Status> {
        self.create_vm(request, server, false).await
    }

    pub async fn launch(
        &self,
        request: LaunchRequest,
        server: &ReplyStream<LaunchReply>,
    ) -> std::result::Result<(), Status> {
        self.create_vm(request, server, true).await
    }

    async fn validate_image(&self, request: &LaunchRequest) -> Result<()> {
        if self
            .config
            .blueprint_provider
            .info_for(&request.image)
            .await?
            .is_none()
        {
            let query = query_from(request, "")?;
            if query.query_type == QueryType::Alias
                && self.config.vault.all_info_for(&query).await?.is_empty()
            {
                return Err(Error::ImageNotFound(request.image.clone()));
            }
        }
        Ok(())
    }

    async fn create_vm(
        &self,
        request: LaunchRequest,
        server: &ReplyStream<LaunchReply>,
        start: bool,
    ) -> std::result::Result<(), Status> {
        self.validate_image(&request).await.map_err(fp)?;

        let host_networks = if request.network_options.is_empty() {
            None
        } else {
            match self.config.factory.networks().await {
                Ok(networks) => Some(networks),
                Err(Error::NotImplementedOnThisBackend(_)) => {
                    return Err(fp(Error::NotImplementedOnThisBackend("bridging".into())))
                }
                Err(e) => return Err(fp(e)),
            }
        };

        let checked = validate::validate_create_arguments(
            &request,
            host_networks.as_deref(),
            self.config.settings.as_ref(),
        )
        .map_err(fp)?;

        if !checked.option_errors.is_empty() {
            return Err(Error::InvalidArguments {
                details: checked.option_errors.serialized(),
            }
            .to_status());
        }

        if !checked.nets_need_bridging.is_empty() && !request.permission_to_bridge {
            server
                .write(LaunchReply {
                    nets_need_bridging: checked.nets_need_bridging.clone(),
                    ..Default::default()
                })
                .await;
            return Err(Error::MissingBridges.to_status());
        }

        let blueprint_name = self
            .config
            .blueprint_provider
            .name_from_blueprint(&request.image);

        let name;
        {
            let mut st = self.state.lock().await;
            name = alloc::name_from(
                &checked.instance_name,
                &blueprint_name,
                self.config.name_generator.as_ref(),
                &st.used_names(),
            )
            .map_err(fp)?;

            let trail = find_instance(&st, &name);
            select::status_for_trail(&trail, &require_missing_instances())?;

            if st.preparing_instances.contains(&name) {
                return Err(Status::invalid_argument(format!(
                    "instance \"{}\" is being prepared",
                    name
                )));
            }

            if !st.instances_running() {
                self.config
                    .factory
                    .hypervisor_health_check()
                    .await
                    .map_err(fp)?;
            }

            st.preparing_instances.insert(name.clone());
        }

        let timeout = timeout_for(
            request.timeout,
            self.config.blueprint_provider.blueprint_timeout(&blueprint_name),
        );

        let prepared = self
            .prepare_instance(&request, &name, &checked, server)
            .await;
        let (desc, launch_data) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.abandon_creation(&name).await;
                return Err(e.status_with_default(Code::FailedPrecondition));
            }
        };

        {
            let mut st = self.state.lock().await;
            let vm = match self.config.factory.create_virtual_machine(&desc).await {
                Ok(vm) => vm,
                Err(e) => {
                    drop(st);
                    self.abandon_creation(&name).await;
                    return Err(fp(e));
                }
            };

            st.specs.insert(
                name.clone(),
                VMSpecs {
                    num_cores: desc.num_cores,
                    mem_size: desc.mem_size,
                    disk_space: desc.disk_space,
                    default_mac_address: desc.default_mac_address.clone(),
                    extra_interfaces: desc.extra_interfaces.clone(),
                    ssh_username: self.config.paths.ssh_username.clone(),
                    state: InstanceState::Off,
                    mounts: Default::default(),
                    deleted: false,
                    metadata: serde_json::json!({}),
                },
            );
            st.operative_instances.insert(name.clone(), vm);
            st.preparing_instances.remove(&name);
            self.persist(&st).map_err(fp)?;
        }

        if !start {
            return Ok(());
        }

        server
            .write(LaunchReply {
                create_message: format!("Starting {}", name),
                ..Default::default()
            })
            .await;

        let vm = self
            .state
            .lock()
            .await
            .operative_instances
            .get(&name)
            .cloned()
            .expect("instance registered above");
        if let Err(e) = vm.start().await {
            self.abandon_creation(&name).await;
            return Err(Error::StartFailure {
                name: name.clone(),
                reason: e.to_string(),
            }
            .to_status());
        }

        let reporter: Arc<dyn ReadinessReporter> = Arc::new(StreamReporter {
            stream: server.clone(),
        });
        let status = self
            .wait_for_ready_all(
                std::slice::from_ref(&name),
                timeout,
                true,
                Some(reporter),
                Vec::new(),
            )
            .await;

        let mut reply = LaunchReply {
            vm_instance_name: name.clone(),
            ..Default::default()
        };
        for alias in &launch_data.aliases_to_be_created {
            tracing::debug!("Adding alias '{}' to RPC reply", alias.name);
        }
        reply.aliases_to_be_created = launch_data.aliases_to_be_created;
        for workspace in &launch_data.workspaces_to_be_created {
            tracing::debug!("Adding workspace '{}' to RPC reply", workspace);
        }
        reply.workspaces_to_be_created = launch_data.workspaces_to_be_created;
        server.write(reply).await;

        status
    }

    /// Back out of a failed creation: drop the preparing mark, release any
    /// acquired resources and persist whatever is left.
    async fn abandon_creation(&self, name: &str) {
        let mut st = self.state.lock().await;
        st.preparing_instances.remove(name);
        self.release_resources(&mut st, name).await;
        st.operative_instances.remove(name);
        if let Err(e) = self.persist(&st) {
            tracing::warn!("Could not persist instance specs: {}", e);
        }
    }

    async fn prepare_instance(
        &self,
        request: &LaunchRequest,
        name: &str,
        checked: &validate::CheckedArguments,
        server: &ReplyStream<LaunchReply>,
    ) -> Result<(VirtualMachineDescription, ClientLaunchData)> {
        server
            .write(LaunchReply {
                create_message: format!("Creating {}", name),
                ..Default::default()
            })
            .await;

        let mut desc = VirtualMachineDescription {
            num_cores: request.num_cores,
            mem_size: request.mem_size.parse().unwrap_or(MemorySize::zero()),
            disk_space: request.disk_space.parse().unwrap_or(MemorySize::zero()),
            vm_name: name.to_string(),
            ssh_username: self.config.paths.ssh_username.clone(),
            vendor_data_config: cloudinit::make_cloud_init_vendor_config(
                self.config.ssh_key_provider.as_ref(),
                &request.time_zone,
                &self.config.paths.ssh_username,
                &self.config.factory.backend_version_string(),
                &request.image,
                &request.remote_name,
            )?,
            ..Default::default()
        };

        let mut launch_data = ClientLaunchData::default();
        let query = match self
            .config
            .blueprint_provider
            .fetch_blueprint_for(&request.image, &mut desc, &mut launch_data)
            .await
        {
            Ok(mut query) => {
                query.name = name.to_string();

                // Blueprint aliases and workspaces are named after the
                // blueprint's instance name; follow a user-chosen name.
                if name != request.image {
                    for alias in &mut launch_data.aliases_to_be_created {
                        if alias.instance == request.image {
                            tracing::trace!(
                                "Renaming instance on alias \"{}\" from \"{}\" to \"{}\"",
                                alias.name,
                                alias.instance,
                                name
                            );
                            alias.instance = name.to_string();
                        }
                    }
                    for workspace in &mut launch_data.workspaces_to_be_created {
                        if workspace == &request.image {
                            tracing::trace!(
                                "Renaming workspace \"{}\" to \"{}\"",
                                workspace,
                                name
                            );
                            *workspace = name.to_string();
                        }
                    }
                }
                query
            }
            Err(Error::ImageNotFound(_)) => {
                // Not a blueprint; plain image launch.
                desc.mem_size = checked.mem_size;
                query_from(request, name)?
            }
            Err(e) => return Err(e),
        };

        let progress_stream = server.clone();
        let monitor = move |percentage: i32| {
            progress_stream.try_write(LaunchReply {
                launch_progress: Some(LaunchProgress {
                    percent_complete: percentage.to_string(),
                }),
                ..Default::default()
            });
            true
        };
        let vm_image = self.config.vault.fetch_image(&query, &monitor).await?;

        server
            .write(LaunchReply {
                create_message: format!("Preparing image for {}", name),
                ..Default::default()
            })
            .await;

        let image_size = self
            .config
            .vault
            .minimum_image_size_for(&vm_image.id)
            .await?;
        let requested_disk = if desc.disk_space.in_bytes() > 0 {
            Some(desc.disk_space)
        } else {
            checked.disk_space
        };
        desc.disk_space = validate::compute_final_image_size(
            image_size,
            requested_disk,
            &self.config.paths.data_directory,
        )?;

        server
            .write(LaunchReply {
                create_message: format!("Configuring {}", name),
                ..Default::default()
            })
            .await;

        let mut extra_interfaces = checked.extra_interfaces.clone();
        self.config
            .factory
            .prepare_networking(&mut extra_interfaces)
            .await?;

        // Generate MACs against a snapshot of the allocated set; committed
        // only once the whole preparation has succeeded.
        let mut new_macs = { self.state.lock().await.allocated_macs.clone() };
        for iface in &extra_interfaces {
            if !iface.mac_address.is_empty() && !new_macs.insert(iface.mac_address.clone()) {
                return Err(Error::Runtime(format!(
                    "Repeated MAC address {}",
                    iface.mac_address
                )));
            }
        }
        // Second pass, so generated MACs never collide with requested ones.
        for iface in &mut extra_interfaces {
            if iface.mac_address.is_empty() {
                iface.mac_address = alloc::generate_unused_mac_address(&mut new_macs)?;
            }
        }
        desc.default_mac_address = alloc::generate_unused_mac_address(&mut new_macs)?;
        desc.extra_interfaces = extra_interfaces;

        desc.meta_data_config = cloudinit::make_cloud_init_meta_config(name);
        desc.user_data_config = if request.cloud_init_user_data.is_empty() {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_str(&request.cloud_init_user_data)?
        };
        cloudinit::prepare_user_data(&mut desc.user_data_config, &desc.vendor_data_config);

        desc.num_cores = validate::effective_num_cores(desc.num_cores);
        desc.network_data_config = cloudinit::make_cloud_init_network_config(
            &desc.default_mac_address,
            &desc.extra_interfaces,
        );

        desc.cloud_init_iso = vm_image
            .image_path
            .parent()
            .unwrap_or(Path::new("."))
            .join("cloud-init-config.iso");
        desc.image = vm_image;

        self.config.factory.configure(&mut desc).await?;
        let image = desc.image.clone();
        self.config
            .factory
            .prepare_instance_image(&image, &desc)
            .await?;

        // Everything went well; adopt the MACs used by this instance.
        self.state.lock().await.allocated_macs = new_macs;

        Ok((desc, launch_data))
    }

    // -----------------------------------------------------------------------
    // start / stop / suspend / restart
    // -----------------------------------------------------------------------

    pub async fn start(
        &self,
        request: StartRequest,
        server: &ReplyStream<StartReply>,
    ) -> std::result::Result<(), Status> {
        let timeout = timeout_for(request.timeout, 0);
        let logger = ClientLogger::new(request.verbosity_level, server.clone());

        let mut starting_vms = Vec::new();
        let mut start_errors = Vec::new();
        {
            let mut st = self.state.lock().await;

            if !st.instances_running() {
                self.config
                    .factory
                    .hypervisor_health_check()
                    .await
                    .map_err(fp)?;
            }

            let custom_reaction = SelectionReaction {
                operative: ReactionComponent::ok(),
                deleted: ReactionComponent::code_only(Code::Aborted),
                missing: ReactionComponent::code_only(Code::Aborted),
            };
            let (selection, status) = select::select_instances_and_react(
                &st,
                request.instance_names.iter().map(String::as_str),
                InstanceGroup::Operative,
                &custom_reaction,
            );
            if let Err(status) = status {
                let mut instance_errors = serde_json::Map::new();
                for name in &selection.deleted {
                    instance_errors.insert(name.clone(), "INSTANCE_DELETED".into());
                }
                for name in &selection.missing {
                    instance_errors.insert(name.clone(), "DOES_NOT_EXIST".into());
                }
                let details =
                    serde_json::json!({ "instance_errors": instance_errors }).to_string();
                return Err(Status::with_details(
                    status.code(),
                    "instance(s) missing",
                    details.into_bytes().into(),
                ));
            }

            let mut complain_disabled_mounts = !self.config.settings.get_bool(MOUNTS_KEY);

            for name in &selection.operative {
                let vm = st
                    .operative_instances
                    .get(name)
                    .cloned()
                    .expect("selected operative");
                match vm.current_state() {
                    InstanceState::Unknown => {
                        let error = format!(
                            "Instance '{}' is already running, but in an unknown state",
                            name
                        );
                        logger.log(Level::WARN, &error).await;
                        start_errors.push(error);
                        continue;
                    }
                    InstanceState::Suspending => {
                        start_errors.push(format!(
                            "Cannot start the instance '{}' while suspending",
                            name
                        ));
                        continue;
                    }
                    InstanceState::DelayedShutdown => {
                        st.delayed_shutdowns.remove(name);
                        vm.set_state(InstanceState::Running);
                        continue;
                    }
                    InstanceState::Running => continue,
                    InstanceState::Starting | InstanceState::Restarting => {}
                    _ => {
                        if complain_disabled_mounts
                            && st.specs.get(name).map_or(false, |s| !s.mounts.is_empty())
                        {
                            complain_disabled_mounts = false;
                            logger
                                .log(
                                    Level::ERROR,
                                    "Mounts have been disabled on this instance of Multipass",
                                )
                                .await;
                        }
                        vm.start().await.map_err(fp)?;
                    }
                }
                starting_vms.push(name.clone());
            }
        }

        let reporter: Arc<dyn ReadinessReporter> = Arc::new(StreamReporter {
            stream: server.clone(),
        });
        self.wait_for_ready_all(&starting_vms, timeout, false, Some(reporter), start_errors)
            .await
    }

    pub async fn stop(
        &self,
        request: StopRequest,
        _server: &ReplyStream<StopReply>,
    ) -> std::result::Result<(), Status> {
        let mut st = self.state.lock().await;
        let (selection, status) = select::select_instances_and_react(
            &st,
            request.instance_names.iter().map(String::as_str),
            InstanceGroup::Operative,
            &require_operative_instances(),
        );
        status?;

        for name in &selection.operative {
            if request.cancel_shutdown {
                self.cancel_vm_shutdown(&mut st, name);
            } else {
                let delay = Duration::from_secs(request.time_minutes.max(0) as u64 * 60);
                self.shutdown_vm(&mut st, name, delay).await.map_err(fp)?;
            }
        }

        Ok(())
    }

    async fn shutdown_vm(
        &self,
        st: &mut DaemonState,
        name: &str,
        delay: Duration,
    ) -> Result<()> {
        let vm = st
            .operative_instances
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no handle for '{}'", name)))?;

        if vm.current_state().is_at_rest() {
            tracing::debug!("instance \"{}\" does not need stopping", name);
            return Ok(());
        }

        st.delayed_shutdowns.remove(name);

        let session = match self
            .config
            .ssh
            .connect(
                &vm.ssh_hostname(),
                vm.ssh_port(),
                &vm.ssh_username(),
                self.config.ssh_key_provider.as_ref(),
            )
            .await
        {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::info!("Cannot open ssh session on \"{}\" shutdown: {}", name, e);
                None
            }
        };

        let timer = shutdown::schedule_shutdown(
            name.to_string(),
            vm,
            delay,
            session,
            self.state.clone(),
            self.config.backend_data_directory(),
        );
        st.delayed_shutdowns.insert(name.to_string(), timer);

        Ok(())
    }

    fn cancel_vm_shutdown(&self, st: &mut DaemonState, name: &str) {
        if st.delayed_shutdowns.remove(name).is_some() {
            if let Some(vm) = st.operative_instances.get(name) {
                vm.set_state(InstanceState::Running);
            }
        } else {
            tracing::debug!("no delayed shutdown to cancel on instance \"{}\"", name);
        }
    }

    pub async fn suspend(
        &self,
        request: SuspendRequest,
        _server: &ReplyStream<SuspendReply>,
    ) -> std::result::Result<(), Status> {
        let mut st = self.state.lock().await;
        let (selection, status) = select::select_instances_and_react(
            &st,
            request.instance_names.iter().map(String::as_str),
            InstanceGroup::Operative,
            &require_operative_instances(),
        );
        status?;

        for name in &selection.operative {
            if let Some(handlers) = st.mounts.get_mut(name) {
                mounts::stop_mounts(name, handlers).await;
            }
            let vm = st
                .operative_instances
                .get(name)
                .cloned()
                .expect("selected operative");
            vm.suspend().await.map_err(fp)?;
        }

        Ok(())
    }

    pub async fn restart(
        &self,
        request: RestartRequest,
        server: &ReplyStream<RestartReply>,
    ) -> std::result::Result<(), Status> {
        let timeout = timeout_for(request.timeout, 0);

        let targets;
        {
            let mut st = self.state.lock().await;
            let (selection, status) = select::select_instances_and_react(
                &st,
                request.instance_names.iter().map(String::as_str),
                InstanceGroup::Operative,
                &require_operative_instances(),
            );
            status?;

            for name in &selection.operative {
                let vm = st
                    .operative_instances
                    .get(name)
                    .cloned()
                    .expect("selected operative");

                if vm.current_state() == InstanceState::DelayedShutdown {
                    st.delayed_shutdowns.remove(name);
                }
                if !vm.current_state().is_running() {
                    return Err(Status::invalid_argument(format!(
                        "instance \"{}\" is not running",
                        name
                    )));
                }

                if let Some(handlers) = st.mounts.get_mut(name) {
                    mounts::stop_mounts(name, handlers).await;
                }

                tracing::debug!("Rebooting {}", name);
                self.ssh_reboot(&vm).await?;
            }
            targets = selection.operative;
        }

        let reporter: Arc<dyn ReadinessReporter> = Arc::new(StreamReporter {
            stream: server.clone(),
        });
        self.wait_for_ready_all(&targets, timeout, false, Some(reporter), Vec::new())
            .await
    }

    /// Stop sshd first so "is SSH back yet" cannot race the reboot, then ask
    /// the guest to reboot. The reboot command losing its connection is the
    /// expected outcome.
    async fn ssh_reboot(
        &self,
        vm: &Arc<dyn VirtualMachine>,
    ) -> std::result::Result<(), Status> {
        let mut session = self
            .config
            .ssh
            .connect(
                &vm.ssh_hostname(),
                vm.ssh_port(),
                &vm.ssh_username(),
                self.config.ssh_key_provider.as_ref(),
            )
            .await
            .map_err(fp)?;

        match session.exec(STOP_SSH_CMD).await {
            Ok(exec) if !exec.succeeded() => {
                tracing::debug!(
                    "Could not stop sshd. '{}' exited with code {:?}",
                    STOP_SSH_CMD,
                    exec.exit_code
                );
            }
            Err(e) => tracing::debug!("Could not stop sshd: {}", e),
            Ok(_) => {}
        }

        let reboot = session.exec(REBOOT_CMD).await.map_err(fp)?;
        match reboot.exit_code {
            None | Some(0) => Ok(()),
            Some(code) => Err(Status::failed_precondition(format!(
                "Reboot command exited with code {}",
                code
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // delete / recover / purge
    // -----------------------------------------------------------------------

    pub async fn delete(
        &self,
        request: DeleteRequest,
        server: &ReplyStream<DeleteReply>,
    ) -> std::result::Result<(), Status> {
        let mut purged = Vec::new();
        {
            let mut st = self.state.lock().await;
            let (selection, status) = select::select_instances_and_react(
                &st,
                request
                    .instances_snapshots
                    .iter()
                    .map(|pair| pair.instance_name.as_str()),
                InstanceGroup::All,
                &require_existing_instances(),
            );
            status?;

            for name in &selection.operative {
                let vm = st
                    .operative_instances
                    .get(name)
                    .cloned()
                    .expect("selected operative");

                if vm.current_state() == InstanceState::DelayedShutdown {
                    st.delayed_shutdowns.remove(name);
                }
                if let Some(handlers) = st.mounts.get_mut(name) {
                    handlers.clear();
                }
                vm.shutdown().await.map_err(fp)?;

                if request.purge {
                    self.release_resources(&mut st, name).await;
                    st.operative_instances.remove(name);
                    purged.push(name.clone());
                } else {
                    let vm = st
                        .operative_instances
                        .remove(name)
                        .expect("selected operative");
                    st.deleted_instances.insert(name.clone(), vm);
                    if let Some(spec) = st.specs.get_mut(name) {
                        spec.deleted = true;
                    }
                }
            }

            if request.purge {
                for name in &selection.deleted {
                    self.release_resources(&mut st, name).await;
                    st.deleted_instances.remove(name);
                    purged.push(name.clone());
                }
            }

            self.persist(&st).map_err(fp)?;
        }

        server
            .write(DeleteReply {
                purged_instances: purged,
                ..Default::default()
            })
            .await;
        Ok(())
    }

    pub async fn recover(
        &self,
        request: RecoverRequest,
        _server: &ReplyStream<RecoverReply>,
    ) -> std::result::Result<(), Status> {
        let mut st = self.state.lock().await;

        let mut recover_reaction = require_existing_instances();
        recover_reaction.operative =
            ReactionComponent::new(Code::Ok, "instance \"{}\" does not need to be recovered");

        let (selection, status) = select::select_instances_and_react(
            &st,
            request.instance_names.iter().map(String::as_str),
            InstanceGroup::Deleted,
            &recover_reaction,
        );
        status?;

        for name in &selection.deleted {
            if let Some(spec) = st.specs.get_mut(name) {
                debug_assert!(spec.deleted, "recovering an instance that is not deleted");
                spec.deleted = false;
            }
            if let Some(vm) = st.deleted_instances.remove(name) {
                st.operative_instances.insert(name.clone(), vm);
            }
            mounts::init_mounts(&mut st, &self.config, name);
        }
        self.persist(&st).map_err(fp)?;

        Ok(())
    }

    pub async fn purge(
        &self,
        _request: PurgeRequest,
        server: &ReplyStream<PurgeReply>,
    ) -> std::result::Result<(), Status> {
        let mut purged = Vec::new();
        {
            let mut st = self.state.lock().await;
            let mut names: Vec<String> = st.deleted_instances.keys().cloned().collect();
            names.sort();
            for name in names {
                self.release_resources(&mut st, &name).await;
                purged.push(name);
            }
            st.deleted_instances.clear();
            self.persist(&st).map_err(fp)?;
        }

        server
            .write(PurgeReply {
                purged_instances: purged,
                ..Default::default()
            })
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // mount / umount
    // -----------------------------------------------------------------------

    pub async fn mount(
        &self,
        request: MountRequest,
        _server: &ReplyStream<MountReply>,
    ) -> std::result::Result<(), Status> {
        if !self.config.settings.get_bool(MOUNTS_KEY) {
            return Err(Error::MountsDisabled.to_status());
        }

        let mut errors = Vec::new();
        let mut st = self.state.lock().await;

        for path_entry in &request.target_paths {
            let name = &path_entry.instance_name;
            let target = mounts::clean_path(&path_entry.target_path);

            let Some(vm) = st.operative_instances.get(name).cloned() else {
                errors.push(format!("instance '{}' does not exist", name));
                continue;
            };

            if mounts::invalid_target_path(&target) {
                errors.push(format!("unable to mount to \"{}\"", target));
                continue;
            }

            if st
                .mounts
                .entry(name.clone())
                .or_default()
                .contains_key(&target)
            {
                errors.push(format!("\"{}\" is already mounted in '{}'", target, name));
                continue;
            }

            let vm_mount = VMMount::new(
                request.source_path.clone(),
                request.mount_maps.uid_mappings.clone(),
                request.mount_maps.gid_mappings.clone(),
                request.mount_type,
            );

            let handler = match mounts::make_mount(&self.config, &vm, &target, &vm_mount) {
                Ok(handler) => handler,
                Err(e) => {
                    errors.push(format!("error mounting \"{}\": {}", target, e));
                    continue;
                }
            };

            // Publish first; roll the entry back if activation fails.
            let needs_activation = vm.current_state() == InstanceState::Running
                || handler.is_mount_managed_by_backend();
            let vm_mounts = st.mounts.get_mut(name).expect("entry created above");
            vm_mounts.insert(target.clone(), handler);

            if needs_activation {
                let result = vm_mounts
                    .get_mut(&target)
                    .expect("inserted above")
                    .activate()
                    .await;
                match result {
                    Ok(()) => {}
                    Err(Error::SshfsMissing(_)) => {
                        vm_mounts.remove(&target);
                        self.persist(&st).map_err(fp)?;
                        return Err(Error::SshfsMissing(name.clone()).to_status());
                    }
                    Err(e) => {
                        errors.push(format!("error mounting \"{}\": {}", target, e));
                        vm_mounts.remove(&target);
                        continue;
                    }
                }
            }

            st.specs
                .get_mut(name)
                .expect("operative instances have specs")
                .mounts
                .insert(target, vm_mount);
        }

        self.persist(&st).map_err(fp)?;

        select::status_for(errors, Code::Ok)
    }

    pub async fn umount(
        &self,
        request: UmountRequest,
        _server: &ReplyStream<UmountReply>,
    ) -> std::result::Result<(), Status> {
        let mut errors = Vec::new();
        let mut st = self.state.lock().await;

        for path_entry in &request.target_paths {
            let name = &path_entry.instance_name;

            if !st.operative_instances.contains_key(name) {
                errors.push(format!("instance '{}' does not exist", name));
                continue;
            }

            st.mounts.entry(name.clone()).or_default();

            // Empty target path means "unmount everything in this instance".
            let targets: Vec<String> = if path_entry.target_path.is_empty() {
                st.mounts[name].keys().cloned().collect()
            } else {
                let target = mounts::clean_path(&path_entry.target_path);
                if !st.mounts[name].contains_key(&target) {
                    errors.push(format!("path \"{}\" is not mounted in '{}'", target, name));
                    continue;
                }
                vec![target]
            };

            for target in targets {
                let result = st
                    .mounts
                    .get_mut(name)
                    .expect("entry created above")
                    .get_mut(&target)
                    .expect("listed above")
                    .deactivate(false)
                    .await;
                match result {
                    Ok(()) => {
                        st.mounts
                            .get_mut(name)
                            .expect("entry created above")
                            .remove(&target);
                        if let Some(spec) = st.specs.get_mut(name) {
                            spec.mounts.remove(&target);
                        }
                    }
                    Err(e) => {
                        errors.push(format!(
                            "failed to unmount \"{}\" from '{}': {}",
                            target, name, e
                        ));
                    }
                }
            }
        }

        self.persist(&st).map_err(fp)?;

        select::status_for(errors, Code::Ok)
    }

    // -----------------------------------------------------------------------
    // list / info / find / networks / version
    // -----------------------------------------------------------------------

    pub async fn list(
        &self,
        request: ListRequest,
        server: &ReplyStream<ListReply>,
    ) -> std::result::Result<(), Status> {
        let mut reply = ListReply::default();
        let st = self.state.lock().await;

        let mut names: Vec<String> = st.operative_instances.keys().cloned().collect();
        names.sort();
        for name in names {
            let vm = st.operative_instances.get(&name).cloned().expect("listed");
            let present_state = vm.current_state();

            let image = self
                .config
                .vault
                .fetch_image(&Query::alias(&name, ""), &|_| true)
                .await
                .map_err(fp)?;

            let mut entry = ListVMInstance {
                name: name.clone(),
                instance_status: present_state.into(),
                current_release: image.original_release,
                ipv4: Vec::new(),
            };

            if request.request_ipv4 && present_state.is_running() {
                let management_ip = vm.management_ipv4();
                let all_ipv4 = vm.get_all_ipv4().await;

                if is_ipv4_valid(&management_ip) {
                    entry.ipv4.push(management_ip.clone());
                } else if all_ipv4.is_empty() {
                    entry.ipv4.push("N/A".to_string());
                }
                for extra in all_ipv4 {
                    if extra != management_ip {
                        entry.ipv4.push(extra);
                    }
                }
            }

            reply.instances.push(entry);
        }

        let mut deleted: Vec<String> = st.deleted_instances.keys().cloned().collect();
        deleted.sort();
        for name in deleted {
            reply.instances.push(ListVMInstance {
                name,
                instance_status: InstanceStatus::Deleted,
                ..Default::default()
            });
        }

        server.write(reply).await;
        Ok(())
    }

    pub async fn info(
        &self,
        request: InfoRequest,
        server: &ReplyStream<InfoReply>,
    ) -> std::result::Result<(), Status> {
        let st = self.state.lock().await;
        let (selection, status) = select::select_instances_and_react(
            &st,
            request
                .instances_snapshots
                .iter()
                .map(|pair| pair.instance_name.as_str()),
            InstanceGroup::All,
            &require_existing_instances(),
        );
        status?;

        let snapshot_filters = map_snapshots_to_instances(&request.instances_snapshots);
        let mut reply = InfoReply::default();
        let mut have_mounts = false;

        for (deleted, names) in [(false, &selection.operative), (true, &selection.deleted)] {
            for name in names {
                let vm = st.instance(name).expect("selected");

                if request.snapshot_overview {
                    let mut errors = Vec::new();
                    let wanted = snapshot_filters.get(name).filter(|set| !set.is_empty());
                    match wanted {
                        None => {
                            for snapshot in vm.view_snapshots() {
                                reply.snapshot_overview.push(SnapshotOverviewEntry {
                                    instance_name: name.clone(),
                                    fundamentals: snapshot,
                                });
                            }
                        }
                        Some(set) => {
                            for snapshot_name in set {
                                match vm.get_snapshot(snapshot_name) {
                                    Ok(snapshot) => {
                                        reply.snapshot_overview.push(SnapshotOverviewEntry {
                                            instance_name: name.clone(),
                                            fundamentals: snapshot,
                                        })
                                    }
                                    Err(_) => errors.push(format!(
                                        "snapshot \"{}\" does not exist",
                                        snapshot_name
                                    )),
                                }
                            }
                        }
                    }
                    select::status_for(errors, Code::Ok)?;
                } else {
                    let details = self
                        .instance_details(
                            &st,
                            name,
                            &vm,
                            deleted,
                            request.no_runtime_information,
                            &mut have_mounts,
                        )
                        .await?;
                    reply.details.push(details);
                }
            }
        }

        if have_mounts && !self.config.settings.get_bool(MOUNTS_KEY) {
            let logger = ClientLogger::new(request.verbosity_level, server.clone());
            logger
                .log(
                    Level::ERROR,
                    "Mounts have been disabled on this instance of Multipass",
                )
                .await;
        }

        server.write(reply).await;
        Ok(())
    }

    async fn instance_details(
        &self,
        st: &DaemonState,
        name: &str,
        vm: &Arc<dyn VirtualMachine>,
        deleted: bool,
        no_runtime_information: bool,
        have_mounts: &mut bool,
    ) -> std::result::Result<InstanceDetails, Status> {
        let present_state = vm.current_state();
        let mut details = InstanceDetails {
            name: name.to_string(),
            instance_status: if deleted {
                InstanceStatus::Deleted
            } else {
                present_state.into()
            },
            num_snapshots: vm.view_snapshots().len() as u64,
            ..Default::default()
        };

        let image = self
            .config
            .vault
            .fetch_image(&Query::alias(name, ""), &|_| true)
            .await
            .map_err(fp)?;
        details.image_release = image.original_release.clone();
        details.id = image.id.clone();

        let Some(spec) = st.specs.get(name) else {
            return Err(Status::internal(format!("missing specs for '{}'", name)));
        };

        if !spec.mounts.is_empty() {
            *have_mounts = true;
        }

        if self.config.settings.get_bool(MOUNTS_KEY) {
            for (target, mount) in &spec.mounts {
                if mount.source_path.len() as u64 > details.mount_info.longest_path_len {
                    details.mount_info.longest_path_len = mount.source_path.len() as u64;
                }
                details.mount_info.mount_paths.push(MountPathEntry {
                    source_path: mount.source_path.clone(),
                    target_path: target.clone(),
                    uid_mappings: mount.uid_mappings.clone(),
                    gid_mappings: mount.gid_mappings.clone(),
                });
            }
        }

        if !no_runtime_information && present_state.is_running() {
            let mut session = self
                .config
                .ssh
                .connect(
                    &vm.ssh_hostname(),
                    vm.ssh_port(),
                    &spec.ssh_username,
                    self.config.ssh_key_provider.as_ref(),
                )
                .await
                .map_err(fp)?;
            let session = &mut *session;

            use multipassd_backend::ssh::run_in_session;
            details.load = run_in_session(session, "cat /proc/loadavg | cut -d ' ' -f1-3")
                .await
                .map_err(fp)?;
            details.memory_usage =
                run_in_session(session, "free -b | grep 'Mem:' | awk '{printf $3}'")
                    .await
                    .map_err(fp)?;
            details.memory_total =
                run_in_session(session, "free -b | grep 'Mem:' | awk '{printf $2}'")
                    .await
                    .map_err(fp)?;
            details.disk_usage = run_in_session(
                session,
                "df -t ext4 -t vfat --total -B1 --output=used | tail -n 1",
            )
            .await
            .map_err(fp)?;
            details.disk_total = run_in_session(
                session,
                "df -t ext4 -t vfat --total -B1 --output=size | tail -n 1",
            )
            .await
            .map_err(fp)?;
            details.cpu_count = run_in_session(session, "nproc").await.map_err(fp)?;

            let management_ip = vm.management_ipv4();
            let all_ipv4 = vm.get_all_ipv4().await;
            if is_ipv4_valid(&management_ip) {
                details.ipv4.push(management_ip.clone());
            } else if all_ipv4.is_empty() {
                details.ipv4.push("N/A".to_string());
            }
            for extra in all_ipv4 {
                if extra != management_ip {
                    details.ipv4.push(extra);
                }
            }

            let current_release = run_in_session(
                session,
                "cat /etc/os-release | grep 'PRETTY_NAME' | cut -d \\\" -f2",
            )
            .await
            .map_err(fp)?;
            details.current_release = if current_release.is_empty() {
                image.original_release
            } else {
                current_release
            };
        }

        Ok(details)
    }

    pub async fn find(
        &self,
        request: FindRequest,
        server: &ReplyStream<FindReply>,
    ) -> std::result::Result<(), Status> {
        const DEFAULT_REMOTE: &str = "release";

        let mut reply = FindReply {
            show_images: request.show_images,
            show_blueprints: request.show_blueprints,
            ..Default::default()
        };

        if !request.search_string.is_empty() {
            if request.show_images {
                let query = Query {
                    name: String::new(),
                    release: request.search_string.clone(),
                    remote_name: request.remote_name.clone(),
                    query_type: QueryType::Alias,
                };
                let images_info = match self.config.vault.all_info_for(&query).await {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(
                            "An unexpected error occurred while fetching images matching \"{}\": {}",
                            request.search_string,
                            e
                        );
                        Vec::new()
                    }
                };

                let num_matches = images_info.len();
                for (remote, mut info) in images_info {
                    if info.aliases.contains(&request.search_string) {
                        info.aliases = vec![request.search_string.clone()];
                    } else {
                        info.aliases = vec![info.id.chars().take(12).collect()];
                    }

                    let remote_name = if !request.remote_name.is_empty()
                        || (num_matches > 1 && remote != DEFAULT_REMOTE)
                    {
                        remote.clone()
                    } else {
                        String::new()
                    };
                    add_aliases(&mut reply.images_info, &remote_name, &info, "");
                }
            }

            if request.show_blueprints {
                let info = match self
                    .config
                    .blueprint_provider
                    .info_for(&request.search_string)
                    .await
                {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(
                            "An unexpected error occurred while fetching blueprints matching \"{}\": {}",
                            request.search_string,
                            e
                        );
                        None
                    }
                };
                if let Some(mut info) = info {
                    if info.aliases.contains(&request.search_string) {
                        info.aliases = vec![request.search_string.clone()];
                    } else {
                        info.aliases = vec![info.id.chars().take(12).collect()];
                    }
                    add_aliases(&mut reply.blueprints_info, "", &info, "");
                }
            }
        } else if request.remote_name.is_empty() {
            if request.show_images {
                let mut images_found = HashSet::new();
                for (remote, info) in self
                    .config
                    .vault
                    .all_images("", request.allow_unsupported)
                    .await
                    .map_err(fp)?
                {
                    if (info.supported || request.allow_unsupported)
                        && !info.aliases.is_empty()
                        && !images_found.contains(&info.release_title)
                    {
                        add_aliases(&mut reply.images_info, &remote, &info, DEFAULT_REMOTE);
                        images_found.insert(info.release_title.clone());
                    }
                }
            }

            if request.show_blueprints {
                for info in self
                    .config
                    .blueprint_provider
                    .all_blueprints()
                    .await
                    .map_err(fp)?
                {
                    add_aliases(&mut reply.blueprints_info, "", &info, "");
                }
            }
        } else {
            for (_, info) in self
                .config
                .vault
                .all_images(&request.remote_name, request.allow_unsupported)
                .await
                .map_err(fp)?
            {
                add_aliases(&mut reply.images_info, &request.remote_name, &info, "");
            }
        }

        server.write(reply).await;
        Ok(())
    }

    pub async fn networks(
        &self,
        _request: NetworksRequest,
        server: &ReplyStream<NetworksReply>,
    ) -> std::result::Result<(), Status> {
        {
            let st = self.state.lock().await;
            if !st.instances_running() {
                self.config
                    .factory
                    .hypervisor_health_check()
                    .await
                    .map_err(fp)?;
            }
        }

        let mut reply = NetworksReply::default();
        for iface in self.config.factory.networks().await.map_err(fp)? {
            reply.interfaces.push(NetworkInterfaceEntry {
                name: iface.id,
                if_type: iface.if_type,
                description: iface.description,
            });
        }

        server.write(reply).await;
        Ok(())
    }

    pub async fn version(
        &self,
        _request: VersionRequest,
        server: &ReplyStream<VersionReply>,
    ) -> std::result::Result<(), Status> {
        server
            .write(VersionReply {
                version: crate::VERSION.to_string(),
                ..Default::default()
            })
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ssh_info
    // -----------------------------------------------------------------------

    pub async fn ssh_info(
        &self,
        request: SshInfoRequest,
        server: &ReplyStream<SshInfoReply>,
    ) -> std::result::Result<(), Status> {
        let st = self.state.lock().await;
        let (selection, status) = select::select_instances_and_react(
            &st,
            request.instance_name.iter().map(String::as_str),
            InstanceGroup::None,
            &require_operative_instances(),
        );
        status?;

        let mut reply = SshInfoReply::default();
        for name in &selection.operative {
            let vm = st
                .operative_instances
                .get(name)
                .cloned()
                .expect("selected operative");
            let state = vm.current_state();

            if state == InstanceState::Unknown {
                return Err(fp(Error::Runtime(
                    "Cannot retrieve credentials in unknown state".into(),
                )));
            }
            if !state.is_running() {
                return Err(Status::aborted(format!(
                    "instance \"{}\" is not running",
                    name
                )));
            }

            if state == InstanceState::DelayedShutdown {
                if let Some(timer) = st.delayed_shutdowns.get(name) {
                    if timer.time_remaining() <= Duration::from_secs(60) {
                        return Err(Status::failed_precondition(format!(
                            "\"{}\" is scheduled to shut down in less than a minute, use \
                             'multipass stop --cancel {}' to cancel the shutdown.",
                            name, name
                        )));
                    }
                }
            }

            let username = st
                .specs
                .get(name)
                .map(|spec| spec.ssh_username.clone())
                .unwrap_or_else(|| vm.ssh_username());
            reply.ssh_info.insert(
                name.clone(),
                SshInfo {
                    host: vm.ssh_hostname(),
                    port: vm.ssh_port(),
                    priv_key_base64: self.config.ssh_key_provider.private_key_as_base64(),
                    username,
                },
            );
        }

        server.write(reply).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // settings & authentication
    // -----------------------------------------------------------------------

    pub async fn get(
        &self,
        request: GetRequest,
        server: &ReplyStream<GetReply>,
    ) -> std::result::Result<(), Status> {
        let value = self.config.settings.get(&request.key).map_err(internal)?;
        tracing::debug!("Returning setting {}={}", request.key, value);

        server
            .write(GetReply {
                value,
                ..Default::default()
            })
            .await;
        Ok(())
    }

    pub async fn set(
        &self,
        request: SetRequest,
        _server: &ReplyStream<SetReply>,
    ) -> std::result::Result<(), Status> {
        tracing::trace!("Trying to set {}={}", request.key, request.val);
        self.config
            .settings
            .set(&request.key, &request.val)
            .map_err(internal)?;
        tracing::debug!("Succeeded setting {}={}", request.key, request.val);
        Ok(())
    }

    pub async fn keys(
        &self,
        _request: KeysRequest,
        server: &ReplyStream<KeysReply>,
    ) -> std::result::Result<(), Status> {
        let settings_keys = self.config.settings.keys();
        tracing::debug!("Returning {} settings keys", settings_keys.len());

        server
            .write(KeysReply {
                settings_keys,
                ..Default::default()
            })
            .await;
        Ok(())
    }

    pub async fn authenticate(
        &self,
        request: AuthenticateRequest,
        _server: &ReplyStream<AuthenticateReply>,
    ) -> std::result::Result<(), Status> {
        let stored_hash = self
            .config
            .settings
            .get(PASSPHRASE_KEY)
            .unwrap_or_default();

        if stored_hash.is_empty() {
            return Err(Status::failed_precondition(
                "Passphrase is not set. Please `multipass set local.passphrase` with a \
                 trusted client.",
            ));
        }

        if stored_hash != passphrase_hash(&request.passphrase) {
            return Err(Status::invalid_argument(
                "Passphrase is not correct. Please try again.",
            ));
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // snapshot / restore
    // -----------------------------------------------------------------------

    pub async fn snapshot(
        &self,
        request: SnapshotRequest,
        server: &ReplyStream<SnapshotReply>,
    ) -> std::result::Result<(), Status> {
        let st = self.state.lock().await;
        let trail = find_instance(&st, &request.instance);
        select::status_for_trail(&trail, &require_operative_instances())?;

        let vm = st
            .operative_instances
            .get(&request.instance)
            .cloned()
            .expect("trail said operative");

        if !matches!(
            vm.current_state(),
            InstanceState::Off | InstanceState::Stopped
        ) {
            return Err(Status::invalid_argument(
                "Multipass can only take snapshots of stopped instances.",
            ));
        }

        if !request.snapshot.is_empty() && !validate::valid_hostname(&request.snapshot) {
            return Err(Status::invalid_argument(format!(
                r#"Invalid snapshot name: "{}"."#,
                request.snapshot
            )));
        }

        let spec = st
            .specs
            .get(&request.instance)
            .cloned()
            .ok_or_else(|| Status::internal("missing instance specs"))?;

        let snapshot = vm
            .take_snapshot(&spec, &request.snapshot, &request.comment)
            .await
            .map_err(internal)?;

        server
            .write(SnapshotReply {
                snapshot: snapshot.name,
                ..Default::default()
            })
            .await;
        Ok(())
    }

    pub async fn restore(
        &self,
        request: RestoreRequest,
        server: &ReplyStream<RestoreReply>,
    ) -> std::result::Result<(), Status> {
        let mut st = self.state.lock().await;
        let trail = find_instance(&st, &request.instance);
        select::status_for_trail(&trail, &require_operative_instances())?;

        let vm = st
            .operative_instances
            .get(&request.instance)
            .cloned()
            .expect("trail said operative");

        if !matches!(
            vm.current_state(),
            InstanceState::Off | InstanceState::Stopped
        ) {
            return Err(Status::invalid_argument(
                "Multipass can only restore snapshots of stopped instances.",
            ));
        }

        let mut spec = st
            .specs
            .get(&request.instance)
            .cloned()
            .ok_or_else(|| Status::internal("missing instance specs"))?;

        if !request.destructive {
            server
                .write(RestoreReply {
                    reply_message: format!("Taking snapshot before restoring {}", request.instance),
                    ..Default::default()
                })
                .await;

            let snapshot = vm
                .take_snapshot(&spec, "", &format!("Before restoring {}", request.snapshot))
                .await
                .map_err(internal)?;

            server
                .write(RestoreReply {
                    reply_message: format!(
                        "Snapshot taken: {}.{}\n",
                        request.instance, snapshot.name
                    ),
                    ..Default::default()
                })
                .await;
        }

        server
            .write(RestoreReply {
                reply_message: "Restoring snapshot".to_string(),
                ..Default::default()
            })
            .await;

        vm.restore_snapshot(&request.snapshot, &mut spec)
            .await
            .map_err(internal)?;
        st.specs.insert(request.instance.clone(), spec);
        self.persist(&st).map_err(internal)?;

        server.write(RestoreReply::default()).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // readiness pipeline
    // -----------------------------------------------------------------------

    /// Wait for every name to be ready, deduplicating waiters per instance:
    /// a second caller attaches to the in-flight future instead of starting
    /// its own.
    async fn wait_for_ready_all(
        &self,
        names: &[String],
        timeout: Duration,
        wait_for_init: bool,
        reporter: Option<Arc<dyn ReadinessReporter>>,
        start_errors: Vec<String>,
    ) -> std::result::Result<(), Status> {
        let mut waits = Vec::with_capacity(names.len());
        {
            let mut st = self.state.lock().await;
            for name in names {
                if let Some(shared) = st.readiness.get(name) {
                    waits.push(shared.clone());
                } else {
                    let shared = readiness_waiter(
                        self.config.clone(),
                        self.state.clone(),
                        name.clone(),
                        timeout,
                        wait_for_init,
                        reporter.clone(),
                    )
                    .boxed()
                    .shared();
                    st.readiness.insert(name.clone(), shared.clone());
                    waits.push(shared);
                }
            }
        }

        let results = futures::future::join_all(waits).await;

        {
            let mut st = self.state.lock().await;
            for name in names {
                st.readiness.remove(name);
            }
        }

        let mut errors = start_errors;
        errors.extend(results.into_iter().filter(|error| !error.is_empty()));
        select::status_for(errors, Code::Ok)
    }

    #[cfg(test)]
    pub(crate) fn test_state(&self) -> Arc<Mutex<DaemonState>> {
        self.state.clone()
    }
}

/// One instance's readiness wait: SSH up, optionally cloud-init done, then
/// mount activation. Resolves to an error string, empty on success.
async fn readiness_waiter(
    config: Arc<DaemonConfig>,
    state: Arc<Mutex<DaemonState>>,
    name: String,
    timeout: Duration,
    wait_for_init: bool,
    reporter: Option<Arc<dyn ReadinessReporter>>,
) -> String {
    match readiness_steps(&config, &state, &name, timeout, wait_for_init, reporter).await {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

async fn readiness_steps(
    config: &Arc<DaemonConfig>,
    state: &Arc<Mutex<DaemonState>>,
    name: &str,
    timeout: Duration,
    wait_for_init: bool,
    reporter: Option<Arc<dyn ReadinessReporter>>,
) -> Result<()> {
    let vm = state
        .lock()
        .await
        .operative_instances
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Runtime(format!("instance \"{}\" does not exist", name)))?;

    vm.wait_until_ssh_up(timeout).await?;

    if wait_for_init {
        if let Some(reporter) = &reporter {
            reporter
                .reply_message("Waiting for initialization to complete")
                .await;
        }
        vm.wait_for_cloud_init(timeout).await?;
    }

    if config.settings.get_bool(MOUNTS_KEY) {
        // Take the handlers out so activation does not hold the registry
        // lock across guest round trips.
        let mut handlers = state.lock().await.mounts.remove(name).unwrap_or_default();

        let mut sshfs_missing = false;
        let mut invalid_mounts = Vec::new();
        let mut warnings = String::new();
        for (target, handler) in handlers.iter_mut() {
            if handler.is_mount_managed_by_backend() {
                continue;
            }
            match handler.activate().await {
                Ok(()) => {}
                Err(Error::SshfsMissing(_)) => {
                    sshfs_missing = true;
                    break;
                }
                Err(e) => {
                    let msg = format!("Removing mount \"{}\" from '{}': {}\n", target, name, e);
                    tracing::warn!("{}", msg.trim_end());
                    warnings.push_str(&msg);
                    invalid_mounts.push(target.clone());
                }
            }
        }

        {
            let mut st = state.lock().await;
            for target in &invalid_mounts {
                handlers.remove(target);
                if let Some(spec) = st.specs.get_mut(name) {
                    spec.mounts.remove(target);
                }
            }
            st.mounts.insert(name.to_string(), handlers);
            catalog::persist_db(&config.backend_data_directory(), &st.specs)?;
        }

        if !warnings.is_empty() {
            if let Some(reporter) = &reporter {
                reporter.stream_log(&warnings).await;
            }
        }

        if sshfs_missing {
            return Err(Error::SshfsMissing(name.to_string()));
        }
    }

    Ok(())
}
