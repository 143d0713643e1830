//! Launch request validation.

use bitflags::bitflags;
use multipassd_backend::{NetworkInterfaceInfo, Settings};
use multipassd_common::memory::{DEFAULT_DISK_SIZE, DEFAULT_MEM_SIZE, MIN_DISK_SIZE, MIN_MEM_SIZE};
use multipassd_common::settings::{BRIDGED_INTERFACE_KEY, BRIDGED_NETWORK_NAME};
use multipassd_common::{Error, MemorySize, NetworkInterface, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::alloc::valid_mac_address;
use crate::rpc::{LaunchRequest, NetworkMode};

bitflags! {
    /// Option errors accumulated while validating a launch request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LaunchError: u32 {
        const INVALID_MEM_SIZE = 1 << 0;
        const INVALID_DISK_SIZE = 1 << 1;
        const INVALID_HOSTNAME = 1 << 2;
        const INVALID_NETWORK = 1 << 3;
    }
}

impl LaunchError {
    /// Wire encoding of the error set, carried in the status details.
    pub fn serialized(&self) -> String {
        let mut names = Vec::new();
        if self.contains(Self::INVALID_MEM_SIZE) {
            names.push("INVALID_MEM_SIZE");
        }
        if self.contains(Self::INVALID_DISK_SIZE) {
            names.push("INVALID_DISK_SIZE");
        }
        if self.contains(Self::INVALID_HOSTNAME) {
            names.push("INVALID_HOSTNAME");
        }
        if self.contains(Self::INVALID_NETWORK) {
            names.push("INVALID_NETWORK");
        }
        names.join(",")
    }
}

/// Validated launch arguments, ready for the prepare stage.
#[derive(Debug, Clone, Default)]
pub struct CheckedArguments {
    pub mem_size: MemorySize,
    /// None when the client left the disk size to be computed from the image.
    pub disk_space: Option<MemorySize>,
    pub instance_name: String,
    pub extra_interfaces: Vec<NetworkInterface>,
    pub nets_need_bridging: Vec<String>,
    pub option_errors: LaunchError,
}

// Images known not to support DHCP auto-configuration of extra interfaces.
const NO_BRIDGING_RELEASE: &[&str] = &[
    "10.04", "lucid", "11.10", "oneiric", "12.04", "precise", "12.10", "quantal", "13.04",
    "raring", "13.10", "saucy", "14.04", "trusty", "14.10", "utopic", "15.04", "vivid", "15.10",
    "wily", "16.04", "xenial", "16.10", "yakkety", "17.04", "zesty",
];
const NO_BRIDGING_REMOTELESS: &[&str] = &["core", "core16"];

pub fn valid_hostname(name: &str) -> bool {
    static HOSTNAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = HOSTNAME_RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z][a-zA-Z0-9-]{0,61}[a-zA-Z0-9]|[a-zA-Z])$").unwrap()
    });
    re.is_match(name)
}

fn try_mem_size(value: &str) -> Option<MemorySize> {
    value.parse().ok()
}

fn auto_config_unavailable(remote: &str, image: &str) -> bool {
    if remote.is_empty() {
        NO_BRIDGING_REMOTELESS.contains(&image) || NO_BRIDGING_RELEASE.contains(&image)
    } else {
        (remote == "release" || remote == "daily") && NO_BRIDGING_RELEASE.contains(&image)
    }
}

fn validate_extra_interfaces(
    request: &LaunchRequest,
    host_networks: Option<&[NetworkInterfaceInfo]>,
    settings: &dyn Settings,
    nets_need_bridging: &mut Vec<String>,
    option_errors: &mut LaunchError,
) -> Result<Vec<NetworkInterface>> {
    let mut interfaces = Vec::new();
    if request.network_options.is_empty() {
        return Ok(interfaces);
    }

    let specified_image = if request.remote_name.is_empty() {
        request.image.clone()
    } else {
        format!("{}:{}", request.remote_name, request.image)
    };
    let dont_allow_auto = auto_config_unavailable(&request.remote_name, &request.image);

    let host_networks =
        host_networks.ok_or_else(|| Error::NotImplementedOnThisBackend("bridging".into()))?;

    for net in &request.network_options {
        let mut net_id = net.id.clone();

        if net_id == BRIDGED_NETWORK_NAME {
            let bridged_id = settings.get(BRIDGED_INTERFACE_KEY).unwrap_or_default();
            if bridged_id.is_empty() {
                return Err(Error::Runtime(format!(
                    "You have to `multipass set {}=<name>` to use the `--bridged` shortcut.",
                    BRIDGED_INTERFACE_KEY
                )));
            }
            net_id = bridged_id;
        }

        if dont_allow_auto && net.mode == NetworkMode::Auto {
            return Err(Error::Runtime(format!(
                "Automatic network configuration not available for {}. \
                 Consider using manual mode.",
                specified_image
            )));
        }

        match host_networks.iter().find(|info| info.id == net_id) {
            None => {
                if net.id == BRIDGED_NETWORK_NAME {
                    return Err(Error::Runtime(format!(
                        "Invalid network '{}' set as bridged interface, use \
                         `multipass set {}=<name>` to correct. See `multipass networks` \
                         for valid names.",
                        net_id, BRIDGED_INTERFACE_KEY
                    )));
                }
                tracing::warn!("Invalid network name \"{}\"", net_id);
                option_errors.insert(LaunchError::INVALID_NETWORK);
            }
            Some(info) if info.needs_authorization => nets_need_bridging.push(info.id.clone()),
            Some(_) => {}
        }

        let mac = net.mac_address.to_lowercase();
        if mac.is_empty() || valid_mac_address(&mac) {
            interfaces.push(NetworkInterface {
                id: net_id,
                mac_address: mac,
                auto_mode: net.mode != NetworkMode::Manual,
            });
        } else {
            tracing::warn!("Invalid MAC address \"{}\"", mac);
            option_errors.insert(LaunchError::INVALID_NETWORK);
        }
    }

    Ok(interfaces)
}

/// Check memory, disk, hostname and networks of a launch request.
///
/// `host_networks` must be supplied when the request names extra networks;
/// `None` there means the backend does not support bridging at all.
pub fn validate_create_arguments(
    request: &LaunchRequest,
    host_networks: Option<&[NetworkInterfaceInfo]>,
    settings: &dyn Settings,
) -> Result<CheckedArguments> {
    let min_mem: MemorySize = MIN_MEM_SIZE.parse().expect("bad minimum memory constant");
    let min_disk: MemorySize = MIN_DISK_SIZE.parse().expect("bad minimum disk constant");

    let mut option_errors = LaunchError::empty();

    let mem_request = if request.mem_size.is_empty() {
        DEFAULT_MEM_SIZE
    } else {
        &request.mem_size
    };
    let mem_size = match try_mem_size(mem_request) {
        Some(size) if size >= min_mem => size,
        _ => {
            option_errors.insert(LaunchError::INVALID_MEM_SIZE);
            MemorySize::zero()
        }
    };

    // No explicit disk request means "compute from the image later".
    let mut disk_space = None;
    if !request.disk_space.is_empty() {
        match try_mem_size(&request.disk_space) {
            Some(size) if size >= min_disk => disk_space = Some(size),
            _ => {
                option_errors.insert(LaunchError::INVALID_DISK_SIZE);
            }
        }
    }

    if !request.instance_name.is_empty() && !valid_hostname(&request.instance_name) {
        option_errors.insert(LaunchError::INVALID_HOSTNAME);
    }

    let mut nets_need_bridging = Vec::new();
    let extra_interfaces = validate_extra_interfaces(
        request,
        host_networks,
        settings,
        &mut nets_need_bridging,
        &mut option_errors,
    )?;

    Ok(CheckedArguments {
        mem_size,
        disk_space,
        instance_name: request.instance_name.clone(),
        extra_interfaces,
        nets_need_bridging,
        option_errors,
    })
}

/// Cores below the minimum fall back to the default.
pub fn effective_num_cores(requested: i32) -> i32 {
    if requested < 1 {
        1
    } else {
        requested
    }
}

fn filesystem_bytes_available(path: &Path) -> Result<u64> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64),
        Err(errno) => {
            tracing::debug!(error = %errno, path = %path.display(), "statvfs failed");
            Err(Error::Runtime(format!(
                "Failed to determine information about the volume containing {}",
                path.display()
            )))
        }
    }
}

/// Final disk size for a new instance: the client's request when it fits the
/// image, else the larger of the image and the default. Fails when the image
/// does not fit the request or the available disk.
pub fn compute_final_image_size(
    image_size: MemorySize,
    requested: Option<MemorySize>,
    data_directory: &Path,
) -> Result<MemorySize> {
    let disk_space = match requested {
        None => {
            let default_disk: MemorySize = DEFAULT_DISK_SIZE.parse().expect("bad disk constant");
            if image_size < default_disk {
                default_disk
            } else {
                image_size
            }
        }
        Some(requested) if requested < image_size => {
            return Err(Error::Runtime(format!(
                "Requested disk ({} bytes) below minimum for this image ({} bytes)",
                requested.in_bytes(),
                image_size.in_bytes()
            )));
        }
        Some(requested) => requested,
    };

    let available = MemorySize::from_bytes(filesystem_bytes_available(data_directory)?);
    if available < image_size {
        return Err(Error::Runtime(format!(
            "Available disk ({} bytes) below minimum for this image ({} bytes)",
            available.in_bytes(),
            image_size.in_bytes()
        )));
    }
    if available < disk_space {
        tracing::warn!(
            "Reserving more disk space ({} bytes) than available ({} bytes)",
            disk_space.in_bytes(),
            available.in_bytes()
        );
    }

    Ok(disk_space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSettings;

    fn request(mem: &str, disk: &str, name: &str) -> LaunchRequest {
        LaunchRequest {
            instance_name: name.to_string(),
            image: "default".to_string(),
            mem_size: mem.to_string(),
            disk_space: disk.to_string(),
            ..Default::default()
        }
    }

    fn host_networks() -> Vec<NetworkInterfaceInfo> {
        vec![
            NetworkInterfaceInfo {
                id: "eth0".into(),
                if_type: "ethernet".into(),
                description: "wired".into(),
                needs_authorization: false,
            },
            NetworkInterfaceInfo {
                id: "wlan0".into(),
                if_type: "wifi".into(),
                description: "wireless".into(),
                needs_authorization: true,
            },
        ]
    }

    #[test]
    fn test_defaults_pass() {
        let settings = MockSettings::default();
        let checked =
            validate_create_arguments(&request("", "", ""), None, &settings).unwrap();
        assert!(checked.option_errors.is_empty());
        assert_eq!(checked.mem_size.in_bytes(), 1 << 30);
        assert!(checked.disk_space.is_none());
    }

    #[test]
    fn test_small_memory_is_flagged() {
        let settings = MockSettings::default();
        let checked =
            validate_create_arguments(&request("512M", "", ""), None, &settings).unwrap();
        assert!(checked.option_errors.contains(LaunchError::INVALID_MEM_SIZE));
    }

    #[test]
    fn test_small_disk_is_flagged() {
        let settings = MockSettings::default();
        let checked =
            validate_create_arguments(&request("", "1G", ""), None, &settings).unwrap();
        assert!(checked
            .option_errors
            .contains(LaunchError::INVALID_DISK_SIZE));
    }

    #[test]
    fn test_bad_hostname_is_flagged() {
        let settings = MockSettings::default();
        let checked =
            validate_create_arguments(&request("", "", "-bad-"), None, &settings).unwrap();
        assert!(checked
            .option_errors
            .contains(LaunchError::INVALID_HOSTNAME));
    }

    #[test]
    fn test_valid_hostnames() {
        for name in ["a", "primary", "dev-box", "a1"] {
            assert!(valid_hostname(name), "{} should be valid", name);
        }
        for name in ["", "1abc", "-x", "x-", "has space"] {
            assert!(!valid_hostname(name), "{} should be invalid", name);
        }
    }

    #[test]
    fn test_unknown_network_is_flagged() {
        let settings = MockSettings::default();
        let mut req = request("", "", "");
        req.network_options.push(crate::rpc::NetworkOptions {
            id: "nope".into(),
            ..Default::default()
        });
        let checked =
            validate_create_arguments(&req, Some(&host_networks()), &settings).unwrap();
        assert!(checked.option_errors.contains(LaunchError::INVALID_NETWORK));
    }

    #[test]
    fn test_bridged_shortcut_requires_setting() {
        let settings = MockSettings::default(); // no bridged interface configured
        let mut req = request("", "", "");
        req.network_options.push(crate::rpc::NetworkOptions {
            id: BRIDGED_NETWORK_NAME.into(),
            ..Default::default()
        });
        let err =
            validate_create_arguments(&req, Some(&host_networks()), &settings).unwrap_err();
        assert!(err.to_string().starts_with(
            "You have to `multipass set local.bridged-network=",
        ));
    }

    #[test]
    fn test_bridged_shortcut_resolves_through_setting() {
        let settings = MockSettings::default();
        settings.insert(BRIDGED_INTERFACE_KEY, "eth0");
        let mut req = request("", "", "");
        req.network_options.push(crate::rpc::NetworkOptions {
            id: BRIDGED_NETWORK_NAME.into(),
            ..Default::default()
        });
        let checked =
            validate_create_arguments(&req, Some(&host_networks()), &settings).unwrap();
        assert_eq!(checked.extra_interfaces[0].id, "eth0");
    }

    #[test]
    fn test_network_needing_authorization_is_recorded() {
        let settings = MockSettings::default();
        let mut req = request("", "", "");
        req.network_options.push(crate::rpc::NetworkOptions {
            id: "wlan0".into(),
            ..Default::default()
        });
        let checked =
            validate_create_arguments(&req, Some(&host_networks()), &settings).unwrap();
        assert_eq!(checked.nets_need_bridging, vec!["wlan0"]);
    }

    #[test]
    fn test_auto_mode_rejected_for_old_images() {
        let settings = MockSettings::default();
        let mut req = request("", "", "");
        req.image = "xenial".into();
        req.network_options.push(crate::rpc::NetworkOptions {
            id: "eth0".into(),
            mode: NetworkMode::Auto,
            ..Default::default()
        });
        let err =
            validate_create_arguments(&req, Some(&host_networks()), &settings).unwrap_err();
        assert!(err
            .to_string()
            .contains("Automatic network configuration not available for xenial"));

        req.image = "core16".into();
        assert!(
            validate_create_arguments(&req, Some(&host_networks()), &settings).is_err()
        );
    }

    #[test]
    fn test_requested_mac_is_checked_and_lowercased() {
        let settings = MockSettings::default();
        let mut req = request("", "", "");
        req.network_options.push(crate::rpc::NetworkOptions {
            id: "eth0".into(),
            mac_address: "52:54:00:AB:CD:EF".into(),
            ..Default::default()
        });
        let checked =
            validate_create_arguments(&req, Some(&host_networks()), &settings).unwrap();
        assert_eq!(checked.extra_interfaces[0].mac_address, "52:54:00:ab:cd:ef");

        req.network_options[0].mac_address = "garbage".into();
        let checked =
            validate_create_arguments(&req, Some(&host_networks()), &settings).unwrap();
        assert!(checked.option_errors.contains(LaunchError::INVALID_NETWORK));
    }

    #[test]
    fn test_launch_error_serialization() {
        let errors = LaunchError::INVALID_MEM_SIZE | LaunchError::INVALID_NETWORK;
        assert_eq!(errors.serialized(), "INVALID_MEM_SIZE,INVALID_NETWORK");
    }

    #[test]
    fn test_requested_disk_below_image_size_errors() {
        let dir = tempfile::tempdir().unwrap();
        let image: MemorySize = "10G".parse().unwrap();
        let requested: MemorySize = "6G".parse().unwrap();
        let err =
            compute_final_image_size(image, Some(requested), dir.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&requested.in_bytes().to_string()));
        assert!(msg.contains(&image.in_bytes().to_string()));
    }

    #[test]
    fn test_disk_defaults_to_image_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let small_image: MemorySize = "1G".parse().unwrap();
        let size = compute_final_image_size(small_image, None, dir.path()).unwrap();
        assert_eq!(size, DEFAULT_DISK_SIZE.parse().unwrap());
    }

    #[test]
    fn test_effective_num_cores() {
        assert_eq!(effective_num_cores(0), 1);
        assert_eq!(effective_num_cores(-4), 1);
        assert_eq!(effective_num_cores(3), 3);
    }
}
